//! Browser: target discovery and browser-wide events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::page::Page;
use crate::protocol::{
    BrowserVersion, TargetCreatedEvent, TargetDestroyedEvent, TargetInfoChangedEvent,
};
use crate::listeners::Listeners;
use crate::session::Session;
use crate::target::Target;
use crate::transport::{resolve_ws_endpoint, Transport, WebSocketTransport};

/// Fixed page dimensions applied to every new page target.
#[derive(Debug, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Connection-level browser options.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Debugging endpoint: `ws://.../devtools/browser/...` or an
    /// `http://host:port` endpoint to discover it from.
    pub ws_endpoint: String,
    /// Accept invalid TLS certificates on every page.
    pub ignore_https_errors: bool,
    /// The browser runs a single app window rather than tabs.
    pub app_mode: bool,
    /// Viewport applied to new pages; `None` leaves the browser default.
    pub default_viewport: Option<Viewport>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: "http://localhost:9222".to_string(),
            ignore_https_errors: false,
            app_mode: false,
            default_viewport: Some(Viewport {
                width: 1280,
                height: 720,
            }),
        }
    }
}

type CloseCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct BrowserInner {
    connection: Connection,
    config: BrowserConfig,
    targets: Mutex<HashMap<String, Target>>,
    targets_changed: watch::Sender<u64>,
    is_closed: AtomicBool,
    close_callback: Mutex<Option<CloseCallback>>,
    disconnect_emitted: AtomicBool,
    target_created: Listeners<Target>,
    target_changed: Listeners<Target>,
    target_destroyed: Listeners<Target>,
    closed: Listeners<()>,
    disconnected: Listeners<()>,
}

/// A connected browser. Cheap to clone.
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

impl Browser {
    /// Connect to a running browser's debugging endpoint.
    pub async fn connect(config: BrowserConfig) -> Result<Browser> {
        let ws_url = resolve_ws_endpoint(&config.ws_endpoint).await?;
        let transport = Arc::new(WebSocketTransport::connect(&ws_url).await?);
        Self::connect_with_transport(config, transport).await
    }

    /// Connect over an already-established transport. This is the seam the
    /// in-process test transport plugs into.
    pub async fn connect_with_transport(
        config: BrowserConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Browser> {
        let connection = Connection::new(transport);
        let inner = Arc::new(BrowserInner {
            connection: connection.clone(),
            config,
            targets: Mutex::new(HashMap::new()),
            targets_changed: watch::channel(0).0,
            is_closed: AtomicBool::new(false),
            close_callback: Mutex::new(None),
            disconnect_emitted: AtomicBool::new(false),
            target_created: Listeners::new(),
            target_changed: Listeners::new(),
            target_destroyed: Listeners::new(),
            closed: Listeners::new(),
            disconnected: Listeners::new(),
        });

        let root = connection.root_session();
        let weak = Arc::downgrade(&inner);
        root.on_event(
            "Target.targetCreated",
            weak.clone(),
            |inner: Arc<BrowserInner>, ev: TargetCreatedEvent| {
                Box::pin(async move { inner.on_target_created(ev) })
            },
        );
        root.on_event(
            "Target.targetInfoChanged",
            weak.clone(),
            |inner: Arc<BrowserInner>, ev: TargetInfoChangedEvent| {
                Box::pin(async move { inner.on_target_info_changed(ev).await })
            },
        );
        root.on_event(
            "Target.targetDestroyed",
            weak.clone(),
            |inner: Arc<BrowserInner>, ev: TargetDestroyedEvent| {
                Box::pin(async move { inner.on_target_destroyed(ev).await })
            },
        );

        // Emit Disconnected when the transport goes away underneath us.
        let mut closed_rx = connection.closed_signal();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                if *closed_rx.borrow_and_update() {
                    break;
                }
                if closed_rx.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.emit_disconnected().await;
            }
        });

        root.send(
            "Target.setDiscoverTargets",
            Some(json!({ "discover": true })),
        )
        .await?;

        Ok(Browser { inner })
    }

    /// The browser-level session.
    pub fn root_session(&self) -> Session {
        self.inner.connection.root_session()
    }

    /// Register a callback run during `close`, between stopping the reader
    /// and tearing down the transport (e.g. to kill a launched process).
    pub fn set_close_callback(&self, callback: CloseCallback) {
        *self.inner.close_callback.lock() = Some(callback);
    }

    /// Open a new page on `about:blank` and wait for it to be usable.
    pub async fn new_page(&self) -> Result<Page> {
        let raw = self
            .root_session()
            .send(
                "Target.createTarget",
                Some(json!({ "url": "about:blank" })),
            )
            .await?;
        let target_id = raw["targetId"]
            .as_str()
            .ok_or_else(|| Error::InvalidResponse("missing targetId".to_string()))?
            .to_string();

        let target = self.wait_for_target(&target_id).await;
        if !target.wait_initialized().await {
            return Err(Error::InvalidResponse(format!(
                "created target {} is not a page",
                target_id
            )));
        }
        target
            .page()
            .ok_or_else(|| Error::InvalidResponse(format!("target {} has no page", target_id)))
    }

    /// The target with `target_id`, waiting for its creation event if the
    /// reply outran discovery.
    pub async fn wait_for_target(&self, target_id: &str) -> Target {
        let mut changes = self.inner.targets_changed.subscribe();
        loop {
            if let Some(target) = self.inner.targets.lock().get(target_id).cloned() {
                return target;
            }
            if changes.changed().await.is_err() {
                // The sender lives in `self`; don't spin if it ever breaks.
                tokio::task::yield_now().await;
            }
        }
    }

    /// Snapshot of all known targets.
    pub fn targets(&self) -> Vec<Target> {
        self.inner.targets.lock().values().cloned().collect()
    }

    /// Pages of every initialized, usable target.
    pub fn pages(&self) -> Vec<Page> {
        self.targets()
            .into_iter()
            .filter(|target| target.is_initialized() == Some(true))
            .filter_map(|target| target.page())
            .collect()
    }

    pub async fn version(&self) -> Result<String> {
        Ok(self.get_version().await?.product)
    }

    pub async fn user_agent(&self) -> Result<String> {
        Ok(self.get_version().await?.user_agent)
    }

    async fn get_version(&self) -> Result<BrowserVersion> {
        let raw = self.root_session().send("Browser.getVersion", None).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Shut the browser connection down. Idempotent.
    ///
    /// Order matters: stop the reader so no further events fire, run the
    /// user close callback, tear down the transport, then emit `Closed` so
    /// subscribers observe a fully quiesced browser.
    pub async fn close(&self) -> Result<()> {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.connection.stop_reading();
        let callback = self.inner.close_callback.lock().take();
        if let Some(callback) = callback {
            callback().await;
        }
        self.inner.connection.close("browser closed").await;
        self.inner.closed.invoke(&()).await;
        Ok(())
    }

    /// Drop the connection; the browser process keeps running.
    pub async fn disconnect(&self) {
        self.inner.connection.close("browser disconnected").await;
        self.inner.emit_disconnected().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    pub fn on_target_created(&self) -> &Listeners<Target> {
        &self.inner.target_created
    }

    pub fn on_target_changed(&self) -> &Listeners<Target> {
        &self.inner.target_changed
    }

    pub fn on_target_destroyed(&self) -> &Listeners<Target> {
        &self.inner.target_destroyed
    }

    pub fn on_closed(&self) -> &Listeners<()> {
        &self.inner.closed
    }

    pub fn on_disconnected(&self) -> &Listeners<()> {
        &self.inner.disconnected
    }
}

impl BrowserInner {
    fn on_target_created(self: Arc<Self>, ev: TargetCreatedEvent) {
        let target = Target::new(ev.target_info);
        let target_id = target.target_id().to_string();
        let replaced = self
            .targets
            .lock()
            .insert(target_id.clone(), target.clone());
        if replaced.is_some() {
            warn!("target {} created twice, replacing", target_id);
        }
        self.targets_changed.send_modify(|v| *v += 1);

        // Initialization sends commands whose replies route through the very
        // reader that delivered this event, so it runs as its own task.
        let inner = self.clone();
        tokio::spawn(async move {
            let usable = inner.initialize_target(&target).await;
            target.resolve_init(usable);
            if usable {
                inner.target_created.invoke(&target).await;
            }
        });
    }

    async fn initialize_target(&self, target: &Target) -> bool {
        if !target.kind().is_page_like() {
            return false;
        }
        match self.assemble_page(target).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to initialize target {}: {}", target.target_id(), e);
                false
            }
        }
    }

    async fn assemble_page(&self, target: &Target) -> Result<()> {
        let session = self.connection.create_session(target.target_id()).await?;
        target.set_session(session.clone());

        if self.config.ignore_https_errors {
            session
                .send(
                    "Security.setIgnoreCertificateErrors",
                    Some(json!({ "ignore": true })),
                )
                .await?;
        }
        if let Some(viewport) = &self.config.default_viewport {
            session
                .send(
                    "Emulation.setDeviceMetricsOverride",
                    Some(json!({
                        "width": viewport.width,
                        "height": viewport.height,
                        "deviceScaleFactor": 1,
                        "mobile": false,
                    })),
                )
                .await?;
        }

        let page = Page::attach(session, target.target_id().to_string()).await?;
        target.set_page(page);
        debug!("target {} initialized", target.target_id());
        Ok(())
    }

    async fn on_target_info_changed(&self, ev: TargetInfoChangedEvent) {
        let target = self
            .targets
            .lock()
            .get(&ev.target_info.target_id)
            .cloned();
        let Some(target) = target else {
            // Info for a target we never saw created: the target map
            // invariant is broken, which is a bug, not a recoverable state.
            error!(
                "targetInfoChanged for unknown target {}",
                ev.target_info.target_id
            );
            debug_assert!(false, "targetInfoChanged for unknown target");
            return;
        };
        let changed = target.update_info(&ev.target_info);
        if changed && target.is_initialized() == Some(true) {
            self.target_changed.invoke(&target).await;
        }
    }

    async fn on_target_destroyed(&self, ev: TargetDestroyedEvent) {
        let target = self.targets.lock().remove(&ev.target_id);
        let Some(target) = target else {
            error!("targetDestroyed for unknown target {}", ev.target_id);
            debug_assert!(false, "targetDestroyed for unknown target");
            return;
        };
        self.targets_changed.send_modify(|v| *v += 1);
        let was_usable = target.is_initialized() == Some(true);
        target.mark_closed();
        if was_usable {
            self.target_destroyed.invoke(&target).await;
        }
    }

    async fn emit_disconnected(&self) {
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            self.disconnected.invoke(&()).await;
        }
    }
}
