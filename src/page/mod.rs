//! Page assembly: frame tree, network mirror, navigation, and dialogs for
//! one page target.

mod context;
mod frame;
mod network;
mod watcher;

pub use context::ExecutionContext;
pub use frame::{Frame, FrameManager};
pub use network::{
    ContinueOverrides, Credentials, NetworkManager, Request, RespondPayload, Response,
};
pub use watcher::{NavigateOptions, WaitUntil};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::dialog::Dialog;
use crate::error::{Error, Result};
use crate::listeners::Listeners;
use crate::protocol::{JavascriptDialogOpeningEvent, NavigateResult};
use crate::session::Session;

use watcher::NavigationWatcher;

struct PageInner {
    session: Session,
    target_id: String,
    frames: FrameManager,
    network: NetworkManager,
    dialog: Listeners<Arc<Dialog>>,
}

/// A single page (tab) under automation. Cheap to clone.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

impl Page {
    /// Build the page mirror on an attached session: enable the Page,
    /// Runtime, and Network domains and seed the frame tree.
    pub(crate) async fn attach(session: Session, target_id: String) -> Result<Page> {
        let frames = FrameManager::new(session.clone());
        let network = NetworkManager::new(session.clone());
        let inner = Arc::new(PageInner {
            session: session.clone(),
            target_id,
            frames: frames.clone(),
            network: network.clone(),
            dialog: Listeners::new(),
        });

        session.on_event(
            "Page.javascriptDialogOpening",
            Arc::downgrade(&inner),
            |inner: Arc<PageInner>, ev: JavascriptDialogOpeningEvent| {
                Box::pin(async move {
                    let dialog = Arc::new(Dialog::new(inner.session.clone(), ev));
                    inner.dialog.invoke(&dialog).await;
                })
            },
        );

        frames.init().await?;
        network.init().await?;
        Ok(Page { inner })
    }

    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    /// The raw protocol session; escape hatch for methods the page API does
    /// not cover.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn main_frame(&self) -> Option<Arc<Frame>> {
        self.inner.frames.main_frame()
    }

    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.inner.frames.frames()
    }

    /// Current url of the main frame.
    pub fn url(&self) -> Option<String> {
        self.main_frame().map(|frame| frame.url())
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    /// Navigate the main frame and wait for the lifecycle set in `options`.
    pub async fn goto(&self, url: &str, options: NavigateOptions) -> Result<()> {
        let frame = self.main_frame().ok_or(Error::DetachedFrame)?;
        let watcher = NavigationWatcher::new(self.inner.frames.clone(), frame, &options);

        let raw = self
            .inner
            .session
            .send("Page.navigate", Some(json!({ "url": url })))
            .await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                watcher.cancel();
                return Err(e);
            }
        };
        let result: NavigateResult = serde_json::from_value(raw)?;
        if let Some(error_text) = result.error_text {
            watcher.cancel();
            return Err(Error::Navigation(error_text));
        }

        watcher.wait().await
    }

    /// Reload the page and wait for it to settle again.
    pub async fn reload(&self, options: NavigateOptions) -> Result<()> {
        let frame = self.main_frame().ok_or(Error::DetachedFrame)?;
        let watcher = NavigationWatcher::new(self.inner.frames.clone(), frame, &options);

        if let Err(e) = self.inner.session.send("Page.reload", None).await {
            watcher.cancel();
            return Err(e);
        }
        watcher.wait().await
    }

    /// Wait for the next navigation of the main frame to settle, without
    /// initiating one (e.g. after a click that triggers it).
    pub async fn wait_for_navigation(&self, options: NavigateOptions) -> Result<()> {
        let frame = self.main_frame().ok_or(Error::DetachedFrame)?;
        let watcher = NavigationWatcher::new(self.inner.frames.clone(), frame, &options);
        watcher.wait().await
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate an expression in the main frame's default context.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let frame = self.main_frame().ok_or(Error::DetachedFrame)?;
        frame.evaluate(expression).await
    }

    /// Inject a `<script>` tag with inline content or a remote source.
    pub async fn add_script_tag(&self, tag: ScriptTag) -> Result<()> {
        let expression = match (&tag.content, &tag.url) {
            (Some(content), _) => format!(
                r#"(() => {{
                    const script = document.createElement('script');
                    script.type = 'text/javascript';
                    script.text = {};
                    document.head.appendChild(script);
                }})()"#,
                serde_json::to_string(content)?
            ),
            (None, Some(url)) => format!(
                r#"new Promise((resolve, reject) => {{
                    const script = document.createElement('script');
                    script.src = {};
                    script.onload = () => resolve();
                    script.onerror = () => reject(new Error('failed to load script'));
                    document.head.appendChild(script);
                }})"#,
                serde_json::to_string(url)?
            ),
            (None, None) => {
                return Err(Error::InvalidResponse(
                    "script tag needs content or url".to_string(),
                ))
            }
        };
        self.evaluate(&expression).await?;
        Ok(())
    }

    /// Let injected scripts run on pages that forbid them via CSP. Takes
    /// effect on the next navigation.
    pub async fn set_bypass_csp(&self, enabled: bool) -> Result<()> {
        self.inner
            .session
            .send("Page.setBypassCSP", Some(json!({ "enabled": enabled })))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Network controls
    // ========================================================================

    pub async fn set_request_interception(&self, enabled: bool) -> Result<()> {
        self.inner.network.set_request_interception(enabled).await
    }

    pub async fn authenticate(&self, credentials: Option<Credentials>) -> Result<()> {
        self.inner.network.authenticate(credentials).await
    }

    pub async fn set_offline_mode(&self, offline: bool) -> Result<()> {
        self.inner.network.set_offline_mode(offline).await
    }

    pub async fn set_extra_http_headers(&self, headers: HashMap<String, String>) -> Result<()> {
        self.inner.network.set_extra_http_headers(headers).await
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.inner.network.set_user_agent(user_agent).await
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_dialog(&self) -> &Listeners<Arc<Dialog>> {
        &self.inner.dialog
    }

    pub fn on_request(&self) -> &Listeners<Arc<Request>> {
        self.inner.network.on_request()
    }

    pub fn on_response(&self) -> &Listeners<Arc<Response>> {
        self.inner.network.on_response()
    }

    pub fn on_request_failed(&self) -> &Listeners<Arc<Request>> {
        self.inner.network.on_request_failed()
    }

    pub fn on_request_finished(&self) -> &Listeners<Arc<Request>> {
        self.inner.network.on_request_finished()
    }

    pub fn on_frame_attached(&self) -> &Listeners<Arc<Frame>> {
        self.inner.frames.on_frame_attached()
    }

    pub fn on_frame_detached(&self) -> &Listeners<Arc<Frame>> {
        self.inner.frames.on_frame_detached()
    }

    pub fn on_frame_navigated(&self) -> &Listeners<Arc<Frame>> {
        self.inner.frames.on_frame_navigated()
    }
}

/// What to inject with [`Page::add_script_tag`].
#[derive(Debug, Clone, Default)]
pub struct ScriptTag {
    pub url: Option<String>,
    pub content: Option<String>,
}

impl ScriptTag {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            url: None,
            content: Some(content.into()),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            content: None,
        }
    }
}
