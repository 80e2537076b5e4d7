//! Targets: the things in the browser a client can drive.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::page::Page;
use crate::protocol::TargetInfo;
use crate::session::Session;

/// What a target is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    BackgroundPage,
    ServiceWorker,
    Browser,
    Other,
}

impl TargetKind {
    fn from_protocol(kind: &str) -> Self {
        match kind {
            "page" => TargetKind::Page,
            "background_page" => TargetKind::BackgroundPage,
            "service_worker" => TargetKind::ServiceWorker,
            "browser" => TargetKind::Browser,
            _ => TargetKind::Other,
        }
    }

    /// Whether this kind gets a page assembled on attach.
    pub(crate) fn is_page_like(&self) -> bool {
        matches!(self, TargetKind::Page | TargetKind::BackgroundPage)
    }
}

struct TargetState {
    kind: TargetKind,
    url: String,
    opener_id: Option<String>,
}

pub(crate) struct TargetInner {
    target_id: String,
    state: Mutex<TargetState>,
    /// Resolves to the usable flag; `false` for kinds without a page.
    init: watch::Sender<Option<bool>>,
    closed: watch::Sender<bool>,
    session: Mutex<Option<Session>>,
    page: Mutex<Option<Page>>,
}

/// One driveable thing in the browser. Cheap to clone.
#[derive(Clone)]
pub struct Target {
    inner: Arc<TargetInner>,
}

impl Target {
    pub(crate) fn new(info: TargetInfo) -> Self {
        let (init, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(TargetInner {
                target_id: info.target_id,
                state: Mutex::new(TargetState {
                    kind: TargetKind::from_protocol(&info.kind),
                    url: info.url,
                    opener_id: info.opener_id,
                }),
                init,
                closed,
                session: Mutex::new(None),
                page: Mutex::new(None),
            }),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    pub fn kind(&self) -> TargetKind {
        self.inner.state.lock().kind
    }

    pub fn url(&self) -> String {
        self.inner.state.lock().url.clone()
    }

    /// Target that opened this one, if any.
    pub fn opener_id(&self) -> Option<String> {
        self.inner.state.lock().opener_id.clone()
    }

    /// The page assembled for page-like targets, once initialized.
    pub fn page(&self) -> Option<Page> {
        self.inner.page.lock().clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// `Some(usable)` once initialization finished, `None` while pending.
    pub fn is_initialized(&self) -> Option<bool> {
        *self.inner.init.borrow()
    }

    /// Wait for initialization; the flag says whether the target is usable.
    pub async fn wait_initialized(&self) -> bool {
        let mut rx = self.inner.init.subscribe();
        loop {
            if let Some(usable) = *rx.borrow_and_update() {
                return usable;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Wait until the browser reports the target destroyed.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// First resolution wins; a destroyed target that never finished
    /// initializing resolves unusable.
    pub(crate) fn resolve_init(&self, usable: bool) {
        self.inner.init.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(usable);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_closed(&self) {
        self.resolve_init(false);
        let _ = self.inner.closed.send(true);
    }

    pub(crate) fn set_session(&self, session: Session) {
        *self.inner.session.lock() = Some(session);
    }

    pub(crate) fn set_page(&self, page: Page) {
        *self.inner.page.lock() = Some(page);
    }

    /// Apply a `targetInfoChanged` payload. Returns whether url or kind
    /// actually changed.
    pub(crate) fn update_info(&self, info: &TargetInfo) -> bool {
        let mut state = self.inner.state.lock();
        let kind = TargetKind::from_protocol(&info.kind);
        let changed = state.url != info.url || state.kind != kind;
        state.url = info.url.clone();
        state.kind = kind;
        state.opener_id = info.opener_id.clone();
        changed
    }
}
