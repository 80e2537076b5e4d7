//! Remote browser-automation client for Chromium-family browsers.
//!
//! The client maintains an event-driven mirror of a running browser over its
//! DevTools wire protocol: the target map, per-page frame trees, network
//! activity, and navigation lifecycle. High-level operations (open a page,
//! navigate, intercept requests, handle dialogs) are built on that mirror.
//!
//! ## Usage
//!
//! Start a browser with remote debugging enabled:
//!
//! ```bash
//! chrome --remote-debugging-port=9222
//! ```
//!
//! Then connect and drive it:
//!
//! ```rust,ignore
//! let browser = Browser::connect(BrowserConfig::default()).await?;
//! let page = browser.new_page().await?;
//! page.goto("https://example.com", NavigateOptions::default()).await?;
//! let title = page.evaluate("document.title").await?;
//! ```

mod browser;
mod connection;
mod dialog;
mod error;
mod listeners;
mod multimap;
mod page;
mod protocol;
mod session;
mod target;
pub mod testing;
mod transport;

pub use browser::{Browser, BrowserConfig, Viewport};
pub use connection::Connection;
pub use dialog::{Dialog, DialogKind};
pub use error::{Error, Result};
pub use listeners::{Listener, Listeners};
pub use multimap::MultiMap;
pub use page::{
    ContinueOverrides, Credentials, ExecutionContext, Frame, NavigateOptions, Page, Request,
    RespondPayload, Response, ScriptTag, WaitUntil,
};
pub use protocol::{ProtocolEvent, RemoteObject};
pub use session::Session;
pub use target::{Target, TargetKind};
pub use transport::{resolve_ws_endpoint, Transport, WebSocketTransport};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use serde_json::json;

    use crate::connection::Connection;
    use crate::listeners::Listener;
    use crate::session::Session;
    use crate::testing::LoopbackTransport;

    /// A connection over a loopback transport, with its root session.
    pub(crate) fn connect() -> (Arc<LoopbackTransport>, Connection, Session) {
        let transport = Arc::new(LoopbackTransport::new());
        let connection = Connection::new(transport.clone());
        let session = connection.root_session();
        (transport, connection, session)
    }

    /// Wait until every event injected before this call has been dispatched
    /// on `session`, by riding a sentinel event through its queue.
    pub(crate) async fn sync(transport: &LoopbackTransport, session: &Session) {
        let notify = Arc::new(tokio::sync::Notify::new());
        let notified = notify.clone();
        let handle = session.on(
            "Test.sync",
            Listener::sync(move |_| notified.notify_one()),
        );
        transport.emit("Test.sync", json!({}), session.session_id());
        notify.notified().await;
        session.listeners("Test.sync").remove(&handle);
    }
}
