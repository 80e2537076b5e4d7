//! Per-target protocol sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::listeners::{Listener, Listeners};
use crate::protocol::ProtocolEvent;

pub(crate) struct SessionInner {
    session_id: Option<String>,
    connection: Weak<ConnectionInner>,
    listeners: Mutex<HashMap<String, Arc<Listeners<Arc<ProtocolEvent>>>>>,
    detached: AtomicBool,
    events_tx: mpsc::UnboundedSender<Arc<ProtocolEvent>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<ProtocolEvent>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    pub(crate) fn new(session_id: Option<String>, connection: Weak<ConnectionInner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            connection,
            listeners: Mutex::new(HashMap::new()),
            detached: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the session's dispatcher task.
    ///
    /// The reader only enqueues; this task invokes the fanout, so a
    /// subscriber may await its own `send` without starving the reader of
    /// the reply. Events stay ordered because there is exactly one queue
    /// and one consumer per session.
    pub(crate) fn start_dispatcher(session: &Arc<SessionInner>) {
        let Some(mut events_rx) = session.events_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(session);
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                let listeners = session.listeners.lock().get(&event.method).cloned();
                if let Some(listeners) = listeners {
                    listeners.invoke(&event).await;
                }
            }
        });
        *session.dispatcher.lock() = Some(task);
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }

    /// Queue an inbound event for ordered dispatch.
    pub(crate) fn enqueue(&self, event: Arc<ProtocolEvent>) {
        let _ = self.events_tx.send(event);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}

/// One logical protocol channel bound to a target. Cheap to clone.
///
/// The root session (no session id) speaks for the browser itself; flat
/// sessions created by attaching to a target carry their `sessionId` on every
/// command.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    /// Issue a command and await its reply.
    ///
    /// Fails with [`Error::Protocol`] when the remote reports an error and
    /// with [`Error::TargetClosed`] when the session or connection terminates
    /// before the reply arrives. There is no built-in timeout; callers that
    /// need one wrap the future themselves.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.inner.detached.load(Ordering::SeqCst) {
            return Err(Error::TargetClosed("session detached".to_string()));
        }
        let connection = self
            .inner
            .connection
            .upgrade()
            .ok_or_else(|| Error::TargetClosed("connection dropped".to_string()))?;
        connection
            .submit(method, params, self.inner.session_id.clone())
            .await
    }

    /// The fanout list for one event name, created on first use.
    pub fn listeners(&self, event: &str) -> Arc<Listeners<Arc<ProtocolEvent>>> {
        self.inner
            .listeners
            .lock()
            .entry(event.to_string())
            .or_insert_with(|| Arc::new(Listeners::new()))
            .clone()
    }

    /// Subscribe to an event by name. Returns a removal handle.
    pub fn on(
        &self,
        event: &str,
        listener: Listener<Arc<ProtocolEvent>>,
    ) -> Listener<Arc<ProtocolEvent>> {
        self.listeners(event).add(listener)
    }

    /// Subscribe a component to a typed event.
    ///
    /// The payload is deserialized before the handler runs; undecodable
    /// payloads are logged and dropped. The handler holds its owner weakly so
    /// a subscription never keeps a dead component alive.
    pub(crate) fn on_event<S, T, H>(
        &self,
        event: &str,
        owner: Weak<S>,
        handler: H,
    ) -> Listener<Arc<ProtocolEvent>>
    where
        S: Send + Sync + 'static,
        T: serde::de::DeserializeOwned + Send + 'static,
        H: Fn(Arc<S>, T) -> BoxFuture<'static, ()> + Clone + Send + Sync + 'static,
    {
        self.on(
            event,
            Listener::async_fn(move |event: Arc<ProtocolEvent>| {
                let owner = owner.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let Some(owner) = owner.upgrade() else {
                        return;
                    };
                    match event.parse::<T>() {
                        Ok(payload) => handler(owner, payload).await,
                        Err(e) => warn!("undecodable {} payload: {}", event.method, e),
                    }
                })
            }),
        )
    }

    /// Detach this session. All pending sends fail with `TargetClosed`.
    pub async fn detach(&self) -> Result<()> {
        let Some(session_id) = self.inner.session_id.clone() else {
            return Err(Error::InvalidResponse(
                "cannot detach the root session".to_string(),
            ));
        };
        let connection = self
            .inner
            .connection
            .upgrade()
            .ok_or_else(|| Error::TargetClosed("connection dropped".to_string()))?;
        connection
            .submit(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": session_id })),
                None,
            )
            .await?;
        connection.drop_session(&session_id, "session detached");
        Ok(())
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }
}
