//! Connection: one transport, many sessions.
//!
//! A single reader task decodes every inbound message. Replies are matched to
//! their awaiter by id; events are routed to the session named by their
//! `sessionId` (or the root session when absent). All per-connection state is
//! mutated only on that path or behind the pending-map lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::protocol::{CdpMessage, CdpRequest, ProtocolEvent};
use crate::session::{Session, SessionInner};
use crate::transport::Transport;

pub(crate) struct PendingCommand {
    pub tx: oneshot::Sender<Result<Value>>,
    pub session_id: Option<String>,
}

pub(crate) struct ConnectionInner {
    pub(crate) transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pub(crate) pending: Mutex<HashMap<u64, PendingCommand>>,
    sessions: Mutex<HashMap<String, Arc<SessionInner>>>,
    root: Arc<SessionInner>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// A live protocol connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a transport and start routing its messages.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|weak: &Weak<ConnectionInner>| ConnectionInner {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            root: Arc::new(SessionInner::new(None, weak.clone())),
            closed: AtomicBool::new(false),
            closed_tx,
            reader: Mutex::new(None),
        });

        SessionInner::start_dispatcher(&inner.root);
        let task = tokio::spawn(Self::reader_loop(inner.clone()));
        *inner.reader.lock() = Some(task);

        Self { inner }
    }

    /// The browser-level session (no `sessionId` on the wire).
    pub fn root_session(&self) -> Session {
        Session::from_inner(self.inner.root.clone())
    }

    /// Attach to `target_id` and register the resulting flat session.
    pub async fn create_session(&self, target_id: &str) -> Result<Session> {
        let result = self
            .root_session()
            .send(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
            )
            .await?;

        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| Error::InvalidResponse("missing sessionId".to_string()))?
            .to_string();

        let session = Arc::new(SessionInner::new(
            Some(session_id.clone()),
            Arc::downgrade(&self.inner),
        ));
        SessionInner::start_dispatcher(&session);
        self.inner
            .sessions
            .lock()
            .insert(session_id, session.clone());
        Ok(Session::from_inner(session))
    }

    /// Signal flipping to `true` once the connection has closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop the reader task. No further events or replies will be processed;
    /// in-flight sends fail once `close` runs.
    pub fn stop_reading(&self) {
        if let Some(task) = self.inner.reader.lock().take() {
            task.abort();
        }
    }

    /// Close the connection: stop reading, fail every pending send with
    /// `TargetClosed`, detach all sessions, and tear down the transport.
    pub async fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_reading();
        self.inner.fail_all_pending(reason);
        let sessions: Vec<_> = self.inner.sessions.lock().drain().collect();
        for (_, session) in sessions {
            session.mark_detached();
        }
        self.inner.root.mark_detached();
        self.inner.transport.close().await;
        let _ = self.inner.closed_tx.send(true);
        debug!("connection closed: {}", reason);
    }

    async fn reader_loop(inner: Arc<ConnectionInner>) {
        while let Some(text) = inner.transport.next().await {
            match serde_json::from_str::<CdpMessage>(&text) {
                Ok(message) => inner.handle_message(message),
                Err(e) => warn!("failed to parse protocol message: {}", e),
            }
        }

        // Transport gone: fail whatever is still in flight.
        if !inner.closed.swap(true, Ordering::SeqCst) {
            inner.fail_all_pending("connection closed");
            let sessions: Vec<_> = inner.sessions.lock().drain().collect();
            for (_, session) in sessions {
                session.mark_detached();
            }
            inner.root.mark_detached();
            let _ = inner.closed_tx.send(true);
            error!("transport reader terminated");
        }
    }
}

impl ConnectionInner {
    pub(crate) fn next_command_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn submit(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<String>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TargetClosed("connection closed".to_string()));
        }

        let id = self.next_command_id();
        let request = CdpRequest {
            id,
            method: method.to_string(),
            params,
            session_id: session_id.clone(),
        };
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingCommand { tx, session_id });

        if let Err(e) = self.transport.send(text).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::TargetClosed("connection closed".to_string())),
        }
    }

    fn handle_message(&self, message: CdpMessage) {
        if let Some(id) = message.id {
            let entry = self.pending.lock().remove(&id);
            if let Some(entry) = entry {
                let result = match message.error {
                    Some(e) => Err(Error::Protocol {
                        code: e.code,
                        message: e.message,
                    }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                let _ = entry.tx.send(result);
            }
            return;
        }

        let Some(method) = message.method else {
            return;
        };

        // The browser tells us when a session goes away on its own.
        if method == "Target.detachedFromTarget" {
            let detached_id = message
                .params
                .as_ref()
                .and_then(|p| p.get("sessionId"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(detached_id) = detached_id {
                self.drop_session(&detached_id, "session detached");
            }
            return;
        }

        let event = Arc::new(ProtocolEvent {
            method,
            params: message.params.unwrap_or(Value::Null),
            session_id: message.session_id.clone(),
        });

        let session = match &message.session_id {
            Some(id) => self.sessions.lock().get(id).cloned(),
            None => Some(self.root.clone()),
        };
        match session {
            Some(session) => session.enqueue(event),
            None => debug!("event {} for unknown session", event.method),
        }
    }

    /// Remove a session from the registry and fail its pending sends.
    pub(crate) fn drop_session(&self, session_id: &str, reason: &str) {
        let session = self.sessions.lock().remove(session_id);
        if let Some(session) = session {
            session.mark_detached();
        }
        let failed: Vec<_> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, cmd)| cmd.session_id.as_deref() == Some(session_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for cmd in failed {
            let _ = cmd.tx.send(Err(Error::TargetClosed(reason.to_string())));
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, cmd) in drained {
            let _ = cmd.tx.send(Err(Error::TargetClosed(reason.to_string())));
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}
