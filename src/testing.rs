//! In-process transport for driving the client without a browser.
//!
//! Commands are acknowledged immediately from a per-method stub table and
//! recorded for inspection; protocol events are injected by the test. The
//! reader processes messages in order, so awaiting any command reply
//! guarantees every previously injected event has been dispatched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// How the transport acknowledges a command.
#[derive(Clone)]
enum StubReply {
    /// Reply with this `result` object.
    Result(Value),
    /// Reply with a protocol error object.
    Error { code: i64, message: String },
    /// Never reply; the command stays pending.
    Silent,
}

pub struct LoopbackTransport {
    incoming_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    sent: parking_lot::Mutex<Vec<Value>>,
    responses: parking_lot::Mutex<HashMap<String, StubReply>>,
    closed: AtomicBool,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            incoming_tx: parking_lot::Mutex::new(Some(tx)),
            incoming_rx: tokio::sync::Mutex::new(rx),
            sent: parking_lot::Mutex::new(Vec::new()),
            responses: parking_lot::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Stub the `result` object returned for a method. Methods without a
    /// stub are acknowledged with an empty object.
    pub fn stub_response(&self, method: &str, result: Value) {
        self.responses
            .lock()
            .insert(method.to_string(), StubReply::Result(result));
    }

    /// Make a method fail with a protocol error object.
    pub fn stub_error(&self, method: &str, code: i64, message: &str) {
        self.responses.lock().insert(
            method.to_string(),
            StubReply::Error {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Make a method never reply, leaving its command pending.
    pub fn stub_silent(&self, method: &str) {
        self.responses
            .lock()
            .insert(method.to_string(), StubReply::Silent);
    }

    /// Inject a protocol event as if the browser had emitted it.
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        let mut event = json!({ "method": method, "params": params });
        if let Some(session_id) = session_id {
            event["sessionId"] = json!(session_id);
        }
        self.push(event.to_string());
    }

    /// Every command sent so far, as raw JSON values.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Method names of every command sent so far.
    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|value| value["method"].as_str().map(str::to_string))
            .collect()
    }

    fn push(&self, text: String) {
        if let Some(tx) = self.incoming_tx.lock().as_ref() {
            let _ = tx.send(text);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("transport closed".to_string()));
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| Error::Transport(e.to_string()))?;
        self.sent.lock().push(value.clone());

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let method = value["method"].as_str().unwrap_or_default();
            let reply = self
                .responses
                .lock()
                .get(method)
                .cloned()
                .unwrap_or_else(|| StubReply::Result(json!({})));
            match reply {
                StubReply::Result(result) => {
                    self.push(json!({ "id": id, "result": result }).to_string());
                }
                StubReply::Error { code, message } => {
                    self.push(
                        json!({ "id": id, "error": { "code": code, "message": message } })
                            .to_string(),
                    );
                }
                StubReply::Silent => {}
            }
        }
        Ok(())
    }

    async fn next(&self) -> Option<String> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.incoming_tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
