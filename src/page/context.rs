//! Execution contexts: handles to JavaScript worlds inside frames.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::protocol::{EvaluateResult, RemoteObject};
use crate::session::Session;

/// A JavaScript realm attached to (at most) one frame.
///
/// Context ids are scoped to one session. A context stops being usable on
/// `Runtime.executionContextDestroyed` or when the runtime clears all
/// contexts on cross-document navigation.
pub struct ExecutionContext {
    id: u64,
    frame_id: Option<String>,
    session: Session,
    destroyed: AtomicBool,
}

impl ExecutionContext {
    pub(crate) fn new(id: u64, frame_id: Option<String>, session: Session) -> Self {
        Self {
            id,
            frame_id,
            session,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn frame_id(&self) -> Option<&str> {
        self.frame_id.as_deref()
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Evaluate an expression in this context and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .evaluate_internal(expression, /* return_by_value */ true)
            .await?;
        Ok(result.result.value.unwrap_or(Value::Null))
    }

    /// Evaluate an expression and keep the result in the page as a handle.
    pub async fn evaluate_handle(&self, expression: &str) -> Result<RemoteObject> {
        let result = self.evaluate_internal(expression, false).await?;
        Ok(result.result)
    }

    async fn evaluate_internal(
        &self,
        expression: &str,
        return_by_value: bool,
    ) -> Result<EvaluateResult> {
        if self.is_destroyed() {
            return Err(Error::ExecutionContextDestroyed);
        }
        let raw = self
            .session
            .send(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "contextId": self.id,
                    "returnByValue": return_by_value,
                    "awaitPromise": true,
                })),
            )
            .await
            .map_err(remap_context_error)?;

        let result: EvaluateResult = serde_json::from_value(raw)?;
        if let Some(details) = &result.exception_details {
            return Err(Error::JavaScript(details.message()));
        }
        Ok(result)
    }

    /// Call a function declaration on a remote object.
    pub async fn call_function_on(
        &self,
        object_id: &str,
        function_declaration: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        if self.is_destroyed() {
            return Err(Error::ExecutionContextDestroyed);
        }
        let arguments: Vec<Value> = args.into_iter().map(|v| json!({ "value": v })).collect();
        let raw = self
            .session
            .send(
                "Runtime.callFunctionOn",
                Some(json!({
                    "objectId": object_id,
                    "functionDeclaration": function_declaration,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await
            .map_err(remap_context_error)?;

        let result: EvaluateResult = serde_json::from_value(raw)?;
        if let Some(details) = &result.exception_details {
            return Err(Error::JavaScript(details.message()));
        }
        Ok(result.result.value.unwrap_or(Value::Null))
    }
}

/// The browser reports evaluation against a gone context as a generic
/// protocol error; surface it as the dedicated variant instead.
fn remap_context_error(e: Error) -> Error {
    match &e {
        Error::Protocol { message, .. } if message.contains("Cannot find context") => {
            Error::ExecutionContextDestroyed
        }
        _ => e,
    }
}
