//! JavaScript dialogs (alert, confirm, prompt, beforeunload).

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::JavascriptDialogOpeningEvent;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    Alert,
    BeforeUnload,
    Confirm,
    Prompt,
}

impl DialogKind {
    fn from_protocol(kind: &str) -> Self {
        match kind {
            "alert" => DialogKind::Alert,
            "beforeunload" => DialogKind::BeforeUnload,
            "confirm" => DialogKind::Confirm,
            _ => DialogKind::Prompt,
        }
    }
}

/// A dialog the page opened, waiting to be accepted or dismissed.
pub struct Dialog {
    session: Session,
    kind: DialogKind,
    message: String,
    default_value: String,
    handled: AtomicBool,
}

impl Dialog {
    pub(crate) fn new(session: Session, event: JavascriptDialogOpeningEvent) -> Self {
        Self {
            session,
            kind: DialogKind::from_protocol(&event.kind),
            message: event.message,
            default_value: event.default_prompt.unwrap_or_default(),
            handled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> DialogKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefilled value of a prompt; empty for other kinds.
    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    /// Accept the dialog, optionally answering a prompt.
    pub async fn accept(&self, prompt_text: Option<&str>) -> Result<()> {
        self.handle(true, prompt_text).await
    }

    /// Dismiss the dialog.
    pub async fn dismiss(&self) -> Result<()> {
        self.handle(false, None).await
    }

    async fn handle(&self, accept: bool, prompt_text: Option<&str>) -> Result<()> {
        if self.handled.swap(true, Ordering::SeqCst) {
            return Err(Error::DialogAlreadyHandled);
        }
        let mut params = json!({ "accept": accept });
        if let Some(text) = prompt_text {
            params["promptText"] = json!(text);
        }
        self.session
            .send("Page.handleJavaScriptDialog", Some(params))
            .await?;
        debug!("dialog {:?} handled (accept: {})", self.kind, accept);
        Ok(())
    }
}
