//! Client error types.

use thiserror::Error;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to reach or handshake with the browser endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote returned an error object for a command.
    #[error("Protocol error: {message} (code: {code})")]
    Protocol { code: i64, message: String },

    /// The session or transport was closed before a reply arrived.
    #[error("Target closed: {0}")]
    TargetClosed(String),

    /// The target map saw an event for an id it does not know.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Navigation did not settle within the configured timeout.
    #[error("Navigation timeout of {0} ms exceeded")]
    NavigationTimeout(u32),

    /// Navigation failed for a reason reported by the protocol.
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// The body of a redirect response can never be retrieved.
    #[error("Response body is unavailable for redirect responses")]
    BodyUnavailable,

    /// Operation against a frame that has been removed from its tree.
    #[error("Frame is detached")]
    DetachedFrame,

    /// Operation against an execution context that no longer exists.
    #[error("Execution context was destroyed")]
    ExecutionContextDestroyed,

    /// Script evaluation threw in the page.
    #[error("JavaScript error: {0}")]
    JavaScript(String),

    /// Interception API used without request interception enabled.
    #[error("Request interception is not enabled")]
    InterceptionNotEnabled,

    /// An intercepted request was continued, aborted, or fulfilled twice.
    #[error("Request is already handled")]
    InterceptionAlreadyHandled,

    /// A dialog was accepted or dismissed twice.
    #[error("Dialog is already handled")]
    DialogAlreadyHandled,

    /// WebSocket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error during endpoint discovery.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A response payload was missing a field the client requires.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::ConnectionFailed(format!("Invalid URL: {}", e))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
