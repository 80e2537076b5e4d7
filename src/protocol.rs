//! DevTools protocol envelope and typed event payloads.
//!
//! The wire carries freeform JSON; each event the client consumes is
//! deserialized into one of the payload structs below at the point where a
//! component handles it. Raw `serde_json::Value` params remain available as
//! the escape hatch for methods whose shape the client does not own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing command message.
#[derive(Debug, Serialize)]
pub struct CdpRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Incoming message: a reply (`id`) or an event (`method`).
#[derive(Debug, Deserialize)]
pub struct CdpMessage {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<CdpRemoteError>,
    pub method: Option<String>,
    pub params: Option<Value>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Error object inside a reply.
#[derive(Debug, Deserialize)]
pub struct CdpRemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

/// An event as routed to subscribers: method name plus raw params.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl ProtocolEvent {
    /// Deserialize the params into a typed payload.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }
}

/// Browser version info from the `/json/version` discovery endpoint.
///
/// Note: Chrome returns PascalCase field names for this endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointVersion {
    #[serde(rename = "Browser")]
    pub browser: String,
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// Result of `Browser.getVersion`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserVersion {
    pub protocol_version: Option<String>,
    pub product: String,
    pub revision: Option<String>,
    pub user_agent: String,
    pub js_version: Option<String>,
}

// ============================================================================
// Target domain
// ============================================================================

/// Target description carried by `Target.*` events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    pub url: String,
    pub attached: Option<bool>,
    pub opener_id: Option<String>,
    pub browser_context_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreatedEvent {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoChangedEvent {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyedEvent {
    pub target_id: String,
}

// ============================================================================
// Page domain
// ============================================================================

/// Frame description from `Page.frameNavigated` and `Page.getFrameTree`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub id: String,
    pub parent_id: Option<String>,
    pub loader_id: String,
    pub name: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTree {
    pub frame: FramePayload,
    pub child_frames: Option<Vec<FrameTree>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFrameTreeResult {
    pub frame_tree: FrameTree,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAttachedEvent {
    pub frame_id: String,
    pub parent_frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameNavigatedEvent {
    pub frame: FramePayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatedWithinDocumentEvent {
    pub frame_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetachedEvent {
    pub frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEventPayload {
    pub frame_id: String,
    pub loader_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStoppedLoadingEvent {
    pub frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavascriptDialogOpeningEvent {
    pub url: Option<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResult {
    pub frame_id: Option<String>,
    pub loader_id: Option<String>,
    pub error_text: Option<String>,
}

// ============================================================================
// Runtime domain
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: u64,
    pub origin: Option<String>,
    pub name: Option<String>,
    pub aux_data: Option<Value>,
}

impl ExecutionContextDescription {
    /// Frame this context is attached to, from the aux data.
    pub fn frame_id(&self) -> Option<&str> {
        self.aux_data.as_ref()?.get("frameId")?.as_str()
    }

    /// Whether this is the default world for its frame.
    pub fn is_default(&self) -> bool {
        self.aux_data
            .as_ref()
            .and_then(|aux| aux.get("isDefault"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextCreatedEvent {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyedEvent {
    pub execution_context_id: u64,
}

/// Remote object from the Runtime domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub object_type: String,
    pub subtype: Option<String>,
    pub class_name: Option<String>,
    pub value: Option<Value>,
    pub unserializable_value: Option<String>,
    pub description: Option<String>,
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    pub exception_details: Option<ExceptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub text: String,
    pub line_number: Option<i64>,
    pub column_number: Option<i64>,
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    /// Human-readable description, preferring the thrown value.
    pub fn message(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|e| e.description.clone())
            .unwrap_or_else(|| self.text.clone())
    }
}

// ============================================================================
// Network domain
// ============================================================================

/// Request description shared by `requestWillBeSent` and `requestIntercepted`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    pub post_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub url: Option<String>,
    pub status: i64,
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    pub mime_type: Option<String>,
    pub from_disk_cache: Option<bool>,
    pub from_service_worker: Option<bool>,
    pub security_details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSentEvent {
    pub request_id: String,
    pub loader_id: Option<String>,
    pub request: RequestPayload,
    pub redirect_response: Option<ResponsePayload>,
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub source: Option<String>,
    pub origin: Option<String>,
    pub scheme: Option<String>,
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInterceptedEvent {
    pub interception_id: String,
    pub request: RequestPayload,
    pub frame_id: Option<String>,
    pub resource_type: Option<String>,
    #[serde(default)]
    pub is_navigation_request: bool,
    pub redirect_url: Option<String>,
    pub auth_challenge: Option<AuthChallenge>,
    pub response_status_code: Option<i64>,
    pub response_headers: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceivedEvent {
    pub request_id: String,
    pub response: ResponsePayload,
    #[serde(rename = "type")]
    pub resource_type: Option<String>,
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinishedEvent {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailedEvent {
    pub request_id: String,
    pub error_text: String,
    pub canceled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestServedFromCacheEvent {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResponseBodyResult {
    pub body: String,
    pub base64_encoded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_without_empty_fields() {
        let request = CdpRequest {
            id: 7,
            method: "Page.enable".to_string(),
            params: None,
            session_id: None,
        };
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(text, r#"{"id":7,"method":"Page.enable"}"#);
    }

    #[test]
    fn request_carries_session_id() {
        let request = CdpRequest {
            id: 1,
            method: "Runtime.evaluate".to_string(),
            params: Some(json!({"expression": "1"})),
            session_id: Some("sess-1".to_string()),
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(value["sessionId"], "sess-1");
    }

    #[test]
    fn message_distinguishes_reply_and_event() {
        let reply: CdpMessage =
            serde_json::from_str(r#"{"id":3,"result":{"frameId":"f"}}"#).unwrap();
        assert_eq!(reply.id, Some(3));
        assert!(reply.method.is_none());

        let event: CdpMessage = serde_json::from_str(
            r#"{"method":"Page.frameNavigated","params":{},"sessionId":"s"}"#,
        )
        .unwrap();
        assert!(event.id.is_none());
        assert_eq!(event.method.as_deref(), Some("Page.frameNavigated"));
        assert_eq!(event.session_id.as_deref(), Some("s"));
    }

    #[test]
    fn context_description_reads_aux_data() {
        let context: ExecutionContextDescription = serde_json::from_value(json!({
            "id": 4,
            "origin": "http://a.test",
            "name": "",
            "auxData": {"frameId": "frame-1", "isDefault": true}
        }))
        .unwrap();
        assert_eq!(context.frame_id(), Some("frame-1"));
        assert!(context.is_default());
    }

    #[test]
    fn context_without_aux_data_is_not_default() {
        let context: ExecutionContextDescription =
            serde_json::from_value(json!({"id": 9})).unwrap();
        assert_eq!(context.frame_id(), None);
        assert!(!context.is_default());
    }

    #[test]
    fn intercepted_event_parses_auth_challenge() {
        let event: RequestInterceptedEvent = serde_json::from_value(json!({
            "interceptionId": "int-1",
            "request": {"url": "http://a.test/", "method": "GET", "headers": {}},
            "isNavigationRequest": true,
            "authChallenge": {"origin": "http://a.test", "scheme": "basic", "realm": "r"}
        }))
        .unwrap();
        assert!(event.auth_challenge.is_some());
        assert!(event.redirect_url.is_none());
    }
}
