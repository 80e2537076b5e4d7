//! Network request lifecycle for one page target.
//!
//! The browser reports a single HTTP request through several partially
//! ordered events; this module correlates them into `Request`/`Response`
//! objects, tracks redirect chains, and drives request interception
//! including HTTP authentication.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::error::{Error, Result};
use crate::listeners::Listeners;
use crate::multimap::MultiMap;
use crate::protocol::{
    GetResponseBodyResult, LoadingFailedEvent, LoadingFinishedEvent, RequestInterceptedEvent,
    RequestPayload, RequestServedFromCacheEvent, RequestWillBeSentEvent, ResponsePayload,
    ResponseReceivedEvent,
};
use crate::session::Session;

/// Username/password offered on HTTP auth challenges.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Overrides applied when continuing an intercepted request.
#[derive(Debug, Clone, Default)]
pub struct ContinueOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub post_data: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

/// A fulfillment served in place of an intercepted request.
#[derive(Debug, Clone)]
pub struct RespondPayload {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl Default for RespondPayload {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            content_type: None,
            body: None,
        }
    }
}

/// One HTTP request observed on the wire.
///
/// Held alive by the manager's id maps until the protocol reports completion;
/// user code keeps whatever `Arc`s it likes beyond that.
pub struct Request {
    session: Session,
    request_id: Mutex<Option<String>>,
    interception_id: Mutex<Option<String>>,
    url: String,
    method: String,
    headers: HashMap<String, String>,
    post_data: Option<String>,
    resource_type: Option<String>,
    is_navigation_request: bool,
    frame_id: Option<String>,
    redirect_chain: Arc<Mutex<Vec<Arc<Request>>>>,
    response: Mutex<Option<Arc<Response>>>,
    failure: Mutex<Option<String>>,
    from_memory_cache: AtomicBool,
    interception_enabled: bool,
    interception_handled: AtomicBool,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session: Session,
        request_id: Option<String>,
        interception_id: Option<String>,
        interception_enabled: bool,
        payload: &RequestPayload,
        resource_type: Option<String>,
        is_navigation_request: bool,
        frame_id: Option<String>,
        redirect_chain: Arc<Mutex<Vec<Arc<Request>>>>,
    ) -> Self {
        Self {
            session,
            request_id: Mutex::new(request_id),
            interception_id: Mutex::new(interception_id),
            url: payload.url.clone(),
            method: payload.method.clone(),
            headers: flatten_headers(&payload.headers),
            post_data: payload.post_data.clone(),
            resource_type,
            is_navigation_request,
            frame_id,
            redirect_chain,
            response: Mutex::new(None),
            failure: Mutex::new(None),
            from_memory_cache: AtomicBool::new(false),
            interception_enabled,
            interception_handled: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Header names are lower-cased on ingress.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn post_data(&self) -> Option<&str> {
        self.post_data.as_deref()
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    pub fn is_navigation_request(&self) -> bool {
        self.is_navigation_request
    }

    pub fn frame_id(&self) -> Option<&str> {
        self.frame_id.as_deref()
    }

    /// Protocol request id; `None` until an interception-created request is
    /// paired with its `requestWillBeSent` twin.
    pub fn request_id(&self) -> Option<String> {
        self.request_id.lock().clone()
    }

    pub fn interception_id(&self) -> Option<String> {
        self.interception_id.lock().clone()
    }

    /// Prior requests that redirected to this one, oldest first.
    pub fn redirect_chain(&self) -> Vec<Arc<Request>> {
        self.redirect_chain.lock().clone()
    }

    pub fn response(&self) -> Option<Arc<Response>> {
        self.response.lock().clone()
    }

    /// Error text from `loadingFailed`, if the request failed.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn from_memory_cache(&self) -> bool {
        self.from_memory_cache.load(Ordering::SeqCst)
    }

    fn redirect_chain_handle(&self) -> Arc<Mutex<Vec<Arc<Request>>>> {
        self.redirect_chain.clone()
    }

    fn take_interception_handled(&self) -> Result<String> {
        if !self.interception_enabled {
            return Err(Error::InterceptionNotEnabled);
        }
        let interception_id = self
            .interception_id
            .lock()
            .clone()
            .ok_or(Error::InterceptionNotEnabled)?;
        if self.interception_handled.swap(true, Ordering::SeqCst) {
            return Err(Error::InterceptionAlreadyHandled);
        }
        Ok(interception_id)
    }

    /// Let an intercepted request proceed, optionally rewriting it.
    ///
    /// Protocol failures are logged and swallowed: the target may already be
    /// gone by the time the continuation lands.
    pub async fn continue_request(&self, overrides: ContinueOverrides) -> Result<()> {
        let interception_id = self.take_interception_handled()?;
        let mut params = json!({ "interceptionId": interception_id });
        if let Some(url) = overrides.url {
            params["url"] = json!(url);
        }
        if let Some(method) = overrides.method {
            params["method"] = json!(method);
        }
        if let Some(post_data) = overrides.post_data {
            params["postData"] = json!(post_data);
        }
        if let Some(headers) = overrides.headers {
            params["headers"] = json!(headers);
        }
        self.send_interception_response(params).await;
        Ok(())
    }

    /// Abort an intercepted request with a network error.
    pub async fn abort(&self, error_reason: &str) -> Result<()> {
        let interception_id = self.take_interception_handled()?;
        let params = json!({
            "interceptionId": interception_id,
            "errorReason": error_reason,
        });
        self.send_interception_response(params).await;
        Ok(())
    }

    /// Fulfill an intercepted request with a synthetic response.
    pub async fn respond(&self, response: RespondPayload) -> Result<()> {
        let interception_id = self.take_interception_handled()?;

        let mut headers: HashMap<String, String> = response
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        if let Some(content_type) = &response.content_type {
            headers.insert("content-type".to_string(), content_type.clone());
        }
        if let Some(body) = &response.body {
            headers
                .entry("content-length".to_string())
                .or_insert_with(|| body.len().to_string());
        }

        let mut raw = format!(
            "HTTP/1.1 {} {}\r\n",
            response.status,
            status_text(response.status)
        );
        for (name, value) in &headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        let mut bytes = raw.into_bytes();
        if let Some(body) = &response.body {
            bytes.extend_from_slice(body);
        }

        let params = json!({
            "interceptionId": interception_id,
            "rawResponse": BASE64.encode(&bytes),
        });
        self.send_interception_response(params).await;
        Ok(())
    }

    async fn send_interception_response(&self, params: Value) {
        if let Err(e) = self
            .session
            .send("Network.continueInterceptedRequest", Some(params))
            .await
        {
            warn!("continueInterceptedRequest failed: {}", e);
        }
    }
}

#[derive(Clone)]
enum BodyState {
    Pending,
    Ready,
    Unavailable,
    Failed(String),
}

/// A response attached to a request.
pub struct Response {
    session: Session,
    request_id: Option<String>,
    url: Option<String>,
    status: i64,
    status_text: String,
    headers: HashMap<String, String>,
    from_disk_cache: bool,
    from_service_worker: bool,
    security_details: Option<Value>,
    body_state: watch::Sender<BodyState>,
}

impl Response {
    fn new(session: Session, request_id: Option<String>, payload: &ResponsePayload) -> Self {
        let (body_state, _) = watch::channel(BodyState::Pending);
        Self {
            session,
            request_id,
            url: payload.url.clone(),
            status: payload.status,
            status_text: payload.status_text.clone().unwrap_or_default(),
            headers: flatten_headers(&payload.headers),
            from_disk_cache: payload.from_disk_cache.unwrap_or(false),
            from_service_worker: payload.from_service_worker.unwrap_or(false),
            security_details: payload.security_details.clone(),
            body_state,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn status(&self) -> i64 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn from_disk_cache(&self) -> bool {
        self.from_disk_cache
    }

    pub fn from_service_worker(&self) -> bool {
        self.from_service_worker
    }

    pub fn security_details(&self) -> Option<&Value> {
        self.security_details.as_ref()
    }

    /// First transition wins; later resolutions are ignored.
    fn resolve_body(&self, state: BodyState) {
        self.body_state.send_if_modified(|current| {
            if matches!(current, BodyState::Pending) {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Await the body-loaded signal and fetch the body.
    ///
    /// Fails with [`Error::BodyUnavailable`] for redirect responses, whose
    /// bodies can never be retrieved.
    pub async fn body(&self) -> Result<Vec<u8>> {
        let mut rx = self.body_state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                BodyState::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(Error::TargetClosed("response dropped".to_string()));
                    }
                }
                BodyState::Ready => break,
                BodyState::Unavailable => return Err(Error::BodyUnavailable),
                BodyState::Failed(text) => return Err(Error::Navigation(text)),
            }
        }

        let request_id = self.request_id.clone().ok_or(Error::BodyUnavailable)?;
        let raw = self
            .session
            .send(
                "Network.getResponseBody",
                Some(json!({ "requestId": request_id })),
            )
            .await?;
        let result: GetResponseBodyResult = serde_json::from_value(raw)?;
        if result.base64_encoded {
            BASE64
                .decode(result.body.as_bytes())
                .map_err(|e| Error::InvalidResponse(format!("bad body encoding: {}", e)))
        } else {
            Ok(result.body.into_bytes())
        }
    }

    /// The body decoded as UTF-8.
    pub async fn text(&self) -> Result<String> {
        let bytes = self.body().await?;
        String::from_utf8(bytes).map_err(|e| Error::InvalidResponse(format!("non-utf8 body: {}", e)))
    }
}

struct NetworkState {
    request_id_to_request: HashMap<String, Arc<Request>>,
    interception_id_to_request: HashMap<String, Arc<Request>>,
    request_hash_to_request_ids: MultiMap<String, String>,
    request_hash_to_interception_ids: MultiMap<String, String>,
    attempted_authentications: HashSet<String>,
    user_interception_enabled: bool,
    protocol_interception_enabled: bool,
    offline: bool,
    extra_headers: HashMap<String, String>,
    credentials: Option<Credentials>,
}

/// Ordered emissions assembled under the state lock, fired after release.
enum Emit {
    Request(Arc<Request>),
    Response(Arc<Response>),
    Finished(Arc<Request>),
    Failed(Arc<Request>),
}

pub(crate) struct NetworkManagerInner {
    session: Session,
    state: Mutex<NetworkState>,
    request: Listeners<Arc<Request>>,
    response: Listeners<Arc<Response>>,
    request_failed: Listeners<Arc<Request>>,
    request_finished: Listeners<Arc<Request>>,
}

/// Tracks every request of one target and drives interception.
/// Cheap to clone.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<NetworkManagerInner>,
}

impl NetworkManager {
    pub(crate) fn new(session: Session) -> Self {
        let inner = Arc::new(NetworkManagerInner {
            session: session.clone(),
            state: Mutex::new(NetworkState {
                request_id_to_request: HashMap::new(),
                interception_id_to_request: HashMap::new(),
                request_hash_to_request_ids: MultiMap::new(),
                request_hash_to_interception_ids: MultiMap::new(),
                attempted_authentications: HashSet::new(),
                user_interception_enabled: false,
                protocol_interception_enabled: false,
                offline: false,
                extra_headers: HashMap::new(),
                credentials: None,
            }),
            request: Listeners::new(),
            response: Listeners::new(),
            request_failed: Listeners::new(),
            request_finished: Listeners::new(),
        });

        let weak = Arc::downgrade(&inner);
        session.on_event(
            "Network.requestWillBeSent",
            weak.clone(),
            |inner: Arc<NetworkManagerInner>, ev: RequestWillBeSentEvent| {
                Box::pin(async move { inner.on_request_will_be_sent(ev).await })
            },
        );
        session.on_event(
            "Network.requestIntercepted",
            weak.clone(),
            |inner: Arc<NetworkManagerInner>, ev: RequestInterceptedEvent| {
                Box::pin(async move { inner.on_request_intercepted(ev).await })
            },
        );
        session.on_event(
            "Network.responseReceived",
            weak.clone(),
            |inner: Arc<NetworkManagerInner>, ev: ResponseReceivedEvent| {
                Box::pin(async move { inner.on_response_received(ev).await })
            },
        );
        session.on_event(
            "Network.loadingFinished",
            weak.clone(),
            |inner: Arc<NetworkManagerInner>, ev: LoadingFinishedEvent| {
                Box::pin(async move { inner.on_loading_finished(&ev.request_id).await })
            },
        );
        session.on_event(
            "Network.loadingFailed",
            weak.clone(),
            |inner: Arc<NetworkManagerInner>, ev: LoadingFailedEvent| {
                Box::pin(async move { inner.on_loading_failed(ev).await })
            },
        );
        session.on_event(
            "Network.requestServedFromCache",
            weak,
            |inner: Arc<NetworkManagerInner>, ev: RequestServedFromCacheEvent| {
                Box::pin(async move { inner.on_request_served_from_cache(&ev.request_id) })
            },
        );

        Self { inner }
    }

    pub(crate) async fn init(&self) -> Result<()> {
        self.inner.session.send("Network.enable", None).await?;
        Ok(())
    }

    /// Turn user-level request interception on or off.
    pub async fn set_request_interception(&self, enabled: bool) -> Result<()> {
        self.inner.state.lock().user_interception_enabled = enabled;
        self.inner.update_protocol_interception().await
    }

    /// Offer credentials on HTTP auth challenges; `None` clears them.
    pub async fn authenticate(&self, credentials: Option<Credentials>) -> Result<()> {
        self.inner.state.lock().credentials = credentials;
        self.inner.update_protocol_interception().await
    }

    /// Emulate a dropped network connection.
    pub async fn set_offline_mode(&self, offline: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.offline == offline {
                return Ok(());
            }
            state.offline = offline;
        }
        self.inner
            .session
            .send(
                "Network.emulateNetworkConditions",
                Some(json!({
                    "offline": offline,
                    "latency": 0,
                    "downloadThroughput": -1,
                    "uploadThroughput": -1,
                })),
            )
            .await?;
        Ok(())
    }

    /// Attach extra headers to every request. Names are lower-cased.
    pub async fn set_extra_http_headers(&self, headers: HashMap<String, String>) -> Result<()> {
        let lowered: HashMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self.inner.state.lock().extra_headers = lowered.clone();
        self.inner
            .session
            .send(
                "Network.setExtraHTTPHeaders",
                Some(json!({ "headers": lowered })),
            )
            .await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.inner
            .session
            .send(
                "Network.setUserAgentOverride",
                Some(json!({ "userAgent": user_agent })),
            )
            .await?;
        Ok(())
    }

    pub fn extra_http_headers(&self) -> HashMap<String, String> {
        self.inner.state.lock().extra_headers.clone()
    }

    pub fn on_request(&self) -> &Listeners<Arc<Request>> {
        &self.inner.request
    }

    pub fn on_response(&self) -> &Listeners<Arc<Response>> {
        &self.inner.response
    }

    pub fn on_request_failed(&self) -> &Listeners<Arc<Request>> {
        &self.inner.request_failed
    }

    pub fn on_request_finished(&self) -> &Listeners<Arc<Request>> {
        &self.inner.request_finished
    }

    #[cfg(test)]
    pub(crate) fn request_count(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (
            state.request_id_to_request.len(),
            state.interception_id_to_request.len(),
        )
    }
}

impl NetworkManagerInner {
    /// Interception is spoken on the wire whenever the user asked for it or
    /// credentials are configured. Re-asserting the current value is a no-op.
    async fn update_protocol_interception(&self) -> Result<()> {
        let enabled = {
            let mut state = self.state.lock();
            let enabled = state.user_interception_enabled || state.credentials.is_some();
            if enabled == state.protocol_interception_enabled {
                return Ok(());
            }
            state.protocol_interception_enabled = enabled;
            enabled
        };

        self.session
            .send(
                "Network.setCacheDisabled",
                Some(json!({ "cacheDisabled": enabled })),
            )
            .await?;
        let patterns = if enabled {
            json!([{ "urlPattern": "*" }])
        } else {
            json!([])
        };
        self.session
            .send(
                "Network.setRequestInterception",
                Some(json!({ "patterns": patterns })),
            )
            .await?;
        Ok(())
    }

    async fn emit(&self, emissions: Vec<Emit>) {
        for emission in emissions {
            match emission {
                Emit::Request(r) => self.request.invoke(&r).await,
                Emit::Response(r) => self.response.invoke(&r).await,
                Emit::Finished(r) => self.request_finished.invoke(&r).await,
                Emit::Failed(r) => self.request_failed.invoke(&r).await,
            }
        }
    }

    async fn on_request_will_be_sent(&self, ev: RequestWillBeSentEvent) {
        let mut emissions = Vec::new();
        {
            let mut state = self.state.lock();
            let intercepting =
                state.protocol_interception_enabled && !ev.request.url.starts_with("data:");
            if intercepting {
                let hash = request_hash(&ev.request);
                if let Some(interception_id) = state
                    .request_hash_to_interception_ids
                    .first(&hash)
                    .cloned()
                {
                    // The interception arrived first; this event completes
                    // the pairing by assigning the canonical id.
                    state
                        .request_hash_to_interception_ids
                        .remove(&hash, &interception_id);
                    if let Some(request) =
                        state.interception_id_to_request.remove(&interception_id)
                    {
                        *request.request_id.lock() = Some(ev.request_id.clone());
                        state
                            .request_id_to_request
                            .insert(ev.request_id.clone(), request);
                        return;
                    }
                    // Pairing consumed but the request is gone; start fresh.
                    self.handle_request_start(
                        &mut state,
                        &mut emissions,
                        ev,
                        Some(interception_id),
                    );
                } else {
                    state
                        .request_hash_to_request_ids
                        .add(hash, ev.request_id.clone());
                    self.handle_request_start(&mut state, &mut emissions, ev, None);
                }
            } else {
                self.handle_request_start(&mut state, &mut emissions, ev, None);
            }
        }
        self.emit(emissions).await;
    }

    /// Create a new `Request` from a `requestWillBeSent`, finalizing the
    /// previous hop first when the event carries a redirect response.
    fn handle_request_start(
        &self,
        state: &mut NetworkState,
        emissions: &mut Vec<Emit>,
        ev: RequestWillBeSentEvent,
        interception_id: Option<String>,
    ) {
        let mut redirect_chain = Arc::new(Mutex::new(Vec::new()));
        if let Some(redirect_response) = &ev.redirect_response {
            if let Some(previous) = state.request_id_to_request.get(&ev.request_id).cloned() {
                self.finalize_redirect(state, emissions, &previous, redirect_response);
                redirect_chain = previous.redirect_chain_handle();
            }
        }

        let is_navigation = ev.loader_id.as_deref() == Some(ev.request_id.as_str())
            && ev.resource_type.as_deref() == Some("Document");
        let request = Arc::new(Request::new(
            self.session.clone(),
            Some(ev.request_id.clone()),
            interception_id,
            state.user_interception_enabled,
            &ev.request,
            ev.resource_type,
            is_navigation,
            ev.frame_id,
            redirect_chain,
        ));
        state
            .request_id_to_request
            .insert(ev.request_id, request.clone());
        emissions.push(Emit::Request(request));
    }

    /// Finalize a hop that just redirected: attach its response (body
    /// permanently unavailable), extend the shared chain, drop it from the
    /// id maps, and queue `Response` then `RequestFinished`.
    fn finalize_redirect(
        &self,
        state: &mut NetworkState,
        emissions: &mut Vec<Emit>,
        request: &Arc<Request>,
        payload: &ResponsePayload,
    ) {
        let response = Arc::new(Response::new(
            self.session.clone(),
            request.request_id(),
            payload,
        ));
        response.resolve_body(BodyState::Unavailable);
        *request.response.lock() = Some(response.clone());
        request.redirect_chain.lock().push(request.clone());

        if let Some(request_id) = request.request_id() {
            state.request_id_to_request.remove(&request_id);
        }
        if let Some(interception_id) = request.interception_id() {
            state.interception_id_to_request.remove(&interception_id);
            state.attempted_authentications.remove(&interception_id);
        }

        emissions.push(Emit::Response(response));
        emissions.push(Emit::Finished(request.clone()));
    }

    async fn on_request_intercepted(&self, ev: RequestInterceptedEvent) {
        if ev.auth_challenge.is_some() {
            self.respond_to_auth_challenge(&ev.interception_id).await;
            return;
        }

        let mut emissions = Vec::new();
        {
            let mut state = self.state.lock();

            if let Some(redirect_url) = &ev.redirect_url {
                // This interception finalizes the previous hop and opens the
                // next one at the redirect target.
                let previous = state
                    .interception_id_to_request
                    .get(&ev.interception_id)
                    .cloned()
                    .or_else(|| {
                        state
                            .request_id_to_request
                            .values()
                            .find(|r| {
                                r.interception_id().as_deref() == Some(&ev.interception_id)
                            })
                            .cloned()
                    });
                if let Some(previous) = previous {
                    let payload = ResponsePayload {
                        url: Some(previous.url.clone()),
                        status: ev.response_status_code.unwrap_or(0),
                        status_text: None,
                        headers: ev.response_headers.clone().unwrap_or_default(),
                        mime_type: None,
                        from_disk_cache: None,
                        from_service_worker: None,
                        security_details: None,
                    };
                    self.finalize_redirect(&mut state, &mut emissions, &previous, &payload);

                    let mut next_payload = ev.request.clone();
                    next_payload.url = redirect_url.clone();
                    let request = Arc::new(Request::new(
                        self.session.clone(),
                        previous.request_id(),
                        Some(ev.interception_id.clone()),
                        state.user_interception_enabled,
                        &next_payload,
                        ev.resource_type.clone(),
                        ev.is_navigation_request,
                        ev.frame_id.clone(),
                        previous.redirect_chain_handle(),
                    ));
                    match request.request_id() {
                        Some(request_id) => {
                            state.request_id_to_request.insert(request_id, request.clone());
                        }
                        None => {
                            state
                                .interception_id_to_request
                                .insert(ev.interception_id.clone(), request.clone());
                        }
                    }
                    emissions.push(Emit::Request(request));
                }
            } else {
                let hash = request_hash(&ev.request);
                if let Some(request_id) =
                    state.request_hash_to_request_ids.first(&hash).cloned()
                {
                    // The requestWillBeSent arrived first; complete its
                    // request with the interception id.
                    state.request_hash_to_request_ids.remove(&hash, &request_id);
                    if let Some(request) = state.request_id_to_request.get(&request_id).cloned()
                    {
                        *request.interception_id.lock() = Some(ev.interception_id.clone());
                    }
                } else {
                    // Interception first: the request exists without a
                    // canonical id until the twin event arrives.
                    state
                        .request_hash_to_interception_ids
                        .add(hash, ev.interception_id.clone());
                    let request = Arc::new(Request::new(
                        self.session.clone(),
                        None,
                        Some(ev.interception_id.clone()),
                        state.user_interception_enabled,
                        &ev.request,
                        ev.resource_type.clone(),
                        ev.is_navigation_request,
                        ev.frame_id.clone(),
                        Arc::new(Mutex::new(Vec::new())),
                    ));
                    state
                        .interception_id_to_request
                        .insert(ev.interception_id.clone(), request.clone());
                    emissions.push(Emit::Request(request));
                }
            }
        }
        self.emit(emissions).await;
    }

    /// Answer an auth challenge. A second challenge for the same
    /// interception id is always cancelled to break credential loops.
    async fn respond_to_auth_challenge(&self, interception_id: &str) {
        let (response, credentials) = {
            let mut state = self.state.lock();
            let response = if state.attempted_authentications.contains(interception_id) {
                "CancelAuth"
            } else if state.credentials.is_some() {
                state
                    .attempted_authentications
                    .insert(interception_id.to_string());
                "ProvideCredentials"
            } else {
                "Default"
            };
            (response, state.credentials.clone())
        };

        let mut auth_response = json!({ "response": response });
        if let Some(credentials) = credentials {
            auth_response["username"] = json!(credentials.username);
            auth_response["password"] = json!(credentials.password);
        }
        let params = json!({
            "interceptionId": interception_id,
            "authChallengeResponse": auth_response,
        });

        // The target may already be gone by the time this lands; log and
        // move on.
        if let Err(e) = self
            .session
            .send("Network.continueInterceptedRequest", Some(params))
            .await
        {
            warn!("auth challenge response failed: {}", e);
        }
    }

    async fn on_response_received(&self, ev: ResponseReceivedEvent) {
        let mut emissions = Vec::new();
        {
            let state = self.state.lock();
            // The browser omits requestWillBeSent for some cached hits;
            // nothing to attach to then.
            let Some(request) = state.request_id_to_request.get(&ev.request_id).cloned() else {
                return;
            };
            let response = Arc::new(Response::new(
                self.session.clone(),
                Some(ev.request_id.clone()),
                &ev.response,
            ));
            *request.response.lock() = Some(response.clone());
            emissions.push(Emit::Response(response));
        }
        self.emit(emissions).await;
    }

    async fn on_loading_finished(&self, request_id: &str) {
        let mut emissions = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(request) = state.request_id_to_request.remove(request_id) else {
                return;
            };
            if let Some(response) = request.response() {
                response.resolve_body(BodyState::Ready);
            }
            if let Some(interception_id) = request.interception_id() {
                state.interception_id_to_request.remove(&interception_id);
                state.attempted_authentications.remove(&interception_id);
            }
            emissions.push(Emit::Finished(request));
        }
        self.emit(emissions).await;
    }

    async fn on_loading_failed(&self, ev: LoadingFailedEvent) {
        let mut emissions = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(request) = state.request_id_to_request.remove(&ev.request_id) else {
                return;
            };
            *request.failure.lock() = Some(ev.error_text.clone());
            if let Some(response) = request.response() {
                response.resolve_body(BodyState::Failed(ev.error_text));
            }
            if let Some(interception_id) = request.interception_id() {
                state.interception_id_to_request.remove(&interception_id);
                state.attempted_authentications.remove(&interception_id);
            }
            emissions.push(Emit::Failed(request));
        }
        self.emit(emissions).await;
    }

    fn on_request_served_from_cache(&self, request_id: &str) {
        let state = self.state.lock();
        if let Some(request) = state.request_id_to_request.get(request_id) {
            request.from_memory_cache.store(true, Ordering::SeqCst);
        }
    }
}

/// Headers whose value may legitimately differ between the two halves of an
/// interception pair; they are excluded from the correlation hash.
const HASH_IGNORED_HEADERS: &[&str] = &[
    "accept",
    "referer",
    "x-devtools-emulate-network-conditions-client-id",
    "cookie",
    "origin",
    "authorization",
];

/// Content-derived key pairing a `requestWillBeSent` with its
/// `requestIntercepted` twin.
fn request_hash(payload: &RequestPayload) -> String {
    let mut headers: Vec<(String, String)> = payload
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), header_value(v)))
        .filter(|(k, _)| !HASH_IGNORED_HEADERS.contains(&k.as_str()))
        .collect();
    headers.sort();

    let mut hash = format!("{} {}", payload.method, payload.url);
    if let Some(post_data) = &payload.post_data {
        hash.push(' ');
        hash.push_str(post_data);
    }
    for (name, value) in headers {
        hash.push_str(&format!("\n{}: {}", name, value));
    }
    hash
}

fn header_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_headers(headers: &HashMap<String, Value>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), header_value(v)))
        .collect()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

#[cfg(test)]
#[path = "network_tests.rs"]
mod tests;
