//! Message transport between the client and the browser.
//!
//! Framing is the transport's problem; the connection layer only sees whole
//! JSON texts. The trait seam lets tests drive the entire client with a
//! loopback implementation.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::protocol::EndpointVersion;

/// A bidirectional channel carrying protocol JSON texts.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one outgoing message.
    async fn send(&self, text: String) -> Result<()>;

    /// Receive the next inbound message; `None` once the channel is closed.
    async fn next(&self) -> Option<String>;

    /// Tear the channel down. Subsequent `next` calls return `None`.
    async fn close(&self);

    /// Whether the channel has been closed (locally or by the peer).
    fn is_closed(&self) -> bool;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Production transport over a WebSocket.
pub struct WebSocketTransport {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    closed: std::sync::atomic::AtomicBool,
}

impl WebSocketTransport {
    /// Connect to a browser WebSocket URL (`ws://...`).
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("WebSocket: {}", e)))?;
        debug!("WebSocket connected to {}", ws_url);

        let (sink, source) = stream.split();
        Ok(Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, text: String) -> Result<()> {
        trace!("send: {}", text);
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn next(&self) -> Option<String> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!("recv: {}", text);
                    return Some(text.to_string());
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.closed
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.closed
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Resolve the browser WebSocket URL from an `http://host:port` debugging
/// endpoint via `/json/version`. A `ws://` endpoint is returned as-is.
pub async fn resolve_ws_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }

    let version_url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    debug!("Fetching browser version from {}", version_url);

    let version: EndpointVersion = reqwest::get(&version_url)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", endpoint, e)))?
        .json()
        .await
        .map_err(|e| Error::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

    debug!("Discovered browser: {}", version.browser);
    Ok(version.web_socket_debugger_url)
}
