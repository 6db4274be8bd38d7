//! Websocket transport behind small capability traits
//!
//! The session only sees [`FrameSink`] and [`FrameSource`]; [`WsConnector`]
//! provides them over `tokio-tungstenite`, tests provide in-memory ones.

use crate::error::{LoxoneError, Result};
use crate::protocol::commands::{WEBSOCKET_PATH, WEBSOCKET_PROTOCOL};
use crate::protocol::Frame;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the transport, owned by the drain loop
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Read half of the transport, owned by the receive loop
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the transport has ended
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// `ws(s)://<host>:<port>/ws/rfc6455` for the Miniserver at `base`
pub fn websocket_url(base: &Url, use_tls: bool) -> Result<Url> {
    let mut url = base.clone();
    let port = url.port();
    url.set_scheme(if use_tls { "wss" } else { "ws" })
        .map_err(|_| LoxoneError::config(format!("Cannot derive websocket URL from {base}")))?;
    // switching scheme drops a port equal to the old default
    if port.is_none() && url.port().is_none() {
        let default_port = if base.scheme() == "https" { 443 } else { 80 };
        let target_default = if use_tls { 443 } else { 80 };
        if default_port != target_default {
            url.set_port(Some(default_port))
                .map_err(|_| LoxoneError::config(format!("Cannot set port on {base}")))?;
        }
    }
    url.set_path(&format!("/{WEBSOCKET_PATH}"));
    url.set_query(None);
    Ok(url)
}

/// [`Connector`] over `tokio-tungstenite`
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(WEBSOCKET_PROTOCOL),
        );

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| LoxoneError::connection(format!("WebSocket connect to {url} failed: {e}")))?;
        debug!(status = %response.status(), %url, "WebSocket connected");

        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { source })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(bytes) => WsMessage::Binary(bytes),
            Frame::Close => WsMessage::Close(None),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.source.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text))),
                WsMessage::Binary(bytes) => return Some(Ok(Frame::Binary(bytes))),
                WsMessage::Close(reason) => {
                    debug!(?reason, "WebSocket closed by peer");
                    return Some(Ok(Frame::Close));
                }
                other => trace!(kind = ?other, "Ignoring control frame"),
            }
        }
    }
}
