//! Frame transport seam.
//!
//! The channel speaks text frames through a [`Transport`]. Production code
//! uses [`WebSocketTransport`]; tests substitute an in-memory transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::ChannelError;

/// Opens connections to a real-time endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens one connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the endpoint cannot be reached.
    async fn open(&self, url: &Url) -> Result<Box<dyn Connection>, ChannelError>;
}

/// One open, bidirectional text frame connection.
#[async_trait]
pub trait Connection: Send {
    /// Sends one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the connection is broken.
    async fn send(&mut self, frame: String) -> Result<(), ChannelError>;

    /// Receives the next text frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> Result<Box<dyn Connection>, ChannelError> {
        log::debug!(
            "Opening WebSocket to {}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.path()
        );
        let (stream, response) = connect_async(url.as_str()).await?;
        log::trace!("WebSocket upgrade status {}", response.status());
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        self.stream.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(Message::Binary(_)) => {
                    log::warn!("Ignoring binary WebSocket frame");
                }
                // tungstenite answers pings itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    log::debug!("WebSocket closed by peer: {frame:?}");
                    return None;
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::trace!("WebSocket close failed: {e}");
        }
    }
}
