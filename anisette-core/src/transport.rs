//! Duplex transport seam for the provisioning session.
//!
//! The handshake state machine only depends on the [`ProvisioningStream`] /
//! [`StreamConnector`] traits, so it can be driven by a scripted in-memory
//! stream in tests. [`WebSocketConnector`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Short connect timeout for the provisioning session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level failures. The handshake maps these into its own terminal
/// failure category.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The connection attempt exceeded the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// The established stream failed while sending or receiving.
    #[error("stream failed: {0}")]
    Stream(String),
}

/// One established duplex connection carrying JSON text frames.
#[async_trait]
pub trait ProvisioningStream: Send {
    /// Sends one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has failed.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receives the next text frame. `Ok(None)` means the peer closed the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has failed or delivered a non-text
    /// data frame.
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    /// Closes the connection with a normal close code.
    ///
    /// # Errors
    ///
    /// Returns an error if the close could not be sent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens [`ProvisioningStream`]s; one per handshake attempt.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connects to the provisioning session endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established within the
    /// connect timeout.
    async fn connect(&self, url: &str)
        -> Result<Box<dyn ProvisioningStream>, TransportError>;
}

/// Rewrites an HTTP base address into the matching WebSocket scheme.
pub(crate) fn websocket_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Creates a connector with the default [`CONNECT_TIMEOUT`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<Box<dyn ProvisioningStream>, TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url))
                .await
                .map_err(|_| TransportError::ConnectTimeout)?
                .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Box::new(WebSocketProvisioningStream { inner: stream }))
    }
}

struct WebSocketProvisioningStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ProvisioningStream for WebSocketProvisioningStream {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Stream(err.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames are transparent to the session protocol.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    return Err(TransportError::Stream(
                        "unexpected binary frame".to_string(),
                    ))
                }
                Some(Err(err)) => return Err(TransportError::Stream(err.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self
            .inner
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
        {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(TransportError::Stream(err.to_string())),
        }
    }
}
