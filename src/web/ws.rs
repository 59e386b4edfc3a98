//! Websocket session wrapper.
//!
//! Wraps a `tokio-tungstenite` stream with the pieces every venue stream
//! needs: JSON send/receive, protocol ping/pong handling, an optional
//! message timeout, and a last-received timestamp for staleness checks.
//! Reconnection policy lives in the data sources, not here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    message_timeout: Option<Duration>,
    last_recv_time: f64,
}

impl WsConnection {
    /// Open a websocket connection to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to WebSocket");
        let (stream, response) = connect_async(url).await?;
        info!(status = %response.status(), "WebSocket connected");
        Ok(Self {
            stream,
            message_timeout: None,
            last_recv_time: 0.0,
        })
    }

    /// Fail `receive_json` with [`Error::WsMessageTimeout`] when no frame
    /// arrives within `timeout`. Callers treat that as the cue to send an
    /// application-level ping.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = Some(timeout);
        self
    }

    /// Change the receive timeout mid-connection; `None` waits forever.
    /// Callers tighten this to the ping window after sending an
    /// application-level ping.
    pub fn set_message_timeout(&mut self, timeout: Option<Duration>) {
        self.message_timeout = timeout;
    }

    /// Epoch seconds of the last received frame, 0.0 before the first one.
    pub fn last_recv_time(&self) -> f64 {
        self.last_recv_time
    }

    /// Send a JSON payload as a text frame.
    pub async fn send_json(&mut self, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Send a protocol-level ping frame.
    pub async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// Receive the next JSON message.
    ///
    /// Protocol pings are answered transparently; pongs and unparseable text
    /// frames are skipped (the latter with a warning). Returns `Ok(None)`
    /// when the server closes the connection or the stream ends.
    pub async fn receive_json(&mut self) -> Result<Option<Value>> {
        loop {
            let message = match self.message_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, self.stream.next()).await {
                    Ok(message) => message,
                    Err(_) => return Err(Error::WsMessageTimeout(timeout)),
                },
                None => self.stream.next().await,
            };

            let Some(message) = message else {
                return Ok(None);
            };

            self.last_recv_time = unix_time_now();
            match message? {
                Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => {
                        warn!(error = %e, raw = %text, "Failed to parse WebSocket message");
                    }
                },
                Message::Ping(data) => {
                    debug!("Received ping");
                    self.stream.send(Message::Pong(data)).await?;
                }
                Message::Close(frame) => {
                    info!(frame = ?frame, "WebSocket closed by server");
                    return Ok(None);
                }
                // Binary, pong and raw frames carry nothing for us.
                _ => {}
            }
        }
    }

    /// Close the connection gracefully. Errors are ignored; the connection is
    /// gone either way.
    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
