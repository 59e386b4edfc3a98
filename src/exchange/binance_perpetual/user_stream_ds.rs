//! Private user stream over the listen-key channel.
//!
//! The listen key is obtained via REST with the API-key header (no
//! signature), refreshed with a keep-alive every 30 minutes, and the private
//! socket connects to `/ws/<listen_key>`. The venue expires idle keys and
//! announces it with a `listenKeyExpired` event, which triggers a reconnect
//! with a fresh key.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::auth::BinancePerpetualAuth;
use super::constants;
use super::messages::{self, ListenKeyResponse};
use crate::error::{Error, Result};
use crate::user_stream::{TimestampCell, UserStreamDataSource};
use crate::web::{RestClient, RestMethod, RestRequest, WsConnection};

pub struct BinancePerpetualUserStreamDataSource {
    rest: Arc<RestClient>,
    auth: Arc<BinancePerpetualAuth>,
    rest_base: String,
    ws_base: String,
    last_recv: TimestampCell,
}

impl BinancePerpetualUserStreamDataSource {
    pub fn new(
        rest: Arc<RestClient>,
        auth: Arc<BinancePerpetualAuth>,
        rest_base: impl Into<String>,
        ws_base: impl Into<String>,
    ) -> Self {
        Self {
            rest,
            auth,
            rest_base: rest_base.into(),
            ws_base: ws_base.into(),
            last_recv: TimestampCell::new(),
        }
    }

    async fn fetch_listen_key(&self) -> Result<String> {
        let (header, key) = self.auth.api_key_header();
        let url = format!("{}{}", self.rest_base, constants::LISTEN_KEY_PATH);
        let body = self
            .rest
            .call(RestRequest::new(RestMethod::Post, url).header(header, key))
            .await?;
        let response: ListenKeyResponse = serde_json::from_value(body)?;
        Ok(response.listen_key)
    }

    async fn keep_alive_listen_key(&self) -> Result<()> {
        let (header, key) = self.auth.api_key_header();
        let url = format!("{}{}", self.rest_base, constants::LISTEN_KEY_PATH);
        self.rest
            .call(RestRequest::new(RestMethod::Put, url).header(header, key))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStreamDataSource for BinancePerpetualUserStreamDataSource {
    async fn listen(&self, output: mpsc::UnboundedSender<Value>) {
        loop {
            let listen_key = match self.fetch_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Failed to obtain listen key, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(constants::WS_RECONNECT_DELAY))
                        .await;
                    continue;
                }
            };

            let url = format!("{}/ws/{}", self.ws_base, listen_key);
            let mut ws = match WsConnection::connect(&url).await {
                Ok(ws) => {
                    ws.with_message_timeout(Duration::from_secs_f64(constants::MESSAGE_TIMEOUT))
                }
                Err(e) => {
                    warn!(error = %e, "User stream connection failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(constants::WS_RECONNECT_DELAY))
                        .await;
                    continue;
                }
            };
            info!("User stream connected");

            let mut last_keep_alive = Instant::now();
            let mut ping_sent_at: Option<f64> = None;
            loop {
                if last_keep_alive.elapsed().as_secs_f64()
                    >= constants::LISTEN_KEY_KEEP_ALIVE_INTERVAL
                {
                    if let Err(e) = self.keep_alive_listen_key().await {
                        warn!(error = %e, "Listen key keep-alive failed");
                    }
                    last_keep_alive = Instant::now();
                }

                match ws.receive_json().await {
                    Ok(Some(value)) => {
                        if ping_sent_at.take().is_some() {
                            ws.set_message_timeout(Some(Duration::from_secs_f64(
                                constants::MESSAGE_TIMEOUT,
                            )));
                        }
                        self.last_recv.set(unix_time_now());
                        if value.get("e").and_then(Value::as_str)
                            == Some(messages::LISTEN_KEY_EXPIRED_EVENT)
                        {
                            info!("Listen key expired, reconnecting with a fresh key");
                            break;
                        }
                        if output.send(value).is_err() {
                            ws.close().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        warn!("User stream disconnected");
                        break;
                    }
                    Err(Error::WsMessageTimeout(_)) => {
                        // A silent window gets a ping and a tightened
                        // timeout. Pongs are answered inside the connection
                        // without surfacing here, so liveness shows up as a
                        // fresher frame timestamp.
                        if let Some(sent_at) = ping_sent_at {
                            if ws.last_recv_time() >= sent_at {
                                ping_sent_at = None;
                                ws.set_message_timeout(Some(Duration::from_secs_f64(
                                    constants::MESSAGE_TIMEOUT,
                                )));
                                continue;
                            }
                            warn!("No reply within the ping window, reconnecting");
                            break;
                        }
                        ping_sent_at = Some(unix_time_now());
                        ws.set_message_timeout(Some(Duration::from_secs_f64(
                            constants::PING_TIMEOUT,
                        )));
                        if let Err(e) = ws.ping().await {
                            warn!(error = %e, "Ping failed, reconnecting");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "User stream error, reconnecting");
                        break;
                    }
                }
            }
            ws.close().await;
            tokio::time::sleep(Duration::from_secs_f64(constants::WS_RECONNECT_DELAY)).await;
        }
    }

    fn last_recv_time(&self) -> f64 {
        self.last_recv.get()
    }
}

fn unix_time_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}
