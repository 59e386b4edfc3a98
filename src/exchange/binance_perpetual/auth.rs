//! HMAC-SHA256 request signing for Binance perpetual.
//!
//! Signed endpoints receive `timestamp` (from the time synchronizer) and
//! `recvWindow` parameters plus a `signature` computed over the urlencoded
//! parameter string; the API key travels in the `X-MBX-APIKEY` header. The
//! private websocket authenticates through its listen-key URL, so there is
//! no websocket auth payload.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::config::ApiCredentials;
use crate::error::Result;
use crate::web::{Auth, RestRequest, TimeSynchronizer};

const RECV_WINDOW_MS: &str = "5000";
pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub struct BinancePerpetualAuth {
    credentials: ApiCredentials,
    time_sync: Arc<TimeSynchronizer>,
}

impl BinancePerpetualAuth {
    pub fn new(credentials: ApiCredentials, time_sync: Arc<TimeSynchronizer>) -> Self {
        Self {
            credentials,
            time_sync,
        }
    }

    pub fn api_key_header(&self) -> (String, String) {
        (API_KEY_HEADER.to_string(), self.credentials.api_key.clone())
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl Auth for BinancePerpetualAuth {
    async fn rest_authenticate(&self, request: &mut RestRequest) -> Result<()> {
        request
            .params
            .push(("timestamp".into(), self.time_sync.time_ms().to_string()));
        request
            .params
            .push(("recvWindow".into(), RECV_WINDOW_MS.into()));

        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        let signature = self.sign(&query);
        request.params.push(("signature".into(), signature));

        let (header, key) = self.api_key_header();
        request.headers.push((header, key));
        Ok(())
    }

    async fn ws_authenticate(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}
