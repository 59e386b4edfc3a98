//! Throttled, authenticated REST call path.
//!
//! One [`RestClient`] exists per venue and owns the venue's shared HTTP
//! connection pool. Every call passes through the venue throttler before the
//! request is signed and sent, and responses are decoded into JSON with the
//! venue's error flag applied.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::debug;

use super::auth::Auth;
use crate::error::{Error, Result};
use crate::throttler::AsyncThrottler;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Venue-specific check for an error flag inside a 200 response body.
///
/// Returns a description of the failure when the body signals one
/// (e.g. `ret_code != 0`, `status == "FAILURE"`), `None` otherwise.
pub type BodyErrorFn = fn(&Value) -> Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// A single REST request.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: RestMethod,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub is_auth_required: bool,
    /// Throttler key; defaults to the URL path when unset.
    pub limit_id: Option<String>,
    pub timeout: Duration,
}

impl RestRequest {
    pub fn new(method: RestMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            body: None,
            headers: Vec::new(),
            is_auth_required: false,
            limit_id: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.is_auth_required = true;
        self
    }

    pub fn limit_id(mut self, limit_id: impl Into<String>) -> Self {
        self.limit_id = Some(limit_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn effective_limit_id(&self) -> String {
        self.limit_id.clone().unwrap_or_else(|| {
            url::Url::parse(&self.url)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| self.url.clone())
        })
    }
}

/// A decoded REST response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

/// Shared, throttled HTTP client for one venue.
pub struct RestClient {
    http: HttpClient,
    throttler: Arc<AsyncThrottler>,
    auth: Option<Arc<dyn Auth>>,
    body_error: Option<BodyErrorFn>,
}

impl RestClient {
    pub fn new(throttler: Arc<AsyncThrottler>) -> Self {
        Self {
            http: HttpClient::new(),
            throttler,
            auth: None,
            body_error: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Install the venue's in-body error flag check.
    pub fn with_body_error_check(mut self, check: BodyErrorFn) -> Self {
        self.body_error = Some(check);
        self
    }

    /// Execute `request` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RestResponse`] when the HTTP status is not 200/201 or
    /// the venue's body error flag is set. Callers that want the error body
    /// instead of an error use [`RestClient::call_raw`]. No retries happen at
    /// this layer; retrying is the consuming component's policy.
    pub async fn call(&self, request: RestRequest) -> Result<Value> {
        let response = self.call_raw(request).await?;
        if response.status != 200 && response.status != 201 {
            return Err(Error::RestResponse {
                status: response.status,
                body: response.body.to_string(),
            });
        }
        if let Some(check) = self.body_error {
            if let Some(message) = check(&response.body) {
                return Err(Error::RestResponse {
                    status: response.status,
                    body: message,
                });
            }
        }
        Ok(response.body)
    }

    /// Execute `request` and return status + body without mapping venue
    /// failures into errors.
    pub async fn call_raw(&self, mut request: RestRequest) -> Result<RestResponse> {
        self.throttler
            .execute_task(&request.effective_limit_id())
            .await;

        if request.is_auth_required {
            let auth = self
                .auth
                .as_ref()
                .ok_or_else(|| Error::Auth("No authenticator configured".into()))?;
            auth.rest_authenticate(&mut request).await?;
        }

        debug!(method = %request.method, url = %request.url, "REST call");

        let mut builder = match request.method {
            RestMethod::Get => self.http.get(&request.url),
            RestMethod::Post => self.http.post(&request.url),
            RestMethod::Put => self.http.put(&request.url),
            RestMethod::Delete => self.http.delete(&request.url),
        };
        builder = builder.timeout(request.timeout);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(RestResponse { status, body })
    }
}
