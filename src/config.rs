//! Runtime configuration.
//!
//! A TOML [`Config`] carries the logging section and the flat
//! `{venue}_{parameter}` override map used for fee and rate-limit tuning.
//! API credentials never live in the config file; they come from the
//! environment (or a `.env` file via `dotenvy`).

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::connector::fees::TradeFeeSchema;
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Flat `{venue}_{parameter}` map, e.g.
    /// `binance_perpetual_maker_percent_fee = "0.02"`.
    #[serde(default)]
    pub overrides: OverrideMap,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

/// Install the global tracing subscriber described by `config`. A second
/// call is a no-op (tests install their own subscribers).
pub fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }
}

/// Flat key -> value overrides keyed by `{venue}_{parameter}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct OverrideMap {
    values: HashMap<String, String>,
}

impl OverrideMap {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn decimal(&self, key: &str) -> Option<Decimal> {
        self.values.get(key).and_then(|value| value.parse().ok())
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(|value| value.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Venue API credentials, read from `{PREFIX}_API_KEY` / `{PREFIX}_API_SECRET`.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Load credentials from the environment, honoring a `.env` file.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let key_var = format!("{}_API_KEY", prefix.to_uppercase());
        let secret_var = format!("{}_API_SECRET", prefix.to_uppercase());
        let api_key = std::env::var(&key_var)
            .map_err(|_| Error::Config(format!("{key_var} is not set")))?;
        let api_secret = std::env::var(&secret_var)
            .map_err(|_| Error::Config(format!("{secret_var} is not set")))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

/// Static per-venue settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub name: &'static str,
    pub fee_schema: TradeFeeSchema,
    pub order_id_prefix: &'static str,
    pub max_order_id_len: usize,
    /// Share of the venue's advertised rate limits this client may use, in
    /// percent.
    pub rate_limits_share_pct: f64,
}

impl ConnectorSettings {
    /// Apply the `{venue}_rate_limits_share_pct` override.
    pub fn with_overrides(mut self, overrides: &OverrideMap) -> Self {
        if let Some(pct) = overrides
            .decimal(&format!("{}_rate_limits_share_pct", self.name))
            .and_then(|pct| pct.to_f64())
        {
            self.rate_limits_share_pct = pct.clamp(f64::MIN_POSITIVE, 100.0);
        }
        self
    }
}

/// Registry of every venue's [`ConnectorSettings`], constructed once at
/// startup and passed by reference.
#[derive(Debug, Default)]
pub struct AllConnectorSettings {
    settings: HashMap<&'static str, ConnectorSettings>,
}

impl AllConnectorSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, settings: ConnectorSettings) {
        self.settings.insert(settings.name, settings);
    }

    pub fn get(&self, name: &str) -> Option<&ConnectorSettings> {
        self.settings.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.settings.keys().copied().collect()
    }
}
