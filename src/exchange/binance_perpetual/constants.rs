//! Endpoint catalogue, intervals and rate limits for Binance USDT-margined
//! perpetuals.

use rust_decimal_macros::dec;

use crate::config::ConnectorSettings;
use crate::connector::fees::TradeFeeSchema;
use crate::throttler::{LinkedLimitWeightPair, RateLimit};

pub const EXCHANGE_NAME: &str = "binance_perpetual";

pub const REST_BASE_URL: &str = "https://fapi.binance.com";
pub const TESTNET_REST_BASE_URL: &str = "https://testnet.binancefuture.com";
pub const WS_BASE_URL: &str = "wss://fstream.binance.com";
pub const TESTNET_WS_BASE_URL: &str = "wss://stream.binancefuture.com";

// Public endpoints
pub const EXCHANGE_INFO_PATH: &str = "/fapi/v1/exchangeInfo";
pub const SNAPSHOT_PATH: &str = "/fapi/v1/depth";
pub const TICKER_PRICE_CHANGE_PATH: &str = "/fapi/v1/ticker/24hr";
pub const MARK_PRICE_PATH: &str = "/fapi/v1/premiumIndex";
pub const SERVER_TIME_PATH: &str = "/fapi/v1/time";
pub const PING_PATH: &str = "/fapi/v1/ping";

// Private endpoints
pub const ORDER_PATH: &str = "/fapi/v1/order";
pub const CANCEL_ALL_OPEN_ORDERS_PATH: &str = "/fapi/v1/allOpenOrders";
pub const ACCOUNT_TRADE_LIST_PATH: &str = "/fapi/v1/userTrades";
pub const SET_LEVERAGE_PATH: &str = "/fapi/v1/leverage";
pub const INCOME_HISTORY_PATH: &str = "/fapi/v1/income";
pub const CHANGE_POSITION_MODE_PATH: &str = "/fapi/v1/positionSide/dual";
pub const ACCOUNT_INFO_PATH: &str = "/fapi/v2/account";
pub const POSITION_INFORMATION_PATH: &str = "/fapi/v2/positionRisk";
pub const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";

// Rate limit pools
pub const REQUEST_WEIGHT: &str = "REQUEST_WEIGHT";
pub const ORDERS_1MIN: &str = "ORDERS_1MIN";

pub const ONE_SECOND: f64 = 1.0;
pub const ONE_MINUTE: f64 = 60.0;

pub const MAX_REQUEST: u32 = 2_400;

// Polling cadence
pub const SHORT_POLL_INTERVAL: f64 = 5.0;
pub const LONG_POLL_INTERVAL: f64 = 120.0;
/// User stream silence beyond this switches the status poll to the short
/// interval.
pub const USER_STREAM_STALENESS_THRESHOLD: f64 = 60.0;
pub const TRADING_RULES_POLL_INTERVAL: f64 = 60.0;
pub const FUNDING_INFO_POLL_INTERVAL: f64 = 600.0;
/// Binance funding settles every 8 hours.
pub const FUNDING_FEE_POLL_INTERVAL: f64 = 28_800.0;

// Websocket keep-alive
pub const MESSAGE_TIMEOUT: f64 = 30.0;
pub const PING_TIMEOUT: f64 = 5.0;
pub const LISTEN_KEY_KEEP_ALIVE_INTERVAL: f64 = 1_800.0;
pub const WS_RECONNECT_DELAY: f64 = 5.0;
pub const WS_UNEXPECTED_ERROR_DELAY: f64 = 30.0;

/// Pending-create orders older than this are failed by the status poll.
pub const PENDING_CREATE_TIMEOUT: f64 = 120.0;
/// Consecutive not-found status polls before an order is declared lost.
pub const ORDER_NOT_FOUND_LIMIT: u32 = 3;

pub const ORDER_ID_PREFIX: &str = "cw-";
pub const MAX_ORDER_ID_LEN: usize = 36;

pub fn rate_limits() -> Vec<RateLimit> {
    vec![
        // Pool limits
        RateLimit::new(REQUEST_WEIGHT, MAX_REQUEST, ONE_MINUTE),
        RateLimit::new(ORDERS_1MIN, 1_200, ONE_MINUTE),
        // Per-endpoint weights deducted from the pools
        RateLimit::new(PING_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(SERVER_TIME_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(EXCHANGE_INFO_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(40)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 40)]),
        RateLimit::new(SNAPSHOT_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(20)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 20)]),
        RateLimit::new(TICKER_PRICE_CHANGE_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(MARK_PRICE_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(ORDER_PATH, MAX_REQUEST, ONE_MINUTE).linked_to(vec![
            LinkedLimitWeightPair::new(REQUEST_WEIGHT),
            LinkedLimitWeightPair::new(ORDERS_1MIN),
        ]),
        RateLimit::new(CANCEL_ALL_OPEN_ORDERS_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(ACCOUNT_TRADE_LIST_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(5)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 5)]),
        RateLimit::new(SET_LEVERAGE_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(INCOME_HISTORY_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(30)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 30)]),
        RateLimit::new(CHANGE_POSITION_MODE_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
        RateLimit::new(ACCOUNT_INFO_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(5)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 5)]),
        RateLimit::new(POSITION_INFORMATION_PATH, MAX_REQUEST, ONE_MINUTE)
            .weight(5)
            .linked_to(vec![LinkedLimitWeightPair::with_weight(REQUEST_WEIGHT, 5)]),
        RateLimit::new(LISTEN_KEY_PATH, MAX_REQUEST, ONE_MINUTE)
            .linked_to(vec![LinkedLimitWeightPair::new(REQUEST_WEIGHT)]),
    ]
}

pub fn default_fee_schema() -> TradeFeeSchema {
    TradeFeeSchema::new(dec!(0.0002), dec!(0.0004))
}

pub fn connector_settings() -> ConnectorSettings {
    ConnectorSettings {
        name: EXCHANGE_NAME,
        fee_schema: default_fee_schema(),
        order_id_prefix: ORDER_ID_PREFIX,
        max_order_id_len: MAX_ORDER_ID_LEN,
        rate_limits_share_pct: 100.0,
    }
}
