use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("REST response error: HTTP {status}, body: {body}")]
    RestResponse { status: u16, body: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("WebSocket message timeout after {0:?}")]
    WsMessageTimeout(std::time::Duration),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Unknown trading pair symbol: {0}")]
    UnknownSymbol(String),

    #[error(
        "Order book discontinuity for {trading_pair}: diff {diff_update_id} does not follow {last_update_id}"
    )]
    SnapshotDiscontinuity {
        trading_pair: String,
        diff_update_id: u64,
        last_update_id: u64,
    },

    #[error("Execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, Error>;
