//! Authenticated REST and websocket session plumbing shared by every venue.

mod auth;
mod rest;
mod time_sync;
mod ws;

pub use auth::Auth;
pub use rest::{BodyErrorFn, RestClient, RestMethod, RestRequest, RestResponse};
pub use time_sync::TimeSynchronizer;
pub use ws::WsConnection;
