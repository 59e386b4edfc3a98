//! Venue implementations.
//!
//! ## Adding a New Venue
//!
//! 1. Create a module under `exchange/<name>/`
//! 2. Provide the venue pieces:
//!    - `constants` with the endpoint catalogue and its `RateLimit` rows
//!    - an [`Auth`](crate::web::Auth) implementation
//!    - an [`OrderBookDataSource`](crate::order_book::OrderBookDataSource)
//!    - a [`UserStreamDataSource`](crate::user_stream::UserStreamDataSource)
//! 3. Implement [`Connector`](crate::connector::Connector) (and
//!    [`PerpetualConnector`](crate::perpetual::PerpetualConnector) for
//!    derivatives) on top of the shared tracker/throttler machinery.

pub mod binance_perpetual;
