//! Crosswire - multi-venue exchange connector runtime.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── clock/         # Tick source driving connectors and strategies
//! ├── throttler/     # Sliding-window rate limiting with linked pools
//! ├── web/           # REST/WS sessions, signing, server-time sync
//! ├── order_book/    # Books, snapshot/diff tracking
//! ├── user_stream/   # Private stream tracking
//! ├── events/        # Typed market events + weak-listener bus
//! ├── connector/     # Connector contract, in-flight orders, rules, fees
//! ├── perpetual/     # Position book, funding, perpetual contract
//! └── exchange/      # Venue implementations
//! ```
//!
//! Strategies register connectors on the [`clock::Clock`], read order books
//! and balances from the [`connector::Connector`] operations, place orders
//! with `buy`/`sell`/`cancel`, and receive typed [`events::MarketEvent`]s
//! through the [`events::EventBus`].

pub mod clock;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod exchange;
pub mod order_book;
pub mod perpetual;
pub mod throttler;
pub mod user_stream;
pub mod web;

pub use error::{Error, Result};
