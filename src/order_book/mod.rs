//! Per-pair order books maintained from venue snapshots and diff streams.

mod book;
mod data_source;
mod message;
mod tracker;

pub use book::{OrderBook, OrderBookSide};
pub use data_source::OrderBookDataSource;
pub use message::{OrderBookMessage, OrderBookRow};
pub use tracker::OrderBookTracker;
