//! Bitfinex websocket client
//!
//! An authenticated, multiplexed client for the Bitfinex v2 streaming API:
//! - Market data channels (ticker, trades, order books, candles)
//! - Account feeds (wallets, orders, positions, trades, funding)
//! - Order placement and cancellation with acknowledgement tracking
//! - Reconnect, resubscribe and maintenance handling

pub mod auth;
pub mod error;
pub mod types;
pub mod websocket;

pub use auth::{Credentials, HmacSigner, Signer};
pub use error::{Error, Result};
pub use types::*;
pub use websocket::{ConnectionEvent, ConnectionState, StreamId, Subscription, WsClient, WsConfig};
