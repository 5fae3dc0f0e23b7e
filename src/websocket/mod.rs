//! Multiplexed websocket client for Bitfinex real-time data and trading
//!
//! One connection carries public market data channels (ticker, trades, books,
//! candles), the authenticated account channel (wallets, orders, positions,
//! funding) and order commands. The client tracks every subscription across
//! reconnects and maintenance pauses and re-sends it when needed.
//!
//! # Example
//!
//! ```ignore
//! use bitfinex_ws::websocket::{WsClient, WsConfig};
//!
//! let client = WsClient::new(WsConfig::public());
//! client.start().await?;
//!
//! let stream = client
//!     .subscribe_ticker("tBTCUSD", |frame| println!("{frame}"))
//!     .await?;
//!
//! client.unsubscribe(stream).await?;
//! client.close().await?;
//! ```

mod account;
mod client;
mod config;
mod confirm;
mod dispatch;
mod messages;
mod pending;
mod pump;
mod sequence;
mod subscription;
mod supervisor;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use account::AccountFeed;
pub use client::{WsClient, WsClientBuilder};
pub use config::{ReconnectConfig, WsConfig, AUTH_WS_URL, PUBLIC_WS_URL};
pub use messages::{FrameHandler, SharedHandler};
pub use pending::Correlation;
pub use sequence::{Sequences, StreamId};
pub use subscription::{Subscription, SubscriptionKey, SubscriptionStatus, DEFAULT_BOOK_LENGTH};
pub use supervisor::{ConnectionEvent, ConnectionState};
pub use transport::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TungsteniteFactory,
    TungsteniteTransport,
};
