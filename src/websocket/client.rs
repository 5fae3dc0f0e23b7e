//! WebSocket client implementation

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::account::AccountFeed;
use super::config::WsConfig;
use super::confirm::WaitError;
use super::messages::{account_input, frame_tag, PingEvent, SharedHandler};
use super::sequence::{Sequences, StreamId};
use super::subscription::{Subscription, SubscriptionStatus, UnsubscribeStart};
use super::supervisor::{ConnectionEvent, ConnectionState, Supervisor};
use super::transport::{TransportFactory, TungsteniteFactory};
use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::types::{BookFrequency, BookPrecision, CandleInterval, CancelOrderWire, NewOrder, Order};

/// Builder for [`WsClient`]
pub struct WsClientBuilder {
    config: WsConfig,
    credentials: Option<Credentials>,
    factory: Arc<dyn TransportFactory>,
    sequences: Arc<Sequences>,
}

impl std::fmt::Debug for WsClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientBuilder")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl WsClientBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Use a custom transport
    pub fn transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    /// Use private sequences instead of the process-wide ones
    pub fn sequences(mut self, sequences: Arc<Sequences>) -> Self {
        self.sequences = sequences;
        self
    }

    pub fn build(self) -> WsClient {
        WsClient {
            inner: Supervisor::new(self.config, self.factory, self.sequences, self.credentials),
        }
    }
}

/// Multiplexed websocket client for Bitfinex
///
/// One connection carries every market data subscription, the account feeds,
/// and order commands. Subscriptions survive reconnects and maintenance
/// windows: the client re-sends them on every new connection.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Supervisor>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("inner", &self.inner)
            .finish()
    }
}

impl WsClient {
    /// Create a client for the given configuration
    pub fn new(config: WsConfig) -> Self {
        Self::builder(config).build()
    }

    /// Create a client that authenticates with the given credentials
    pub fn with_credentials(config: WsConfig, credentials: Credentials) -> Self {
        Self::builder(config).credentials(credentials).build()
    }

    /// Create a client on the public endpoint
    pub fn public() -> Self {
        Self::new(WsConfig::public())
    }

    pub fn builder(config: WsConfig) -> WsClientBuilder {
        WsClientBuilder {
            config,
            credentials: None,
            factory: Arc::new(TungsteniteFactory),
            sequences: Sequences::process(),
        }
    }

    pub fn config(&self) -> &WsConfig {
        self.inner.config()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect. Returns once the handshake is done; reconnects automatically afterwards.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Disconnect. Subscriptions are kept and re-sent by the next `start`.
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    /// Disconnect and drop every subscription. The client cannot be restarted.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_receiver()
    }

    /// Get a receiver for lifecycle notifications
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    /// Set or replace the credentials; authenticates immediately when connected
    pub async fn set_credentials(&self, credentials: Credentials) {
        self.inner.set_credentials(credentials).await
    }

    /// Send an application-level ping; the pong is logged
    pub async fn ping(&self, cid: u64) -> Result<()> {
        self.inner.send_json(&PingEvent::new(cid)).await
    }

    // ========================================================================
    // Market Data
    // ========================================================================

    /// Subscribe to a market data channel
    ///
    /// While disconnected the request is queued and its stream id returned
    /// right away. While connected this waits for the server's confirmation
    /// and fails with `NoConfirmation` or `ServerRejected`; the request is
    /// then dropped.
    pub async fn subscribe<H>(&self, subscription: Subscription, handler: H) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_shared(subscription, Arc::new(handler)).await
    }

    pub async fn subscribe_shared(
        &self,
        subscription: Subscription,
        handler: SharedHandler,
    ) -> Result<StreamId> {
        let key = subscription.key();
        let channels = self.inner.channels();
        let stream_id = channels.register(subscription, handler).await?;

        if !self.state().is_open() {
            tracing::debug!("Queued subscription {key} as stream {stream_id}");
            return Ok(stream_id);
        }

        // A concurrent sweep may have claimed it already
        let Some((event, confirmation)) = channels.begin_subscribe(stream_id).await else {
            return Ok(stream_id);
        };
        if let Err(e) = self.inner.send_json(&event).await {
            // Lost the connection in between: the next sweep sends it
            tracing::debug!("Subscription {key} deferred: {e}");
            channels.release(stream_id).await;
            return Ok(stream_id);
        }

        match confirmation.wait(self.config().subscribe_timeout).await {
            Ok(Ok(chan_id)) => {
                tracing::info!("Subscribed to {key} on channel {chan_id}");
                Ok(stream_id)
            }
            Ok(Err(message)) => {
                channels.remove(stream_id).await;
                Err(Error::ServerRejected(message))
            }
            Err(WaitError::Timeout) => {
                channels.remove(stream_id).await;
                Err(Error::NoConfirmation(format!("subscribe {key}")))
            }
            Err(WaitError::Abandoned) => {
                channels.remove(stream_id).await;
                Err(Error::NoConfirmation(format!("subscribe {key}: connection lost")))
            }
        }
    }

    /// Subscribe to the ticker of a symbol
    pub async fn subscribe_ticker<H>(&self, symbol: &str, handler: H) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Subscription::ticker(symbol), handler).await
    }

    /// Subscribe to every trade frame: snapshot, `te` (executed) and `tu` (updated)
    pub async fn subscribe_trades<H>(&self, symbol: &str, handler: H) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Subscription::trades(symbol), handler).await
    }

    /// Subscribe to trades, seeing only the snapshot and executions
    pub async fn subscribe_trades_simple<H>(&self, symbol: &str, handler: H) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Subscription::trades(symbol), move |frame: &Value| {
            if frame_tag(frame) != Some("tu") {
                handler(frame);
            }
        })
        .await
    }

    /// Subscribe to the aggregated order book
    pub async fn subscribe_order_book<H>(
        &self,
        symbol: &str,
        precision: BookPrecision,
        frequency: BookFrequency,
        length: u32,
        handler: H,
    ) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = Subscription::book_with_params(symbol, precision, frequency, length);
        self.subscribe(subscription, handler).await
    }

    /// Subscribe to the raw (per order) book
    pub async fn subscribe_raw_order_book<H>(
        &self,
        symbol: &str,
        length: u32,
        handler: H,
    ) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Subscription::raw_book(symbol, length), handler)
            .await
    }

    pub async fn subscribe_candles<H>(
        &self,
        symbol: &str,
        interval: CandleInterval,
        handler: H,
    ) -> Result<StreamId>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(Subscription::candles(symbol, interval), handler)
            .await
    }

    // ========================================================================
    // Account Feeds
    // ========================================================================

    /// Receive every account-channel frame carrying one of the given tags
    ///
    /// Account feeds flow once the session is authenticated; nothing is sent.
    pub async fn subscribe_account<I, S, H>(&self, tags: I, handler: H) -> StreamId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.accounts().register(tags, Arc::new(handler)).await
    }

    pub async fn subscribe_feed<H>(&self, feed: AccountFeed, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .accounts()
            .register_feed(feed, Arc::new(handler))
            .await
    }

    pub async fn subscribe_wallets<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::Wallets, handler).await
    }

    pub async fn subscribe_orders<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::Orders, handler).await
    }

    pub async fn subscribe_positions<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::Positions, handler).await
    }

    /// Own trade executions (`te`/`tu` on the account channel)
    pub async fn subscribe_account_trades<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::Trades, handler).await
    }

    pub async fn subscribe_funding_offers<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::FundingOffers, handler).await
    }

    pub async fn subscribe_funding_credits<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::FundingCredits, handler).await
    }

    pub async fn subscribe_funding_loans<H>(&self, handler: H) -> StreamId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_feed(AccountFeed::FundingLoans, handler).await
    }

    /// Lifecycle state of a market data subscription
    pub async fn subscription_status(&self, stream_id: StreamId) -> Option<SubscriptionStatus> {
        self.inner.channels().status(stream_id).await
    }

    /// The market data channel a stream id was registered for
    pub async fn subscription(&self, stream_id: StreamId) -> Option<Subscription> {
        self.inner.channels().subscription(stream_id).await
    }

    // ========================================================================
    // Unsubscribe
    // ========================================================================

    /// Drop a market data or account stream
    ///
    /// A confirmed channel is unsubscribed on the wire and the call waits for
    /// the server's answer. Fails with `NoSubscription` for an unknown id.
    pub async fn unsubscribe(&self, stream_id: StreamId) -> Result<()> {
        if self.inner.accounts().unregister(stream_id).await {
            return Ok(());
        }

        let channels = self.inner.channels();
        let (event, confirmation) = match channels.begin_unsubscribe(stream_id, true).await {
            UnsubscribeStart::NotFound => return Err(Error::NoSubscription(stream_id)),
            UnsubscribeStart::Removed | UnsubscribeStart::NotConfirmed => return Ok(()),
            UnsubscribeStart::InFlight(chan_id) => {
                tracing::debug!("Unsubscribe of channel {chan_id} already in flight");
                return Ok(());
            }
            UnsubscribeStart::Send {
                event,
                confirmation,
            } => (event, confirmation),
        };

        if let Err(e) = self.inner.send_json(&event).await {
            // Without a connection there is no channel left to leave
            tracing::debug!("Unsubscribe of stream {stream_id} not sent: {e}");
            channels.remove(stream_id).await;
            return Ok(());
        }

        match confirmation.wait(self.config().subscribe_timeout).await {
            Ok(()) | Err(WaitError::Abandoned) => Ok(()),
            Err(WaitError::Timeout) => {
                channels.complete_unsubscribe(event.chan_id).await;
                Err(Error::NoConfirmation(format!(
                    "unsubscribe channel {}",
                    event.chan_id
                )))
            }
        }
    }

    // ========================================================================
    // Trading
    // ========================================================================

    fn ensure_trading(&self) -> Result<()> {
        if !self.inner.has_credentials() {
            return Err(Error::NoCredentials("no API key configured".to_string()));
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::ConnectionNotReady(state));
        }
        if !self.is_authenticated() {
            return Err(Error::NoCredentials("session is not authenticated".to_string()));
        }
        Ok(())
    }

    /// Submit a new order and wait for the exchange to acknowledge it
    ///
    /// Fails without sending anything when the session cannot trade.
    /// `NoConfirmation` means the outcome is unknown: the order may still
    /// have been accepted.
    pub async fn place_order(&self, order: &NewOrder) -> Result<Order> {
        self.ensure_trading()?;
        order.validate()?;

        let pending = self.inner.pending();
        let cid = order
            .client_order_id
            .unwrap_or_else(|| self.inner.sequences().next_client_order_id());
        let frame = account_input("on", &order.to_wire(cid))?;
        let confirmation = pending
            .register_order(cid, order.symbol.as_str(), order.amount, order.type_name())
            .await;

        if let Err(e) = self.inner.send_trading(frame).await {
            pending.remove_order(cid).await;
            return Err(e);
        }
        tracing::debug!("Order {cid} sent: {} {} {}", order.type_name(), order.amount, order.symbol);

        match confirmation.wait(self.config().command_timeout).await {
            Ok(Ok(order)) => Ok(order),
            Ok(Err(message)) => Err(Error::ServerRejected(message)),
            Err(WaitError::Timeout) => {
                pending.remove_order(cid).await;
                Err(Error::NoConfirmation(format!("order {cid}")))
            }
            Err(WaitError::Abandoned) => Err(Error::NoConfirmation(format!(
                "order {cid}: connection lost"
            ))),
        }
    }

    /// Cancel an order by exchange id and wait for the close
    pub async fn cancel_order(&self, order_id: u64) -> Result<bool> {
        self.ensure_trading()?;

        let pending = self.inner.pending();
        let frame = account_input("oc", &CancelOrderWire { id: order_id })?;
        let confirmation = pending.register_cancel(order_id).await?;

        if let Err(e) = self.inner.send_trading(frame).await {
            pending.remove_cancel(order_id).await;
            return Err(e);
        }

        match confirmation.wait(self.config().command_timeout).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(message)) => Err(Error::ServerRejected(message)),
            Err(WaitError::Timeout) => {
                pending.remove_cancel(order_id).await;
                Err(Error::NoConfirmation(format!("cancel {order_id}")))
            }
            Err(WaitError::Abandoned) => Err(Error::NoConfirmation(format!(
                "cancel {order_id}: connection lost"
            ))),
        }
    }
}
