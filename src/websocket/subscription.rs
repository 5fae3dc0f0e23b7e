//! Market data subscriptions and the channel registry
//!
//! A subscription is identified by its [`SubscriptionKey`] until the server
//! confirms it and assigns a channel id. The [`ChannelRegistry`] tracks every
//! subscription through its lifecycle:
//!
//! ```text
//! Pending -> AwaitingConfirmation -> Confirmed -> Unsubscribing -> (removed)
//!    ^                                                 |
//!    +------------- non-terminal unsubscribe ----------+
//! ```
//!
//! Requests survive disconnects: on disconnect every request falls back to
//! `Pending` and is re-sent by the next resubscribe sweep.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::confirm::{confirmation, ConfirmSlot, Confirmation};
use super::messages::{
    invoke_handler, ChannelParams, SharedHandler, SubscribeEvent, UnsubscribeEvent,
};
use super::sequence::{Sequences, StreamId};
use crate::error::{Error, Result};
use crate::types::{BookFrequency, BookPrecision, CandleInterval};

/// Default number of price levels of a book subscription
pub const DEFAULT_BOOK_LENGTH: u32 = 25;

// ============================================================================
// Subscription Types
// ============================================================================

/// A market data channel and its parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Ticker
    Ticker { symbol: String },

    /// Public trades
    Trades { symbol: String },

    /// Order book, aggregated (`P0`..`P4`) or raw (`R0`)
    Book {
        symbol: String,
        precision: BookPrecision,
        frequency: BookFrequency,
        length: u32,
    },

    /// Candles for a time frame
    Candles {
        symbol: String,
        interval: CandleInterval,
    },
}

impl Subscription {
    pub fn ticker(symbol: impl Into<String>) -> Self {
        Subscription::Ticker {
            symbol: symbol.into(),
        }
    }

    pub fn trades(symbol: impl Into<String>) -> Self {
        Subscription::Trades {
            symbol: symbol.into(),
        }
    }

    /// Aggregated book with default precision, frequency, and length
    pub fn book(symbol: impl Into<String>) -> Self {
        Self::book_with_params(
            symbol,
            BookPrecision::P0,
            BookFrequency::F0,
            DEFAULT_BOOK_LENGTH,
        )
    }

    pub fn book_with_params(
        symbol: impl Into<String>,
        precision: BookPrecision,
        frequency: BookFrequency,
        length: u32,
    ) -> Self {
        Subscription::Book {
            symbol: symbol.into(),
            precision,
            frequency,
            length,
        }
    }

    /// Raw book: individual orders rather than price levels
    pub fn raw_book(symbol: impl Into<String>, length: u32) -> Self {
        Self::book_with_params(symbol, BookPrecision::R0, BookFrequency::F0, length)
    }

    pub fn candles(symbol: impl Into<String>, interval: CandleInterval) -> Self {
        Subscription::Candles {
            symbol: symbol.into(),
            interval,
        }
    }

    /// Wire channel name
    pub fn channel_name(&self) -> &'static str {
        match self {
            Subscription::Ticker { .. } => "ticker",
            Subscription::Trades { .. } => "trades",
            Subscription::Book { .. } => "book",
            Subscription::Candles { .. } => "candles",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Subscription::Ticker { symbol }
            | Subscription::Trades { symbol }
            | Subscription::Book { symbol, .. }
            | Subscription::Candles { symbol, .. } => symbol,
        }
    }

    /// Identity used to match the server's confirmation to this request
    pub fn key(&self) -> SubscriptionKey {
        match self {
            Subscription::Ticker { symbol } | Subscription::Trades { symbol } => {
                SubscriptionKey::new(self.channel_name(), &[symbol.as_str()])
            }
            Subscription::Book {
                symbol,
                precision,
                frequency,
                length,
            } => {
                let length = length.to_string();
                SubscriptionKey::new(
                    "book",
                    &[
                        symbol.as_str(),
                        precision.as_str(),
                        frequency.as_str(),
                        length.as_str(),
                    ],
                )
            }
            Subscription::Candles { symbol, interval } => {
                let key = candle_key(symbol, *interval);
                SubscriptionKey::new("candles", &[key.as_str()])
            }
        }
    }

    /// The `subscribe` event for this channel
    pub fn subscribe_event(&self) -> SubscribeEvent {
        let mut event = SubscribeEvent {
            event: "subscribe",
            channel: self.channel_name(),
            symbol: None,
            prec: None,
            freq: None,
            len: None,
            key: None,
        };
        match self {
            Subscription::Ticker { symbol } | Subscription::Trades { symbol } => {
                event.symbol = Some(symbol.clone());
            }
            Subscription::Book {
                symbol,
                precision,
                frequency,
                length,
            } => {
                event.symbol = Some(symbol.clone());
                event.prec = Some(precision.as_str());
                event.freq = Some(frequency.as_str());
                event.len = Some(length.to_string());
            }
            Subscription::Candles { symbol, interval } => {
                event.key = Some(candle_key(symbol, *interval));
            }
        }
        event
    }
}

/// Candle channel key: `trade:<interval>:<symbol>`
fn candle_key(symbol: &str, interval: CandleInterval) -> String {
    format!("trade:{}:{}", interval.as_str(), symbol)
}

/// Channel type plus parameters, in a canonical string form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    fn new(channel: &str, parts: &[&str]) -> Self {
        let mut key = channel.to_string();
        for part in parts {
            key.push('|');
            key.push_str(part);
        }
        Self(key)
    }

    /// Rebuild the key from the parameters the server echoes back
    pub fn from_params(params: &ChannelParams) -> Option<Self> {
        let channel = params.channel.as_deref()?;
        match channel {
            "ticker" | "trades" => Some(Self::new(channel, &[params.symbol.as_deref()?])),
            "book" => {
                let prec = param_text(params.prec.as_ref()).unwrap_or_else(|| "P0".to_string());
                let freq = param_text(params.freq.as_ref()).unwrap_or_else(|| "F0".to_string());
                let len = param_text(params.len.as_ref())
                    .unwrap_or_else(|| DEFAULT_BOOK_LENGTH.to_string());
                Some(Self::new(
                    "book",
                    &[
                        params.symbol.as_deref()?,
                        prec.as_str(),
                        freq.as_str(),
                        len.as_str(),
                    ],
                ))
            }
            "candles" => Some(Self::new("candles", &[params.key.as_deref()?])),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn param_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Channel Registry
// ============================================================================

/// Lifecycle state of a subscription request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Registered, not yet sent on the current connection
    Pending,
    /// Subscribe event sent, waiting for `subscribed`
    AwaitingConfirmation,
    /// Active on the given channel id
    Confirmed(u64),
    /// Unsubscribe event sent for the given channel id
    Unsubscribing(u64),
}

/// Result delivered to a subscribe waiter: the channel id, or the server's rejection text
pub type SubscribeOutcome = std::result::Result<u64, String>;

struct SubscriptionRequest {
    subscription: Subscription,
    key: SubscriptionKey,
    status: SubscriptionStatus,
    handler: SharedHandler,
    confirm: Option<ConfirmSlot<SubscribeOutcome>>,
}

struct UnsubscriptionRequest {
    stream_id: StreamId,
    terminal: bool,
    confirm: ConfirmSlot<()>,
}

#[derive(Default)]
struct RegistryState {
    requests: HashMap<StreamId, SubscriptionRequest>,
    channels: HashMap<u64, StreamId>,
    unsubscribes: HashMap<u64, UnsubscriptionRequest>,
}

impl RegistryState {
    fn unindex(&mut self, stream_id: StreamId) {
        self.channels.retain(|_, id| *id != stream_id);
    }
}

/// Outcome of matching a `subscribed` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Exactly one outstanding request matched and is now confirmed
    Confirmed(StreamId),
    /// No outstanding request carries the key
    Unmatched,
}

/// Outcome of starting an unsubscribe
#[derive(Debug)]
pub enum UnsubscribeStart {
    /// The stream id is not registered
    NotFound,
    /// The request was never confirmed and has been dropped locally
    Removed,
    /// The request was not confirmed, nothing to send
    NotConfirmed,
    /// An unsubscribe for this channel is already in flight
    InFlight(u64),
    /// Send the event and wait on the confirmation
    Send {
        event: UnsubscribeEvent,
        confirmation: Confirmation<()>,
    },
}

/// Tracks every market data subscription of a client
#[derive(Clone)]
pub struct ChannelRegistry {
    state: Arc<RwLock<RegistryState>>,
    sequences: Arc<Sequences>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    pub fn new(sequences: Arc<Sequences>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            sequences,
        }
    }

    /// Register a subscription as `Pending` and allocate its stream id
    ///
    /// Fails if a subscription with the same key is already registered.
    pub async fn register(
        &self,
        subscription: Subscription,
        handler: SharedHandler,
    ) -> Result<StreamId> {
        let key = subscription.key();
        let mut state = self.state.write().await;
        if state.requests.values().any(|r| r.key == key) {
            return Err(Error::DuplicateSubscription(key.to_string()));
        }

        let stream_id = self.sequences.next_stream_id();
        state.requests.insert(
            stream_id,
            SubscriptionRequest {
                subscription,
                key,
                status: SubscriptionStatus::Pending,
                handler,
                confirm: None,
            },
        );
        Ok(stream_id)
    }

    /// Claim a `Pending` request for sending
    ///
    /// Returns the wire event and the confirmation to wait on, or `None` if
    /// the request is gone or was already claimed by a sweep.
    pub async fn begin_subscribe(
        &self,
        stream_id: StreamId,
    ) -> Option<(SubscribeEvent, Confirmation<SubscribeOutcome>)> {
        let mut state = self.state.write().await;
        let request = state.requests.get_mut(&stream_id)?;
        if request.status != SubscriptionStatus::Pending {
            return None;
        }

        let (slot, confirmation) = confirmation();
        request.status = SubscriptionStatus::AwaitingConfirmation;
        request.confirm = Some(slot);
        Some((request.subscription.subscribe_event(), confirmation))
    }

    /// Hand a claimed request back to the sweep after its subscribe could not be sent
    pub async fn release(&self, stream_id: StreamId) {
        let mut state = self.state.write().await;
        if let Some(request) = state.requests.get_mut(&stream_id) {
            if request.status == SubscriptionStatus::AwaitingConfirmation {
                request.status = SubscriptionStatus::Pending;
            }
        }
    }

    /// Claim every `Pending` request for the resubscribe sweep, oldest first
    pub async fn sweep(&self) -> Vec<(StreamId, SubscribeEvent)> {
        let mut state = self.state.write().await;
        let mut claimed: Vec<(StreamId, SubscribeEvent)> = state
            .requests
            .iter_mut()
            .filter(|(_, r)| r.status == SubscriptionStatus::Pending)
            .map(|(stream_id, request)| {
                request.status = SubscriptionStatus::AwaitingConfirmation;
                // Keep an unresolved slot: a caller may still be waiting on it
                if request.confirm.as_ref().map_or(true, ConfirmSlot::is_resolved) {
                    let (slot, _) = confirmation();
                    request.confirm = Some(slot);
                }
                (*stream_id, request.subscription.subscribe_event())
            })
            .collect();
        // Stream ids count down, so the oldest request has the largest id
        claimed.sort_by(|a, b| b.0.cmp(&a.0));
        claimed
    }

    /// Match a `subscribed` event to its outstanding request
    pub async fn confirm(&self, key: &SubscriptionKey, chan_id: u64) -> ConfirmOutcome {
        let mut state = self.state.write().await;

        let matched = state
            .requests
            .iter()
            .find(|(_, r)| {
                &r.key == key
                    && matches!(
                        r.status,
                        SubscriptionStatus::Pending | SubscriptionStatus::AwaitingConfirmation
                    )
            })
            .map(|(id, _)| *id);
        let Some(stream_id) = matched else {
            return ConfirmOutcome::Unmatched;
        };

        // A channel id belongs to at most one confirmed request
        if let Some(stale) = state.channels.insert(chan_id, stream_id) {
            if stale != stream_id {
                tracing::warn!("Channel {chan_id} reassigned from stream {stale} to {stream_id}");
                if let Some(request) = state.requests.get_mut(&stale) {
                    request.status = SubscriptionStatus::Pending;
                }
            }
        }

        if let Some(request) = state.requests.get_mut(&stream_id) {
            request.status = SubscriptionStatus::Confirmed(chan_id);
            if let Some(slot) = &request.confirm {
                slot.resolve(Ok(chan_id));
            }
        }
        ConfirmOutcome::Confirmed(stream_id)
    }

    /// Reject the outstanding request with the given key
    ///
    /// The request falls back to `Pending`; a waiting subscriber receives the
    /// server's message.
    pub async fn reject(&self, key: &SubscriptionKey, message: &str) -> Option<StreamId> {
        let mut state = self.state.write().await;
        let (stream_id, request) = state.requests.iter_mut().find(|(_, r)| {
            &r.key == key && r.status == SubscriptionStatus::AwaitingConfirmation
        })?;

        request.status = SubscriptionStatus::Pending;
        if let Some(slot) = request.confirm.take() {
            slot.resolve(Err(message.to_string()));
        }
        Some(*stream_id)
    }

    /// Hand a data frame to the handler of a confirmed channel
    ///
    /// Returns false when no confirmed request owns the channel id.
    pub async fn route(&self, chan_id: u64, frame: &serde_json::Value) -> bool {
        let handler = {
            let state = self.state.read().await;
            let Some(stream_id) = state.channels.get(&chan_id) else {
                return false;
            };
            match state.requests.get(stream_id) {
                Some(request) => request.handler.clone(),
                None => return false,
            }
        };
        invoke_handler(handler.as_ref(), frame);
        true
    }

    /// Whether a confirmed request owns the channel id
    pub async fn is_confirmed_channel(&self, chan_id: u64) -> bool {
        self.state.read().await.channels.contains_key(&chan_id)
    }

    /// Start unsubscribing a stream
    ///
    /// A terminal unsubscribe deletes the request once confirmed; a
    /// non-terminal one returns it to `Pending` for the next sweep.
    pub async fn begin_unsubscribe(&self, stream_id: StreamId, terminal: bool) -> UnsubscribeStart {
        let mut state = self.state.write().await;
        let Some(status) = state.requests.get(&stream_id).map(|r| r.status) else {
            return UnsubscribeStart::NotFound;
        };

        match status {
            SubscriptionStatus::Confirmed(chan_id) => {
                let (slot, confirmation) = confirmation();
                state.unsubscribes.insert(
                    chan_id,
                    UnsubscriptionRequest {
                        stream_id,
                        terminal,
                        confirm: slot,
                    },
                );
                if let Some(request) = state.requests.get_mut(&stream_id) {
                    request.status = SubscriptionStatus::Unsubscribing(chan_id);
                }
                UnsubscribeStart::Send {
                    event: UnsubscribeEvent::new(chan_id),
                    confirmation,
                }
            }
            SubscriptionStatus::Unsubscribing(chan_id) => {
                // The caller's removal wins over an in-flight refresh
                if terminal {
                    if let Some(unsub) = state.unsubscribes.get_mut(&chan_id) {
                        unsub.terminal = true;
                    }
                }
                UnsubscribeStart::InFlight(chan_id)
            }
            SubscriptionStatus::Pending | SubscriptionStatus::AwaitingConfirmation => {
                if terminal {
                    state.requests.remove(&stream_id);
                    UnsubscribeStart::Removed
                } else {
                    UnsubscribeStart::NotConfirmed
                }
            }
        }
    }

    /// Finish the unsubscribe in flight for a channel
    ///
    /// Called for an `unsubscribed` event, or when the wait for one gives up.
    /// Idempotent: returns `None` once the unsubscribe has been completed.
    pub async fn complete_unsubscribe(&self, chan_id: u64) -> Option<StreamId> {
        let mut state = self.state.write().await;
        let unsub = state.unsubscribes.remove(&chan_id)?;
        if state.channels.get(&chan_id) == Some(&unsub.stream_id) {
            state.channels.remove(&chan_id);
        }

        if unsub.terminal {
            state.requests.remove(&unsub.stream_id);
        } else if let Some(request) = state.requests.get_mut(&unsub.stream_id) {
            request.status = SubscriptionStatus::Pending;
        }
        unsub.confirm.resolve(());
        Some(unsub.stream_id)
    }

    /// Drop a request locally, whatever its state
    pub async fn remove(&self, stream_id: StreamId) -> bool {
        let mut state = self.state.write().await;
        let removed = state.requests.remove(&stream_id).is_some();
        state.unindex(stream_id);
        state.unsubscribes.retain(|_, u| u.stream_id != stream_id);
        removed
    }

    /// Every confirmed channel as (stream id, channel id)
    pub async fn confirmed_channels(&self) -> Vec<(StreamId, u64)> {
        let state = self.state.read().await;
        let mut channels: Vec<(StreamId, u64)> = state
            .requests
            .iter()
            .filter_map(|(id, r)| match r.status {
                SubscriptionStatus::Confirmed(chan_id) => Some((*id, chan_id)),
                _ => None,
            })
            .collect();
        channels.sort_by(|a, b| b.0.cmp(&a.0));
        channels
    }

    /// Forget every channel id after the connection dropped
    ///
    /// Requests return to `Pending` so the next connection resubscribes them;
    /// terminal unsubscribes in flight complete as removals.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let unsubscribes: Vec<UnsubscriptionRequest> =
            state.unsubscribes.drain().map(|(_, u)| u).collect();
        for unsub in unsubscribes {
            if unsub.terminal {
                state.requests.remove(&unsub.stream_id);
            }
            unsub.confirm.resolve(());
        }
        state.channels.clear();
        for request in state.requests.values_mut() {
            request.status = SubscriptionStatus::Pending;
        }
    }

    /// Drop every request
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = RegistryState::default();
    }

    pub async fn status(&self, stream_id: StreamId) -> Option<SubscriptionStatus> {
        self.state
            .read()
            .await
            .requests
            .get(&stream_id)
            .map(|r| r.status)
    }

    pub async fn subscription(&self, stream_id: StreamId) -> Option<Subscription> {
        self.state
            .read()
            .await
            .requests
            .get(&stream_id)
            .map(|r| r.subscription.clone())
    }

    pub async fn contains(&self, stream_id: StreamId) -> bool {
        self.state.read().await.requests.contains_key(&stream_id)
    }

    /// Number of registered requests, whatever their state
    pub async fn len(&self) -> usize {
        self.state.read().await.requests.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(Arc::new(Sequences::new()))
    }

    fn recorder() -> (SharedHandler, Arc<Mutex<Vec<Value>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let handler: SharedHandler = Arc::new(move |frame: &Value| {
            sink.lock().unwrap().push(frame.clone());
        });
        (handler, frames)
    }

    fn noop() -> SharedHandler {
        Arc::new(|_: &Value| {})
    }

    fn params(value: Value) -> ChannelParams {
        serde_json::from_value(value).unwrap()
    }

    // ============ Subscription Construction Tests ============

    #[test]
    fn test_ticker_subscription() {
        let sub = Subscription::ticker("tBTCUSD");
        assert_eq!(sub.channel_name(), "ticker");
        assert_eq!(sub.symbol(), "tBTCUSD");
        assert_eq!(sub.key().as_str(), "ticker|tBTCUSD");
    }

    #[test]
    fn test_book_subscription_defaults() {
        let sub = Subscription::book("tETHUSD");
        assert_eq!(sub.key().as_str(), "book|tETHUSD|P0|F0|25");
        assert_eq!(
            Subscription::raw_book("tETHUSD", 100).key().as_str(),
            "book|tETHUSD|R0|F0|100"
        );
    }

    #[test]
    fn test_candles_key() {
        let sub = Subscription::candles("tBTCUSD", CandleInterval::OneMinute);
        assert_eq!(sub.key().as_str(), "candles|trade:1m:tBTCUSD");
        assert_eq!(sub.symbol(), "tBTCUSD");
    }

    // ============ Subscribe Event Serialization Tests ============

    #[test]
    fn test_subscribe_event_ticker() {
        let json = serde_json::to_value(Subscription::ticker("tBTCUSD").subscribe_event()).unwrap();
        assert_eq!(
            json,
            json!({"event": "subscribe", "channel": "ticker", "symbol": "tBTCUSD"})
        );
    }

    #[test]
    fn test_subscribe_event_book() {
        let sub = Subscription::book_with_params("tBTCUSD", BookPrecision::P2, BookFrequency::F1, 100);
        let json = serde_json::to_value(sub.subscribe_event()).unwrap();
        assert_eq!(
            json,
            json!({
                "event": "subscribe",
                "channel": "book",
                "symbol": "tBTCUSD",
                "prec": "P2",
                "freq": "F1",
                "len": "100"
            })
        );
    }

    #[test]
    fn test_subscribe_event_candles() {
        let sub = Subscription::candles("tBTCUSD", CandleInterval::FifteenMinutes);
        let json = serde_json::to_value(sub.subscribe_event()).unwrap();
        assert_eq!(
            json,
            json!({"event": "subscribe", "channel": "candles", "key": "trade:15m:tBTCUSD"})
        );
    }

    // ============ SubscriptionKey Tests ============

    #[test]
    fn test_key_from_params_matches_request() {
        let cases = vec![
            (
                Subscription::ticker("tBTCUSD"),
                json!({"channel": "ticker", "symbol": "tBTCUSD", "pair": "BTCUSD"}),
            ),
            (
                Subscription::trades("tETHUSD"),
                json!({"channel": "trades", "symbol": "tETHUSD"}),
            ),
            (
                Subscription::book("tBTCUSD"),
                json!({"channel": "book", "symbol": "tBTCUSD", "prec": "P0", "freq": "F0", "len": "25"}),
            ),
            (
                Subscription::raw_book("tBTCUSD", 25),
                json!({"channel": "book", "symbol": "tBTCUSD", "prec": "R0", "len": 25}),
            ),
            (
                Subscription::candles("tBTCUSD", CandleInterval::OneHour),
                json!({"channel": "candles", "key": "trade:1h:tBTCUSD"}),
            ),
        ];

        for (sub, echoed) in cases {
            assert_eq!(
                SubscriptionKey::from_params(&params(echoed)),
                Some(sub.key()),
                "key mismatch for {sub:?}"
            );
        }
    }

    #[test]
    fn test_key_from_params_unknown_channel() {
        assert_eq!(
            SubscriptionKey::from_params(&params(json!({"channel": "status", "key": "x"}))),
            None
        );
        assert_eq!(SubscriptionKey::from_params(&params(json!({}))), None);
    }

    // ============ Registry Lifecycle Tests ============

    #[tokio::test]
    async fn test_register_is_pending() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();

        assert!(id.value() < 0);
        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Pending));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_duplicate_key_rejected() {
        let registry = registry();
        registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let result = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await;

        assert!(matches!(result, Err(Error::DuplicateSubscription(_))));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_begin_subscribe_then_confirm_resolves_waiter() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();

        let (event, confirmation) = registry.begin_subscribe(id).await.unwrap();
        assert_eq!(event.channel, "ticker");
        assert_eq!(
            registry.status(id).await,
            Some(SubscriptionStatus::AwaitingConfirmation)
        );
        assert!(registry.begin_subscribe(id).await.is_none());

        let outcome = registry.confirm(&Subscription::ticker("tBTCUSD").key(), 5).await;
        assert_eq!(outcome, ConfirmOutcome::Confirmed(id));
        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Confirmed(5)));
        assert_eq!(confirmation.wait(Duration::from_secs(1)).await, Ok(Ok(5)));
        assert!(registry.is_confirmed_channel(5).await);
    }

    #[tokio::test]
    async fn test_confirm_matches_exactly_one_request() {
        let registry = registry();
        let btc = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let eth = registry
            .register(Subscription::ticker("tETHUSD"), noop())
            .await
            .unwrap();
        registry.sweep().await;

        let outcome = registry.confirm(&Subscription::ticker("tETHUSD").key(), 9).await;
        assert_eq!(outcome, ConfirmOutcome::Confirmed(eth));
        assert_eq!(
            registry.status(btc).await,
            Some(SubscriptionStatus::AwaitingConfirmation)
        );

        // A second confirmation for the same key finds nothing outstanding
        let again = registry.confirm(&Subscription::ticker("tETHUSD").key(), 10).await;
        assert_eq!(again, ConfirmOutcome::Unmatched);
        assert_eq!(registry.status(eth).await, Some(SubscriptionStatus::Confirmed(9)));
    }

    #[tokio::test]
    async fn test_confirm_unknown_key_is_unmatched() {
        let registry = registry();
        let outcome = registry.confirm(&Subscription::trades("tXRPUSD").key(), 3).await;
        assert_eq!(outcome, ConfirmOutcome::Unmatched);
        assert!(!registry.is_confirmed_channel(3).await);
    }

    #[tokio::test]
    async fn test_reject_returns_request_to_pending() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tNOPE"), noop())
            .await
            .unwrap();
        let (_, confirmation) = registry.begin_subscribe(id).await.unwrap();

        let rejected = registry
            .reject(&Subscription::ticker("tNOPE").key(), "symbol: invalid")
            .await;
        assert_eq!(rejected, Some(id));
        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Pending));
        assert_eq!(
            confirmation.wait(Duration::from_secs(1)).await,
            Ok(Err("symbol: invalid".to_string()))
        );
    }

    #[tokio::test]
    async fn test_sweep_claims_pending_oldest_first() {
        let registry = registry();
        let first = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let second = registry
            .register(Subscription::trades("tBTCUSD"), noop())
            .await
            .unwrap();
        let third = registry
            .register(Subscription::book("tBTCUSD"), noop())
            .await
            .unwrap();

        let swept = registry.sweep().await;
        let ids: Vec<StreamId> = swept.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![first, second, third]);

        // Nothing left to claim
        assert!(registry.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_claim_to_sweep() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let _claim = registry.begin_subscribe(id).await.unwrap();
        assert!(registry.sweep().await.is_empty());

        registry.release(id).await;
        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Pending));
        assert_eq!(registry.sweep().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_unresolved_waiter() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let (_, confirmation) = registry.begin_subscribe(id).await.unwrap();

        // Connection dropped before the confirmation, then came back
        registry.reset().await;
        assert_eq!(registry.sweep().await.len(), 1);
        registry.confirm(&Subscription::ticker("tBTCUSD").key(), 12).await;

        assert_eq!(confirmation.wait(Duration::from_secs(1)).await, Ok(Ok(12)));
    }

    // ============ Routing Tests ============

    #[tokio::test]
    async fn test_route_to_confirmed_handler() {
        let registry = registry();
        let (handler, frames) = recorder();
        registry
            .register(Subscription::ticker("tBTCUSD"), handler)
            .await
            .unwrap();
        registry.sweep().await;
        registry.confirm(&Subscription::ticker("tBTCUSD").key(), 5).await;

        assert!(registry.route(5, &json!([5, [1.0, 2.0]])).await);
        assert!(!registry.route(6, &json!([6, [1.0]])).await);
        assert_eq!(frames.lock().unwrap().as_slice(), &[json!([5, [1.0, 2.0]])]);
    }

    #[tokio::test]
    async fn test_route_before_confirmation_dropped() {
        let registry = registry();
        let (handler, frames) = recorder();
        registry
            .register(Subscription::ticker("tBTCUSD"), handler)
            .await
            .unwrap();

        assert!(!registry.route(5, &json!([5, [1.0]])).await);
        assert!(frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_channel_owner_reset() {
        let registry = registry();
        let a = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        let b = registry
            .register(Subscription::ticker("tETHUSD"), noop())
            .await
            .unwrap();
        registry.sweep().await;
        registry.confirm(&Subscription::ticker("tBTCUSD").key(), 5).await;
        registry.confirm(&Subscription::ticker("tETHUSD").key(), 5).await;

        assert_eq!(registry.status(a).await, Some(SubscriptionStatus::Pending));
        assert_eq!(registry.status(b).await, Some(SubscriptionStatus::Confirmed(5)));
        assert_eq!(registry.confirmed_channels().await, vec![(b, 5)]);
    }

    // ============ Unsubscribe Tests ============

    async fn confirmed(registry: &ChannelRegistry, sub: Subscription, chan_id: u64) -> StreamId {
        let id = registry.register(sub.clone(), noop()).await.unwrap();
        registry.begin_subscribe(id).await.unwrap();
        registry.confirm(&sub.key(), chan_id).await;
        id
    }

    #[tokio::test]
    async fn test_terminal_unsubscribe_removes_on_confirmation() {
        let registry = registry();
        let id = confirmed(&registry, Subscription::ticker("tBTCUSD"), 5).await;

        let UnsubscribeStart::Send { event, confirmation } =
            registry.begin_unsubscribe(id, true).await
        else {
            panic!("Expected Send");
        };
        assert_eq!(event, UnsubscribeEvent::new(5));
        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Unsubscribing(5)));

        assert_eq!(registry.complete_unsubscribe(5).await, Some(id));
        assert_eq!(confirmation.wait(Duration::from_secs(1)).await, Ok(()));
        assert!(!registry.contains(id).await);
        assert!(!registry.is_confirmed_channel(5).await);

        // Completing twice is a no-op
        assert_eq!(registry.complete_unsubscribe(5).await, None);
    }

    #[tokio::test]
    async fn test_non_terminal_unsubscribe_returns_to_pending() {
        let registry = registry();
        let id = confirmed(&registry, Subscription::trades("tBTCUSD"), 7).await;

        assert!(matches!(
            registry.begin_unsubscribe(id, false).await,
            UnsubscribeStart::Send { .. }
        ));
        registry.complete_unsubscribe(7).await;

        assert_eq!(registry.status(id).await, Some(SubscriptionStatus::Pending));
        assert_eq!(registry.sweep().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unconfirmed_removes_locally() {
        let registry = registry();
        let id = registry
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();

        assert!(matches!(
            registry.begin_unsubscribe(id, true).await,
            UnsubscribeStart::Removed
        ));
        assert!(matches!(
            registry.begin_unsubscribe(id, true).await,
            UnsubscribeStart::NotFound
        ));
    }

    #[tokio::test]
    async fn test_caller_unsubscribe_wins_over_refresh() {
        let registry = registry();
        let id = confirmed(&registry, Subscription::ticker("tBTCUSD"), 5).await;

        // A refresh (non-terminal) is in flight when the caller unsubscribes
        assert!(matches!(
            registry.begin_unsubscribe(id, false).await,
            UnsubscribeStart::Send { .. }
        ));
        assert!(matches!(
            registry.begin_unsubscribe(id, true).await,
            UnsubscribeStart::InFlight(5)
        ));

        registry.complete_unsubscribe(5).await;
        assert!(!registry.contains(id).await);
        assert!(registry.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_returns_everything_to_pending() {
        let registry = registry();
        let a = confirmed(&registry, Subscription::ticker("tBTCUSD"), 5).await;
        let b = confirmed(&registry, Subscription::ticker("tETHUSD"), 6).await;
        let c = confirmed(&registry, Subscription::ticker("tLTCUSD"), 7).await;
        let UnsubscribeStart::Send { confirmation, .. } = registry.begin_unsubscribe(c, true).await
        else {
            panic!("Expected Send");
        };

        registry.reset().await;

        assert_eq!(registry.status(a).await, Some(SubscriptionStatus::Pending));
        assert_eq!(registry.status(b).await, Some(SubscriptionStatus::Pending));
        assert!(!registry.contains(c).await);
        assert!(registry.confirmed_channels().await.is_empty());
        assert_eq!(confirmation.wait(Duration::from_secs(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let registry = registry();
        confirmed(&registry, Subscription::ticker("tBTCUSD"), 5).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
        assert!(!registry.is_confirmed_channel(5).await);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let registry = registry();
        let cloned = registry.clone();
        let id = cloned
            .register(Subscription::ticker("tBTCUSD"), noop())
            .await
            .unwrap();
        assert!(registry.contains(id).await);
    }

    // ============ Send/Sync Tests ============

    #[test]
    fn test_registry_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<ChannelRegistry>();
        assert_sync::<ChannelRegistry>();
        assert_send::<Subscription>();
        assert_sync::<Subscription>();
    }
}
