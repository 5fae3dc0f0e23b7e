//! Account stream registry
//!
//! Account feeds (wallets, orders, positions, ...) have no subscribe
//! handshake. The exchange pushes them on channel 0 once the session is
//! authenticated, each frame tagged with a short message type such as `ws`
//! (wallet snapshot) or `ou` (order update). A registration names the tags it
//! wants and every matching registration receives the frame.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::messages::{invoke_handler, SharedHandler};
use super::sequence::{Sequences, StreamId};

/// Account feed and the message-type tags it consists of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountFeed {
    Wallets,
    Orders,
    Positions,
    Trades,
    FundingOffers,
    FundingCredits,
    FundingLoans,
    BalanceInfo,
    Notifications,
}

impl AccountFeed {
    /// Wire tags carrying this feed: snapshot first, then updates
    pub fn tags(&self) -> &'static [&'static str] {
        match self {
            AccountFeed::Wallets => &["ws", "wu"],
            AccountFeed::Orders => &["os", "on", "ou", "oc"],
            AccountFeed::Positions => &["ps", "pn", "pu", "pc"],
            AccountFeed::Trades => &["te", "tu"],
            AccountFeed::FundingOffers => &["fos", "fon", "fou", "foc"],
            AccountFeed::FundingCredits => &["fcs", "fcn", "fcu", "fcc"],
            AccountFeed::FundingLoans => &["fls", "fln", "flu", "flc"],
            AccountFeed::BalanceInfo => &["bu"],
            AccountFeed::Notifications => &["n"],
        }
    }
}

struct Registration {
    tags: Vec<String>,
    handler: SharedHandler,
}

/// Registrations for account-channel feeds
#[derive(Clone)]
pub struct AccountStreamRegistry {
    registrations: Arc<RwLock<HashMap<StreamId, Registration>>>,
    sequences: Arc<Sequences>,
}

impl std::fmt::Debug for AccountStreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStreamRegistry").finish_non_exhaustive()
    }
}

impl AccountStreamRegistry {
    pub fn new(sequences: Arc<Sequences>) -> Self {
        Self {
            registrations: Arc::new(RwLock::new(HashMap::new())),
            sequences,
        }
    }

    /// Register a handler for a set of tags. Always succeeds.
    pub async fn register<I, S>(&self, tags: I, handler: SharedHandler) -> StreamId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stream_id = self.sequences.next_stream_id();
        let registration = Registration {
            tags: tags.into_iter().map(Into::into).collect(),
            handler,
        };
        self.registrations
            .write()
            .await
            .insert(stream_id, registration);
        stream_id
    }

    /// Register a handler for a whole feed
    pub async fn register_feed(&self, feed: AccountFeed, handler: SharedHandler) -> StreamId {
        self.register(feed.tags().iter().copied(), handler).await
    }

    /// Returns false if the stream id was not registered
    pub async fn unregister(&self, stream_id: StreamId) -> bool {
        self.registrations
            .write()
            .await
            .remove(&stream_id)
            .is_some()
    }

    /// Hand a frame to every registration accepting the tag
    ///
    /// Returns the number of handlers that received it.
    pub async fn route(&self, tag: &str, frame: &serde_json::Value) -> usize {
        let handlers: Vec<SharedHandler> = {
            let registrations = self.registrations.read().await;
            let mut matched: Vec<(StreamId, SharedHandler)> = registrations
                .iter()
                .filter(|(_, r)| r.tags.iter().any(|t| t == tag))
                .map(|(id, r)| (*id, r.handler.clone()))
                .collect();
            // Registration order
            matched.sort_by(|a, b| b.0.cmp(&a.0));
            matched.into_iter().map(|(_, h)| h).collect()
        };

        for handler in &handlers {
            invoke_handler(handler.as_ref(), frame);
        }
        handlers.len()
    }

    pub async fn contains(&self, stream_id: StreamId) -> bool {
        self.registrations.read().await.contains_key(&stream_id)
    }

    pub async fn clear(&self) {
        self.registrations.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
