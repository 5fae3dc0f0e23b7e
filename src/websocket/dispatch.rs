//! Inbound frame dispatch
//!
//! Every text frame the receive loop reads passes through
//! [`Dispatcher::dispatch`]. Data frames go to the channel registry, the
//! pending-command table, or the account registry. Control events that change
//! the connection (auth results, maintenance codes, reconnect requests) are
//! handed back to the caller as a [`ControlSignal`].

use serde_json::Value;
use std::sync::Arc;

use super::account::AccountStreamRegistry;
use super::messages::{
    frame_tag, is_heartbeat, ControlEvent, InboundFrame, PlatformStatus, ACCOUNT_CHANNEL_ID,
    INFO_MAINTENANCE_END, INFO_MAINTENANCE_START, INFO_RECONNECT,
};
use super::pending::{Correlation, PendingCommands};
use super::subscription::{ChannelRegistry, ConfirmOutcome, SubscriptionKey};
use crate::error::Result;
use crate::types::{Order, OrderNotification};

/// Connection-level action requested by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Authenticated,
    AuthenticationFailed(String),
    /// Maintenance started: stop trading
    Pause,
    /// Maintenance ended: refresh subscriptions and resume trading
    Resume,
    /// Server asked for a fresh connection
    Reconnect,
}

/// Routes inbound frames to the registries
#[derive(Debug, Clone)]
pub struct Dispatcher {
    channels: ChannelRegistry,
    accounts: AccountStreamRegistry,
    pending: Arc<PendingCommands>,
}

impl Dispatcher {
    pub fn new(
        channels: ChannelRegistry,
        accounts: AccountStreamRegistry,
        pending: Arc<PendingCommands>,
    ) -> Self {
        Self {
            channels,
            accounts,
            pending,
        }
    }

    /// Classify and route one text frame
    pub async fn dispatch(&self, text: &str) -> Result<Option<ControlSignal>> {
        match InboundFrame::parse(text)? {
            InboundFrame::Control(event) => Ok(self.on_control(event).await),
            InboundFrame::Channel { chan_id, frame } => {
                self.on_channel(chan_id, &frame).await?;
                Ok(None)
            }
        }
    }

    async fn on_control(&self, event: ControlEvent) -> Option<ControlSignal> {
        match event {
            ControlEvent::Auth {
                status, msg, code, ..
            } => {
                if status == "OK" {
                    tracing::info!("Authenticated");
                    Some(ControlSignal::Authenticated)
                } else {
                    let reason = msg.unwrap_or(status);
                    tracing::warn!("Authentication failed ({code:?}): {reason}");
                    Some(ControlSignal::AuthenticationFailed(reason))
                }
            }
            ControlEvent::Subscribed { chan_id, params } => {
                let Some(key) = SubscriptionKey::from_params(&params) else {
                    tracing::warn!("Confirmation for unrecognized channel {params:?}");
                    return None;
                };
                match self.channels.confirm(&key, chan_id).await {
                    ConfirmOutcome::Confirmed(stream_id) => {
                        tracing::debug!("Stream {stream_id} ({key}) confirmed on channel {chan_id}");
                    }
                    ConfirmOutcome::Unmatched => {
                        tracing::warn!("No outstanding subscription for {key} (channel {chan_id})");
                    }
                }
                None
            }
            ControlEvent::Unsubscribed { chan_id, status } => {
                match self.channels.complete_unsubscribe(chan_id).await {
                    Some(stream_id) => {
                        tracing::debug!("Stream {stream_id} unsubscribed from channel {chan_id}");
                    }
                    None => {
                        tracing::debug!("Unsubscribed from channel {chan_id} ({status:?}), nothing pending");
                    }
                }
                None
            }
            ControlEvent::Info {
                version,
                code,
                msg,
                platform,
            } => self.on_info(version, code, msg, platform),
            ControlEvent::Error { msg, code, params } => {
                let message = msg.unwrap_or_else(|| format!("error {code:?}"));
                match SubscriptionKey::from_params(&params) {
                    Some(key) => {
                        if self.channels.reject(&key, &message).await.is_none() {
                            tracing::warn!("Subscription error for {key} with nothing outstanding: {message}");
                        } else {
                            tracing::warn!("Subscription {key} rejected: {message}");
                        }
                    }
                    None => tracing::error!("Server error ({code:?}): {message}"),
                }
                None
            }
            ControlEvent::Pong { cid } => {
                tracing::debug!("Pong {cid:?}");
                None
            }
            ControlEvent::Conf { status } => {
                tracing::debug!("Configuration acknowledged: {status:?}");
                None
            }
            ControlEvent::Unknown => {
                tracing::debug!("Ignoring unknown control event");
                None
            }
        }
    }

    fn on_info(
        &self,
        version: Option<i64>,
        code: Option<i64>,
        msg: Option<String>,
        platform: Option<PlatformStatus>,
    ) -> Option<ControlSignal> {
        if let Some(code) = code {
            let msg = msg.unwrap_or_default();
            return match code {
                INFO_RECONNECT => {
                    tracing::info!("Server requested reconnect: {msg}");
                    Some(ControlSignal::Reconnect)
                }
                INFO_MAINTENANCE_START => {
                    tracing::info!("Maintenance started: {msg}");
                    Some(ControlSignal::Pause)
                }
                INFO_MAINTENANCE_END => {
                    tracing::info!("Maintenance ended: {msg}");
                    Some(ControlSignal::Resume)
                }
                other => {
                    tracing::info!("Info {other}: {msg}");
                    None
                }
            };
        }

        tracing::info!("Connected to API version {version:?}");
        match platform {
            Some(PlatformStatus { status: 0 }) => {
                tracing::warn!("Platform is in maintenance");
                Some(ControlSignal::Pause)
            }
            _ => None,
        }
    }

    async fn on_channel(&self, chan_id: u64, frame: &Value) -> Result<()> {
        if is_heartbeat(frame) {
            return Ok(());
        }

        if chan_id != ACCOUNT_CHANNEL_ID {
            if !self.channels.route(chan_id, frame).await {
                tracing::warn!("Dropping frame for unknown channel {chan_id}");
            }
            return Ok(());
        }

        let Some(tag) = frame_tag(frame) else {
            tracing::debug!("Untagged account frame: {frame}");
            return Ok(());
        };

        let correlated = self.correlate(tag, frame).await;
        self.accounts.route(tag, frame).await;
        correlated
    }

    /// Match account frames against pending trading commands
    async fn correlate(&self, tag: &str, frame: &Value) -> Result<()> {
        let Some(payload) = frame.get(2).and_then(Value::as_array) else {
            return Ok(());
        };

        let correlation = match tag {
            "on" => {
                let order = Order::from_array(payload)?;
                self.pending.acknowledge_order(&order).await
            }
            "oc" => match Order::from_array(payload)?.id {
                Some(id) => self.pending.acknowledge_cancel(id).await,
                None => Correlation::NoMatch,
            },
            "n" => {
                let notification = OrderNotification::from_array(payload)?;
                match (notification.kind.as_str(), notification.is_failure()) {
                    ("on-req", true) => self.pending.reject_order(&notification).await,
                    ("on-req", false) => match notification.order() {
                        Some(order) => self.pending.acknowledge_order(&order).await,
                        None => Correlation::NoMatch,
                    },
                    ("oc-req", true) => self.pending.reject_cancel(&notification).await,
                    _ => Correlation::NoMatch,
                }
            }
            _ => return Ok(()),
        };

        if correlation == Correlation::NoMatch {
            tracing::trace!("No pending command for {tag} frame");
        }
        Ok(())
    }
}
