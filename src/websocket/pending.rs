//! Pending trading commands
//!
//! The exchange acknowledges a new order asynchronously on the account
//! channel. Every order carries a client order id (`cid`) that the exchange
//! echoes back, so acknowledgements carrying a cid are matched by it alone.
//! A reply with an unknown cid belongs to another session and resolves
//! nothing. Only when the reply has no cid does the table fall back to
//! matching by (symbol, original amount) for acknowledgements and
//! (amount, order type) for rejections. Two pending
//! orders with the same heuristic key are ambiguous: the oldest is resolved
//! and the collision is reported as [`Correlation::Ambiguous`].
//!
//! Cancels are keyed by the exchange order id and never ambiguous.

use std::collections::HashMap;
use tokio::sync::Mutex;

use super::confirm::{confirmation, ConfirmSlot, Confirmation};
use crate::error::{Error, Result};
use crate::types::{amounts_match, Order, OrderNotification};

/// Result delivered to an order waiter: the acknowledged order or the server's text
pub type OrderOutcome = std::result::Result<Order, String>;

/// Result delivered to a cancel waiter
pub type CancelOutcome = std::result::Result<(), String>;

/// How an inbound frame lined up with the pending commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Exactly one pending command matched
    Unique,
    /// Several pending commands matched; the oldest was resolved
    Ambiguous(usize),
    /// Nothing matched
    NoMatch,
}

struct PendingOrder {
    cid: u64,
    symbol: String,
    amount: f64,
    order_type: String,
    confirm: ConfirmSlot<OrderOutcome>,
}

/// Outstanding new-order and cancel-order commands
#[derive(Default)]
pub struct PendingCommands {
    // Oldest first
    orders: Mutex<Vec<PendingOrder>>,
    cancels: Mutex<HashMap<u64, ConfirmSlot<CancelOutcome>>>,
}

impl std::fmt::Debug for PendingCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommands").finish_non_exhaustive()
    }
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new order about to be sent
    pub async fn register_order(
        &self,
        cid: u64,
        symbol: impl Into<String>,
        amount: f64,
        order_type: impl Into<String>,
    ) -> Confirmation<OrderOutcome> {
        let (slot, confirmation) = confirmation();
        self.orders.lock().await.push(PendingOrder {
            cid,
            symbol: symbol.into(),
            amount,
            order_type: order_type.into(),
            confirm: slot,
        });
        confirmation
    }

    /// Track a cancel about to be sent
    pub async fn register_cancel(&self, order_id: u64) -> Result<Confirmation<CancelOutcome>> {
        let mut cancels = self.cancels.lock().await;
        if cancels.contains_key(&order_id) {
            return Err(Error::InvalidParameter(format!(
                "cancel already pending for order {order_id}"
            )));
        }
        let (slot, confirmation) = confirmation();
        cancels.insert(order_id, slot);
        Ok(confirmation)
    }

    /// Forget an order whose wait ended
    pub async fn remove_order(&self, cid: u64) -> bool {
        let mut orders = self.orders.lock().await;
        let before = orders.len();
        orders.retain(|o| o.cid != cid);
        orders.len() != before
    }

    /// Forget a cancel whose wait ended
    pub async fn remove_cancel(&self, order_id: u64) -> bool {
        self.cancels.lock().await.remove(&order_id).is_some()
    }

    /// Match an order acknowledgement to a pending new order
    pub async fn acknowledge_order(&self, order: &Order) -> Correlation {
        let mut orders = self.orders.lock().await;
        let (index, correlation) = match find_order(&orders, order.client_order_id, |p| {
            p.symbol == order.symbol && amounts_match(p.amount, order.amount_orig)
        }) {
            Some(found) => found,
            None => return Correlation::NoMatch,
        };

        let pending = orders.remove(index);
        pending.confirm.resolve(Ok(order.clone()));
        correlation
    }

    /// Match a failed `on-req` notification to a pending new order
    pub async fn reject_order(&self, notification: &OrderNotification) -> Correlation {
        let Some(attempted) = notification.order() else {
            return Correlation::NoMatch;
        };

        let mut orders = self.orders.lock().await;
        let (index, correlation) = match find_order(&orders, attempted.client_order_id, |p| {
            amounts_match(p.amount, attempted.amount_orig)
                && p.order_type.eq_ignore_ascii_case(&attempted.order_type)
        }) {
            Some(found) => found,
            None => return Correlation::NoMatch,
        };

        let pending = orders.remove(index);
        pending.confirm.resolve(Err(notification.text.clone()));
        correlation
    }

    /// Resolve a pending cancel with the closed order
    pub async fn acknowledge_cancel(&self, order_id: u64) -> Correlation {
        match self.cancels.lock().await.remove(&order_id) {
            Some(slot) => {
                slot.resolve(Ok(()));
                Correlation::Unique
            }
            None => Correlation::NoMatch,
        }
    }

    /// Match a failed `oc-req` notification to a pending cancel
    pub async fn reject_cancel(&self, notification: &OrderNotification) -> Correlation {
        let order_id = notification
            .info
            .as_array()
            .and_then(|fields| fields.first())
            .and_then(serde_json::Value::as_u64);
        let Some(order_id) = order_id else {
            return Correlation::NoMatch;
        };

        match self.cancels.lock().await.remove(&order_id) {
            Some(slot) => {
                slot.resolve(Err(notification.text.clone()));
                Correlation::Unique
            }
            None => Correlation::NoMatch,
        }
    }

    /// Drop every pending command; parked waiters are released as abandoned
    pub async fn clear(&self) {
        self.orders.lock().await.clear();
        self.cancels.lock().await.clear();
    }

    pub async fn pending_orders(&self) -> usize {
        self.orders.lock().await.len()
    }

    pub async fn pending_cancels(&self) -> usize {
        self.cancels.lock().await.len()
    }
}

/// Index of the pending order to resolve.
///
/// An echoed cid is authoritative: it matches exactly one pending order or
/// none. The heuristic only applies when the reply carries no cid (absent or
/// zero).
fn find_order<F>(
    orders: &[PendingOrder],
    cid: Option<u64>,
    heuristic: F,
) -> Option<(usize, Correlation)>
where
    F: Fn(&PendingOrder) -> bool,
{
    if let Some(cid) = cid.filter(|cid| *cid != 0) {
        return orders
            .iter()
            .position(|p| p.cid == cid)
            .map(|index| (index, Correlation::Unique));
    }

    let matches: Vec<usize> = orders
        .iter()
        .enumerate()
        .filter(|(_, p)| heuristic(*p))
        .map(|(i, _)| i)
        .collect();
    match matches.as_slice() {
        [] => None,
        [index] => Some((*index, Correlation::Unique)),
        [first, ..] => {
            tracing::warn!(
                "{} pending orders match the acknowledgement, resolving the oldest",
                matches.len()
            );
            Some((*first, Correlation::Ambiguous(matches.len())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::confirm::WaitError;
    use serde_json::{json, Value};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);

    fn order_array(id: u64, cid: Option<u64>, symbol: &str, amount: f64, kind: &str) -> Vec<Value> {
        let cid = cid.map(Value::from).unwrap_or(Value::Null);
        vec![
            json!(id),
            Value::Null,
            cid,
            json!(symbol),
            json!(1_700_000_000_000i64),
            json!(1_700_000_000_000i64),
            json!(amount),
            json!(amount),
            json!(kind),
            Value::Null,
            Value::Null,
            Value::Null,
            json!(0),
            json!("ACTIVE"),
            Value::Null,
            Value::Null,
            json!(30000.0),
            json!(0.0),
        ]
    }

    fn ack(id: u64, cid: Option<u64>, symbol: &str, amount: f64) -> Order {
        Order::from_array(&order_array(id, cid, symbol, amount, "EXCHANGE LIMIT")).unwrap()
    }

    fn failure(kind: &str, info: Value, text: &str) -> OrderNotification {
        let fields = vec![
            json!(1_700_000_000_000i64),
            json!(kind),
            Value::Null,
            Value::Null,
            info,
            Value::Null,
            json!("ERROR"),
            json!(text),
        ];
        OrderNotification::from_array(&fields).unwrap()
    }

    // ============ New Order Correlation Tests ============

    #[tokio::test]
    async fn test_ack_matches_by_cid() {
        let pending = PendingCommands::new();
        let first = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;
        let second = pending
            .register_order(2, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        // Identical symbol and amount, told apart by cid
        let correlation = pending
            .acknowledge_order(&ack(900, Some(2), "tBTCUSD", 0.01))
            .await;
        assert_eq!(correlation, Correlation::Unique);

        let order = second.wait(WAIT).await.unwrap().unwrap();
        assert_eq!(order.id, Some(900));
        assert_eq!(pending.pending_orders().await, 1);
        drop(first);
    }

    #[tokio::test]
    async fn test_ack_falls_back_to_symbol_and_amount() {
        let pending = PendingCommands::new();
        let waiter = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;
        pending
            .register_order(2, "tETHUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        let correlation = pending
            .acknowledge_order(&ack(900, None, "tBTCUSD", 0.01))
            .await;
        assert_eq!(correlation, Correlation::Unique);
        assert_eq!(waiter.wait(WAIT).await.unwrap().unwrap().symbol, "tBTCUSD");
    }

    #[tokio::test]
    async fn test_ack_ambiguous_resolves_oldest() {
        let pending = PendingCommands::new();
        let oldest = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;
        let newest = pending
            .register_order(2, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        let correlation = pending
            .acknowledge_order(&ack(900, None, "tBTCUSD", 0.01))
            .await;
        assert_eq!(correlation, Correlation::Ambiguous(2));
        assert!(oldest.wait(WAIT).await.unwrap().is_ok());
        assert_eq!(
            newest.wait(Duration::from_millis(20)).await,
            Err(WaitError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_ack_without_match_is_dropped() {
        let pending = PendingCommands::new();
        pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        let correlation = pending
            .acknowledge_order(&ack(900, Some(77), "tBTCUSD", 0.02))
            .await;
        assert_eq!(correlation, Correlation::NoMatch);
        assert_eq!(pending.pending_orders().await, 1);
    }

    #[tokio::test]
    async fn test_ack_with_unknown_cid_leaves_heuristic_match_pending() {
        let pending = PendingCommands::new();
        let waiter = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        // Same symbol and amount, but the cid belongs to another session
        let correlation = pending
            .acknowledge_order(&ack(900, Some(99), "tBTCUSD", 0.01))
            .await;
        assert_eq!(correlation, Correlation::NoMatch);
        assert_eq!(pending.pending_orders().await, 1);
        assert_eq!(
            waiter.wait(Duration::from_millis(20)).await,
            Err(WaitError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_ack_with_zero_cid_uses_heuristic() {
        let pending = PendingCommands::new();
        let waiter = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;

        let correlation = pending
            .acknowledge_order(&ack(900, Some(0), "tBTCUSD", 0.01))
            .await;
        assert_eq!(correlation, Correlation::Unique);
        assert_eq!(waiter.wait(WAIT).await.unwrap().unwrap().id, Some(900));
    }

    #[tokio::test]
    async fn test_reject_with_unknown_cid_is_dropped() {
        let pending = PendingCommands::new();
        pending
            .register_order(1, "tBTCUSD", 0.5, "EXCHANGE LIMIT")
            .await;

        let info = Value::Array(order_array(0, Some(42), "tBTCUSD", 0.5, "EXCHANGE LIMIT"));
        let notification = failure("on-req", info, "rejected");
        assert_eq!(pending.reject_order(&notification).await, Correlation::NoMatch);
        assert_eq!(pending.pending_orders().await, 1);
    }

    #[tokio::test]
    async fn test_reject_matches_amount_and_type() {
        let pending = PendingCommands::new();
        let limit = pending
            .register_order(1, "tBTCUSD", 0.5, "EXCHANGE LIMIT")
            .await;
        pending
            .register_order(2, "tBTCUSD", 0.5, "EXCHANGE MARKET")
            .await;

        let info = Value::Array(order_array(0, None, "tBTCUSD", 0.5, "EXCHANGE LIMIT"));
        let notification = failure("on-req", info, "Invalid order: not enough balance");
        assert_eq!(pending.reject_order(&notification).await, Correlation::Unique);

        assert_eq!(
            limit.wait(WAIT).await.unwrap(),
            Err("Invalid order: not enough balance".to_string())
        );
        assert_eq!(pending.pending_orders().await, 1);
    }

    #[tokio::test]
    async fn test_reject_prefers_cid() {
        let pending = PendingCommands::new();
        pending
            .register_order(1, "tBTCUSD", 0.5, "EXCHANGE LIMIT")
            .await;
        let target = pending
            .register_order(2, "tBTCUSD", 0.5, "EXCHANGE LIMIT")
            .await;

        let info = Value::Array(order_array(0, Some(2), "tBTCUSD", 0.5, "EXCHANGE LIMIT"));
        let notification = failure("on-req", info, "rejected");
        assert_eq!(pending.reject_order(&notification).await, Correlation::Unique);
        assert_eq!(target.wait(WAIT).await.unwrap(), Err("rejected".to_string()));
    }

    #[tokio::test]
    async fn test_reject_without_order_info() {
        let pending = PendingCommands::new();
        pending
            .register_order(1, "tBTCUSD", 0.5, "EXCHANGE LIMIT")
            .await;
        let notification = failure("on-req", Value::Null, "rejected");
        assert_eq!(pending.reject_order(&notification).await, Correlation::NoMatch);
    }

    // ============ Cancel Correlation Tests ============

    #[tokio::test]
    async fn test_cancel_ack_by_id() {
        let pending = PendingCommands::new();
        let waiter = pending.register_cancel(42).await.unwrap();

        assert_eq!(pending.acknowledge_cancel(41).await, Correlation::NoMatch);
        assert_eq!(pending.acknowledge_cancel(42).await, Correlation::Unique);
        assert_eq!(waiter.wait(WAIT).await, Ok(Ok(())));
        assert_eq!(pending.pending_cancels().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_rejection() {
        let pending = PendingCommands::new();
        let waiter = pending.register_cancel(42).await.unwrap();

        let notification = failure("oc-req", json!([42, null, null]), "Order not found");
        assert_eq!(pending.reject_cancel(&notification).await, Correlation::Unique);
        assert_eq!(
            waiter.wait(WAIT).await,
            Ok(Err("Order not found".to_string()))
        );
    }

    #[tokio::test]
    async fn test_duplicate_cancel_refused() {
        let pending = PendingCommands::new();
        let _waiter = pending.register_cancel(42).await.unwrap();
        assert!(matches!(
            pending.register_cancel(42).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    // ============ Cleanup Tests ============

    #[tokio::test]
    async fn test_remove_after_timeout() {
        let pending = PendingCommands::new();
        pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;
        pending.register_cancel(5).await.unwrap();

        assert!(pending.remove_order(1).await);
        assert!(!pending.remove_order(1).await);
        assert!(pending.remove_cancel(5).await);
        assert_eq!(
            pending
                .acknowledge_order(&ack(900, Some(1), "tBTCUSD", 0.01))
                .await,
            Correlation::NoMatch
        );
    }

    #[tokio::test]
    async fn test_clear_abandons_waiters() {
        let pending = PendingCommands::new();
        let order = pending
            .register_order(1, "tBTCUSD", 0.01, "EXCHANGE LIMIT")
            .await;
        let cancel = pending.register_cancel(5).await.unwrap();

        pending.clear().await;
        assert_eq!(order.wait(WAIT).await, Err(WaitError::Abandoned));
        assert_eq!(cancel.wait(WAIT).await, Err(WaitError::Abandoned));
    }

    #[test]
    fn test_pending_commands_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<PendingCommands>();
        assert_sync::<PendingCommands>();
    }
}
