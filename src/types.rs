//! Request and payload types for the Bitfinex streaming API
//!
//! Channel parameters (candle intervals, book precision), the new-order
//! builder sent over the authenticated channel, and the order/notification
//! arrays the exchange pushes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Channel Parameters
// ============================================================================

/// Candle interval (time frame) for the candles channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1D")]
    OneDay,
    #[serde(rename = "1W")]
    OneWeek,
    #[serde(rename = "14D")]
    FourteenDays,
    #[serde(rename = "1M")]
    OneMonth,
}

impl CandleInterval {
    /// Wire name used inside the candle key (`trade:<interval>:<symbol>`)
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::FifteenMinutes => "15m",
            CandleInterval::ThirtyMinutes => "30m",
            CandleInterval::OneHour => "1h",
            CandleInterval::ThreeHours => "3h",
            CandleInterval::SixHours => "6h",
            CandleInterval::TwelveHours => "12h",
            CandleInterval::OneDay => "1D",
            CandleInterval::OneWeek => "1W",
            CandleInterval::FourteenDays => "14D",
            CandleInterval::OneMonth => "1M",
        }
    }
}

/// Price aggregation level of a book subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookPrecision {
    /// Five significant figures
    P0,
    /// Four significant figures
    P1,
    /// Three significant figures
    P2,
    /// Two significant figures
    P3,
    /// One significant figure
    P4,
    /// Raw book, individual orders
    R0,
}

impl BookPrecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookPrecision::P0 => "P0",
            BookPrecision::P1 => "P1",
            BookPrecision::P2 => "P2",
            BookPrecision::P3 => "P3",
            BookPrecision::P4 => "P4",
            BookPrecision::R0 => "R0",
        }
    }

    /// Whether this precision selects the raw (non-aggregated) book
    pub fn is_raw(&self) -> bool {
        matches!(self, BookPrecision::R0)
    }
}

/// Update frequency of a book subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BookFrequency {
    /// Realtime
    #[default]
    F0,
    /// Every two seconds
    F1,
}

impl BookFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFrequency::F0 => "F0",
            BookFrequency::F1 => "F1",
        }
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Order flag: hidden order
pub const FLAG_HIDDEN: u32 = 64;
/// Order flag: close position
pub const FLAG_CLOSE: u32 = 512;
/// Order flag: reduce only
pub const FLAG_REDUCE_ONLY: u32 = 1024;
/// Order flag: post only
pub const FLAG_POST_ONLY: u32 = 4096;
/// Order flag: one cancels other
pub const FLAG_OCO: u32 = 16384;

/// Order type, independent of the exchange/margin wallet choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopLimit,
    TrailingStop,
    FillOrKill,
    ImmediateOrCancel,
}

impl OrderType {
    fn base_name(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP LIMIT",
            OrderType::TrailingStop => "TRAILING STOP",
            OrderType::FillOrKill => "FOK",
            OrderType::ImmediateOrCancel => "IOC",
        }
    }

    /// Wire name, e.g. `EXCHANGE LIMIT` for exchange wallet orders
    pub fn wire_name(&self, exchange: bool) -> String {
        if exchange {
            format!("EXCHANGE {}", self.base_name())
        } else {
            self.base_name().to_string()
        }
    }

    fn requires_price(&self) -> bool {
        !matches!(self, OrderType::Market | OrderType::TrailingStop)
    }
}

/// A new order to submit over the authenticated channel
///
/// Positive amounts buy, negative amounts sell.
///
/// # Example
/// ```ignore
/// use bitfinex_ws::NewOrder;
///
/// let order = NewOrder::limit("tBTCUSD", 0.01, 25_000.0)
///     .exchange()
///     .post_only();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub symbol: String,
    pub amount: f64,
    pub order_type: OrderType,
    pub exchange: bool,
    pub price: Option<f64>,
    pub price_aux_limit: Option<f64>,
    pub price_trailing: Option<f64>,
    pub client_order_id: Option<u64>,
    pub group_id: Option<u64>,
    pub flags: u32,
    pub leverage: Option<u32>,
}

impl NewOrder {
    fn new(symbol: impl Into<String>, amount: f64, order_type: OrderType) -> Self {
        Self {
            symbol: symbol.into(),
            amount,
            order_type,
            exchange: false,
            price: None,
            price_aux_limit: None,
            price_trailing: None,
            client_order_id: None,
            group_id: None,
            flags: 0,
            leverage: None,
        }
    }

    /// Create a limit order
    pub fn limit(symbol: impl Into<String>, amount: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::new(symbol, amount, OrderType::Limit)
        }
    }

    /// Create a market order
    pub fn market(symbol: impl Into<String>, amount: f64) -> Self {
        Self::new(symbol, amount, OrderType::Market)
    }

    /// Create a stop order triggering at `stop_price`
    pub fn stop(symbol: impl Into<String>, amount: f64, stop_price: f64) -> Self {
        Self {
            price: Some(stop_price),
            ..Self::new(symbol, amount, OrderType::Stop)
        }
    }

    /// Create a stop-limit order
    pub fn stop_limit(
        symbol: impl Into<String>,
        amount: f64,
        stop_price: f64,
        limit_price: f64,
    ) -> Self {
        Self {
            price: Some(stop_price),
            price_aux_limit: Some(limit_price),
            ..Self::new(symbol, amount, OrderType::StopLimit)
        }
    }

    /// Create a trailing stop order with the given trailing distance
    pub fn trailing_stop(symbol: impl Into<String>, amount: f64, distance: f64) -> Self {
        Self {
            price_trailing: Some(distance),
            ..Self::new(symbol, amount, OrderType::TrailingStop)
        }
    }

    /// Create a fill-or-kill order
    pub fn fill_or_kill(symbol: impl Into<String>, amount: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::new(symbol, amount, OrderType::FillOrKill)
        }
    }

    /// Create an immediate-or-cancel order
    pub fn immediate_or_cancel(symbol: impl Into<String>, amount: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::new(symbol, amount, OrderType::ImmediateOrCancel)
        }
    }

    /// Route the order to the exchange wallet instead of margin
    pub fn exchange(mut self) -> Self {
        self.exchange = true;
        self
    }

    /// Set the client order ID echoed back by the exchange
    pub fn client_order_id(mut self, cid: u64) -> Self {
        self.client_order_id = Some(cid);
        self
    }

    /// Set the group ID
    pub fn group_id(mut self, gid: u64) -> Self {
        self.group_id = Some(gid);
        self
    }

    /// Set leverage (derivatives only)
    pub fn leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }

    /// Add raw order flags
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn hidden(self) -> Self {
        self.flags(FLAG_HIDDEN)
    }

    pub fn post_only(self) -> Self {
        self.flags(FLAG_POST_ONLY)
    }

    pub fn reduce_only(self) -> Self {
        self.flags(FLAG_REDUCE_ONLY)
    }

    /// Wire name of this order's type
    pub fn type_name(&self) -> String {
        self.order_type.wire_name(self.exchange)
    }

    /// Check the order is well-formed before it goes on the wire
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(Error::InvalidParameter("symbol must not be empty".to_string()));
        }
        if !self.amount.is_finite() || self.amount == 0.0 {
            return Err(Error::InvalidParameter(
                "amount must be a non-zero number".to_string(),
            ));
        }
        if self.order_type.requires_price() && self.price.is_none() {
            return Err(Error::InvalidParameter(format!(
                "{} order requires a price",
                self.type_name()
            )));
        }
        if self.order_type == OrderType::TrailingStop && self.price_trailing.is_none() {
            return Err(Error::InvalidParameter(
                "trailing stop requires a trailing distance".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the wire payload with the client order id the command is tracked by
    pub fn to_wire(&self, cid: u64) -> NewOrderWire {
        NewOrderWire {
            gid: self.group_id,
            cid,
            order_type: self.type_name(),
            symbol: self.symbol.clone(),
            amount: self.amount.to_string(),
            price: self.price.map(|p| p.to_string()),
            price_aux_limit: self.price_aux_limit.map(|p| p.to_string()),
            price_trailing: self.price_trailing.map(|p| p.to_string()),
            flags: (self.flags != 0).then_some(self.flags),
            lev: self.leverage,
        }
    }
}

/// Wire format of a new order input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u64>,
    pub cid: u64,
    #[serde(rename = "type")]
    pub order_type: String,
    pub symbol: String,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_aux_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_trailing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lev: Option<u32>,
}

/// Wire format of a cancel order input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrderWire {
    pub id: u64,
}

/// An order as pushed by the exchange on the account channel
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: Option<u64>,
    pub group_id: Option<u64>,
    pub client_order_id: Option<u64>,
    pub symbol: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    /// Remaining amount
    pub amount: f64,
    /// Amount as originally submitted
    pub amount_orig: f64,
    pub order_type: String,
    pub flags: u32,
    pub status: Option<String>,
    pub price: Option<f64>,
    pub price_avg: Option<f64>,
}

impl Order {
    /// Parse the exchange's order array
    ///
    /// `[ID, GID, CID, SYMBOL, MTS_CREATE, MTS_UPDATE, AMOUNT, AMOUNT_ORIG,
    /// TYPE, TYPE_PREV, MTS_TIF, _, FLAGS, STATUS, _, _, PRICE, PRICE_AVG, ...]`
    pub fn from_array(fields: &[Value]) -> Result<Self> {
        let symbol = fields
            .get(3)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ProtocolDesync("order array without symbol".to_string()))?;
        let amount_orig = field_f64(fields, 7)
            .or_else(|| field_f64(fields, 6))
            .ok_or_else(|| Error::ProtocolDesync("order array without amount".to_string()))?;

        Ok(Self {
            id: field_u64(fields, 0),
            group_id: field_u64(fields, 1),
            client_order_id: field_u64(fields, 2),
            symbol: symbol.to_string(),
            created_at: fields.get(4).and_then(Value::as_i64),
            updated_at: fields.get(5).and_then(Value::as_i64),
            amount: field_f64(fields, 6).unwrap_or(amount_orig),
            amount_orig,
            order_type: fields
                .get(8)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            flags: field_u64(fields, 12).unwrap_or(0) as u32,
            status: fields.get(13).and_then(Value::as_str).map(str::to_string),
            price: field_f64(fields, 16),
            price_avg: field_f64(fields, 17),
        })
    }
}

/// A notification (`n`) pushed on the account channel
///
/// `[MTS, TYPE, MESSAGE_ID, _, NOTIFY_INFO, CODE, STATUS, TEXT]`
#[derive(Debug, Clone, PartialEq)]
pub struct OrderNotification {
    pub timestamp: Option<i64>,
    /// Request type the notification answers, e.g. `on-req`, `oc-req`
    pub kind: String,
    pub info: Value,
    pub status: String,
    pub text: String,
}

impl OrderNotification {
    pub fn from_array(fields: &[Value]) -> Result<Self> {
        let kind = fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ProtocolDesync("notification without type".to_string()))?;

        Ok(Self {
            timestamp: fields.first().and_then(Value::as_i64),
            kind: kind.to_string(),
            info: fields.get(4).cloned().unwrap_or(Value::Null),
            status: fields
                .get(6)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            text: fields
                .get(7)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Whether the exchange reported the request as failed
    pub fn is_failure(&self) -> bool {
        matches!(self.status.as_str(), "ERROR" | "FAILURE")
    }

    /// Order array carried in the notification info, if any
    pub fn order(&self) -> Option<Order> {
        self.info
            .as_array()
            .and_then(|fields| Order::from_array(fields).ok())
    }
}

/// Compare two order amounts tolerating float formatting noise
pub fn amounts_match(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= scale * 1e-9
}

fn field_f64(fields: &[Value], index: usize) -> Option<f64> {
    match fields.get(index)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_u64(fields: &[Value], index: usize) -> Option<u64> {
    match fields.get(index)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
