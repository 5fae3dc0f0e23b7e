//! Wire message types for the websocket API
//!
//! Outbound control events are typed structs. Inbound text is classified into
//! an [`InboundFrame`]: either a control object tagged by `event`, or an
//! array-shaped channel frame whose first element is the channel id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Channel id the exchange uses for the authenticated account stream
pub const ACCOUNT_CHANNEL_ID: u64 = 0;

/// Heartbeat marker in `[chanId, "hb"]`
pub const HEARTBEAT: &str = "hb";

/// Info code: the server asks clients to reconnect
pub const INFO_RECONNECT: i64 = 20051;
/// Info code: maintenance started, trading paused
pub const INFO_MAINTENANCE_START: i64 = 20060;
/// Info code: maintenance ended, resubscribe and resume
pub const INFO_MAINTENANCE_END: i64 = 20061;

/// Consumer of the frames of one stream
///
/// Handlers are only ever invoked from the receive loop, one frame at a time
/// and in wire order.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: &Value);
}

impl<F> FrameHandler for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn handle(&self, frame: &Value) {
        self(frame)
    }
}

pub type SharedHandler = Arc<dyn FrameHandler>;

/// Call a handler, containing a panic to the frame that caused it
pub fn invoke_handler(handler: &dyn FrameHandler, frame: &Value) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(frame))) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!("Frame handler panicked on {frame}");
            false
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// `subscribe` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeEvent {
    pub event: &'static str,
    pub channel: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prec: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// `unsubscribe` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnsubscribeEvent {
    pub event: &'static str,
    #[serde(rename = "chanId")]
    pub chan_id: u64,
}

impl UnsubscribeEvent {
    pub fn new(chan_id: u64) -> Self {
        Self {
            event: "unsubscribe",
            chan_id,
        }
    }
}

/// Application-level `ping` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PingEvent {
    pub event: &'static str,
    pub cid: u64,
}

impl PingEvent {
    pub fn new(cid: u64) -> Self {
        Self { event: "ping", cid }
    }
}

/// Build an account-channel input frame: `[0, tag, null, payload]`
pub fn account_input<T: Serialize>(tag: &str, payload: &T) -> Result<String> {
    let frame = serde_json::json!([ACCOUNT_CHANNEL_ID, tag, Value::Null, payload]);
    Ok(serde_json::to_string(&frame)?)
}

// ============================================================================
// Inbound
// ============================================================================

/// Channel parameters echoed by `subscribed` and subscription `error` events
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChannelParams {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub prec: Option<Value>,
    #[serde(default)]
    pub freq: Option<Value>,
    #[serde(default)]
    pub len: Option<Value>,
}

/// Platform status carried by the info banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PlatformStatus {
    pub status: i64,
}

/// Control object received from the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ControlEvent {
    Auth {
        status: String,
        #[serde(rename = "userId", default)]
        user_id: Option<u64>,
        #[serde(default)]
        msg: Option<String>,
        #[serde(default)]
        code: Option<i64>,
    },
    Subscribed {
        #[serde(rename = "chanId")]
        chan_id: u64,
        #[serde(flatten)]
        params: ChannelParams,
    },
    Unsubscribed {
        #[serde(default)]
        status: Option<String>,
        #[serde(rename = "chanId")]
        chan_id: u64,
    },
    Info {
        #[serde(default)]
        version: Option<i64>,
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        msg: Option<String>,
        #[serde(default)]
        platform: Option<PlatformStatus>,
    },
    Error {
        #[serde(default)]
        msg: Option<String>,
        #[serde(default)]
        code: Option<i64>,
        #[serde(flatten)]
        params: ChannelParams,
    },
    Pong {
        #[serde(default)]
        cid: Option<u64>,
    },
    Conf {
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// One classified inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlEvent),
    Channel { chan_id: u64, frame: Value },
}

impl InboundFrame {
    /// Classify a raw text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        match &value {
            Value::Object(_) => Ok(InboundFrame::Control(serde_json::from_value(value)?)),
            Value::Array(fields) => {
                let chan_id = fields.first().and_then(Value::as_u64).ok_or_else(|| {
                    Error::ProtocolDesync(format!("array frame without channel id: {text}"))
                })?;
                Ok(InboundFrame::Channel {
                    chan_id,
                    frame: value,
                })
            }
            _ => Err(Error::ProtocolDesync(format!("unrecognized frame: {text}"))),
        }
    }
}

/// Whether a channel frame is a heartbeat: `[chanId, "hb"]`
pub fn is_heartbeat(frame: &Value) -> bool {
    frame.get(1).and_then(Value::as_str) == Some(HEARTBEAT)
}

/// Message-type tag of a channel frame: the second element, when it is a string
pub fn frame_tag(frame: &Value) -> Option<&str> {
    frame.get(1).and_then(Value::as_str)
}
