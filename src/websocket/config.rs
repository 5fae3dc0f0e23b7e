//! Connection and reconnection settings

use std::time::Duration;

/// Public market data endpoint
pub const PUBLIC_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

/// Endpoint accepting authenticated sessions
pub const AUTH_WS_URL: &str = "wss://api.bitfinex.com/ws/2";

/// Configuration for a websocket client
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Endpoint to connect to
    pub url: String,
    /// How long subscribe and unsubscribe calls wait for the server
    pub subscribe_timeout: Duration,
    /// How long trading commands wait for an acknowledgement
    pub command_timeout: Duration,
    /// Silence on the receive side after which the connection is presumed dead
    pub idle_timeout: Duration,
    /// Interval of transport-level pings
    pub heartbeat_interval: Duration,
    /// Reconnection after an unexpected close
    pub reconnect: ReconnectConfig,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: AUTH_WS_URL.to_string(),
            subscribe_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl WsConfig {
    /// Market data only, against the public endpoint
    pub fn public() -> Self {
        Self::default().with_url(PUBLIC_WS_URL)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Configuration for automatic reconnection
///
/// The default is a single attempt after a fixed 2 s delay. Raising
/// `max_attempts` turns on bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to automatically reconnect on disconnect
    pub enabled: bool,
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum number of reconnect attempts (None for unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: Some(1),
        }
    }
}

impl ReconnectConfig {
    /// Create a new reconnect config with reconnection disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = (self.initial_delay.as_millis() as f64 * multiplier) as u64;
        let delay = Duration::from_millis(delay_ms);

        std::cmp::min(delay, self.max_delay)
    }

    /// Check if another reconnect attempt should be made
    pub fn should_attempt(&self, attempt: u32) -> bool {
        if !self.enabled {
            return false;
        }
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
