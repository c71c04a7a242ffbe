use std::fmt;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Polymarket CLOB market-data WebSocket endpoint.
pub const DEFAULT_WS_ENDPOINT: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Order side as reported on price_change entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// Strict parse of the wire representation. Anything but "BUY"/"SELL" is
    /// rejected so a malformed entry never mutates a book.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

/// Lifecycle states of one WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Active,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(value)
    }
}

/// One resting price level. Sizes are always strictly positive once stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Best price on one side, stamped with the book's last update time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestQuote {
    pub price: Decimal,
    pub size: Decimal,
    pub ts_ms: i64,
}

/// Best bid and offer. Either side may be absent on a one-sided book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bbo {
    pub bid: Option<BestQuote>,
    pub ask: Option<BestQuote>,
}

/// Result of a price-bounded scan over one book side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub orders: Vec<PriceLevel>,
    pub total_size: Decimal,
    /// Size-weighted average price, zero when nothing matched.
    pub avg_price: Decimal,
}

/// Result of a simulated market buy against resting asks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReport {
    pub orders: Vec<PriceLevel>,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
    pub completely_filled: bool,
}

/// Kind of book mutation behind an update notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Book,
    PriceChange,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Book => f.write_str("book"),
            Self::PriceChange => f.write_str("price_change"),
        }
    }
}

/// Notification pushed on the update channel after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookUpdate {
    pub token_id: String,
    pub kind: UpdateKind,
    pub ts_ms: i64,
}

/// Error taxonomy surfaced by the SDK.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("order book not initialized")]
    NotInitialized,
    #[error("token not subscribed: {0}")]
    TokenNotFound(String),
    #[error("no data for requested value")]
    NoData,
    #[error("operation invalid in current sdk lifecycle state")]
    AlreadyStarted,
    #[error("session not active: {state}")]
    StateConflict { state: ConnState },
    #[error("write queue enqueue timed out")]
    Timeout,
    #[error("stream failure: {0}")]
    Stream(String),
    #[error("wire parse failure: {0}")]
    Parse(String),
}

/// Feed configuration. Field defaults mirror the provider's documented limits;
/// every value can be overridden via `POLYBOOK_*` env vars or a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Market-channel WebSocket endpoint.
    pub endpoint: String,
    /// Sharding bound: max tokens subscribed on a single session.
    pub max_tokens_per_conn: usize,
    /// Reconnect backoff floor (ms).
    pub reconnect_min_ms: u64,
    /// Reconnect backoff ceiling (ms).
    pub reconnect_max_ms: u64,
    /// Max reconnect attempts per failure, 0 = retry forever.
    pub reconnect_max_attempts: u32,
    /// Heartbeat ping period (s).
    pub ping_interval_s: u64,
    /// Grace beyond the ping period before a connection is declared dead (s).
    pub pong_timeout_s: u64,
    /// Per-session write queue capacity.
    pub message_buffer_size: usize,
    /// Update notification channel capacity.
    pub update_channel_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            max_tokens_per_conn: 50,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 0,
            ping_interval_s: 30,
            pong_timeout_s: 10,
            message_buffer_size: 1000,
            update_channel_size: 1000,
        }
    }
}

impl FeedConfig {
    /// Defaults plus `POLYBOOK_*` environment overrides. Unparsable values
    /// keep the default rather than failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("POLYBOOK_WS_ENDPOINT") {
            if !v.trim().is_empty() {
                cfg.endpoint = v;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_MAX_TOKENS_PER_CONN") {
            if let Ok(n) = v.parse() {
                cfg.max_tokens_per_conn = n;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_RECONNECT_MIN_MS") {
            if let Ok(ms) = v.parse() {
                cfg.reconnect_min_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_RECONNECT_MAX_MS") {
            if let Ok(ms) = v.parse() {
                cfg.reconnect_max_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                cfg.reconnect_max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_PING_INTERVAL_S") {
            if let Ok(s) = v.parse() {
                cfg.ping_interval_s = s;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_PONG_TIMEOUT_S") {
            if let Ok(s) = v.parse() {
                cfg.pong_timeout_s = s;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_MESSAGE_BUFFER_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.message_buffer_size = n;
            }
        }
        if let Ok(v) = std::env::var("POLYBOOK_UPDATE_CHANNEL_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.update_channel_size = n;
            }
        }

        cfg
    }

    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, BookError> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| BookError::Parse(format!("read config: {e}")))?;
        toml::from_str(&raw).map_err(|e| BookError::Parse(format!("parse config: {e}")))
    }

    /// Read deadline for one frame: a healthy server answers pings well
    /// inside one ping period plus the pong grace.
    pub fn read_deadline_s(&self) -> u64 {
        self.ping_interval_s + self.pong_timeout_s
    }
}

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_matches_provider_limits() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.endpoint, DEFAULT_WS_ENDPOINT);
        assert_eq!(cfg.max_tokens_per_conn, 50);
        assert_eq!(cfg.reconnect_min_ms, 1000);
        assert_eq!(cfg.reconnect_max_ms, 30_000);
        assert_eq!(cfg.reconnect_max_attempts, 0);
        assert_eq!(cfg.ping_interval_s, 30);
        assert_eq!(cfg.pong_timeout_s, 10);
        assert_eq!(cfg.message_buffer_size, 1000);
        assert_eq!(cfg.update_channel_size, 1000);
        assert_eq!(cfg.read_deadline_s(), 40);
    }

    #[test]
    fn config_toml_partial_override() {
        let cfg: FeedConfig = toml::from_str(
            r#"
            max_tokens_per_conn = 10
            reconnect_min_ms = 250
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.max_tokens_per_conn, 10);
        assert_eq!(cfg.reconnect_min_ms, 250);
        assert_eq!(cfg.reconnect_max_ms, 30_000);
        assert_eq!(cfg.endpoint, DEFAULT_WS_ENDPOINT);
    }

    #[test]
    fn side_parse_is_strict() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("buy"), None);
        assert_eq!(Side::parse(""), None);
    }

    #[test]
    fn side_serde_round_trip() {
        let buy: Side = serde_json::from_str("\"BUY\"").expect("buy");
        assert_eq!(buy, Side::Buy);
        assert_eq!(serde_json::to_string(&Side::Sell).expect("sell"), "\"SELL\"");
    }

    #[test]
    fn price_level_equality_ignores_scale() {
        let a = PriceLevel {
            price: dec!(0.50),
            size: dec!(100),
        };
        let b = PriceLevel {
            price: dec!(0.5),
            size: dec!(100.0),
        };
        assert_eq!(a, b);
    }
}
