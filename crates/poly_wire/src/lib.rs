//! Wire format of the Polymarket CLOB market channel.
//!
//! Frames are UTF-8 JSON text: either a single event object or an array of
//! event objects (the server batches the initial snapshots after a
//! subscription). Every numeric field travels as a decimal-bearing string and
//! is kept as a string here; parsing into exact decimals happens where the
//! value is consumed.

use serde::{Deserialize, Serialize};

/// One raw price level as it appears inside `book` snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLevel {
    pub price: String,
    pub size: String,
}

/// Full book snapshot (`event_type: "book"`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookMessage {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    /// Milliseconds since the epoch, as a string.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

/// One incremental level update inside a `price_change` envelope.
/// `best_bid`/`best_ask` are advisory metadata from the server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceChange {
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub price: String,
    /// New aggregate size at the level; "0" removes it.
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub best_bid: String,
    #[serde(default)]
    pub best_ask: String,
}

/// Batch of level updates sharing one timestamp (`event_type: "price_change"`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceChangeMessage {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub price_changes: Vec<PriceChange>,
}

/// `event_type: "tick_size_change"`. Recognized and dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickSizeChangeMessage {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub old_tick_size: String,
    #[serde(default)]
    pub new_tick_size: String,
    #[serde(default)]
    pub timestamp: String,
}

/// `event_type: "last_trade_price"`. Recognized and dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastTradePriceMessage {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub fee_rate_bps: String,
    #[serde(default)]
    pub timestamp: String,
}

/// A demultiplexed server event.
#[derive(Debug, Clone)]
pub enum WireEvent {
    Book(BookMessage),
    PriceChange(PriceChangeMessage),
    TickSizeChange(TickSizeChangeMessage),
    LastTradePrice(LastTradePriceMessage),
    /// Unrecognized `event_type`; carried for logging only.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct EventTag {
    #[serde(default)]
    event_type: String,
}

/// Split a raw frame into typed events. The branch between single-object and
/// array bodies is picked off the first non-whitespace byte.
pub fn parse_frame(raw: &str) -> Result<Vec<WireEvent>, serde_json::Error> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
        values.into_iter().map(classify).collect()
    } else {
        let value: serde_json::Value = serde_json::from_str(trimmed)?;
        Ok(vec![classify(value)?])
    }
}

fn classify(value: serde_json::Value) -> Result<WireEvent, serde_json::Error> {
    let tag: EventTag = serde_json::from_value(value.clone())?;
    match tag.event_type.as_str() {
        "book" => Ok(WireEvent::Book(serde_json::from_value(value)?)),
        "price_change" => Ok(WireEvent::PriceChange(serde_json::from_value(value)?)),
        "tick_size_change" => Ok(WireEvent::TickSizeChange(serde_json::from_value(value)?)),
        "last_trade_price" => Ok(WireEvent::LastTradePrice(serde_json::from_value(value)?)),
        other => Ok(WireEvent::Unknown(other.to_string())),
    }
}

/// Parse a wire timestamp (decimal string of epoch milliseconds).
pub fn parse_ts_ms(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

/// Initial bulk subscription sent right after the transport handshake.
#[derive(Debug, Clone, Serialize)]
pub struct InitialSubscribe {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub channel: String,
}

impl InitialSubscribe {
    pub fn market(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            channel: "MARKET".to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of two plain fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Dynamic subscribe/unsubscribe for an already-active session.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicOp {
    pub assets_ids: Vec<String>,
    pub operation: String,
}

impl DynamicOp {
    pub fn subscribe(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            operation: "subscribe".to_string(),
        }
    }

    pub fn unsubscribe(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            operation: "unsubscribe".to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOK_FRAME: &str = r#"{
        "event_type": "book",
        "asset_id": "token-1",
        "market": "0xmarket",
        "timestamp": "1000",
        "hash": "abc",
        "bids": [{"price": "0.55", "size": "100"}],
        "asks": [{"price": "0.57", "size": "150"}]
    }"#;

    #[test]
    fn parses_single_book_object() {
        let events = parse_frame(BOOK_FRAME).expect("parse");
        assert_eq!(events.len(), 1);
        let WireEvent::Book(msg) = &events[0] else {
            panic!("expected book event");
        };
        assert_eq!(msg.asset_id, "token-1");
        assert_eq!(msg.market, "0xmarket");
        assert_eq!(msg.hash, "abc");
        assert_eq!(msg.bids.len(), 1);
        assert_eq!(msg.bids[0].price, "0.55");
        assert_eq!(parse_ts_ms(&msg.timestamp), Some(1000));
    }

    #[test]
    fn parses_array_body() {
        let frame = format!("  [{BOOK_FRAME}, {BOOK_FRAME}]");
        let events = parse_frame(&frame).expect("parse");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WireEvent::Book(_)));
        assert!(matches!(events[1], WireEvent::Book(_)));
    }

    #[test]
    fn parses_price_change_batch() {
        let frame = r#"{
            "event_type": "price_change",
            "market": "0xmarket",
            "timestamp": "1010",
            "price_changes": [
                {"asset_id": "token-1", "price": "0.55", "size": "80", "side": "BUY",
                 "hash": "h1", "best_bid": "0.55", "best_ask": "0.57"},
                {"asset_id": "token-2", "price": "0.60", "size": "0", "side": "SELL"}
            ]
        }"#;
        let events = parse_frame(frame).expect("parse");
        let WireEvent::PriceChange(msg) = &events[0] else {
            panic!("expected price_change event");
        };
        assert_eq!(msg.price_changes.len(), 2);
        assert_eq!(msg.price_changes[0].side, "BUY");
        assert_eq!(msg.price_changes[1].size, "0");
        assert_eq!(parse_ts_ms(&msg.timestamp), Some(1010));
    }

    #[test]
    fn ignored_event_kinds_are_still_typed() {
        let frame = r#"{"event_type": "last_trade_price", "asset_id": "t", "price": "0.4", "side": "SELL", "size": "12", "timestamp": "5"}"#;
        let events = parse_frame(frame).expect("parse");
        assert!(matches!(events[0], WireEvent::LastTradePrice(_)));

        let frame = r#"{"event_type": "tick_size_change", "asset_id": "t", "old_tick_size": "0.01", "new_tick_size": "0.001"}"#;
        let events = parse_frame(frame).expect("parse");
        assert!(matches!(events[0], WireEvent::TickSizeChange(_)));
    }

    #[test]
    fn unknown_event_type_is_flagged_not_failed() {
        let events = parse_frame(r#"{"event_type": "mystery"}"#).expect("parse");
        let WireEvent::Unknown(kind) = &events[0] else {
            panic!("expected unknown event");
        };
        assert_eq!(kind, "mystery");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_frame("PONG").is_err());
        assert!(parse_frame("{not json").is_err());
    }

    #[test]
    fn subscription_request_shapes() {
        let initial = InitialSubscribe::market(vec!["a".into(), "b".into()]).to_json();
        assert_eq!(initial, r#"{"assets_ids":["a","b"],"type":"MARKET"}"#);

        let add = DynamicOp::subscribe(vec!["c".into()]).to_json();
        assert_eq!(add, r#"{"assets_ids":["c"],"operation":"subscribe"}"#);

        let remove = DynamicOp::unsubscribe(vec!["c".into()]).to_json();
        assert_eq!(remove, r#"{"assets_ids":["c"],"operation":"unsubscribe"}"#);
    }

    #[test]
    fn wire_timestamps_reject_garbage() {
        assert_eq!(parse_ts_ms("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(parse_ts_ms(" 42 "), Some(42));
        assert_eq!(parse_ts_ms("12.5"), None);
        assert_eq!(parse_ts_ms(""), None);
    }
}
