use std::sync::Arc;

use rust_decimal_macros::dec;

use core_types::{FeedConfig, UpdateKind};

use super::Manager;

fn manager_with_channel(capacity: usize) -> Arc<Manager> {
    Manager::new(FeedConfig {
        update_channel_size: capacity,
        ..FeedConfig::default()
    })
}

fn registered_manager(tokens: &[&str]) -> Arc<Manager> {
    let manager = manager_with_channel(64);
    let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    manager.register_tokens(&tokens);
    manager
}

fn book_frame(token: &str, ts: i64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let levels = |side: &[(&str, &str)]| {
        side.iter()
            .map(|(p, s)| format!(r#"{{"price":"{p}","size":"{s}"}}"#))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        r#"{{"event_type":"book","asset_id":"{token}","market":"0xmkt","timestamp":"{ts}","hash":"h{ts}","bids":[{}],"asks":[{}]}}"#,
        levels(bids),
        levels(asks)
    )
}

fn delta_frame(token: &str, ts: i64, price: &str, size: &str, side: &str) -> String {
    format!(
        r#"{{"event_type":"price_change","market":"0xmkt","timestamp":"{ts}","price_changes":[{{"asset_id":"{token}","price":"{price}","size":"{size}","side":"{side}","hash":"d{ts}"}}]}}"#
    )
}

#[test]
fn snapshot_then_delta_flows_through() {
    let manager = registered_manager(&["T1"]);

    manager.handle_frame(&book_frame(
        "T1",
        1000,
        &[("0.55", "100"), ("0.54", "200")],
        &[("0.57", "150"), ("0.58", "80")],
    ));
    manager.handle_frame(&delta_frame("T1", 1010, "0.55", "80", "BUY"));

    let book = manager.book("T1").expect("book");
    assert!(book.is_initialized());
    assert_eq!(book.best_bid().expect("bid").price, dec!(0.55));
    assert_eq!(book.best_bid().expect("bid").size, dec!(80));
    assert_eq!(book.best_ask().expect("ask").price, dec!(0.57));
    assert_eq!(book.mid_price(), Some(dec!(0.56)));
    assert_eq!(book.spread(), Some(dec!(0.02)));

    // Per-token notifications reflect application order.
    let updates = manager.updates();
    let first = updates.try_recv().expect("book update");
    assert_eq!(first.kind, UpdateKind::Book);
    assert_eq!(first.token_id, "T1");
    assert_eq!(first.ts_ms, 1000);
    let second = updates.try_recv().expect("delta update");
    assert_eq!(second.kind, UpdateKind::PriceChange);
    assert_eq!(second.ts_ms, 1010);
}

#[test]
fn pre_snapshot_deltas_are_buffered_and_stale_ones_discarded() {
    let manager = registered_manager(&["T1"]);

    // Delta before any snapshot: buffered, book stays uninitialized.
    manager.handle_frame(&delta_frame("T1", 900, "0.55", "100", "BUY"));
    let book = manager.book("T1").expect("book");
    assert!(!book.is_initialized());
    assert!(manager.updates().try_recv().is_none());

    // Snapshot at ts=1000: the ts=900 delta is older and must not replay.
    manager.handle_frame(&book_frame("T1", 1000, &[], &[("0.60", "10")]));
    assert!(book.is_initialized());
    assert!(book.best_bid().is_none());
    assert_eq!(book.best_ask().expect("ask").price, dec!(0.60));
    assert_eq!(book.best_ask().expect("ask").size, dec!(10));
}

#[test]
fn buffered_delta_at_or_after_snapshot_is_replayed() {
    let manager = registered_manager(&["T1"]);

    manager.handle_frame(&delta_frame("T1", 1100, "0.55", "40", "BUY"));
    manager.handle_frame(&delta_frame("T1", 990, "0.50", "70", "BUY"));
    manager.handle_frame(&book_frame("T1", 1000, &[], &[("0.60", "10")]));

    let book = manager.book("T1").expect("book");
    // ts=1100 replays, ts=990 is dropped.
    assert_eq!(book.best_bid().expect("bid").price, dec!(0.55));
    assert_eq!(book.best_bid().expect("bid").size, dec!(40));
    assert_eq!(book.timestamp_ms(), 1100);

    // The queue was emptied: a second snapshot must not replay anything.
    manager.handle_frame(&book_frame("T1", 1200, &[], &[("0.61", "5")]));
    assert!(book.best_bid().is_none());
}

#[test]
fn stale_snapshot_is_ignored() {
    let manager = registered_manager(&["T1"]);

    manager.handle_frame(&book_frame("T1", 2000, &[("0.55", "100")], &[]));
    manager.handle_frame(&book_frame("T1", 1500, &[("0.10", "5")], &[]));

    let book = manager.book("T1").expect("book");
    assert_eq!(book.best_bid().expect("bid").price, dec!(0.55));
    assert_eq!(book.timestamp_ms(), 2000);

    // Only the first snapshot produced a notification.
    let updates = manager.updates();
    assert!(updates.try_recv().is_some());
    assert!(updates.try_recv().is_none());
}

#[test]
fn array_bodies_are_demultiplexed_in_order() {
    let manager = registered_manager(&["T1", "T2"]);

    let batch = format!(
        "[{},{}]",
        book_frame("T1", 1000, &[("0.55", "100")], &[]),
        book_frame("T2", 1001, &[], &[("0.60", "10")])
    );
    manager.handle_frame(&batch);

    assert!(manager.is_initialized("T1"));
    assert!(manager.is_initialized("T2"));
    assert!(manager.is_all_initialized());
}

#[test]
fn unknown_tokens_and_event_types_are_ignored() {
    let manager = registered_manager(&["T1"]);

    manager.handle_frame(&book_frame("T9", 1000, &[("0.55", "100")], &[]));
    manager.handle_frame(r#"{"event_type":"tick_size_change","asset_id":"T1","old_tick_size":"0.01","new_tick_size":"0.001"}"#);
    manager.handle_frame(r#"{"event_type":"last_trade_price","asset_id":"T1","price":"0.5","side":"SELL","size":"3","timestamp":"1000"}"#);
    manager.handle_frame(r#"{"event_type":"mystery"}"#);
    manager.handle_frame("PONG");
    manager.handle_frame("{broken json");

    assert!(!manager.is_initialized("T1"));
    assert!(manager.updates().try_recv().is_none());
}

#[test]
fn bad_timestamps_drop_the_message() {
    let manager = registered_manager(&["T1"]);

    let frame = r#"{"event_type":"book","asset_id":"T1","timestamp":"not-a-number","bids":[],"asks":[]}"#;
    manager.handle_frame(frame);
    assert!(!manager.is_initialized("T1"));
}

#[test]
fn saturated_update_channel_keeps_most_recent() {
    let manager = Manager::new(FeedConfig {
        update_channel_size: 2,
        ..FeedConfig::default()
    });
    manager.register_tokens(&["T1".to_string()]);

    manager.handle_frame(&book_frame("T1", 1000, &[("0.50", "10")], &[]));
    for ts in 1001..=1006 {
        manager.handle_frame(&delta_frame("T1", ts, "0.50", "20", "BUY"));
    }

    let updates = manager.updates();
    assert_eq!(updates.len(), 2);
    // Oldest were evicted; the newest notification is always present.
    let first = updates.try_recv().expect("first");
    assert_eq!(first.ts_ms, 1005);
    let last = updates.try_recv().expect("last");
    assert_eq!(last.ts_ms, 1006);
    assert!(updates.dropped_count() >= 1);
}

#[tokio::test]
async fn unsubscribe_drops_replica_and_pending_state() {
    let manager = registered_manager(&["T1", "T2"]);
    manager.handle_frame(&delta_frame("T1", 900, "0.55", "100", "BUY"));

    manager
        .unsubscribe(&["T1".to_string()])
        .await
        .expect("unsubscribe");

    assert!(manager.book("T1").is_none());
    assert!(manager.book("T2").is_some());
    let tokens = manager.subscribed_tokens();
    assert_eq!(tokens, vec!["T2".to_string()]);

    // Frames for the dropped token are ignored without effect.
    manager.handle_frame(&book_frame("T1", 1000, &[("0.55", "100")], &[]));
    assert!(manager.book("T1").is_none());
}

#[test]
fn all_initialized_requires_at_least_one_book() {
    let manager = manager_with_channel(8);
    assert!(!manager.is_all_initialized());

    manager.register_tokens(&["T1".to_string(), "T2".to_string()]);
    manager.handle_frame(&book_frame("T1", 1000, &[("0.55", "100")], &[]));
    assert!(!manager.is_all_initialized());
    manager.handle_frame(&book_frame("T2", 1000, &[], &[("0.60", "10")]));
    assert!(manager.is_all_initialized());
}

#[test]
fn ingestion_stats_track_the_pipeline() {
    let manager = registered_manager(&["T1"]);
    assert_eq!(manager.stats(), super::StatsSnapshot::default());

    // One buffered delta, one replayed at snapshot time, one applied live,
    // one parse error.
    manager.handle_frame(&delta_frame("T1", 1100, "0.55", "40", "BUY"));
    manager.handle_frame(&book_frame("T1", 1000, &[], &[("0.60", "10")]));
    manager.handle_frame(&delta_frame("T1", 1200, "0.60", "5", "SELL"));
    manager.handle_frame("{broken");

    let stats = manager.stats();
    assert_eq!(stats.snapshots_applied, 1);
    assert_eq!(stats.deltas_buffered, 1);
    assert_eq!(stats.deltas_replayed, 1);
    assert_eq!(stats.deltas_applied, 1);
    assert_eq!(stats.parse_errors, 1);
    assert_eq!(stats.books_reset, 0);

    let books = manager.books();
    assert_eq!(books.len(), 1);
    assert!(books["T1"].is_initialized());
}

#[tokio::test]
async fn close_is_idempotent_and_ends_the_update_stream() {
    let manager = registered_manager(&["T1"]);
    let updates = manager.updates();

    manager.handle_frame(&book_frame("T1", 1000, &[("0.55", "100")], &[]));
    manager.close().await;
    manager.close().await;

    // Drained, then end-of-stream; publishes after close are rejected.
    assert!(updates.recv().await.is_some());
    assert!(updates.recv().await.is_none());
    manager.handle_frame(&delta_frame("T1", 1010, "0.55", "80", "BUY"));
    assert!(updates.try_recv().is_none());

    assert!(manager
        .subscribe(&["T9".to_string()])
        .await
        .is_err_and(|e| matches!(e, core_types::BookError::AlreadyStarted)));
}
