//! Demultiplexes market-channel frames onto per-token book replicas.
//!
//! The manager owns the session pool, one replica and one pending-delta queue
//! per subscribed token, and the bounded drop-oldest update bus. Deltas that
//! arrive before a token's first snapshot are buffered and replayed once the
//! snapshot lands; a session disconnect resets every book routed through it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use book_replica::BookReplica;
use core_types::{BookError, BookUpdate, ConnState, FeedConfig, UpdateKind};
use feed_polymarket::{MessageHandler, SessionPool, StateChangeHandler};
use infra_bus::UpdateBus;
use poly_wire::{BookMessage, PriceChange, PriceChangeMessage, WireEvent};

struct PendingChange {
    change: PriceChange,
    ts_ms: i64,
}

/// Ingestion counters, mirrored into the process metrics recorder.
#[derive(Debug, Default)]
struct ManagerStats {
    snapshots_applied: AtomicU64,
    deltas_applied: AtomicU64,
    deltas_buffered: AtomicU64,
    deltas_replayed: AtomicU64,
    parse_errors: AtomicU64,
    books_reset: AtomicU64,
}

/// Point-in-time view of the manager's ingestion counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub snapshots_applied: u64,
    pub deltas_applied: u64,
    pub deltas_buffered: u64,
    pub deltas_replayed: u64,
    pub parse_errors: u64,
    pub books_reset: u64,
    pub updates_dropped: u64,
}

#[derive(Default)]
struct ManagerInner {
    books: HashMap<String, Arc<BookReplica>>,
    pending: HashMap<String, Vec<PendingChange>>,
    subscribed: HashSet<String>,
}

pub struct Manager {
    cfg: Arc<FeedConfig>,
    cancel: CancellationToken,
    inner: RwLock<ManagerInner>,
    pool: OnceLock<Arc<SessionPool>>,
    updates: UpdateBus<BookUpdate>,
    stats: ManagerStats,
    closed: AtomicBool,
}

impl Manager {
    pub fn new(cfg: FeedConfig) -> Arc<Self> {
        let updates = UpdateBus::new(cfg.update_channel_size);
        Arc::new(Self {
            cfg: Arc::new(cfg),
            cancel: CancellationToken::new(),
            inner: RwLock::new(ManagerInner::default()),
            pool: OnceLock::new(),
            updates,
            stats: ManagerStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Open the pool's first idle connection without subscribing anything.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BookError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }
        self.ensure_pool().connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.pool.get().is_some_and(|p| p.is_connected())
    }

    /// Union new tokens into the subscribed set, create fresh replicas and
    /// pending queues for them, and route only the net-new subset.
    pub async fn subscribe(self: &Arc<Self>, token_ids: &[String]) -> Result<(), BookError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }

        let fresh = self.register_tokens(token_ids);
        if fresh.is_empty() {
            return Ok(());
        }

        tracing::info!(count = fresh.len(), "subscribing tokens");
        self.ensure_pool().subscribe(&fresh).await
    }

    /// Drop replicas, pending queues, and routes for the given tokens.
    pub async fn unsubscribe(self: &Arc<Self>, token_ids: &[String]) -> Result<(), BookError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }
        {
            let mut inner = self.inner.write();
            for token in token_ids {
                inner.subscribed.remove(token);
                inner.books.remove(token);
                inner.pending.remove(token);
            }
        }
        match self.pool.get() {
            Some(pool) => pool.unsubscribe(token_ids).await,
            None => Ok(()),
        }
    }

    /// The update notification channel (single consumer, drop-oldest).
    pub fn updates(&self) -> UpdateBus<BookUpdate> {
        self.updates.clone()
    }

    pub fn book(&self, token_id: &str) -> Option<Arc<BookReplica>> {
        self.inner.read().books.get(token_id).cloned()
    }

    pub fn subscribed_tokens(&self) -> Vec<String> {
        self.inner.read().subscribed.iter().cloned().collect()
    }

    pub fn is_initialized(&self, token_id: &str) -> bool {
        self.inner
            .read()
            .books
            .get(token_id)
            .is_some_and(|b| b.is_initialized())
    }

    pub fn is_all_initialized(&self) -> bool {
        let inner = self.inner.read();
        !inner.books.is_empty() && inner.books.values().all(|b| b.is_initialized())
    }

    pub fn connection_status(&self) -> HashMap<String, ConnState> {
        self.pool.get().map(|p| p.status()).unwrap_or_default()
    }

    /// All replicas, keyed by token. Handles, not copies.
    pub fn books(&self) -> HashMap<String, Arc<BookReplica>> {
        self.inner.read().books.clone()
    }

    pub fn session_count(&self) -> usize {
        self.pool.get().map(|p| p.session_count()).unwrap_or(0)
    }

    pub fn routed_token_count(&self) -> usize {
        self.pool.get().map(|p| p.token_count()).unwrap_or(0)
    }

    pub fn is_all_active(&self) -> bool {
        self.pool.get().is_some_and(|p| p.is_all_active())
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            snapshots_applied: self.stats.snapshots_applied.load(Ordering::Relaxed),
            deltas_applied: self.stats.deltas_applied.load(Ordering::Relaxed),
            deltas_buffered: self.stats.deltas_buffered.load(Ordering::Relaxed),
            deltas_replayed: self.stats.deltas_replayed.load(Ordering::Relaxed),
            parse_errors: self.stats.parse_errors.load(Ordering::Relaxed),
            books_reset: self.stats.books_reset.load(Ordering::Relaxed),
            updates_dropped: self.updates.dropped_count(),
        }
    }

    /// Idempotent shutdown: cancel sessions, drop routes, close the bus.
    /// Pending notifications are not flushed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        self.updates.close();
        tracing::info!("manager closed");
    }

    /// Create replicas and pending queues for tokens not yet subscribed;
    /// returns the net-new subset.
    fn register_tokens(&self, token_ids: &[String]) -> Vec<String> {
        let mut inner = self.inner.write();
        let mut fresh = Vec::new();
        for token in token_ids {
            if inner.subscribed.insert(token.clone()) {
                inner
                    .books
                    .entry(token.clone())
                    .or_insert_with(|| Arc::new(BookReplica::new(token.clone())));
                inner.pending.entry(token.clone()).or_default();
                fresh.push(token.clone());
            }
        }
        fresh
    }

    fn ensure_pool(self: &Arc<Self>) -> Arc<SessionPool> {
        if let Some(pool) = self.pool.get() {
            return pool.clone();
        }

        let weak: Weak<Manager> = Arc::downgrade(self);
        let on_message: MessageHandler = Arc::new(move |frame: &str| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_frame(frame);
            }
        });
        let weak = Arc::downgrade(self);
        let on_state: StateChangeHandler = Arc::new(move |session_id: &str, state: ConnState| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_session_state(session_id, state);
            }
        });

        let pool = Arc::new(SessionPool::new(
            self.cfg.clone(),
            self.cancel.child_token(),
            on_message,
            Some(on_state),
        ));
        // A concurrent caller may have won the race; use whichever landed.
        let _ = self.pool.set(pool);
        self.pool.get().expect("pool just installed").clone()
    }

    /// Entry point for every frame read off a session.
    fn handle_frame(&self, raw: &str) {
        let events = match poly_wire::parse_frame(raw) {
            Ok(events) => events,
            Err(err) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("wire.parse_error").increment(1);
                tracing::debug!(error = %err, "dropping unparsable frame");
                return;
            }
        };
        for event in events {
            match event {
                WireEvent::Book(msg) => self.handle_book(msg),
                WireEvent::PriceChange(msg) => self.handle_price_change(msg),
                // Acknowledged kinds with no book effect.
                WireEvent::TickSizeChange(_) | WireEvent::LastTradePrice(_) => {}
                WireEvent::Unknown(kind) => {
                    tracing::debug!(kind, "ignoring unknown event type");
                }
            }
        }
    }

    fn handle_book(&self, msg: BookMessage) {
        let Some(ts_ms) = poly_wire::parse_ts_ms(&msg.timestamp) else {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("wire.parse_error").increment(1);
            tracing::debug!(token = %msg.asset_id, "book message with bad timestamp");
            return;
        };

        // The token may have been unsubscribed while the frame was in flight.
        let Some(book) = self.book(&msg.asset_id) else {
            tracing::debug!(token = %msg.asset_id, "book for unknown token");
            return;
        };

        if !book.apply_snapshot(&msg, ts_ms) {
            return;
        }
        self.stats.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("book.snapshot_applied").increment(1);

        // Replay buffered deltas that are not older than the snapshot, then
        // empty the queue unconditionally.
        let buffered = {
            let mut inner = self.inner.write();
            inner
                .pending
                .get_mut(&msg.asset_id)
                .map(std::mem::take)
                .unwrap_or_default()
        };
        let mut replayed = 0usize;
        for pending in &buffered {
            if pending.ts_ms >= ts_ms && book.apply_price_change(&pending.change, pending.ts_ms) {
                replayed += 1;
            }
        }
        if replayed > 0 {
            self.stats
                .deltas_replayed
                .fetch_add(replayed as u64, Ordering::Relaxed);
            tracing::debug!(token = %msg.asset_id, replayed, "replayed buffered deltas");
        }

        self.publish(BookUpdate {
            token_id: msg.asset_id,
            kind: UpdateKind::Book,
            ts_ms,
        });
    }

    fn handle_price_change(&self, msg: PriceChangeMessage) {
        let Some(ts_ms) = poly_wire::parse_ts_ms(&msg.timestamp) else {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("wire.parse_error").increment(1);
            tracing::debug!(market = %msg.market, "price_change with bad timestamp");
            return;
        };

        for change in msg.price_changes {
            let Some(book) = self.book(&change.asset_id) else {
                tracing::debug!(token = %change.asset_id, "price_change for unknown token");
                continue;
            };

            if !book.is_initialized() {
                self.stats.deltas_buffered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("book.delta_buffered").increment(1);
                let mut inner = self.inner.write();
                inner
                    .pending
                    .entry(change.asset_id.clone())
                    .or_default()
                    .push(PendingChange { change, ts_ms });
                continue;
            }

            let token_id = change.asset_id.clone();
            if book.apply_price_change(&change, ts_ms) {
                self.stats.deltas_applied.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("book.delta_applied").increment(1);
                self.publish(BookUpdate {
                    token_id,
                    kind: UpdateKind::PriceChange,
                    ts_ms,
                });
            }
        }
    }

    /// Session-state callback from the pool. Books routed through a session
    /// that lost its connection are reset in place; the replica objects stay
    /// so external handles remain valid.
    fn handle_session_state(&self, session_id: &str, state: ConnState) {
        tracing::info!(session = session_id, state = %state, "session state change");
        if state != ConnState::Reconnecting && state != ConnState::Disconnected {
            return;
        }
        let Some(pool) = self.pool.get() else {
            return;
        };

        let affected: Vec<(String, Arc<BookReplica>)> = {
            let inner = self.inner.read();
            inner
                .books
                .iter()
                .filter(|(token, _)| {
                    pool.session_for(token)
                        .is_some_and(|s| s.id() == session_id)
                })
                .map(|(token, book)| (token.clone(), book.clone()))
                .collect()
        };
        if affected.is_empty() {
            return;
        }

        for (_, book) in &affected {
            book.reset();
        }
        self.stats
            .books_reset
            .fetch_add(affected.len() as u64, Ordering::Relaxed);
        metrics::counter!("book.reset").increment(affected.len() as u64);
        {
            let mut inner = self.inner.write();
            for (token, _) in &affected {
                if let Some(queue) = inner.pending.get_mut(token) {
                    queue.clear();
                }
            }
        }
        tracing::info!(
            session = session_id,
            books = affected.len(),
            "reset books after disconnect"
        );
    }

    fn publish(&self, update: BookUpdate) {
        self.updates.publish(update);
    }
}

#[cfg(test)]
mod tests;
