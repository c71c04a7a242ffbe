//! Externally-visible SDK facade: guards the manager lifecycle and forwards
//! read queries to the per-token replicas.
//!
//! Lifecycle operations (subscribe / unsubscribe / close) are serialized;
//! reads go straight to the replica's own lock and run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;

use book_manager::{Manager, StatsSnapshot};
use book_replica::BookReplica;
use core_types::{
    Bbo, BestQuote, BookError, BookUpdate, ConnState, FeedConfig, FillReport, PriceLevel,
    ScanReport,
};
use infra_bus::UpdateBus;

pub use book_manager::StatsSnapshot as SdkStats;
pub use core_types as types;

pub struct OrderBookSdk {
    manager: Arc<Manager>,
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl OrderBookSdk {
    pub fn new(cfg: FeedConfig) -> Self {
        Self {
            manager: Manager::new(cfg),
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FeedConfig::default())
    }

    /// Open the stream without subscribing anything ("connect first,
    /// subscribe later").
    pub async fn connect(&self) -> Result<(), BookError> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }
        self.manager.connect().await
    }

    /// Incremental, idempotent subscription: already-subscribed tokens are
    /// skipped without error.
    pub async fn subscribe(&self, token_ids: &[String]) -> Result<(), BookError> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }
        self.manager.subscribe(token_ids).await
    }

    pub async fn unsubscribe(&self, token_ids: &[String]) -> Result<(), BookError> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(BookError::AlreadyStarted);
        }
        self.manager.unsubscribe(token_ids).await
    }

    /// The bounded drop-oldest notification channel (single consumer).
    pub fn updates(&self) -> UpdateBus<BookUpdate> {
        self.manager.updates()
    }

    /// Idempotent. Pending notifications are dropped, not flushed.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.close().await;
    }

    pub fn is_initialized(&self, token_id: &str) -> bool {
        self.manager.is_initialized(token_id)
    }

    pub fn is_all_initialized(&self) -> bool {
        self.manager.is_all_initialized()
    }

    pub fn connection_status(&self) -> HashMap<String, ConnState> {
        self.manager.connection_status()
    }

    /// True when every pool session currently holds a live connection.
    pub fn is_all_active(&self) -> bool {
        self.manager.is_all_active()
    }

    pub fn session_count(&self) -> usize {
        self.manager.session_count()
    }

    /// Tokens with a live session route (may lag `subscribed_tokens` while a
    /// subscription is still being placed).
    pub fn routed_token_count(&self) -> usize {
        self.manager.routed_token_count()
    }

    pub fn subscribed_tokens(&self) -> Vec<String> {
        self.manager.subscribed_tokens()
    }

    /// Ingestion counters since startup.
    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats()
    }

    pub fn best_bid(&self, token_id: &str) -> Result<BestQuote, BookError> {
        let book = self.initialized_book(token_id)?;
        book.best_bid().ok_or(BookError::NoData)
    }

    pub fn best_ask(&self, token_id: &str) -> Result<BestQuote, BookError> {
        let book = self.initialized_book(token_id)?;
        book.best_ask().ok_or(BookError::NoData)
    }

    /// Both tops at once; sides may individually be absent.
    pub fn bbo(&self, token_id: &str) -> Result<Bbo, BookError> {
        let book = self.book(token_id)?;
        book.bbo().ok_or(BookError::NotInitialized)
    }

    pub fn mid_price(&self, token_id: &str) -> Result<Decimal, BookError> {
        let book = self.initialized_book(token_id)?;
        book.mid_price().ok_or(BookError::NoData)
    }

    pub fn spread(&self, token_id: &str) -> Result<Decimal, BookError> {
        let book = self.initialized_book(token_id)?;
        book.spread().ok_or(BookError::NoData)
    }

    pub fn depth(
        &self,
        token_id: &str,
        depth: usize,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), BookError> {
        let book = self.book(token_id)?;
        book.depth(depth).ok_or(BookError::NotInitialized)
    }

    pub fn total_bid_size(&self, token_id: &str) -> Result<Decimal, BookError> {
        let book = self.initialized_book(token_id)?;
        Ok(book.total_bid_size())
    }

    pub fn total_ask_size(&self, token_id: &str) -> Result<Decimal, BookError> {
        let book = self.initialized_book(token_id)?;
        Ok(book.total_ask_size())
    }

    pub fn all_bids(&self, token_id: &str) -> Result<Vec<PriceLevel>, BookError> {
        let book = self.book(token_id)?;
        book.all_bids().ok_or(BookError::NotInitialized)
    }

    pub fn all_asks(&self, token_id: &str) -> Result<Vec<PriceLevel>, BookError> {
        let book = self.book(token_id)?;
        book.all_asks().ok_or(BookError::NotInitialized)
    }

    /// Asks priced at or below `max_price`, with totals and the weighted
    /// average price of the slice.
    pub fn scan_asks_below(
        &self,
        token_id: &str,
        max_price: Decimal,
    ) -> Result<ScanReport, BookError> {
        let book = self.book(token_id)?;
        book.scan_asks_below(max_price).ok_or(BookError::NotInitialized)
    }

    /// Bids priced at or above `min_price`; mirror of `scan_asks_below`.
    pub fn scan_bids_above(
        &self,
        token_id: &str,
        min_price: Decimal,
    ) -> Result<ScanReport, BookError> {
        let book = self.book(token_id)?;
        book.scan_bids_above(min_price).ok_or(BookError::NotInitialized)
    }

    /// Simulated market buy sweeping the asks from the best price.
    pub fn simulate_buy_asks(
        &self,
        token_id: &str,
        required_size: Decimal,
    ) -> Result<FillReport, BookError> {
        let book = self.book(token_id)?;
        book.simulate_buy_asks(required_size)
            .ok_or(BookError::NotInitialized)
    }

    pub fn timestamp_ms(&self, token_id: &str) -> Result<i64, BookError> {
        let book = self.initialized_book(token_id)?;
        Ok(book.timestamp_ms())
    }

    pub fn hash(&self, token_id: &str) -> Result<String, BookError> {
        let book = self.initialized_book(token_id)?;
        Ok(book.hash())
    }

    fn book(&self, token_id: &str) -> Result<Arc<BookReplica>, BookError> {
        self.manager
            .book(token_id)
            .ok_or_else(|| BookError::TokenNotFound(token_id.to_string()))
    }

    fn initialized_book(&self, token_id: &str) -> Result<Arc<BookReplica>, BookError> {
        let book = self.book(token_id)?;
        if !book.is_initialized() {
            return Err(BookError::NotInitialized);
        }
        Ok(book)
    }
}
