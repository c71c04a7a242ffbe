//! Local replica of one token's remote limit order book.
//!
//! Level maps are keyed by the parsed decimal price; `rust_decimal` equality
//! and hashing are scale-insensitive, so "0.5" and "0.50" share a bucket.
//! Sorted views are rebuilt lazily behind dirty flags and only ever handed
//! out as copies.

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use core_types::{Bbo, BestQuote, FillReport, PriceLevel, ScanReport, Side};
use poly_wire::{BookMessage, PriceChange};

#[derive(Debug, Default)]
struct BookState {
    market: String,
    hash: String,
    ts_ms: i64,
    initialized: bool,
    bids: HashMap<Decimal, Decimal>,
    asks: HashMap<Decimal, Decimal>,
    sorted_bids: Vec<PriceLevel>,
    sorted_asks: Vec<PriceLevel>,
    bids_dirty: bool,
    asks_dirty: bool,
}

impl BookState {
    fn rebuild_sorted_bids(&mut self) {
        if !self.bids_dirty {
            return;
        }
        self.sorted_bids = self
            .bids
            .iter()
            .map(|(price, size)| PriceLevel {
                price: *price,
                size: *size,
            })
            .collect();
        // Highest bid first.
        self.sorted_bids.sort_unstable_by(|a, b| b.price.cmp(&a.price));
        self.bids_dirty = false;
    }

    fn rebuild_sorted_asks(&mut self) {
        if !self.asks_dirty {
            return;
        }
        self.sorted_asks = self
            .asks
            .iter()
            .map(|(price, size)| PriceLevel {
                price: *price,
                size: *size,
            })
            .collect();
        // Lowest ask first.
        self.sorted_asks.sort_unstable_by(|a, b| a.price.cmp(&b.price));
        self.asks_dirty = false;
    }
}

/// Thread-safe book replica. All queries return owned copies; no lock is held
/// across anything that can suspend.
#[derive(Debug)]
pub struct BookReplica {
    token_id: String,
    state: Mutex<BookState>,
}

impl BookReplica {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            state: Mutex::new(BookState {
                bids_dirty: true,
                asks_dirty: true,
                ..BookState::default()
            }),
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn market(&self) -> String {
        self.state.lock().market.clone()
    }

    pub fn hash(&self) -> String {
        self.state.lock().hash.clone()
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.state.lock().ts_ms
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Back to the post-construction state. The token id survives so external
    /// handles stay valid across disconnects.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        *st = BookState {
            bids_dirty: true,
            asks_dirty: true,
            ..BookState::default()
        };
    }

    /// Replace the whole book from a snapshot. Returns false when the
    /// snapshot is older than the current state.
    pub fn apply_snapshot(&self, msg: &BookMessage, ts_ms: i64) -> bool {
        let mut st = self.state.lock();
        if ts_ms < st.ts_ms {
            return false;
        }

        st.bids.clear();
        st.asks.clear();
        for level in &msg.bids {
            if let Some((price, size)) = parse_level(level) {
                st.bids.insert(price, size);
            }
        }
        for level in &msg.asks {
            if let Some((price, size)) = parse_level(level) {
                st.asks.insert(price, size);
            }
        }

        st.market = msg.market.clone();
        st.hash = msg.hash.clone();
        st.ts_ms = ts_ms;
        st.initialized = true;
        st.bids_dirty = true;
        st.asks_dirty = true;
        true
    }

    /// Apply one level update. Returns false before the first snapshot, for
    /// stale timestamps, and for unparsable entries.
    pub fn apply_price_change(&self, change: &PriceChange, ts_ms: i64) -> bool {
        let mut st = self.state.lock();
        if !st.initialized || ts_ms < st.ts_ms {
            return false;
        }

        let Some(side) = Side::parse(&change.side) else {
            return false;
        };
        let Ok(price) = change.price.parse::<Decimal>() else {
            return false;
        };
        let Ok(size) = change.size.parse::<Decimal>() else {
            return false;
        };
        if size.is_sign_negative() {
            return false;
        }

        match side {
            Side::Buy => {
                if size.is_zero() {
                    st.bids.remove(&price);
                } else {
                    st.bids.insert(price, size);
                }
                st.bids_dirty = true;
            }
            Side::Sell => {
                if size.is_zero() {
                    st.asks.remove(&price);
                } else {
                    st.asks.insert(price, size);
                }
                st.asks_dirty = true;
            }
        }

        st.hash = change.hash.clone();
        st.ts_ms = ts_ms;
        true
    }

    pub fn best_bid(&self) -> Option<BestQuote> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        let ts_ms = st.ts_ms;
        st.sorted_bids.first().map(|level| BestQuote {
            price: level.price,
            size: level.size,
            ts_ms,
        })
    }

    pub fn best_ask(&self) -> Option<BestQuote> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_asks();
        let ts_ms = st.ts_ms;
        st.sorted_asks.first().map(|level| BestQuote {
            price: level.price,
            size: level.size,
            ts_ms,
        })
    }

    /// Both tops in one lock acquisition. None until initialized; sides may
    /// individually be absent.
    pub fn bbo(&self) -> Option<Bbo> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        st.rebuild_sorted_asks();
        let ts_ms = st.ts_ms;
        let quote = |level: &PriceLevel| BestQuote {
            price: level.price,
            size: level.size,
            ts_ms,
        };
        Some(Bbo {
            bid: st.sorted_bids.first().map(quote),
            ask: st.sorted_asks.first().map(quote),
        })
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        st.rebuild_sorted_asks();
        let bid = st.sorted_bids.first()?.price;
        let ask = st.sorted_asks.first()?.price;
        Some((bid + ask) / Decimal::from(2))
    }

    pub fn spread(&self) -> Option<Decimal> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        st.rebuild_sorted_asks();
        let bid = st.sorted_bids.first()?.price;
        let ask = st.sorted_asks.first()?.price;
        Some(ask - bid)
    }

    /// Up to `depth` levels from each side in canonical order.
    pub fn depth(&self, depth: usize) -> Option<(Vec<PriceLevel>, Vec<PriceLevel>)> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        st.rebuild_sorted_asks();
        let bids = st.sorted_bids.iter().take(depth).copied().collect();
        let asks = st.sorted_asks.iter().take(depth).copied().collect();
        Some((bids, asks))
    }

    /// Sum over the unordered map; does not touch the sorted caches.
    pub fn total_bid_size(&self) -> Decimal {
        let st = self.state.lock();
        if !st.initialized {
            return Decimal::ZERO;
        }
        st.bids.values().copied().sum()
    }

    pub fn total_ask_size(&self) -> Decimal {
        let st = self.state.lock();
        if !st.initialized {
            return Decimal::ZERO;
        }
        st.asks.values().copied().sum()
    }

    pub fn all_bids(&self) -> Option<Vec<PriceLevel>> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();
        Some(st.sorted_bids.clone())
    }

    pub fn all_asks(&self) -> Option<Vec<PriceLevel>> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_asks();
        Some(st.sorted_asks.clone())
    }

    /// Every ask priced at or below `max_price`, with the total size and the
    /// size-weighted average price of the slice.
    pub fn scan_asks_below(&self, max_price: Decimal) -> Option<ScanReport> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_asks();

        let mut orders = Vec::new();
        let mut total_size = Decimal::ZERO;
        let mut total_value = Decimal::ZERO;
        for level in &st.sorted_asks {
            if level.price > max_price {
                // Ascending order: nothing further can match.
                break;
            }
            orders.push(*level);
            total_size += level.size;
            total_value += level.price * level.size;
        }

        let avg_price = if total_size.is_zero() {
            Decimal::ZERO
        } else {
            total_value / total_size
        };
        Some(ScanReport {
            orders,
            total_size,
            avg_price,
        })
    }

    /// Every bid priced at or above `min_price`; mirror of `scan_asks_below`.
    pub fn scan_bids_above(&self, min_price: Decimal) -> Option<ScanReport> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_bids();

        let mut orders = Vec::new();
        let mut total_size = Decimal::ZERO;
        let mut total_value = Decimal::ZERO;
        for level in &st.sorted_bids {
            if level.price < min_price {
                break;
            }
            orders.push(*level);
            total_size += level.size;
            total_value += level.price * level.size;
        }

        let avg_price = if total_size.is_zero() {
            Decimal::ZERO
        } else {
            total_value / total_size
        };
        Some(ScanReport {
            orders,
            total_size,
            avg_price,
        })
    }

    /// Walk the asks from the best price and accumulate until `required_size`
    /// is filled. The last touched level contributes only the needed
    /// remainder. A book too shallow to fill reports the partial result with
    /// `completely_filled == false`.
    pub fn simulate_buy_asks(&self, required_size: Decimal) -> Option<FillReport> {
        let mut st = self.state.lock();
        if !st.initialized {
            return None;
        }
        st.rebuild_sorted_asks();

        let mut orders = Vec::new();
        let mut filled_size = Decimal::ZERO;
        let mut total_value = Decimal::ZERO;
        for level in &st.sorted_asks {
            if filled_size >= required_size {
                break;
            }
            let want = required_size - filled_size;
            let take = if level.size < want { level.size } else { want };
            orders.push(PriceLevel {
                price: level.price,
                size: take,
            });
            filled_size += take;
            total_value += level.price * take;
        }

        let avg_price = if filled_size.is_zero() {
            Decimal::ZERO
        } else {
            total_value / filled_size
        };
        Some(FillReport {
            orders,
            filled_size,
            avg_price,
            completely_filled: filled_size >= required_size,
        })
    }
}

fn parse_level(level: &poly_wire::RawLevel) -> Option<(Decimal, Decimal)> {
    let price = level.price.parse::<Decimal>().ok()?;
    let size = level.size.parse::<Decimal>().ok()?;
    if size <= Decimal::ZERO {
        return None;
    }
    Some((price, size))
}
