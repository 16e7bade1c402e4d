//! Order book normalizer & cache (C2).
//!
//! Maintains, per token id, a best-bid/best-ask view derived from raw
//! book snapshots and incremental deltas. See [`cache`] for the LRU/TTL
//! cache and freshness-aware accessors, and [`ws_client`] for the upstream
//! feed that drives it.

pub mod cache;
pub mod ws_client;

pub use cache::BookCache;

use std::collections::BTreeMap;
use std::time::Instant;

use crate::fixed_point::{is_valid_price, PriceMicros};

/// A single raw price level as received from the upstream feed, before
/// validation. Size is in share micros.
#[derive(Debug, Clone, Copy)]
pub struct RawLevel {
    pub price_micros: i64,
    pub size_micros: i64,
}

/// Source of the most recent update to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSource {
    Rest,
    Ws,
}

/// Per-token order book state: two keyed maps (price -> size), exactly as
/// specified. Bids and asks are kept as ordinary maps; sorted views are
/// materialised on read, not maintained incrementally, since reads are far
/// less frequent than the WS delta rate for an actively-traded token.
#[derive(Debug, Clone)]
pub struct RawBook {
    bids: BTreeMap<PriceMicros, i64>,
    asks: BTreeMap<PriceMicros, i64>,
    pub updated_at: Instant,
    pub source: BookSource,
}

impl RawBook {
    pub fn empty(source: BookSource) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            updated_at: Instant::now(),
            source,
        }
    }

    /// Replace the entire bid or ask side with a full snapshot of levels.
    pub fn apply_snapshot(&mut self, bids: &[RawLevel], asks: &[RawLevel], source: BookSource) {
        self.bids.clear();
        self.asks.clear();
        for lvl in bids {
            self.set_level(true, lvl.price_micros, lvl.size_micros);
        }
        for lvl in asks {
            self.set_level(false, lvl.price_micros, lvl.size_micros);
        }
        self.source = source;
        self.updated_at = Instant::now();
    }

    /// Apply a single incremental delta: size 0 removes the level, any
    /// other size assigns it (replace, not add).
    pub fn apply_delta(&mut self, is_bid: bool, price_micros: i64, size_micros: i64, source: BookSource) {
        self.set_level(is_bid, price_micros, size_micros);
        self.source = source;
        self.updated_at = Instant::now();
    }

    fn set_level(&mut self, is_bid: bool, price_micros: i64, size_micros: i64) {
        let side = if is_bid { &mut self.bids } else { &mut self.asks };
        // Keys that fall outside the valid price range or carry zero size
        // are never stored -- a later snapshot containing the "impossible"
        // edge levels from an unsorted payload must not poison the book.
        let price = price_micros as PriceMicros;
        if size_micros <= 0 || !is_valid_price(price) {
            side.remove(&price);
            return;
        }
        side.insert(price, size_micros);
    }

    /// Materialise a normalized, queryable snapshot: bids descending,
    /// asks ascending, with best bid/ask/mid/spread precomputed from the
    /// surviving (price > 0, price < 1_000_000, size > 0) levels -- never
    /// the first element of an unsorted input array.
    pub fn normalize(&self) -> NormalizedBook {
        let bids: Vec<(PriceMicros, i64)> = self.bids.iter().rev().map(|(p, s)| (*p, *s)).collect();
        let asks: Vec<(PriceMicros, i64)> = self.asks.iter().map(|(p, s)| (*p, *s)).collect();

        let best_bid = bids.first().map(|(p, _)| *p);
        let best_ask = asks.first().map(|(p, _)| *p);
        let mid = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some(((b as i64 + a as i64) / 2) as PriceMicros),
            _ => None,
        };
        let spread = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };

        NormalizedBook {
            bids,
            asks,
            best_bid,
            best_ask,
            mid,
            spread,
            updated_at: self.updated_at,
            source: self.source,
        }
    }
}

/// Queryable, immutable snapshot of a normalized book. Cheap to clone
/// (small `Vec`s of levels, typically capped by the feed to a shallow
/// depth) and safe to hand out to many concurrent readers.
#[derive(Debug, Clone)]
pub struct NormalizedBook {
    /// Descending by price (best bid first).
    pub bids: Vec<(PriceMicros, i64)>,
    /// Ascending by price (best ask first).
    pub asks: Vec<(PriceMicros, i64)>,
    pub best_bid: Option<PriceMicros>,
    pub best_ask: Option<PriceMicros>,
    pub mid: Option<PriceMicros>,
    pub spread: Option<i64>,
    pub updated_at: Instant,
    pub source: BookSource,
}

impl NormalizedBook {
    pub fn placeholder() -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            best_bid: None,
            best_ask: None,
            mid: None,
            spread: None,
            updated_at: Instant::now(),
            source: BookSource::Rest,
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.updated_at.elapsed()
    }

    pub fn is_fresh(&self, threshold: std::time::Duration) -> bool {
        self.age() <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, size: f64) -> RawLevel {
        RawLevel {
            price_micros: (price * 1_000_000.0).round() as i64,
            size_micros: (size * 1_000_000.0).round() as i64,
        }
    }

    #[test]
    fn unsorted_book_normalizes_to_correct_best_bid_ask() {
        // Scenario 1 from spec.md §8.
        let mut book = RawBook::empty(BookSource::Ws);
        let bids = [lvl(0.01, 1000.0), lvl(0.50, 5000.0), lvl(0.49, 3000.0), lvl(0.48, 2000.0)];
        let asks = [lvl(0.99, 1000.0), lvl(0.52, 5000.0), lvl(0.53, 3000.0), lvl(0.54, 2000.0)];
        book.apply_snapshot(&bids, &asks, BookSource::Ws);

        let nb = book.normalize();
        assert_eq!(nb.best_bid, Some(500_000));
        assert_eq!(nb.best_ask, Some(520_000));
        assert_eq!(nb.spread, Some(20_000));
        assert_eq!(nb.mid, Some(510_000));
    }

    #[test]
    fn delta_with_zero_size_removes_level() {
        let mut book = RawBook::empty(BookSource::Ws);
        book.apply_snapshot(&[lvl(0.50, 100.0)], &[lvl(0.60, 100.0)], BookSource::Ws);
        book.apply_delta(true, 500_000, 0, BookSource::Ws);
        let nb = book.normalize();
        assert!(nb.best_bid.is_none());
        assert_eq!(nb.best_ask, Some(600_000));
    }

    #[test]
    fn levels_at_price_extremes_are_dropped() {
        let mut book = RawBook::empty(BookSource::Ws);
        book.apply_snapshot(
            &[lvl(0.0, 100.0), lvl(0.50, 100.0)],
            &[lvl(1.0, 100.0), lvl(0.60, 100.0)],
            BookSource::Ws,
        );
        let nb = book.normalize();
        assert_eq!(nb.best_bid, Some(500_000));
        assert_eq!(nb.best_ask, Some(600_000));
    }
}
