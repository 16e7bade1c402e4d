//! LRU/TTL cache of normalized books, with freshness-aware waiters.
//!
//! Grounded on the ArcSwap-per-key, lock-free-read pattern used by the
//! teacher's Polymarket book store (`scrapers/polymarket_book_store.rs`),
//! generalized to integer-micros books and the subscribe/unsubscribe
//! event bus §9 calls for (cache and WS client as two actors exchanging
//! typed events rather than holding mutual references).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

use super::{BookSource, NormalizedBook, RawBook};

/// Events the cache emits for the WS client (C3) and observability to
/// consume. A finite vocabulary, per DESIGN NOTES §9.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Subscribe { token_id: String },
    Unsubscribe { token_id: String },
    Update { token_id: String },
    Evict { token_id: String },
}

struct Entry {
    book: Arc<ArcSwap<RawBook>>,
    last_access: Mutex<Instant>,
    waiters: Notify,
}

/// Configuration for cache freshness/eviction policy.
#[derive(Debug, Clone, Copy)]
pub struct BookCacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub freshness_threshold: Duration,
}

impl Default for BookCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 2_000,
            ttl: Duration::from_secs(600),
            freshness_threshold: Duration::from_millis(100),
        }
    }
}

/// The shared, multi-reader book cache. Cheap to clone (`Arc` internally).
#[derive(Clone)]
pub struct BookCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: BookCacheConfig,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl BookCache {
    pub fn new(config: BookCacheConfig) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribe to cache events (for the WS client and observability).
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.inner.events.send(event);
    }

    fn get_or_create_entry(&self, token_id: &str) -> Arc<Entry> {
        let mut entries = self.inner.entries.lock();
        if let Some(e) = entries.get(token_id) {
            return e.clone();
        }
        let entry = Arc::new(Entry {
            book: Arc::new(ArcSwap::from_pointee(RawBook::empty(BookSource::Rest))),
            last_access: Mutex::new(Instant::now()),
            waiters: Notify::new(),
        });
        entries.insert(token_id.to_string(), entry.clone());
        entry
    }

    /// Apply a full snapshot for `token_id`. Used by the WS client on
    /// `book` messages and by any REST warm-up fetch.
    pub fn apply_snapshot(
        &self,
        token_id: &str,
        bids: &[super::RawLevel],
        asks: &[super::RawLevel],
        source: BookSource,
    ) {
        let entry = self.get_or_create_entry(token_id);
        let mut raw = (**entry.book.load()).clone();
        raw.apply_snapshot(bids, asks, source);
        entry.book.store(Arc::new(raw));
        entry.waiters.notify_waiters();
        self.emit(CacheEvent::Update {
            token_id: token_id.to_string(),
        });
        self.evict_if_needed();
    }

    /// Apply a single incremental delta for `token_id`.
    pub fn apply_delta(
        &self,
        token_id: &str,
        is_bid: bool,
        price_micros: i64,
        size_micros: i64,
        source: BookSource,
    ) {
        let entry = self.get_or_create_entry(token_id);
        let mut raw = (**entry.book.load()).clone();
        raw.apply_delta(is_bid, price_micros, size_micros, source);
        entry.book.store(Arc::new(raw));
        entry.waiters.notify_waiters();
        self.emit(CacheEvent::Update {
            token_id: token_id.to_string(),
        });
    }

    /// Non-blocking read: returns whatever is cached (possibly stale or a
    /// placeholder), ensuring a subscription exists but never suspending.
    pub fn get_no_wait(&self, token_id: &str) -> NormalizedBook {
        let had_entry = {
            let entries = self.inner.entries.lock();
            entries.contains_key(token_id)
        };
        if !had_entry {
            self.emit(CacheEvent::Subscribe {
                token_id: token_id.to_string(),
            });
        }
        let entry = self.get_or_create_entry(token_id);
        *entry.last_access.lock() = Instant::now();
        entry.book.load().normalize()
    }

    /// Freshness-aware read per §4.2:
    /// 1. ensure a subscription exists (emits `Subscribe`),
    /// 2. return immediately if already fresh,
    /// 3. otherwise wait up to `wait_ms` for the next update,
    /// 4. return the (possibly still stale) book on timeout.
    pub async fn get_fresh_or_wait(&self, token_id: &str, wait_ms: u64) -> NormalizedBook {
        let is_new = {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(token_id) {
                false
            } else {
                entries.insert(
                    token_id.to_string(),
                    Arc::new(Entry {
                        book: Arc::new(ArcSwap::from_pointee(RawBook::empty(BookSource::Rest))),
                        last_access: Mutex::new(Instant::now()),
                        waiters: Notify::new(),
                    }),
                );
                true
            }
        };
        if is_new {
            self.emit(CacheEvent::Subscribe {
                token_id: token_id.to_string(),
            });
        }

        let entry = self.get_or_create_entry(token_id);
        *entry.last_access.lock() = Instant::now();

        let snapshot = entry.book.load().normalize();
        if snapshot.is_fresh(self.inner.config.freshness_threshold) {
            return snapshot;
        }

        let wait = Duration::from_millis(wait_ms);
        if wait.is_zero() {
            return snapshot;
        }
        let notified = entry.waiters.notified();
        tokio::select! {
            _ = notified => {
                entry.book.load().normalize()
            }
            _ = tokio::time::sleep(wait) => {
                trace!(token_id, "getFreshOrWait timed out, returning stale book");
                entry.book.load().normalize()
            }
        }
    }

    /// Explicitly release interest in a token. Only meaningful as a hint
    /// to C3; the entry itself is reclaimed by TTL/LRU eviction.
    pub fn unsubscribe(&self, token_id: &str) {
        self.emit(CacheEvent::Unsubscribe {
            token_id: token_id.to_string(),
        });
    }

    /// Wake every waiter across every token — called on cache shutdown so
    /// in-flight `getFreshOrWait` callers resolve with a stale book
    /// instead of hanging past process shutdown.
    pub fn wake_all_for_shutdown(&self) {
        let entries = self.inner.entries.lock();
        for entry in entries.values() {
            entry.waiters.notify_waiters();
        }
    }

    fn evict_if_needed(&self) {
        let mut entries = self.inner.entries.lock();
        let now = Instant::now();
        let ttl = self.inner.config.ttl;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(*e.last_access.lock()) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.remove(key);
            debug!(token_id = %key, "evicted stale book cache entry (ttl)");
        }
        if entries.len() > self.inner.config.max_entries {
            let mut by_access: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), *e.last_access.lock()))
                .collect();
            by_access.sort_by_key(|(_, t)| *t);
            let excess = entries.len() - self.inner.config.max_entries;
            for (key, _) in by_access.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
        drop(entries);
        for key in stale {
            self.emit(CacheEvent::Evict { token_id: key });
        }
    }

    pub fn stats(&self) -> BookCacheStats {
        let entries = self.inner.entries.lock();
        BookCacheStats {
            entry_count: entries.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BookCacheStats {
    pub entry_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::RawLevel;

    fn lvl(price_micros: i64, size_micros: i64) -> RawLevel {
        RawLevel { price_micros, size_micros }
    }

    #[tokio::test]
    async fn get_no_wait_never_blocks_and_emits_subscribe() {
        let cache = BookCache::new(BookCacheConfig::default());
        let mut rx = cache.events();
        let nb = cache.get_no_wait("tok1");
        assert!(nb.best_bid.is_none());
        let evt = rx.try_recv().unwrap();
        assert!(matches!(evt, CacheEvent::Subscribe { .. }));
    }

    #[tokio::test]
    async fn get_fresh_or_wait_returns_immediately_when_fresh() {
        let cache = BookCache::new(BookCacheConfig::default());
        cache.apply_snapshot("tok1", &[lvl(500_000, 100)], &[lvl(510_000, 100)], BookSource::Ws);
        let nb = cache.get_fresh_or_wait("tok1", 50).await;
        assert_eq!(nb.best_bid, Some(500_000));
    }

    #[tokio::test]
    async fn get_fresh_or_wait_times_out_with_stale_book() {
        let config = BookCacheConfig {
            freshness_threshold: Duration::from_millis(0),
            ..BookCacheConfig::default()
        };
        let cache = BookCache::new(config);
        cache.apply_snapshot("tok1", &[lvl(500_000, 100)], &[lvl(510_000, 100)], BookSource::Ws);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let nb = cache.get_fresh_or_wait("tok1", 10).await;
        assert_eq!(nb.best_bid, Some(500_000));
    }
}
