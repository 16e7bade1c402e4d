//! Small-trade buffer (C9): nets sized copy trades that fall below the
//! immediate-execution notional threshold into per-(user, asset) buckets,
//! flushing a synthetic group through the hot path once enough has
//! accumulated. Mirrors [`crate::trades::grouper::EventGrouper`]'s
//! accumulate/sweep/flush shape -- same bucket-plus-timer structure, one
//! level up the pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::debug;

use crate::fixed_point::{notional_micros, Micros, PriceMicros};
use crate::trades::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFlushReason {
    Threshold,
    Quiet,
    MaxTime,
    OppositeSide,
    Shutdown,
}

/// One sized copy-trade candidate handed to the buffer because its
/// `target_notional` fell below `notionalThresholdMicros`.
#[derive(Debug, Clone)]
pub struct BufferCandidate {
    pub followed_user_id: String,
    pub token_id: String,
    pub asset_id: String,
    pub side: Side,
    pub target_notional_micros: Micros,
    pub reference_price_micros: PriceMicros,
    pub event_ids: Vec<String>,
    pub event_time: DateTime<Utc>,
    /// Captured at enqueue time from the leader's effective config, so the
    /// sweep loop never needs to re-resolve per-leader overrides for an
    /// already-open bucket.
    pub quiet_period: Duration,
    pub max_buffer: Duration,
    pub flush_min_notional_micros: Micros,
    pub min_exec_notional_micros: Micros,
}

/// A bucket that has closed and is ready to either submit as a synthetic
/// group (`net_notional_micros >= min_exec_notional_micros`) or be
/// recorded as `BUFFER_FLUSH_BELOW_MIN_EXEC`.
#[derive(Debug, Clone)]
pub struct FlushedBucket {
    pub followed_user_id: String,
    pub token_id: String,
    pub asset_id: String,
    pub side: Side,
    pub net_shares_micros: Micros,
    pub net_notional_micros: Micros,
    pub vwap_price_micros: PriceMicros,
    pub contributing_event_ids: Vec<String>,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub min_exec_notional_micros: Micros,
    pub flush_reason: BufferFlushReason,
}

impl FlushedBucket {
    pub fn below_min_exec(&self) -> bool {
        self.net_notional_micros.abs() < self.min_exec_notional_micros
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct BucketKey {
    followed_user_id: String,
    asset_id: String,
}

/// Signed running state. `net_shares_micros`/`net_notional_micros` track
/// the netted-down exposure under `netBuySell`; under `sameSideOnly` every
/// contribution shares one sign so net and gross coincide.
struct Bucket {
    token_id: String,
    net_shares_micros: Micros,
    gross_notional_micros: Micros,
    gross_shares_micros: Micros,
    contributing_event_ids: Vec<String>,
    first_time: DateTime<Utc>,
    last_time: DateTime<Utc>,
    quiet_period: Duration,
    max_buffer: Duration,
    flush_min_notional_micros: Micros,
    min_exec_notional_micros: Micros,
}

impl Bucket {
    fn from_candidate(c: &BufferCandidate) -> Self {
        let shares = shares_from(c);
        Self {
            token_id: c.token_id.clone(),
            net_shares_micros: signed(c.side, shares),
            gross_notional_micros: c.target_notional_micros,
            gross_shares_micros: shares,
            contributing_event_ids: c.event_ids.clone(),
            first_time: c.event_time,
            last_time: c.event_time,
            quiet_period: c.quiet_period,
            max_buffer: c.max_buffer,
            flush_min_notional_micros: c.flush_min_notional_micros,
            min_exec_notional_micros: c.min_exec_notional_micros,
        }
    }

    fn add(&mut self, c: &BufferCandidate) {
        let shares = shares_from(c);
        self.net_shares_micros += signed(c.side, shares);
        self.gross_notional_micros += c.target_notional_micros;
        self.gross_shares_micros += shares;
        self.contributing_event_ids.extend(c.event_ids.iter().cloned());
        self.last_time = c.event_time;
    }

    fn vwap_price_micros(&self) -> PriceMicros {
        if self.gross_shares_micros <= 0 {
            return 0;
        }
        (((self.gross_notional_micros as i128) * 1_000_000i128) / self.gross_shares_micros as i128) as PriceMicros
    }

    fn net_notional_micros(&self) -> Micros {
        notional_micros(self.net_shares_micros.abs(), self.vwap_price_micros())
    }

    fn close(self, key: &BucketKey, reason: BufferFlushReason) -> FlushedBucket {
        let vwap = self.vwap_price_micros();
        let net_notional = notional_micros(self.net_shares_micros.abs(), vwap);
        FlushedBucket {
            followed_user_id: key.followed_user_id.clone(),
            token_id: self.token_id,
            asset_id: key.asset_id.clone(),
            side: if self.net_shares_micros >= 0 { Side::Buy } else { Side::Sell },
            net_shares_micros: self.net_shares_micros.abs(),
            net_notional_micros: net_notional,
            vwap_price_micros: vwap,
            contributing_event_ids: self.contributing_event_ids,
            first_event_time: self.first_time,
            last_event_time: self.last_time,
            min_exec_notional_micros: self.min_exec_notional_micros,
            flush_reason: reason,
        }
    }
}

fn shares_from(c: &BufferCandidate) -> Micros {
    crate::fixed_point::shares_for_notional(c.target_notional_micros, c.reference_price_micros)
}

fn signed(side: Side, shares: Micros) -> Micros {
    match side {
        Side::Buy => shares,
        Side::Sell => -shares,
    }
}

pub struct SmallTradeBuffer {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl SmallTradeBuffer {
    pub fn new() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }

    /// Accumulate one candidate. Returns a closed bucket immediately when
    /// the new total crosses `flushMinNotionalMicros` or, under
    /// `sameSideOnly`, when the candidate's side disagrees with the
    /// bucket already open.
    pub fn add(&self, candidate: BufferCandidate, same_side_only: bool) -> Option<FlushedBucket> {
        let key = BucketKey {
            followed_user_id: candidate.followed_user_id.clone(),
            asset_id: candidate.asset_id.clone(),
        };
        let mut buckets = self.buckets.lock();

        if same_side_only {
            if let Some(existing) = buckets.get(&key) {
                let existing_side = if existing.net_shares_micros >= 0 { Side::Buy } else { Side::Sell };
                if existing_side != candidate.side {
                    let closed = buckets.remove(&key).unwrap();
                    let flushed = closed.close(&key, BufferFlushReason::OppositeSide);
                    buckets.insert(key.clone(), Bucket::from_candidate(&candidate));
                    debug!(followed_user_id = %key.followed_user_id, asset_id = %key.asset_id, "buffer flushed on opposite-side arrival");
                    return Some(flushed);
                }
            }
        }

        match buckets.get_mut(&key) {
            Some(existing) => existing.add(&candidate),
            None => {
                buckets.insert(key.clone(), Bucket::from_candidate(&candidate));
            }
        }
        let bucket = buckets.get(&key).expect("just inserted or updated above");

        if bucket.net_notional_micros().abs() >= bucket.flush_min_notional_micros {
            let closed = buckets.remove(&key).unwrap();
            return Some(closed.close(&key, BufferFlushReason::Threshold));
        }
        None
    }

    /// Close any bucket past its quiet period or max age. Called on a
    /// timer tick, same shape as [`crate::trades::grouper::EventGrouper::sweep`].
    pub fn sweep(&self) -> Vec<FlushedBucket> {
        let now = Utc::now();
        let mut buckets = self.buckets.lock();
        let mut flushed = Vec::new();
        let expired: Vec<BucketKey> = buckets
            .iter()
            .filter_map(|(key, bucket)| {
                let age = now.signed_duration_since(bucket.first_time);
                let idle = now.signed_duration_since(bucket.last_time);
                if idle.to_std().map(|d| d >= bucket.quiet_period).unwrap_or(false) {
                    Some((key.clone(), BufferFlushReason::Quiet))
                } else if age.to_std().map(|d| d >= bucket.max_buffer).unwrap_or(false) {
                    Some((key.clone(), BufferFlushReason::MaxTime))
                } else {
                    None
                }
            })
            .map(|(k, _)| k)
            .collect();
        for key in expired {
            if let Some(bucket) = buckets.remove(&key) {
                let reason = {
                    let idle = now.signed_duration_since(bucket.last_time);
                    if idle.to_std().map(|d| d >= bucket.quiet_period).unwrap_or(false) {
                        BufferFlushReason::Quiet
                    } else {
                        BufferFlushReason::MaxTime
                    }
                };
                flushed.push(bucket.close(&key, reason));
            }
        }
        flushed
    }

    /// Close every open bucket unconditionally, for graceful shutdown.
    pub fn flush_all(&self) -> Vec<FlushedBucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .drain()
            .map(|(key, bucket)| bucket.close(&key, BufferFlushReason::Shutdown))
            .collect()
    }
}

impl Default for SmallTradeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic sweep loop: ticks every 500ms, forwards flushed buckets down
/// `tx`, and drains on shutdown signal -- identical cadence and shutdown
/// handling to [`crate::trades::grouper::run_sweeper`].
pub async fn run_sweeper(
    buffer: std::sync::Arc<SmallTradeBuffer>,
    tx: mpsc::Sender<FlushedBucket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for flushed in buffer.sweep() {
                    if tx.send(flushed).await.is_err() {
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    for flushed in buffer.flush_all() {
                        let _ = tx.send(flushed).await;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(user: &str, asset: &str, side: Side, notional: Micros, price: PriceMicros, id: &str) -> BufferCandidate {
        BufferCandidate {
            followed_user_id: user.to_string(),
            token_id: "tok1".to_string(),
            asset_id: asset.to_string(),
            side,
            target_notional_micros: notional,
            reference_price_micros: price,
            event_ids: vec![id.to_string()],
            event_time: Utc::now(),
            quiet_period: Duration::from_secs(3),
            max_buffer: Duration::from_secs(60),
            flush_min_notional_micros: 5_000_000,
            min_exec_notional_micros: 1_000_000,
        }
    }

    #[test]
    fn accumulates_until_flush_threshold_crossed() {
        let buffer = SmallTradeBuffer::new();
        let first = buffer.add(candidate("u1", "a1", Side::Buy, 2_000_000, 500_000, "e1"), true);
        assert!(first.is_none());
        let second = buffer.add(candidate("u1", "a1", Side::Buy, 4_000_000, 500_000, "e2"), true);
        let flushed = second.expect("threshold crossed");
        assert_eq!(flushed.flush_reason, BufferFlushReason::Threshold);
        assert_eq!(flushed.net_notional_micros, 6_000_000);
        assert_eq!(flushed.contributing_event_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn opposite_side_flushes_under_same_side_only() {
        let buffer = SmallTradeBuffer::new();
        buffer.add(candidate("u1", "a1", Side::Buy, 1_000_000, 500_000, "e1"), true);
        let flushed = buffer
            .add(candidate("u1", "a1", Side::Sell, 1_000_000, 500_000, "e2"), true)
            .expect("opposite side flushes prior bucket");
        assert_eq!(flushed.flush_reason, BufferFlushReason::OppositeSide);
        assert_eq!(flushed.side, Side::Buy);
    }

    #[test]
    fn below_min_exec_is_flagged() {
        let flushed = FlushedBucket {
            followed_user_id: "u1".to_string(),
            token_id: "tok1".to_string(),
            asset_id: "a1".to_string(),
            side: Side::Buy,
            net_shares_micros: 1_000_000,
            net_notional_micros: 500_000,
            vwap_price_micros: 500_000,
            contributing_event_ids: vec!["e1".to_string()],
            first_event_time: Utc::now(),
            last_event_time: Utc::now(),
            min_exec_notional_micros: 1_000_000,
            flush_reason: BufferFlushReason::Quiet,
        };
        assert!(flushed.below_min_exec());
    }
}
