//! Event grouper (C7): collapses a burst of fills from the same
//! (followedUserId, assetId, side) into one decision unit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::debug;

use super::model::{Side, TradeEvent};
use crate::fixed_point::{Micros, PriceMicros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GroupCloseReason {
    OppositeSide,
    QuietPeriod,
    MaxWindow,
    Shutdown,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TradeGroup {
    pub followed_user_id: String,
    pub token_id: String,
    pub side: Side,
    pub aggregate_shares_micros: Micros,
    pub aggregate_notional_micros: Micros,
    pub vwap_price_micros: PriceMicros,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub contributing_event_ids: Vec<String>,
    pub close_reason: GroupCloseReason,
}

struct OpenGroup {
    shares: Micros,
    notional: Micros,
    first_time: DateTime<Utc>,
    last_time: DateTime<Utc>,
    event_ids: Vec<String>,
    side: Side,
}

impl OpenGroup {
    fn from_event(event: &TradeEvent) -> Self {
        Self {
            shares: event.share_micros,
            notional: event.notional_micros,
            first_time: event.event_time,
            last_time: event.event_time,
            event_ids: vec![event.id.clone()],
            side: event.side,
        }
    }

    fn add(&mut self, event: &TradeEvent) {
        self.shares += event.share_micros;
        self.notional += event.notional_micros;
        self.last_time = event.event_time;
        self.event_ids.push(event.id.clone());
    }

    fn close(&self, followed_user_id: String, token_id: String, reason: GroupCloseReason) -> TradeGroup {
        let vwap = if self.shares > 0 {
            (((self.notional as i128) * 1_000_000i128) / self.shares as i128) as PriceMicros
        } else {
            0
        };
        TradeGroup {
            followed_user_id,
            token_id,
            side: self.side,
            aggregate_shares_micros: self.shares,
            aggregate_notional_micros: self.notional,
            vwap_price_micros: vwap,
            first_event_time: self.first_time,
            last_event_time: self.last_time,
            contributing_event_ids: self.event_ids.clone(),
            close_reason: reason,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventGrouperConfig {
    pub quiet_period: Duration,
    pub max_window: Duration,
}

impl Default for EventGrouperConfig {
    fn default() -> Self {
        Self { quiet_period: Duration::from_secs(3), max_window: Duration::from_secs(20) }
    }
}

/// Key: (followedUserId, tokenId, side).
type GroupKey = (String, String, Side);

/// Holds in-flight groups. A background sweep (driven by [`run_sweeper`])
/// closes groups whose quiet period or max window has elapsed; an
/// opposite-side arrival closes its group synchronously in [`add_event`].
pub struct EventGrouper {
    config: EventGrouperConfig,
    open: Mutex<HashMap<GroupKey, (OpenGroup, std::time::Instant, std::time::Instant)>>,
}

impl EventGrouper {
    pub fn new(config: EventGrouperConfig) -> Arc<Self> {
        Arc::new(Self { config, open: Mutex::new(HashMap::new()) })
    }

    /// Adds an event to its group, synchronously closing and returning
    /// the *previous* opposite-side group if one exists for the same
    /// (user, asset) -- rule (a) in spec §4.7.
    pub fn add_event(&self, event: TradeEvent) -> Option<TradeGroup> {
        let key = (event.followed_user_id.clone(), event.token_id.clone(), event.side);
        let opposite_key = (event.followed_user_id.clone(), event.token_id.clone(), event.side.opposite());

        let mut open = self.open.lock();
        let closed_opposite = open.remove(&opposite_key).map(|(g, ..)| {
            g.close(event.followed_user_id.clone(), event.token_id.clone(), GroupCloseReason::OppositeSide)
        });

        let now = std::time::Instant::now();
        match open.get_mut(&key) {
            Some((group, _first_seen, last_touched)) => {
                group.add(&event);
                *last_touched = now;
            }
            None => {
                open.insert(key, (OpenGroup::from_event(&event), now, now));
            }
        }

        closed_opposite
    }

    /// Periodic sweep: closes groups whose quiet period or max window
    /// elapsed. Run inside a loop alongside [`add_event`] callers.
    pub fn sweep(&self) -> Vec<TradeGroup> {
        let mut open = self.open.lock();
        let now = std::time::Instant::now();
        let mut closed = Vec::new();
        let expired: Vec<GroupKey> = open
            .iter()
            .filter(|(_, (_, first_seen, last_touched))| {
                now.duration_since(*last_touched) >= self.config.quiet_period
                    || now.duration_since(*first_seen) >= self.config.max_window
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some((group, first_seen, last_touched)) = open.remove(&key) {
                let reason = if now.duration_since(last_touched) >= self.config.quiet_period {
                    GroupCloseReason::QuietPeriod
                } else {
                    GroupCloseReason::MaxWindow
                };
                let _ = first_seen;
                closed.push(group.close(key.0.clone(), key.1.clone(), reason));
            }
        }
        closed
    }

    /// Flushes every open group with `Shutdown`, for graceful shutdown
    /// step (per §5 cancellation sequence, applied to groups rather than
    /// the small-trade buffer).
    pub fn flush_all(&self) -> Vec<TradeGroup> {
        let mut open = self.open.lock();
        open.drain()
            .map(|(key, (group, ..))| group.close(key.0, key.1, GroupCloseReason::Shutdown))
            .collect()
    }
}

/// Drives periodic sweeps and forwards closed groups onto the
/// copy-attempt queue channel.
pub async fn run_sweeper(
    grouper: Arc<EventGrouper>,
    groups_tx: mpsc::Sender<TradeGroup>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for group in grouper.sweep() {
                    debug!(?group.close_reason, user = %group.followed_user_id, "group closed");
                    let _ = groups_tx.send(group).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    for group in grouper.flush_all() {
                        let _ = groups_tx.send(group).await;
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
    use crate::trades::model::EnrichmentStatus;

    fn event(id: &str, side: Side, shares: Micros, notional: Micros) -> TradeEvent {
        TradeEvent {
            id: id.to_string(),
            tx_hash: id.to_string(),
            log_index: 0,
            followed_user_id: "u1".to_string(),
            profile_address: "0xabc".to_string(),
            proxy_address: None,
            token_id: "tok1".to_string(),
            side,
            price_micros: (notional * 1_000_000 / shares.max(1)) as PriceMicros,
            share_micros: shares,
            notional_micros: notional,
            fee_micros: 0,
            event_time: Utc::now(),
            detect_time: Utc::now(),
            enrichment_status: EnrichmentStatus::Pending,
            market_id: None,
            condition_id: None,
            asset_id: None,
        }
    }

    #[test]
    fn same_side_events_accumulate_into_one_group() {
        let grouper = EventGrouper::new(EventGrouperConfig::default());
        assert!(grouper.add_event(event("e1", Side::Buy, 10_000_000, 5_000_000)).is_none());
        assert!(grouper.add_event(event("e2", Side::Buy, 20_000_000, 10_000_000)).is_none());
        let closed = grouper.flush_all();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].aggregate_shares_micros, 30_000_000);
        assert_eq!(closed[0].aggregate_notional_micros, 15_000_000);
        assert_eq!(closed[0].contributing_event_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn opposite_side_fill_closes_the_prior_group() {
        let grouper = EventGrouper::new(EventGrouperConfig::default());
        assert!(grouper.add_event(event("e1", Side::Buy, 10_000_000, 5_000_000)).is_none());
        let closed = grouper.add_event(event("e2", Side::Sell, 5_000_000, 2_500_000));
        let closed = closed.expect("opposite side should close prior group");
        assert_eq!(closed.side, Side::Buy);
        assert_eq!(closed.close_reason, GroupCloseReason::OppositeSide);
    }
}
