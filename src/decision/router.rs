//! Group router: the glue between the event grouper (C7) / small-trade
//! buffer (C9) and the copy-attempt queue (C13) a [`super::engine::CopyDecisionEngine`]
//! consumer drains. Not a numbered spec component itself -- it implements
//! the branch point spec §4.9 describes ("if the computed target_notional
//! is below `notionalThresholdMicros` ...") that has to sit between where
//! a group closes and where the hot path's queue consumer picks it up.
//!
//! Grounded on the same sizing precheck the engine runs internally
//! ([`super::sizing::compute_sizing`]), so a candidate's buffering fate is
//! decided with the exact same arithmetic the hot path would have used.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::attempt::AttemptSource;
use super::engine::{CopyDecisionEngine, MarketMetadata};
use super::job::CopyAttemptJob;
use super::reason::ReasonCode;
use super::sizing::compute_sizing;
use crate::book::BookCache;
use crate::buffer::{BufferCandidate, FlushedBucket, SmallTradeBuffer};
use crate::config::ConfigStore;
use crate::fixed_point::Micros;
use crate::ledger::{LedgerStore, PortfolioScope};
use crate::queue::DurableQueue;
use crate::trades::{GroupCloseReason, TradeGroup};

pub struct GroupRouter<M: MarketMetadata> {
    config: ConfigStore,
    ledger: LedgerStore,
    book_cache: BookCache,
    engine: Arc<CopyDecisionEngine<M>>,
    buffer: Arc<SmallTradeBuffer>,
    copy_attempt_queue: Arc<DurableQueue<CopyAttemptJob>>,
    initial_bankroll_micros: Micros,
}

impl<M: MarketMetadata> GroupRouter<M> {
    pub fn new(
        config: ConfigStore,
        ledger: LedgerStore,
        book_cache: BookCache,
        engine: Arc<CopyDecisionEngine<M>>,
        buffer: Arc<SmallTradeBuffer>,
        copy_attempt_queue: Arc<DurableQueue<CopyAttemptJob>>,
        initial_bankroll_micros: Micros,
    ) -> Self {
        Self { config, ledger, book_cache, engine, buffer, copy_attempt_queue, initial_bankroll_micros }
    }

    /// Routes one closed group from C7: below the notional threshold it
    /// goes into the small-trade buffer and is recorded as an immediate
    /// `BUFFERED` skip; otherwise it's handed straight to the copy-attempt
    /// queue for the hot path to evaluate.
    pub async fn route_group(&self, group: TradeGroup, asset_id: String, market_id: Option<String>) -> Result<()> {
        let config = self.config.effective_for(&group.followed_user_id).await?;
        let price_lookup = |asset: &str| self.book_cache.get_no_wait(asset).mid;
        let global = self
            .ledger
            .summary(PortfolioScope::ExecGlobal, None, self.initial_bankroll_micros, &price_lookup)
            .await?;
        let leader = self
            .ledger
            .summary(PortfolioScope::ExecUser, Some(&group.followed_user_id), 0, &price_lookup)
            .await?;
        let sizing = compute_sizing(group.aggregate_notional_micros, &config, leader.exposure_micros, global.equity_micros);

        if sizing.target_notional_micros < config.notional_threshold_micros {
            self.engine
                .record_forced_skip(
                    &group,
                    &asset_id,
                    market_id.as_deref(),
                    ReasonCode::Buffered,
                    sizing.target_notional_micros,
                    AttemptSource::Immediate,
                )
                .await?;
            let candidate = BufferCandidate {
                followed_user_id: group.followed_user_id.clone(),
                token_id: group.token_id.clone(),
                asset_id,
                side: group.side,
                target_notional_micros: sizing.target_notional_micros,
                reference_price_micros: group.vwap_price_micros,
                event_ids: group.contributing_event_ids.clone(),
                event_time: group.last_event_time,
                quiet_period: Duration::from_millis(config.buffer_quiet_ms),
                max_buffer: Duration::from_millis(config.max_buffer_ms),
                flush_min_notional_micros: config.flush_min_notional_micros,
                min_exec_notional_micros: config.min_exec_notional_micros,
            };
            if let Some(flushed) = self.buffer.add(candidate, config.same_side_only) {
                self.route_flushed(flushed).await?;
            }
            return Ok(());
        }

        self.copy_attempt_queue
            .enqueue(&CopyAttemptJob { group, asset_id, market_id, source: AttemptSource::Immediate })
            .await?;
        Ok(())
    }

    /// Routes a bucket the buffer's sweeper or `flush_all` just closed.
    pub async fn route_flushed(&self, flushed: FlushedBucket) -> Result<()> {
        let group = synthetic_group(&flushed);
        if flushed.below_min_exec() {
            self.engine
                .record_forced_skip(
                    &group,
                    &flushed.asset_id,
                    None,
                    ReasonCode::BufferFlushBelowMinExec,
                    flushed.net_notional_micros,
                    AttemptSource::Buffer,
                )
                .await?;
            return Ok(());
        }
        self.copy_attempt_queue
            .enqueue(&CopyAttemptJob { group, asset_id: flushed.asset_id.clone(), market_id: None, source: AttemptSource::Buffer })
            .await?;
        Ok(())
    }
}

/// A flushed bucket carries everything a [`TradeGroup`] does, just netted
/// across possibly-opposite-signed candidates rather than same-side
/// fills -- submit it through the identical hot-path shape the event
/// grouper's output takes.
fn synthetic_group(flushed: &FlushedBucket) -> TradeGroup {
    TradeGroup {
        followed_user_id: flushed.followed_user_id.clone(),
        token_id: flushed.token_id.clone(),
        side: flushed.side,
        aggregate_shares_micros: flushed.net_shares_micros,
        aggregate_notional_micros: flushed.net_notional_micros,
        vwap_price_micros: flushed.vwap_price_micros,
        first_event_time: flushed.first_event_time,
        last_event_time: flushed.last_event_time,
        contributing_event_ids: flushed.contributing_event_ids.clone(),
        close_reason: GroupCloseReason::Shutdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::engine::NullMarketMetadata;
    use crate::decision::attempt::CopyAttemptStore;
    use crate::followed_user::FollowedUserStore;
    use crate::book::{BookCache, BookCacheConfig};

    async fn router_with_temp_stores(dir: &std::path::Path) -> GroupRouter<NullMarketMetadata> {
        let db = dir.join("router.db");
        let db_path = db.to_str().unwrap();
        let config = ConfigStore::new(db_path).unwrap();
        let ledger = LedgerStore::new(db_path).unwrap();
        let attempts = CopyAttemptStore::new(db_path).unwrap();
        let users = FollowedUserStore::new(db_path).unwrap();
        let book_cache = BookCache::new(BookCacheConfig::default());
        let engine = Arc::new(CopyDecisionEngine::new(
            ledger.clone(),
            config.clone(),
            book_cache.clone(),
            attempts,
            users,
            NullMarketMetadata,
            1_000_000_000,
        ));
        let buffer = Arc::new(SmallTradeBuffer::new());
        let queue: Arc<DurableQueue<CopyAttemptJob>> =
            Arc::new(DurableQueue::new(db_path, "copy_attempt_queue").unwrap());
        GroupRouter::new(config, ledger, book_cache, engine, buffer, queue, 1_000_000_000)
    }

    fn group(notional: Micros) -> TradeGroup {
        TradeGroup {
            followed_user_id: "u1".to_string(),
            token_id: "tok1".to_string(),
            side: crate::trades::Side::Buy,
            aggregate_shares_micros: notional,
            aggregate_notional_micros: notional,
            vwap_price_micros: 500_000,
            first_event_time: chrono::Utc::now(),
            last_event_time: chrono::Utc::now(),
            contributing_event_ids: vec!["e1".to_string()],
            close_reason: GroupCloseReason::QuietPeriod,
        }
    }

    #[tokio::test]
    async fn below_threshold_group_goes_to_buffer_not_queue() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_temp_stores(dir.path()).await;
        // default notionalThresholdMicros is 5_000_000; a tiny trade's
        // fixed-rate sizing target will land far below that.
        router.route_group(group(100_000), "tok1".to_string(), None).await.unwrap();
        assert_eq!(router.copy_attempt_queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn above_threshold_group_is_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_with_temp_stores(dir.path()).await;
        // a large trade's fixed-rate (1%) target clears the 5_000_000 floor.
        router.route_group(group(2_000_000_000), "tok1".to_string(), None).await.unwrap();
        assert_eq!(router.copy_attempt_queue.depth().await.unwrap(), 1);
    }
}
