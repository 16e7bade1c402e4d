//! Canonical trade writer (C5): upserts [`TradeEvent`] rows keyed on
//! `(txHash, logIndex)` and notifies the event grouper (C7).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::model::{EnrichmentStatus, Side, TradeEvent};
use super::store::TradeEventStore;
use crate::chain::{DecodedFill, TradeSide};
use crate::followed_user::FollowedUserStore;

/// Looks up a block's timestamp. External collaborator in production
/// (an RPC `eth_getBlockByNumber` call or a block-indexer API); the
/// trait boundary keeps C5 testable without a live chain connection.
#[async_trait]
pub trait BlockTimestampLookup: Send + Sync {
    async fn timestamp_for_block(&self, block_number: u64) -> Option<DateTime<Utc>>;
}

const BLOCK_TS_CACHE_CAP: usize = 1_000;

struct BlockTsCache {
    map: HashMap<u64, DateTime<Utc>>,
    order: std::collections::VecDeque<u64>,
}

impl BlockTsCache {
    fn new() -> Self {
        Self { map: HashMap::new(), order: std::collections::VecDeque::new() }
    }

    fn get(&self, block: u64) -> Option<DateTime<Utc>> {
        self.map.get(&block).copied()
    }

    fn insert(&mut self, block: u64, ts: DateTime<Utc>) {
        if !self.map.contains_key(&block) {
            self.order.push_back(block);
            if self.order.len() > BLOCK_TS_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
        self.map.insert(block, ts);
    }
}

pub struct TradeWriter<L: BlockTimestampLookup> {
    store: TradeEventStore,
    users: FollowedUserStore,
    block_ts: L,
    cache: Mutex<BlockTsCache>,
}

impl<L: BlockTimestampLookup> TradeWriter<L> {
    pub fn new(store: TradeEventStore, users: FollowedUserStore, block_ts: L) -> Self {
        Self { store, users, block_ts, cache: Mutex::new(BlockTsCache::new()) }
    }

    /// Writes one decoded fill, looks up a followed-user match, and
    /// notifies `grouper_tx` on a successful first write. A second
    /// delivery of the same log is a no-op: `insert_if_absent` returns
    /// `false` and no notification is sent. Returns the inserted event
    /// (`None` on a duplicate or an untracked wallet) so the caller can
    /// also enqueue it for token-metadata enrichment.
    pub async fn handle_fill(
        &self,
        fill: DecodedFill,
        grouper_tx: &mpsc::Sender<TradeEvent>,
    ) -> Result<Option<TradeEvent>> {
        let wallet_address = match fill.wallet_side {
            crate::chain::WalletSide::Maker => &fill.maker,
            crate::chain::WalletSide::Taker => &fill.taker,
        };
        let Some(user) = self.users.find_by_address(wallet_address).await? else {
            debug!(wallet = %wallet_address, "fill from untracked wallet, dropping");
            return Ok(None);
        };
        if !user.enabled {
            debug!(user_id = %user.id, "fill from disabled user, observed only");
        }

        let detect_time = Utc::now();
        let event_time = self.event_time_for_block(fill.block_number, detect_time).await;

        let side = match fill.trade_side {
            TradeSide::Buy => Side::Buy,
            TradeSide::Sell => Side::Sell,
        };

        let event = TradeEvent {
            id: Uuid::new_v4().to_string(),
            tx_hash: fill.tx_hash.clone(),
            log_index: fill.log_index as i64,
            followed_user_id: user.id.clone(),
            profile_address: user.profile_address.clone(),
            proxy_address: if wallet_address.eq_ignore_ascii_case(&user.profile_address) {
                None
            } else {
                Some(wallet_address.to_string())
            },
            token_id: fill.outcome_token_id.to_string(),
            side,
            price_micros: fill.price_micros,
            share_micros: fill.token_amount_micros,
            notional_micros: fill.usdc_amount_micros,
            fee_micros: fill.fee_micros,
            event_time,
            detect_time,
            enrichment_status: EnrichmentStatus::Pending,
            market_id: None,
            condition_id: None,
            asset_id: None,
        };

        let inserted = self.store.insert_if_absent(&event).await?;
        if inserted {
            let _ = grouper_tx.send(event.clone()).await;
            Ok(Some(event))
        } else {
            Ok(None)
        }
    }

    async fn event_time_for_block(&self, block_number: u64, fallback: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(cached) = self.cache.lock().get(block_number) {
            return cached;
        }
        match self.block_ts.timestamp_for_block(block_number).await {
            Some(ts) => {
                self.cache.lock().insert(block_number, ts);
                ts
            }
            None => fallback,
        }
    }
}

/// In-memory no-op lookup used where a real block-timestamp service
/// isn't wired up (tests, or a minimal deployment relying solely on
/// `detectTime`).
pub struct NullBlockTimestampLookup;

#[async_trait]
impl BlockTimestampLookup for NullBlockTimestampLookup {
    async fn timestamp_for_block(&self, _block_number: u64) -> Option<DateTime<Utc>> {
        None
    }
}

pub type SharedTradeWriter<L> = Arc<TradeWriter<L>>;
