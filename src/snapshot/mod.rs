//! Snapshot loops (C11): periodic price snapshots per asset and
//! periodic portfolio (equity/cash/exposure/PnL) snapshots per scope,
//! §4.11. The only writer of snapshot rows, per the ownership rule in
//! §3.
//!
//! Grounded on the `Arc<Mutex<Connection>>` store shape shared by every
//! other `*Store` in this crate, and on [`crate::ledger::LedgerStore`]'s
//! `assets_with_open_position`/`distinct_leader_slices`/`summary`
//! accessors, which already anticipate these two loops in their own doc
//! comments.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::book::BookCache;
use crate::db_common;
use crate::fixed_point::{Micros, PriceMicros};
use crate::ledger::{LedgerStore, PortfolioScope};

/// One `(assetId, bucketTime)` midpoint row.
#[derive(Debug, Clone)]
pub struct MarketPriceSnapshot {
    pub asset_id: String,
    pub bucket_time: DateTime<Utc>,
    pub price_micros: PriceMicros,
}

#[derive(Clone)]
pub struct MarketPriceSnapshotStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl MarketPriceSnapshotStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_price_snapshots (
                asset_id TEXT NOT NULL,
                bucket_time INTEGER NOT NULL,
                price_micros INTEGER NOT NULL,
                PRIMARY KEY (asset_id, bucket_time)
            )",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Upsert one `(assetId, bucketTime)` row. A duplicate key within
    /// the same bucket (e.g. two ticks of the loop landing in the same
    /// `P`-second window) overwrites rather than erroring, per the
    /// idempotency-conflict-as-success rule.
    pub async fn upsert(&self, asset_id: &str, bucket_time: DateTime<Utc>, price_micros: PriceMicros) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO market_price_snapshots (asset_id, bucket_time, price_micros)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(asset_id, bucket_time) DO UPDATE SET price_micros = excluded.price_micros",
            params![asset_id, bucket_time.timestamp_millis(), price_micros],
        )?;
        Ok(())
    }

    pub async fn latest(&self, asset_id: &str) -> Result<Option<MarketPriceSnapshot>> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT bucket_time, price_micros FROM market_price_snapshots
                 WHERE asset_id = ?1 ORDER BY bucket_time DESC LIMIT 1",
                params![asset_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(bucket_ms, price)| MarketPriceSnapshot {
            asset_id: asset_id.to_string(),
            bucket_time: millis_to_utc(bucket_ms),
            price_micros: price as PriceMicros,
        }))
    }
}

/// One `(scope, followedUserId|null, bucketTime)` equity/PnL row.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub bucket_time: DateTime<Utc>,
    pub equity_micros: Micros,
    pub cash_micros: Micros,
    pub exposure_micros: Micros,
    pub unrealized_pnl_micros: Micros,
    pub realized_pnl_micros: Micros,
}

#[derive(Clone)]
pub struct PortfolioSnapshotStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl PortfolioSnapshotStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS portfolio_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                followed_user_id TEXT,
                bucket_time INTEGER NOT NULL,
                equity_micros INTEGER NOT NULL,
                cash_micros INTEGER NOT NULL,
                exposure_micros INTEGER NOT NULL,
                unrealized_pnl_micros INTEGER NOT NULL,
                realized_pnl_micros INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_portfolio_snapshots_scope_user
             ON portfolio_snapshots(scope, followed_user_id, created_at)",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Append one snapshot row. Spec §9 resolves the nullable-leader
    /// unique-index ambiguity by tolerating duplicate `(scope, NULL,
    /// bucketTime)` rows rather than an `updateMany`-then-`create`
    /// dance: every call here is a plain insert, and readers always
    /// take the most recent row for a given scope/leader.
    pub async fn insert(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO portfolio_snapshots
             (scope, followed_user_id, bucket_time, equity_micros, cash_micros,
              exposure_micros, unrealized_pnl_micros, realized_pnl_micros, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                snapshot.scope.as_str(),
                snapshot.followed_user_id,
                snapshot.bucket_time.timestamp_millis(),
                snapshot.equity_micros,
                snapshot.cash_micros,
                snapshot.exposure_micros,
                snapshot.unrealized_pnl_micros,
                snapshot.realized_pnl_micros,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn latest(&self, scope: PortfolioScope, followed_user_id: Option<&str>) -> Result<Option<PortfolioSnapshot>> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64, i64, i64, i64, i64)> = match followed_user_id {
            Some(id) => conn
                .query_row(
                    "SELECT bucket_time, equity_micros, cash_micros, exposure_micros,
                            unrealized_pnl_micros, realized_pnl_micros
                     FROM portfolio_snapshots
                     WHERE scope = ?1 AND followed_user_id = ?2
                     ORDER BY created_at DESC LIMIT 1",
                    params![scope.as_str(), id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT bucket_time, equity_micros, cash_micros, exposure_micros,
                            unrealized_pnl_micros, realized_pnl_micros
                     FROM portfolio_snapshots
                     WHERE scope = ?1 AND followed_user_id IS NULL
                     ORDER BY created_at DESC LIMIT 1",
                    params![scope.as_str()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
                )
                .optional()?,
        };
        Ok(row.map(|(bucket_ms, equity, cash, exposure, unrealized, realized)| PortfolioSnapshot {
            scope,
            followed_user_id: followed_user_id.map(str::to_string),
            bucket_time: millis_to_utc(bucket_ms),
            equity_micros: equity,
            cash_micros: cash,
            exposure_micros: exposure,
            unrealized_pnl_micros: unrealized,
            realized_pnl_micros: realized,
        }))
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn floor_bucket(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_ms = period.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let floored = (now_ms / period_ms) * period_ms;
    millis_to_utc(floored)
}

/// Price snapshot loop: every `period`, lists every asset with a
/// non-zero EXEC_GLOBAL position and upserts its current midpoint
/// (read straight from the book cache, never re-fetched over the
/// network) into `bucketTime = floor(now / P) * P`.
pub async fn run_price_snapshot_loop(
    ledger: LedgerStore,
    book_cache: BookCache,
    store: MarketPriceSnapshotStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = price_snapshot_tick(&ledger, &book_cache, &store, period).await {
                    warn!(error = %e, "price snapshot tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn price_snapshot_tick(
    ledger: &LedgerStore,
    book_cache: &BookCache,
    store: &MarketPriceSnapshotStore,
    period: Duration,
) -> Result<()> {
    let bucket = floor_bucket(Utc::now(), period);
    let assets = ledger.assets_with_open_position(PortfolioScope::ExecGlobal, None).await?;
    for asset_id in assets {
        let Some(mid) = book_cache.get_no_wait(&asset_id).mid else {
            continue;
        };
        store.upsert(&asset_id, bucket, mid).await?;
    }
    debug!(bucket = %bucket, "price snapshot tick complete");
    Ok(())
}

/// One leader or global slice to snapshot: `None` means the EXEC_GLOBAL
/// aggregate (no leader attribution).
struct Slice {
    scope: PortfolioScope,
    followed_user_id: Option<String>,
}

/// Portfolio snapshot loop: every 60s, snapshots EXEC_GLOBAL (global),
/// every EXEC_GLOBAL per-leader slice, and every SHADOW_USER slice.
pub async fn run_portfolio_snapshot_loop(
    ledger: LedgerStore,
    book_cache: BookCache,
    store: PortfolioSnapshotStore,
    initial_bankroll_micros: Micros,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = portfolio_snapshot_tick(&ledger, &book_cache, &store, initial_bankroll_micros).await {
                    warn!(error = %e, "portfolio snapshot tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn portfolio_snapshot_tick(
    ledger: &LedgerStore,
    book_cache: &BookCache,
    store: &PortfolioSnapshotStore,
    initial_bankroll_micros: Micros,
) -> Result<()> {
    let bucket = Utc::now();
    let mut slices = vec![Slice { scope: PortfolioScope::ExecGlobal, followed_user_id: None }];
    for leader in ledger.distinct_leader_slices(PortfolioScope::ExecGlobal).await? {
        slices.push(Slice { scope: PortfolioScope::ExecGlobal, followed_user_id: Some(leader) });
    }
    for leader in ledger.distinct_leader_slices(PortfolioScope::ShadowUser).await? {
        slices.push(Slice { scope: PortfolioScope::ShadowUser, followed_user_id: Some(leader) });
    }

    let lookup = |asset: &str| book_cache.get_no_wait(asset).mid;
    for slice in slices {
        let bankroll = if slice.scope == PortfolioScope::ExecGlobal && slice.followed_user_id.is_none() {
            initial_bankroll_micros
        } else {
            0
        };
        let summary = ledger
            .summary(slice.scope, slice.followed_user_id.as_deref(), bankroll, &lookup)
            .await?;
        store
            .insert(&PortfolioSnapshot {
                scope: slice.scope,
                followed_user_id: slice.followed_user_id,
                bucket_time: bucket,
                equity_micros: summary.equity_micros,
                cash_micros: summary.cash_micros,
                exposure_micros: summary.exposure_micros,
                unrealized_pnl_micros: summary.unrealized_pnl_micros,
                realized_pnl_micros: summary.realized_pnl_micros,
            })
            .await?;
    }
    debug!(bucket = %bucket, "portfolio snapshot tick complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_bucket_rounds_down_to_period_boundary() {
        let period = Duration::from_secs(30);
        let now = Utc.timestamp_millis_opt(1_000_045_000).single().unwrap();
        let bucket = floor_bucket(now, period);
        assert_eq!(bucket.timestamp_millis(), 1_000_030_000);
    }

    #[tokio::test]
    async fn price_snapshot_upsert_overwrites_same_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarketPriceSnapshotStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap();
        let bucket = Utc.timestamp_millis_opt(60_000).single().unwrap();
        store.upsert("asset1", bucket, 500_000).await.unwrap();
        store.upsert("asset1", bucket, 510_000).await.unwrap();
        let latest = store.latest("asset1").await.unwrap().unwrap();
        assert_eq!(latest.price_micros, 510_000);
    }

    #[tokio::test]
    async fn portfolio_snapshot_tolerates_duplicate_null_leader_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = PortfolioSnapshotStore::new(dir.path().join("p.db").to_str().unwrap()).unwrap();
        let snap = PortfolioSnapshot {
            scope: PortfolioScope::ExecGlobal,
            followed_user_id: None,
            bucket_time: Utc::now(),
            equity_micros: 1_000_000,
            cash_micros: 1_000_000,
            exposure_micros: 0,
            unrealized_pnl_micros: 0,
            realized_pnl_micros: 0,
        };
        store.insert(&snap).await.unwrap();
        let mut snap2 = snap.clone();
        snap2.equity_micros = 2_000_000;
        store.insert(&snap2).await.unwrap();
        let latest = store.latest(PortfolioScope::ExecGlobal, None).await.unwrap().unwrap();
        assert_eq!(latest.equity_micros, 2_000_000);
    }
}
