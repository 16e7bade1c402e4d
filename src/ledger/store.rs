//! Durable append-only store for [`LedgerEntry`] rows (C10), and the
//! grouped-query layer (position/cash/exposure/PnL) spec §4.10 derives
//! from it rather than maintaining separately.
//!
//! Grounded on `vault_db.rs`'s `Arc<Mutex<Connection>>` pattern, same as
//! every other `*Store` in this crate; the double-entry idempotency
//! invariant (`scope, refId, entryType` unique) is enforced with a
//! `UNIQUE` index plus `INSERT OR IGNORE`, matching the idempotency
//! handling in [`crate::trades::store::TradeEventStore`].

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::model::{EntryType, LedgerEntry, PortfolioScope};
use crate::db_common;
use crate::fixed_point::{notional_micros, Micros, PriceMicros};

#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

/// Derived view of a scope/leader's book at a point in time, per spec
/// §4.10. `equity = cash + exposure`; `unrealizedPnl = exposure -
/// costBasis`; `realizedPnl = equity - (initialBankroll + netDeposits) -
/// unrealizedPnl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioSummary {
    pub equity_micros: Micros,
    pub cash_micros: Micros,
    pub exposure_micros: Micros,
    pub unrealized_pnl_micros: Micros,
    pub realized_pnl_micros: Micros,
}

impl LedgerStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                followed_user_id TEXT,
                market_id TEXT,
                asset_id TEXT,
                entry_type TEXT NOT NULL,
                share_delta_micros INTEGER NOT NULL,
                cash_delta_micros INTEGER NOT NULL,
                price_micros INTEGER,
                ref_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entries_idempotency
             ON ledger_entries(scope, ref_id, entry_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_entries_scope_user_asset
             ON ledger_entries(scope, followed_user_id, asset_id)",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Cheap liveness probe for the health endpoint -- a real query
    /// against the connection, not just a lock acquisition.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Append one row. Returns `Ok(false)` (not an error) when the
    /// `(scope, refId, entryType)` triple already exists -- idempotency
    /// conflicts are success per spec §7 and §3's invariant.
    pub async fn append_if_absent(&self, entry: &LedgerEntry) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO ledger_entries
             (id, scope, followed_user_id, market_id, asset_id, entry_type,
              share_delta_micros, cash_delta_micros, price_micros, ref_id, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                entry.id,
                entry.scope.as_str(),
                entry.followed_user_id,
                entry.market_id,
                entry.asset_id,
                entry.entry_type.as_str(),
                entry.share_delta_micros,
                entry.cash_delta_micros,
                entry.price_micros,
                entry.ref_id,
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Append a batch inside one transaction -- used for the multi-row
    /// commit of a single copy-attempt (spec §4.8 step 12) and the
    /// two-row settlement write (§4.12), so a crash mid-batch can't
    /// leave a half-written decision or settlement.
    pub async fn append_batch_if_absent(&self, entries: &[LedgerEntry]) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut written = 0;
        for entry in entries {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO ledger_entries
                 (id, scope, followed_user_id, market_id, asset_id, entry_type,
                  share_delta_micros, cash_delta_micros, price_micros, ref_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    entry.id,
                    entry.scope.as_str(),
                    entry.followed_user_id,
                    entry.market_id,
                    entry.asset_id,
                    entry.entry_type.as_str(),
                    entry.share_delta_micros,
                    entry.cash_delta_micros,
                    entry.price_micros,
                    entry.ref_id,
                    entry.created_at.timestamp_millis(),
                ],
            )?;
            written += changed;
        }
        tx.commit()?;
        Ok(written)
    }

    pub async fn exists(&self, scope: PortfolioScope, ref_id: &str, entry_type: EntryType) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ledger_entries WHERE scope = ?1 AND ref_id = ?2 AND entry_type = ?3",
                params![scope.as_str(), ref_id, entry_type.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// `position(scope, followedUserId, assetId) = sum(shareDeltaMicros)`.
    pub async fn position(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        asset_id: &str,
    ) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let sum: Option<i64> = match followed_user_id {
            Some(id) => conn.query_row(
                "SELECT SUM(share_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2 AND asset_id = ?3",
                params![scope.as_str(), id, asset_id],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT SUM(share_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id IS NULL AND asset_id = ?2",
                params![scope.as_str(), asset_id],
                |r| r.get(0),
            )?,
        };
        Ok(sum.unwrap_or(0))
    }

    /// `costBasis(asset) = -sum(cashDeltaMicros)` on rows carrying that
    /// asset id -- the cash paid out (negative delta) to acquire the
    /// current position.
    async fn cost_basis(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        asset_id: &str,
    ) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let sum: Option<i64> = match followed_user_id {
            Some(id) => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2 AND asset_id = ?3",
                params![scope.as_str(), id, asset_id],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id IS NULL AND asset_id = ?2",
                params![scope.as_str(), asset_id],
                |r| r.get(0),
            )?,
        };
        Ok(-sum.unwrap_or(0))
    }

    /// `cash(scope, followedUserId) = sum(cashDeltaMicros)` across every
    /// row for that scope/leader, regardless of asset -- deposits and
    /// the initial bankroll are just more `cashDeltaMicros` rows (the
    /// caller adds any not-yet-written initial bankroll separately via
    /// [`Self::summary`]).
    pub async fn cash(&self, scope: PortfolioScope, followed_user_id: Option<&str>) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let sum: Option<i64> = match followed_user_id {
            Some(id) => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2",
                params![scope.as_str(), id],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries WHERE scope = ?1 AND followed_user_id IS NULL",
                params![scope.as_str()],
                |r| r.get(0),
            )?,
        };
        Ok(sum.unwrap_or(0))
    }

    /// Net deposits: sum of `cashDeltaMicros` on `DEPOSIT` rows only.
    async fn net_deposits(&self, scope: PortfolioScope, followed_user_id: Option<&str>) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let sum: Option<i64> = match followed_user_id {
            Some(id) => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2 AND entry_type = 'DEPOSIT'",
                params![scope.as_str(), id],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id IS NULL AND entry_type = 'DEPOSIT'",
                params![scope.as_str()],
                |r| r.get(0),
            )?,
        };
        Ok(sum.unwrap_or(0))
    }

    /// Every asset id with a non-zero position for this scope/leader --
    /// feeds both the price snapshot loop (C11) and the settlement loop
    /// (C12)'s "enumerate open positions" step.
    pub async fn assets_with_open_position(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = match followed_user_id {
            Some(_) => conn.prepare_cached(
                "SELECT asset_id FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2 AND asset_id IS NOT NULL
                 GROUP BY asset_id HAVING SUM(share_delta_micros) != 0",
            )?,
            None => conn.prepare_cached(
                "SELECT asset_id FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id IS NULL AND asset_id IS NOT NULL
                 GROUP BY asset_id HAVING SUM(share_delta_micros) != 0",
            )?,
        };
        let rows = match followed_user_id {
            Some(id) => stmt.query_map(params![scope.as_str(), id], |r| r.get::<_, String>(0))?,
            None => stmt.query_map(params![scope.as_str()], |r| r.get::<_, String>(0))?,
        };
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Every distinct `(scope, followedUserId)` leader slice that has
    /// ever written a row -- drives the per-leader EXEC_USER and
    /// SHADOW_USER snapshot loops (§4.11) without needing a separate
    /// "active leaders" registry.
    pub async fn distinct_leader_slices(&self, scope: PortfolioScope) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT followed_user_id FROM ledger_entries
             WHERE scope = ?1 AND followed_user_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![scope.as_str()], |r| r.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Compute the full derived summary for one scope/leader, given a
    /// price lookup for exposure/unrealized-PnL and the scope's initial
    /// bankroll (non-zero only for `EXEC_GLOBAL` with no leader, per
    /// spec §4.10).
    pub async fn summary(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        initial_bankroll_micros: Micros,
        latest_price: impl Fn(&str) -> Option<PriceMicros>,
    ) -> Result<PortfolioSummary> {
        let assets = self.assets_with_open_position(scope, followed_user_id).await?;
        let mut exposure = 0i64;
        let mut cost_basis_total = 0i64;
        for asset in &assets {
            let shares = self.position(scope, followed_user_id, asset).await?;
            let Some(price) = latest_price(asset) else { continue };
            exposure += notional_micros(shares.abs(), price);
            cost_basis_total += self.cost_basis(scope, followed_user_id, asset).await?;
        }
        let cash = self.cash(scope, followed_user_id).await? + initial_bankroll_micros;
        let equity = cash + exposure;
        let unrealized = exposure - cost_basis_total;
        let net_deposits = self.net_deposits(scope, followed_user_id).await?;
        let realized = equity - (initial_bankroll_micros + net_deposits) - unrealized;
        Ok(PortfolioSummary {
            equity_micros: equity,
            cash_micros: cash,
            exposure_micros: exposure,
            unrealized_pnl_micros: unrealized,
            realized_pnl_micros: realized,
        })
    }

    /// Exposure attributed to one market, across all assets belonging to
    /// it and all leaders within `scope` -- used by the per-market
    /// exposure-cap guardrail (§4.8 step 8), which is a cross-leader cap
    /// even though most other reads are per-leader.
    pub async fn market_exposure(
        &self,
        scope: PortfolioScope,
        market_id: &str,
        latest_price: impl Fn(&str) -> Option<PriceMicros>,
    ) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT asset_id, SUM(share_delta_micros) FROM ledger_entries
             WHERE scope = ?1 AND market_id = ?2 AND asset_id IS NOT NULL
             GROUP BY asset_id",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map(params![scope.as_str(), market_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);
        let mut exposure = 0i64;
        for (asset, shares) in rows {
            if let Some(price) = latest_price(&asset) {
                exposure += notional_micros(shares.abs(), price);
            }
        }
        Ok(exposure)
    }

    pub async fn realized_pnl_since(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Micros> {
        let conn = self.conn.lock().await;
        let sum: Option<i64> = match followed_user_id {
            Some(id) => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id = ?2 AND created_at >= ?3 AND entry_type != 'DEPOSIT'",
                params![scope.as_str(), id, since.timestamp_millis()],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT SUM(cash_delta_micros) FROM ledger_entries
                 WHERE scope = ?1 AND followed_user_id IS NULL AND created_at >= ?2 AND entry_type != 'DEPOSIT'",
                params![scope.as_str(), since.timestamp_millis()],
                |r| r.get(0),
            )?,
        };
        Ok(sum.unwrap_or(0))
    }

    #[allow(dead_code)]
    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
        let scope: String = row.get(1)?;
        let entry_type: String = row.get(5)?;
        let created_ms: i64 = row.get(10)?;
        Ok(LedgerEntry {
            id: row.get(0)?,
            scope: PortfolioScope::parse(&scope).unwrap_or(PortfolioScope::ExecGlobal),
            followed_user_id: row.get(2)?,
            market_id: row.get(3)?,
            asset_id: row.get(4)?,
            entry_type: EntryType::parse(&entry_type).unwrap_or(EntryType::TradeBuy),
            share_delta_micros: row.get(6)?,
            cash_delta_micros: row.get(7)?,
            price_micros: row.get(8)?,
            ref_id: row.get(9)?,
            created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(
        scope: PortfolioScope,
        asset: &str,
        entry_type: EntryType,
        shares: Micros,
        cash: Micros,
        ref_id: &str,
    ) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4().to_string(),
            scope,
            followed_user_id: None,
            market_id: Some("m1".to_string()),
            asset_id: Some(asset.to_string()),
            entry_type,
            share_delta_micros: shares,
            cash_delta_micros: cash,
            price_micros: None,
            ref_id: ref_id.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn idempotency_invariant_rejects_duplicate_ref_scope_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        let e = entry(PortfolioScope::ExecGlobal, "a1", EntryType::TradeBuy, 100_000_000, -50_000_000, "g1");
        assert!(store.append_if_absent(&e).await.unwrap());
        let mut dup = e.clone();
        dup.id = Uuid::new_v4().to_string();
        assert!(!store.append_if_absent(&dup).await.unwrap());
    }

    #[tokio::test]
    async fn position_and_cash_sum_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        store
            .append_if_absent(&entry(PortfolioScope::ExecGlobal, "a1", EntryType::TradeBuy, 100_000_000, -50_000_000, "g1"))
            .await
            .unwrap();
        store
            .append_if_absent(&entry(PortfolioScope::ExecGlobal, "a1", EntryType::TradeSell, -40_000_000, 22_000_000, "g2"))
            .await
            .unwrap();
        let position = store.position(PortfolioScope::ExecGlobal, None, "a1").await.unwrap();
        assert_eq!(position, 60_000_000);
        let cash = store.cash(PortfolioScope::ExecGlobal, None).await.unwrap();
        assert_eq!(cash, -28_000_000);
    }

    #[tokio::test]
    async fn settlement_idempotent_across_two_runs() {
        // Scenario 6 from spec.md §8: 100 shares long, payout = 1_000_000.
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap();
        store
            .append_if_absent(&entry(PortfolioScope::ExecGlobal, "a1", EntryType::TradeBuy, 100_000_000, -60_000_000, "open"))
            .await
            .unwrap();

        let zero_out = entry(PortfolioScope::ExecGlobal, "a1", EntryType::Settlement, -100_000_000, 0, "settle:a1:zero");
        let credit = entry(PortfolioScope::ExecGlobal, "a1", EntryType::Settlement, 0, 100_000_000, "settle:a1:credit");
        assert!(store.append_if_absent(&zero_out).await.unwrap());
        assert!(store.append_if_absent(&credit).await.unwrap());
        assert_eq!(store.position(PortfolioScope::ExecGlobal, None, "a1").await.unwrap(), 0);
        let cash_after_first = store.cash(PortfolioScope::ExecGlobal, None).await.unwrap();

        // Second settlement pass over the same asset: no new rows.
        let zero_out_2 = entry(PortfolioScope::ExecGlobal, "a1", EntryType::Settlement, -999, 0, "settle:a1:zero");
        let credit_2 = entry(PortfolioScope::ExecGlobal, "a1", EntryType::Settlement, 0, 999, "settle:a1:credit");
        assert!(!store.append_if_absent(&zero_out_2).await.unwrap());
        assert!(!store.append_if_absent(&credit_2).await.unwrap());
        assert_eq!(store.cash(PortfolioScope::ExecGlobal, None).await.unwrap(), cash_after_first);
    }
}
