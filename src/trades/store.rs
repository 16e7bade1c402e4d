//! Durable store for [`TradeEvent`] rows. Grounded on `vault_db.rs`'s
//! `Arc<Mutex<Connection>>` / table-in-`new()` pattern; the only writer
//! is [`crate::trades::writer::TradeWriter`] (C5), per the ownership
//! rule in spec §3.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::model::{EnrichmentStatus, Side, TradeEvent};
use crate::db_common;

#[derive(Clone)]
pub struct TradeEventStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl TradeEventStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_events (
                id TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                followed_user_id TEXT NOT NULL,
                profile_address TEXT NOT NULL,
                proxy_address TEXT,
                token_id TEXT NOT NULL,
                side TEXT NOT NULL,
                price_micros INTEGER NOT NULL,
                share_micros INTEGER NOT NULL,
                notional_micros INTEGER NOT NULL,
                fee_micros INTEGER NOT NULL,
                event_time INTEGER NOT NULL,
                detect_time INTEGER NOT NULL,
                enrichment_status TEXT NOT NULL,
                market_id TEXT,
                condition_id TEXT,
                asset_id TEXT,
                UNIQUE(tx_hash, log_index)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trade_events_user_asset_side
             ON trade_events(followed_user_id, token_id, side, event_time)",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Insert a new canonical trade row. Returns `Ok(false)` (not an
    /// error) if `(tx_hash, log_index)` already exists -- idempotency
    /// conflicts are success per §7.
    pub async fn insert_if_absent(&self, event: &TradeEvent) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO trade_events
             (id, tx_hash, log_index, followed_user_id, profile_address, proxy_address,
              token_id, side, price_micros, share_micros, notional_micros, fee_micros,
              event_time, detect_time, enrichment_status, market_id, condition_id, asset_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                event.id,
                event.tx_hash,
                event.log_index,
                event.followed_user_id,
                event.profile_address,
                event.proxy_address,
                event.token_id,
                event.side.as_str(),
                event.price_micros,
                event.share_micros,
                event.notional_micros,
                event.fee_micros,
                event.event_time.timestamp_millis(),
                event.detect_time.timestamp_millis(),
                event.enrichment_status.as_str(),
                event.market_id,
                event.condition_id,
                event.asset_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub async fn exists(&self, tx_hash: &str, log_index: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM trade_events WHERE tx_hash = ?1 AND log_index = ?2",
                params![tx_hash, log_index],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub async fn mark_enriched(
        &self,
        id: &str,
        market_id: &str,
        condition_id: &str,
        asset_id: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trade_events SET enrichment_status = 'enriched',
             market_id = ?2, condition_id = ?3, asset_id = ?4 WHERE id = ?1",
            params![id, market_id, condition_id, asset_id],
        )?;
        Ok(())
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<TradeEvent> {
        let side: String = row.get(7)?;
        let status: String = row.get(14)?;
        let event_time_ms: i64 = row.get(12)?;
        let detect_time_ms: i64 = row.get(13)?;
        Ok(TradeEvent {
            id: row.get(0)?,
            tx_hash: row.get(1)?,
            log_index: row.get(2)?,
            followed_user_id: row.get(3)?,
            profile_address: row.get(4)?,
            proxy_address: row.get(5)?,
            token_id: row.get(6)?,
            side: Side::parse(&side).unwrap_or(Side::Buy),
            price_micros: row.get(8)?,
            share_micros: row.get(9)?,
            notional_micros: row.get(10)?,
            fee_micros: row.get(11)?,
            event_time: millis_to_utc(event_time_ms),
            detect_time: millis_to_utc(detect_time_ms),
            enrichment_status: EnrichmentStatus::parse(&status),
            market_id: row.get(15)?,
            condition_id: row.get(16)?,
            asset_id: row.get(17)?,
        })
    }

    pub async fn recent_for_user_asset_side(
        &self,
        followed_user_id: &str,
        token_id: &str,
        side: Side,
        limit: i64,
    ) -> Result<Vec<TradeEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tx_hash, log_index, followed_user_id, profile_address, proxy_address,
                    token_id, side, price_micros, share_micros, notional_micros, fee_micros,
                    event_time, detect_time, enrichment_status, market_id, condition_id, asset_id
             FROM trade_events
             WHERE followed_user_id = ?1 AND token_id = ?2 AND side = ?3
             ORDER BY event_time DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![followed_user_id, token_id, side.as_str(), limit],
            Self::row_to_event,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
