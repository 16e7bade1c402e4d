//! `CopyAttempt` (one row per decision for an event group) and its
//! durable store. Only [`crate::decision::engine::CopyDecisionEngine`]
//! writes these rows, per the single-writer ownership rule in spec §3.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::reason::ReasonCode;
use super::simulate::ExecutableFill;
use crate::db_common;
use crate::fixed_point::{Micros, PriceMicros};
use crate::ledger::PortfolioScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttemptDecision {
    Execute,
    Skip,
}

impl AttemptDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptDecision::Execute => "EXECUTE",
            AttemptDecision::Skip => "SKIP",
        }
    }
}

/// Source of the group this attempt decided on, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AttemptSource {
    /// A single ungrouped fill (a closed group with exactly one
    /// contributing event).
    Immediate,
    /// A synthetic group flushed out of the small-trade buffer (C9).
    Buffer,
    /// A multi-fill burst collapsed by the event grouper (C7).
    Aggregator,
}

impl AttemptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptSource::Immediate => "IMMEDIATE",
            AttemptSource::Buffer => "BUFFER",
            AttemptSource::Aggregator => "AGGREGATOR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "BUFFER" => AttemptSource::Buffer,
            "AGGREGATOR" => AttemptSource::Aggregator,
            _ => AttemptSource::Immediate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyAttempt {
    pub id: String,
    pub scope: PortfolioScope,
    pub followed_user_id: String,
    pub decision: AttemptDecision,
    pub reasons: Vec<ReasonCode>,
    pub target_notional_micros: Micros,
    pub filled_notional_micros: Micros,
    pub filled_ratio_bps: u32,
    pub vwap_price_micros: Option<PriceMicros>,
    pub reference_price_micros: PriceMicros,
    pub source: AttemptSource,
    pub buffered_trade_count: u32,
    pub fills: Vec<ExecutableFill>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CopyAttemptStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl CopyAttemptStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS copy_attempts (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                followed_user_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                reasons TEXT NOT NULL,
                target_notional_micros INTEGER NOT NULL,
                filled_notional_micros INTEGER NOT NULL,
                filled_ratio_bps INTEGER NOT NULL,
                vwap_price_micros INTEGER,
                reference_price_micros INTEGER NOT NULL,
                source TEXT NOT NULL,
                buffered_trade_count INTEGER NOT NULL,
                fills TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_copy_attempts_user_created
             ON copy_attempts(followed_user_id, created_at DESC)",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn insert(&self, attempt: &CopyAttempt) -> Result<()> {
        let reasons = serde_json::to_string(&attempt.reasons)?;
        let fills = serde_json::to_string(&attempt.fills)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO copy_attempts
             (id, scope, followed_user_id, decision, reasons, target_notional_micros,
              filled_notional_micros, filled_ratio_bps, vwap_price_micros,
              reference_price_micros, source, buffered_trade_count, fills, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                attempt.id,
                attempt.scope.as_str(),
                attempt.followed_user_id,
                attempt.decision.as_str(),
                reasons,
                attempt.target_notional_micros,
                attempt.filled_notional_micros,
                attempt.filled_ratio_bps,
                attempt.vwap_price_micros,
                attempt.reference_price_micros,
                attempt.source.as_str(),
                attempt.buffered_trade_count,
                fills,
                attempt.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn recent_for_user(&self, followed_user_id: &str, limit: i64) -> Result<Vec<CopyAttempt>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, scope, followed_user_id, decision, reasons, target_notional_micros,
                    filled_notional_micros, filled_ratio_bps, vwap_price_micros,
                    reference_price_micros, source, buffered_trade_count, fills, created_at
             FROM copy_attempts WHERE followed_user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![followed_user_id, limit], Self::row_to_attempt)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn row_to_attempt(row: &rusqlite::Row) -> rusqlite::Result<CopyAttempt> {
        let scope: String = row.get(1)?;
        let decision: String = row.get(3)?;
        let reasons_json: String = row.get(4)?;
        let source: String = row.get(10)?;
        let fills_json: String = row.get(12)?;
        let created_ms: i64 = row.get(13)?;
        Ok(CopyAttempt {
            id: row.get(0)?,
            scope: PortfolioScope::parse(&scope).unwrap_or(PortfolioScope::ExecGlobal),
            followed_user_id: row.get(2)?,
            decision: if decision == "EXECUTE" { AttemptDecision::Execute } else { AttemptDecision::Skip },
            reasons: serde_json::from_str(&reasons_json).unwrap_or_default(),
            target_notional_micros: row.get(5)?,
            filled_notional_micros: row.get(6)?,
            filled_ratio_bps: row.get::<_, i64>(7)? as u32,
            vwap_price_micros: row.get(8)?,
            reference_price_micros: row.get(9)?,
            source: AttemptSource::parse(&source),
            buffered_trade_count: row.get::<_, i64>(11)? as u32,
            fills: serde_json::from_str(&fills_json).unwrap_or_default(),
            created_at: Utc.timestamp_millis_opt(created_ms).single().unwrap_or_else(Utc::now),
        })
    }

    #[allow(dead_code)]
    async fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1 FROM copy_attempts WHERE id = ?1", params![id], |r| r.get::<_, i64>(0))
            .optional()
            .map(|v| v.is_some())
            .map_err(Into::into)
    }
}
