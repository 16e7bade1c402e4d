//! Config store (C14). Writes use compare-on-latest (plain inserts,
//! tolerating duplicate rows since reads always take the newest);
//! global scope uses a NULL leader id, per-leader rows override
//! field-by-field. The pause flag is a distinct checkpoint key, not a
//! config row, so it can be toggled without bumping config versions.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::types::{EffectiveConfig, GuardrailConfig, SizingConfig};
use crate::db_common;

#[derive(Clone)]
pub struct ConfigStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl ConfigStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sizing_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                followed_user_id TEXT,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS guardrail_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                followed_user_id TEXT,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sizing_config_user_updated
             ON sizing_config(followed_user_id, updated_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_guardrail_config_user_updated
             ON guardrail_config(followed_user_id, updated_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS system_checkpoint (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn write_sizing(&self, followed_user_id: Option<&str>, config: &SizingConfig) -> Result<()> {
        let payload = serde_json::to_string(config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sizing_config (followed_user_id, payload, updated_at) VALUES (?1, ?2, ?3)",
            params![followed_user_id, payload, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub async fn write_guardrails(
        &self,
        followed_user_id: Option<&str>,
        config: &GuardrailConfig,
    ) -> Result<()> {
        let payload = serde_json::to_string(config)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO guardrail_config (followed_user_id, payload, updated_at) VALUES (?1, ?2, ?3)",
            params![followed_user_id, payload, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    async fn latest_sizing(&self, followed_user_id: Option<&str>) -> Result<SizingConfig> {
        let conn = self.conn.lock().await;
        let payload: Option<String> = match followed_user_id {
            Some(id) => conn
                .query_row(
                    "SELECT payload FROM sizing_config WHERE followed_user_id = ?1
                     ORDER BY updated_at DESC LIMIT 1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT payload FROM sizing_config WHERE followed_user_id IS NULL
                     ORDER BY updated_at DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?,
        };
        Ok(match payload {
            Some(p) => serde_json::from_str(&p)?,
            None => SizingConfig::default(),
        })
    }

    async fn latest_guardrails(&self, followed_user_id: Option<&str>) -> Result<GuardrailConfig> {
        let conn = self.conn.lock().await;
        let payload: Option<String> = match followed_user_id {
            Some(id) => conn
                .query_row(
                    "SELECT payload FROM guardrail_config WHERE followed_user_id = ?1
                     ORDER BY updated_at DESC LIMIT 1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT payload FROM guardrail_config WHERE followed_user_id IS NULL
                     ORDER BY updated_at DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?,
        };
        Ok(match payload {
            Some(p) => serde_json::from_str(&p)?,
            None => GuardrailConfig::default(),
        })
    }

    /// Resolve the fully-merged, defaulted config for a given leader:
    /// per-leader row wins field-by-field over the global row, which
    /// falls back to hard-coded defaults for anything never configured.
    pub async fn effective_for(&self, followed_user_id: &str) -> Result<EffectiveConfig> {
        let global_sizing = self.latest_sizing(None).await?;
        let leader_sizing = self.latest_sizing(Some(followed_user_id)).await?;
        let sizing = leader_sizing.merged_with(&global_sizing);

        let global_guardrails = self.latest_guardrails(None).await?;
        let leader_guardrails = self.latest_guardrails(Some(followed_user_id)).await?;
        let guardrails = leader_guardrails.merged_with(&global_guardrails);

        Ok(EffectiveConfig::from_merged(&sizing, &guardrails))
    }

    /// The pause flag: a distinct checkpoint key, not a config row.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_checkpoint (key, value, updated_at) VALUES ('engine_paused', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![if paused { "true" } else { "false" }, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM system_checkpoint WHERE key = 'engine_paused'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("true"))
    }
}
