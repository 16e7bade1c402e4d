//! SystemCheckpoint (C4/C6 support): key/JSON store for cursors -- last
//! processed block, per-user trade/activity ingest cursors. The pause
//! flag lives in [`crate::config::ConfigStore`] since spec §4.14 calls
//! it out as a config-store concern; this store owns everything else
//! that needs a durable cursor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::ChainCheckpointStore;
use crate::db_common;

#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl CheckpointStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
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

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM system_checkpoint WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_checkpoint (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub async fn get_user_cursor(&self, followed_user_id: &str) -> Result<Option<String>> {
        self.get(&format!("ingest_cursor:{followed_user_id}")).await
    }

    pub async fn set_user_cursor(&self, followed_user_id: &str, cursor: &str) -> Result<()> {
        self.set(&format!("ingest_cursor:{followed_user_id}"), cursor).await
    }
}

#[async_trait]
impl ChainCheckpointStore for CheckpointStore {
    async fn last_block(&self) -> Result<Option<u64>> {
        Ok(self.get("last_block").await?.and_then(|v| v.parse().ok()))
    }

    async fn set_last_block(&self, block: u64) -> Result<()> {
        self.set("last_block", &block.to_string()).await
    }
}
