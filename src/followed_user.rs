//! FollowedUser entity: who we're copying, and the addresses that
//! identify their on-chain activity. Created/labeled externally; this
//! module only persists and looks them up.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db_common;

#[derive(Debug, Clone)]
pub struct FollowedUser {
    pub id: String,
    pub label: String,
    pub profile_address: String,
    pub proxy_addresses: Vec<String>,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct FollowedUserStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl FollowedUserStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = db_common::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS followed_users (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                profile_address TEXT NOT NULL,
                proxy_addresses TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_followed_users_profile
             ON followed_users(profile_address)",
            [],
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn upsert(&self, user: &FollowedUser) -> Result<()> {
        let conn = self.conn.lock().await;
        let proxies = serde_json::to_string(&user.proxy_addresses)?;
        conn.execute(
            "INSERT INTO followed_users (id, label, profile_address, proxy_addresses, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                profile_address = excluded.profile_address,
                proxy_addresses = excluded.proxy_addresses,
                enabled = excluded.enabled",
            params![user.id, user.label, user.profile_address.to_lowercase(), proxies, user.enabled as i64],
        )?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE followed_users SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    /// Matches on either the profile address or any proxy alias,
    /// case-insensitively.
    pub async fn find_by_address(&self, address: &str) -> Result<Option<FollowedUser>> {
        let address = address.to_lowercase();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, label, profile_address, proxy_addresses, enabled FROM followed_users",
        )?;
        let rows = stmt.query_map([], Self::row_to_user)?;
        for row in rows.filter_map(|r| r.ok()) {
            if row.profile_address.eq_ignore_ascii_case(&address)
                || row.proxy_addresses.iter().any(|p| p.eq_ignore_ascii_case(&address))
            {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FollowedUser>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, label, profile_address, proxy_addresses, enabled FROM followed_users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_enabled(&self) -> Result<Vec<FollowedUser>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, label, profile_address, proxy_addresses, enabled FROM followed_users WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], Self::row_to_user)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<FollowedUser> {
        let proxies_json: String = row.get(3)?;
        let proxy_addresses: Vec<String> = serde_json::from_str(&proxies_json).unwrap_or_default();
        Ok(FollowedUser {
            id: row.get(0)?,
            label: row.get(1)?,
            profile_address: row.get(2)?,
            proxy_addresses,
            enabled: row.get::<_, i64>(4)? != 0,
        })
    }
}
