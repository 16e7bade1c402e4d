//! Shared SQLite connection-opening helper, reused by every `*Store::new`
//! so WAL mode and busy-timeout pragmas aren't repeated per component.
//! Grounded on `vault/vault_db.rs`'s `VaultDb::new`.

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn open(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path).with_context(|| format!("open sqlite db at {db_path}"))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", 5_000i64).ok();
    conn.execute("PRAGMA foreign_keys = ON", []).ok();
    Ok(conn)
}
