//! Persistent block-hash index
//!
//! Optional SQLite mapping between the block hashes the gateway hands to
//! Ethereum clients and the underlying Qtum block hashes. When the index
//! is not configured, handlers fall back to the identity mapping (an
//! Ethereum hash is the Qtum hash with a `0x` prefix), so the index only
//! exists to make round-trips survive restarts and representation
//! changes.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BlockHashError {
    #[error("block hash database: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// SQLite-backed `hash_pairs` table.
pub struct BlockHashIndex {
    conn: Mutex<Connection>,
}

impl BlockHashIndex {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, BlockHashError> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS hash_pairs (
                eth_hash  CHAR(66) PRIMARY KEY,
                qtum_hash CHAR(64) NOT NULL,
                height    BIGINT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_hash_pairs_qtum ON hash_pairs (qtum_hash)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index, used by tests.
    pub fn open_in_memory() -> Result<Self, BlockHashError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS hash_pairs (
                eth_hash  CHAR(66) PRIMARY KEY,
                qtum_hash CHAR(64) NOT NULL,
                height    BIGINT
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a pair. Idempotent; failures are logged and swallowed so a
    /// broken index never takes a read path down with it.
    pub fn record(&self, eth_hash: &str, qtum_hash: &str, height: u64) {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT OR REPLACE INTO hash_pairs (eth_hash, qtum_hash, height)
             VALUES (?1, ?2, ?3)",
            params![eth_hash.to_lowercase(), qtum_hash.to_lowercase(), height as i64],
        );
        match result {
            Ok(_) => debug!(eth_hash, qtum_hash, height, "recorded hash pair"),
            Err(e) => warn!("failed to record hash pair: {e}"),
        }
    }

    /// Qtum hash for a gateway-issued hash.
    pub fn qtum_for_eth(&self, eth_hash: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT qtum_hash FROM hash_pairs WHERE eth_hash = ?1",
            params![eth_hash.to_lowercase()],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!("hash pair lookup failed: {e}");
            None
        })
    }

    /// Gateway hash for a Qtum hash.
    pub fn eth_for_qtum(&self, qtum_hash: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT eth_hash FROM hash_pairs WHERE qtum_hash = ?1",
            params![qtum_hash.to_lowercase()],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!("hash pair lookup failed: {e}");
            None
        })
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM hash_pairs", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_both_directions() {
        let index = BlockHashIndex::open_in_memory().unwrap();
        let eth = format!("0x{}", "ab".repeat(32));
        let qtum = "ab".repeat(32);

        index.record(&eth, &qtum, 813);
        assert_eq!(index.qtum_for_eth(&eth).as_deref(), Some(qtum.as_str()));
        assert_eq!(index.eth_for_qtum(&qtum).as_deref(), Some(eth.as_str()));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let index = BlockHashIndex::open_in_memory().unwrap();
        let eth = format!("0x{}", "cd".repeat(32));
        index.record(&eth.to_uppercase().replace("0X", "0x"), &"cd".repeat(32), 1);
        assert!(index.qtum_for_eth(&eth).is_some());
    }

    #[test]
    fn record_is_idempotent() {
        let index = BlockHashIndex::open_in_memory().unwrap();
        let eth = format!("0x{}", "ef".repeat(32));
        index.record(&eth, &"ef".repeat(32), 5);
        index.record(&eth, &"ef".repeat(32), 5);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn misses_return_none() {
        let index = BlockHashIndex::open_in_memory().unwrap();
        assert!(index.qtum_for_eth("0xdoesnotexist").is_none());
        assert!(index.eth_for_qtum("doesnotexist").is_none());
    }
}
