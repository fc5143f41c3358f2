//! SQLite-backed relational store for normalized OVAL/CPE data
//!
//! Populated by the offline `download`/`sync` commands; at serve time it is
//! read exactly once, to build the in-memory evaluator cache.

pub mod oval_store;
pub mod repo_cpe_store;
pub mod schema;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Handle to the OVAL store
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    /// Create the schema and seed the code tables
    pub fn initialize(&self) -> Result<()> {
        schema::initialize_schema(&self.conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a read transaction so it observes one consistent
    /// snapshot of the store. The transaction is rolled back on drop, which
    /// is fine because `f` only reads.
    pub fn snapshot<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        f(&tx)
    }

    /// Map of architecture name to id, used when classifying repository
    /// labels and state arch constraints.
    pub fn arch_map(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare("SELECT name, id FROM arch")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<HashMap<_, _>, _>>()
            .context("Failed to load architecture table")
    }
}
