//! Storage layer: pooled SQLite access, forward-only migrations, and the
//! per-run sequence generator.
//!
//! Multiple worker tasks run concurrently against the same database, so a
//! connection is checked out of an `r2d2` pool per operation rather than
//! shared behind a single mutex.

pub mod agent;
pub mod analytics;
pub mod artifacts;
pub mod events;
pub mod jobs;
pub mod models;
pub mod operator_actions;
pub mod outbox;
pub mod projects;
pub mod runs;
pub mod webhook;
pub mod worktrees;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::errors::StorageError;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init", include_str!("../../migrations/0001_init.sql")),
    ("0002_steps", include_str!("../../migrations/0002_steps.sql")),
];

pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
}

impl Db {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    /// A single-connection in-memory database, for unit and integration
    /// tests. Pool size is pinned to 1 so every checkout sees the same
    /// in-memory file (distinct `:memory:` connections are otherwise
    /// isolated from each other).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<PooledConn, StorageError> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
        )?;
        for (idx, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            let already: i64 = conn.query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )?;
            if already > 0 {
                continue;
            }
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, chrono::Utc::now().to_rfc3339()],
            )?;
            tracing::debug!(migration = name, version, "applied migration");
        }
        Ok(())
    }

    /// Atomically consumes and returns the next sequence number for a run,
    /// inside the caller's transaction when one is supplied.
    pub fn next_sequence(conn: &rusqlite::Connection, run_id: &str) -> Result<i64, StorageError> {
        let seq: i64 = conn.query_row(
            "UPDATE runs SET next_sequence = next_sequence + 1
             WHERE id = ?1
             RETURNING next_sequence - 1",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
