//! SQLite persistence for the query cache.

mod cache_store;
mod schema;

pub use cache_store::*;
pub use schema::*;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How long a write waits on another engine holding the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Handle on the cached-results database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::debug!(path = %path.display(), "opened result store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> DbResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}
