//! Persisted cache entry operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::dataset::hash_data;
use crate::models::ExecutionResult;

/// A cached result read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub result: ExecutionResult,
    pub stored_at: DateTime<Utc>,
}

/// Row key for a canonical intent under one dataset fingerprint.
pub fn persisted_key(fingerprint: &str, canonical: &str) -> String {
    hash_data(format!("{}|{}", fingerprint, canonical).as_bytes())
}

impl Database {
    /// Insert or replace a cached result.
    pub fn put_cached_result(
        &self,
        fingerprint: &str,
        canonical: &str,
        result: &ExecutionResult,
        stored_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let json = serde_json::to_string(result)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO cached_results (
                cache_key, fingerprint, canonical, result, stored_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                persisted_key(fingerprint, canonical),
                fingerprint,
                canonical,
                json,
                stored_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Look up a cached result for this dataset fingerprint.
    pub fn get_cached_result(&self, fingerprint: &str, canonical: &str) -> DbResult<Option<StoredResult>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT result, stored_at FROM cached_results WHERE cache_key = ?",
                [persisted_key(fingerprint, canonical)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((json, stored_at)) = row else {
            return Ok(None);
        };
        let result: ExecutionResult = serde_json::from_str(&json)?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| DbError::Corrupt(format!("stored_at `{}`: {}", stored_at, e)))?
            .with_timezone(&Utc);
        Ok(Some(StoredResult { result, stored_at }))
    }

    /// Delete every entry not computed from `fingerprint`. Returns rows removed.
    pub fn purge_cached_results_except(&self, fingerprint: &str) -> DbResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM cached_results WHERE fingerprint != ?", [fingerprint])?)
    }

    pub fn cached_result_count(&self) -> DbResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cached_results", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
