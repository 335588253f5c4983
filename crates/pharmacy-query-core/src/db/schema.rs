//! SQLite schema definition.

/// Schema for the persisted query cache.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Cached execution results
-- ============================================================================

-- cache_key = sha256(fingerprint || '|' || canonical intent)
CREATE TABLE IF NOT EXISTS cached_results (
    cache_key TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,                   -- dataset content hash
    canonical TEXT NOT NULL,                     -- canonical intent serialization
    result TEXT NOT NULL,                        -- JSON ExecutionResult
    stored_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cached_results_fingerprint ON cached_results(fingerprint);
"#;
