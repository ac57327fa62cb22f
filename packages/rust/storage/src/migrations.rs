//! SQL migration definitions for the dedup ledger.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: seen_opportunities",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per opportunity URL ever accepted by a run.
-- Timestamps are RFC 3339 UTC with a fixed width, so they compare as text.
CREATE TABLE IF NOT EXISTS seen_opportunities (
    url          TEXT PRIMARY KEY,
    date_seen    TEXT NOT NULL,
    source       TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_seen_date_seen ON seen_opportunities(date_seen);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
