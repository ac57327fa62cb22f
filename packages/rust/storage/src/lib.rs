//! Embedded libSQL dedup ledger.
//!
//! The [`DedupStore`] keeps one `seen_opportunities` row per opportunity URL.
//! A pipeline run performs one bulk read before scraping and one bulk write
//! after scoring. Rows are written with primary-key upserts, so concurrent
//! runs against the same file rely on the engine's per-row atomicity.

mod migrations;

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use oppscout_shared::{Opportunity, Result, ScoutError, SeenEntry};
use tracing::instrument;

/// Outcome of a bulk [`DedupStore::upsert_new`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows inserted or refreshed.
    pub written: usize,
    /// Records not eligible (not new, or no URL).
    pub skipped: usize,
    /// Rows whose write failed; the rest of the batch still ran.
    pub failed: usize,
}

/// Owned handle on the dedup database.
pub struct DedupStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore").finish_non_exhaustive()
    }
}

fn storage_err(e: impl std::fmt::Display) -> ScoutError {
    ScoutError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so lexical order matches time order.
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ScoutError::Storage(format!("bad timestamp '{raw}': {e}")))
}

impl DedupStore {
    /// Open or create the ledger at `path` and apply pending migrations.
    ///
    /// Safe to call repeatedly against the same file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ScoutError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ScoutError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Every known URL.
    ///
    /// Callers decide how to degrade; the pipeline treats an `Err` as an empty ledger.
    #[instrument(skip_all)]
    pub async fn try_load_seen_urls(&self) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT url FROM seen_opportunities", params![])
            .await
            .map_err(storage_err)?;

        let mut urls = HashSet::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            urls.insert(row.get::<String>(0).map_err(storage_err)?);
        }
        tracing::debug!(count = urls.len(), "loaded seen urls");
        Ok(urls)
    }

    pub async fn get_entry(&self, url: &str) -> Result<Option<SeenEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT url, date_seen, source, last_updated
                 FROM seen_opportunities WHERE url = ?1",
                params![url],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let first_seen = row.get::<String>(1).map_err(storage_err)?;
                let last_updated = row.get::<String>(3).map_err(storage_err)?;
                Ok(Some(SeenEntry {
                    url: row.get::<String>(0).map_err(storage_err)?,
                    first_seen: parse_ts(&first_seen)?,
                    source: row.get::<String>(2).map_err(storage_err)?,
                    last_updated: parse_ts(&last_updated)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Number of ledger rows.
    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM seen_opportunities", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => row.get::<u64>(0).map_err(storage_err),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record a sighting of `url` at `at`.
    ///
    /// First sighting sets `date_seen`; later ones only refresh `last_updated`.
    pub async fn upsert_seen_at(&self, url: &str, source: &str, at: DateTime<Utc>) -> Result<()> {
        let ts = format_ts(at);
        self.conn
            .execute(
                "INSERT INTO seen_opportunities (url, date_seen, source, last_updated)
                 VALUES (?1, ?2, ?3, ?2)
                 ON CONFLICT(url) DO UPDATE SET last_updated = excluded.last_updated",
                params![url, ts.as_str(), source],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Write every `is_new` record that has a URL, each row independently.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn upsert_new(&self, records: &[Opportunity]) -> UpsertReport {
        let now = Utc::now();
        let mut report = UpsertReport::default();

        for opp in records {
            if !opp.is_new || !opp.has_identifier() {
                report.skipped += 1;
                continue;
            }
            match self.upsert_seen_at(&opp.url, &opp.source, now).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(url = %opp.url, error = %e, "failed to record seen opportunity");
                }
            }
        }

        tracing::info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failed,
            "dedup ledger updated"
        );
        report
    }

    /// Refresh `last_updated` for records already in the ledger (`is_new == false`).
    pub async fn refresh_resighted(&self, records: &[Opportunity]) -> UpsertReport {
        let now = Utc::now();
        let mut report = UpsertReport::default();

        for opp in records {
            if opp.is_new || !opp.has_identifier() {
                report.skipped += 1;
                continue;
            }
            match self.upsert_seen_at(&opp.url, &opp.source, now).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(url = %opp.url, error = %e, "failed to refresh seen opportunity");
                }
            }
        }
        report
    }

    /// Delete rows first seen more than `retention_days` ago. Returns the count removed.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = format_ts(Utc::now() - Duration::days(i64::from(retention_days)));
        let deleted = self
            .conn
            .execute(
                "DELETE FROM seen_opportunities WHERE date_seen < ?1",
                params![cutoff.as_str()],
            )
            .await
            .map_err(storage_err)?;

        tracing::info!(deleted, retention_days, "retention sweep finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppscout_shared::RawOpportunity;
    use uuid::Uuid;

    async fn test_store() -> DedupStore {
        let tmp = std::env::temp_dir().join(format!("oppscout_test_{}.db", Uuid::now_v7()));
        DedupStore::open(&tmp).await.expect("open test db")
    }

    fn opp(url: &str, is_new: bool) -> Opportunity {
        let mut o = Opportunity::from_raw(
            RawOpportunity {
                title: Some(format!("Title for {url}")),
                url: Some(url.to_string()),
                ..Default::default()
            },
            "test-source",
        );
        o.is_new = is_new;
        o
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(store.get_schema_version().await, 1);
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn idempotent_open() {
        let tmp = std::env::temp_dir().join(format!("oppscout_test_{}.db", Uuid::now_v7()));
        let s1 = DedupStore::open(&tmp).await.expect("first open");
        s1.upsert_seen_at("a", "src", Utc::now()).await.expect("upsert");
        drop(s1);

        let s2 = DedupStore::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
        assert_eq!(s2.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn upsert_new_writes_only_new_records_with_urls() {
        let store = test_store().await;
        let records = vec![opp("a", true), opp("b", false), opp("", true)];

        let report = store.upsert_new(&records).await;
        assert_eq!(
            report,
            UpsertReport {
                written: 1,
                skipped: 2,
                failed: 0
            }
        );

        let seen = store.try_load_seen_urls().await.expect("load");
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("a"));
    }

    #[tokio::test]
    async fn resighting_refreshes_last_updated_only() {
        let store = test_store().await;
        let first = Utc::now() - Duration::days(3);
        store
            .upsert_seen_at("a", "first-source", first)
            .await
            .expect("first");
        store
            .upsert_seen_at("a", "second-source", Utc::now())
            .await
            .expect("second");

        assert_eq!(store.count().await.expect("count"), 1);
        let entry = store.get_entry("a").await.expect("get").expect("exists");
        assert_eq!(entry.source, "first-source");
        assert_eq!(format_ts(entry.first_seen), format_ts(first));
        assert!(entry.last_updated > entry.first_seen);
    }

    #[tokio::test]
    async fn refresh_touches_only_known_records() {
        let store = test_store().await;
        let first = Utc::now() - Duration::days(2);
        store.upsert_seen_at("a", "src", first).await.expect("seed");

        let report = store
            .refresh_resighted(&[opp("a", false), opp("b", true)])
            .await;
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.count().await.expect("count"), 1);

        let entry = store.get_entry("a").await.expect("get").expect("exists");
        assert_eq!(format_ts(entry.first_seen), format_ts(first));
        assert!(entry.last_updated > first);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let store = test_store().await;
        store
            .upsert_seen_at("old", "src", Utc::now() - Duration::days(40))
            .await
            .expect("old");
        store
            .upsert_seen_at("recent", "src", Utc::now() - Duration::days(10))
            .await
            .expect("recent");

        let deleted = store.cleanup(30).await.expect("cleanup");
        assert_eq!(deleted, 1);

        let seen = store.try_load_seen_urls().await.expect("load");
        assert!(!seen.contains("old"));
        assert!(seen.contains("recent"));
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let store = test_store().await;
        assert!(store.get_entry("nope").await.expect("get").is_none());
        assert!(store.try_load_seen_urls().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn unreadable_ledger_reports_storage_error() {
        let store = test_store().await;
        store
            .conn
            .execute_batch("DROP TABLE seen_opportunities")
            .await
            .expect("drop");

        let err = store.try_load_seen_urls().await.expect_err("read fails");
        assert!(matches!(err, ScoutError::Storage(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn failing_row_does_not_stop_the_rest() {
        let store = test_store().await;
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON seen_opportunities
                 WHEN NEW.url = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .await
            .expect("trigger");

        let records = vec![opp("a", true), opp("bad", true), opp("c", true)];
        let report = store.upsert_new(&records).await;
        assert_eq!(
            report,
            UpsertReport {
                written: 2,
                skipped: 0,
                failed: 1
            }
        );

        let seen = store.try_load_seen_urls().await.expect("load");
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("a"));
        assert!(seen.contains("c"));
        assert!(!seen.contains("bad"));
    }
}
