//! Store trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;

use super::error::StoreError;
use super::schema;
use super::types::{LocalRecord, Payload, RecordKey, RecordKind, StoreSummary, TimelineKind};

/// Trait for local-graph store operations.
///
/// This trait is object-safe and can be used with `Arc<dyn Store>` for
/// shared access across async tasks. Reconciliation batches stage their
/// writes and flush them through `apply_records`, which owns the SQL
/// transaction; the monotonic `updated_at` guard lives in the upsert itself
/// so concurrent batches interleave without locking.
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a single record by its natural key.
    async fn get_record(
        &self,
        domain: &str,
        key: &RecordKey,
    ) -> Result<Option<LocalRecord>, StoreError>;

    /// Batch-fetch every record matching the given keys.
    ///
    /// Used at reconciliation start to pre-warm the persist cache with one
    /// query per entity kind instead of one per entity.
    async fn get_records(
        &self,
        domain: &str,
        keys: &HashSet<RecordKey>,
    ) -> Result<Vec<LocalRecord>, StoreError>;

    /// Upsert a batch of records inside a single transaction.
    ///
    /// An existing row is only overwritten when the incoming `updated_at`
    /// is strictly newer; stale writes are silently dropped. `created_at`
    /// is preserved on merge.
    async fn apply_records(&self, records: &[LocalRecord]) -> Result<(), StoreError>;

    /// Fetch records of one kind by remote id, unordered.
    ///
    /// Callers re-order the result to match their own id list; ids with no
    /// record yet are simply absent.
    async fn records_by_ids(
        &self,
        domain: &str,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<Vec<LocalRecord>, StoreError>;

    /// Status ids currently members of the given timeline.
    async fn membership_ids(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
    ) -> Result<HashSet<String>, StoreError>;

    /// Insert membership markers for statuses not yet in the timeline.
    /// Existing markers (and their `has_more` flags) are left untouched.
    async fn ensure_memberships(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Set the `has_more` flag on a membership marker. A missing marker is
    /// a no-op (the referenced status may have been evicted server-side).
    async fn set_has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_id: &str,
        has_more: bool,
    ) -> Result<(), StoreError>;

    /// Read the `has_more` flag for one membership marker.
    async fn has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_id: &str,
    ) -> Result<Option<bool>, StoreError>;

    /// Whether any membership in the timeline is flagged `has_more`.
    async fn any_has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
    ) -> Result<bool, StoreError>;

    /// Get a summary of the store contents for one domain.
    async fn summary(&self, domain: &str) -> Result<StoreSummary, StoreError>;

    /// Subscribe to change notifications. A message is broadcast after any
    /// mutation commits; receivers coalesce via their own debounce.
    fn subscribe_changes(&self) -> broadcast::Receiver<()>;
}

/// SQLite implementation of the store.
pub struct SqliteStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    changes: broadcast::Sender<()>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL for concurrent readers while a batch commits
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await??;

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            changes,
        })
    }

    /// Open an in-memory database (for tests and previews).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            changes,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Query(e.to_string()))
    }

    fn notify_changed(&self) {
        // No receivers is fine — nobody is projecting right now.
        let _ = self.changes.send(());
    }
}

const RECORD_COLUMNS: &str = "remote_id, payload, author_id, repost_of_id, quote_of_id, \
     subject_id, created_at, updated_at";

/// Raw row shape, converted to `LocalRecord` outside the rusqlite closure so
/// payload JSON errors surface as `StoreError::Payload`.
type RawRecord = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn raw_to_record(domain: &str, raw: RawRecord) -> Result<LocalRecord, StoreError> {
    let (remote_id, payload_json, author_id, repost_of_id, quote_of_id, subject_id, created, updated) =
        raw;
    let payload: Payload = serde_json::from_str(&payload_json)?;
    Ok(LocalRecord {
        domain: domain.to_string(),
        remote_id,
        payload,
        author_id,
        repost_of_id,
        quote_of_id,
        subject_id,
        created_at: millis_to_datetime(created),
        updated_at: millis_to_datetime(updated),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Build an `IN (?, ?, ...)` placeholder list.
fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_record(
        &self,
        domain: &str,
        key: &RecordKey,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let raw: Option<RawRecord> = {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE domain = ?1 AND kind = ?2 AND remote_id = ?3"
                ),
                rusqlite::params![domain, key.kind.as_str(), key.remote_id],
                row_to_raw,
            )
            .optional()
            .map_err(StoreError::query)?
        };

        raw.map(|r| raw_to_record(domain, r)).transpose()
    }

    async fn get_records(
        &self,
        domain: &str,
        keys: &HashSet<RecordKey>,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // Group by kind — the key is a (kind, id) pair, and SQLite has no
        // tuple IN. One query per kind present in the batch.
        let mut by_kind: std::collections::HashMap<RecordKind, Vec<&str>> =
            std::collections::HashMap::new();
        for key in keys {
            by_kind.entry(key.kind).or_default().push(&key.remote_id);
        }

        let mut raw_rows: Vec<RawRecord> = Vec::new();
        {
            let conn = self.lock()?;
            for (kind, ids) in by_kind {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE domain = ? AND kind = ? AND remote_id IN ({})",
                    placeholders(ids.len())
                );
                let mut stmt = conn.prepare(&sql).map_err(StoreError::query)?;
                let params = std::iter::once(domain)
                    .chain(std::iter::once(kind.as_str()))
                    .chain(ids.iter().copied());
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), row_to_raw)
                    .map_err(StoreError::query)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::query)?;
                raw_rows.extend(rows);
            }
        }

        raw_rows
            .into_iter()
            .map(|r| raw_to_record(domain, r))
            .collect()
    }

    async fn apply_records(&self, records: &[LocalRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        {
            let conn = self.lock()?;

            conn.execute("BEGIN TRANSACTION", [])
                .map_err(StoreError::query)?;

            let result = (|| {
                let mut stmt = conn
                    .prepare_cached(
                        r#"
                        INSERT INTO records (domain, kind, remote_id, payload, author_id,
                            repost_of_id, quote_of_id, subject_id, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                        ON CONFLICT(domain, kind, remote_id) DO UPDATE SET
                            payload = excluded.payload,
                            author_id = excluded.author_id,
                            repost_of_id = excluded.repost_of_id,
                            quote_of_id = excluded.quote_of_id,
                            subject_id = excluded.subject_id,
                            updated_at = excluded.updated_at
                        WHERE excluded.updated_at > records.updated_at
                        "#,
                    )
                    .map_err(StoreError::query)?;

                for record in records {
                    let payload_json = serde_json::to_string(&record.payload)?;
                    stmt.execute(rusqlite::params![
                        record.domain,
                        record.kind().as_str(),
                        record.remote_id,
                        payload_json,
                        record.author_id,
                        record.repost_of_id,
                        record.quote_of_id,
                        record.subject_id,
                        record.created_at.timestamp_millis(),
                        record.updated_at.timestamp_millis(),
                    ])
                    .map_err(StoreError::query)?;
                }

                Ok::<_, StoreError>(())
            })();

            match result {
                Ok(()) => {
                    conn.execute("COMMIT", []).map_err(StoreError::query)?;
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
        }

        self.notify_changed();
        Ok(())
    }

    async fn records_by_ids(
        &self,
        domain: &str,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<Vec<LocalRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw_rows: Vec<RawRecord> = {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM records \
                 WHERE domain = ? AND kind = ? AND remote_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(StoreError::query)?;
            let params = std::iter::once(domain)
                .chain(std::iter::once(kind.as_str()))
                .chain(ids.iter().map(String::as_str));
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), row_to_raw)
                .map_err(StoreError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::query)?;
            rows
        };

        raw_rows
            .into_iter()
            .map(|r| raw_to_record(domain, r))
            .collect()
    }

    async fn membership_ids(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
    ) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT status_id FROM timeline_memberships \
                 WHERE domain = ?1 AND account_id = ?2 AND timeline = ?3",
            )
            .map_err(StoreError::query)?;

        let ids = stmt
            .query_map(
                rusqlite::params![domain, account_id, timeline.as_str()],
                |row| row.get::<_, String>(0),
            )
            .map_err(StoreError::query)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(ids)
    }

    async fn ensure_memberships(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_ids: &[String],
    ) -> Result<(), StoreError> {
        if status_ids.is_empty() {
            return Ok(());
        }

        {
            let conn = self.lock()?;

            conn.execute("BEGIN TRANSACTION", [])
                .map_err(StoreError::query)?;

            let result = (|| {
                let mut stmt = conn
                    .prepare_cached(
                        "INSERT OR IGNORE INTO timeline_memberships \
                         (domain, account_id, timeline, status_id, has_more) \
                         VALUES (?1, ?2, ?3, ?4, 0)",
                    )
                    .map_err(StoreError::query)?;

                for status_id in status_ids {
                    stmt.execute(rusqlite::params![
                        domain,
                        account_id,
                        timeline.as_str(),
                        status_id,
                    ])
                    .map_err(StoreError::query)?;
                }

                Ok::<_, StoreError>(())
            })();

            match result {
                Ok(()) => {
                    conn.execute("COMMIT", []).map_err(StoreError::query)?;
                }
                Err(e) => {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e);
                }
            }
        }

        self.notify_changed();
        Ok(())
    }

    async fn set_has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_id: &str,
        has_more: bool,
    ) -> Result<(), StoreError> {
        let updated = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE timeline_memberships SET has_more = ?1 \
                 WHERE domain = ?2 AND account_id = ?3 AND timeline = ?4 AND status_id = ?5",
                rusqlite::params![
                    has_more as i64,
                    domain,
                    account_id,
                    timeline.as_str(),
                    status_id,
                ],
            )
            .map_err(StoreError::query)?
        };

        if updated > 0 {
            self.notify_changed();
        }
        Ok(())
    }

    async fn has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
        status_id: &str,
    ) -> Result<Option<bool>, StoreError> {
        let conn = self.lock()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT has_more FROM timeline_memberships \
                 WHERE domain = ?1 AND account_id = ?2 AND timeline = ?3 AND status_id = ?4",
                rusqlite::params![domain, account_id, timeline.as_str(), status_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::query)?;

        Ok(flag.map(|v| v != 0))
    }

    async fn any_has_more(
        &self,
        domain: &str,
        account_id: &str,
        timeline: TimelineKind,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM timeline_memberships \
                 WHERE domain = ?1 AND account_id = ?2 AND timeline = ?3 AND has_more = 1",
                rusqlite::params![domain, account_id, timeline.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::query)?;

        Ok(count > 0)
    }

    async fn summary(&self, domain: &str) -> Result<StoreSummary, StoreError> {
        let conn = self.lock()?;

        let total_records: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE domain = ?1",
                [domain],
                |row| row.get::<_, i64>(0),
            )
            .map_err(StoreError::query)? as u64;

        let statuses: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE domain = ?1 AND kind = 'status'",
                [domain],
                |row| row.get::<_, i64>(0),
            )
            .map_err(StoreError::query)? as u64;

        let users: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE domain = ?1 AND kind = 'user'",
                [domain],
                |row| row.get::<_, i64>(0),
            )
            .map_err(StoreError::query)? as u64;

        let timeline_entries: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM timeline_memberships WHERE domain = ?1",
                [domain],
                |row| row.get::<_, i64>(0),
            )
            .map_err(StoreError::query)? as u64;

        Ok(StoreSummary {
            total_records,
            statuses,
            users,
            timeline_entries,
        })
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}
