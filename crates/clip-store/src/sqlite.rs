//! SQLite-based storage implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use clip_core::{
    canonicalize_url, now_millis, ClipError, CommitOutcome, ContradictionDetail,
    ContradictionRecord, ContradictionSide, DatabaseConfig, FileCommit, FileHandle, Fingerprint,
    PairKey, Result, RunReport, Segment, SegmentDraft, SegmentId, SourceHandle, Stage, Store,
    StoreStats, WorkUnit,
};

use crate::migrate::{current_version, migrate};
use crate::resolver;
use crate::schema::migrations;

/// SQLite-based store implementation.
///
/// One connection behind a blocking Mutex. Writes run in short IMMEDIATE
/// transactions and are retried with linear backoff while the database is
/// busy or locked by another process.
pub struct SqliteStore {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,

    /// Attempts per write before a busy database is reported.
    write_retries: u32,

    /// Backoff step; attempt `n` sleeps `n * retry_backoff`.
    retry_backoff: Duration,
}

impl SqliteStore {
    /// Open or create a database at the given path with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = DatabaseConfig {
            path: path.as_ref().to_path_buf(),
            ..DatabaseConfig::default()
        };
        Self::open_with_config(&config)
    }

    /// Open or create the database described by `config`.
    pub fn open_with_config(config: &DatabaseConfig) -> Result<Self> {
        let path = config.path.as_path();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ClipError::storage(format!("Failed to open database: {}", e)))?;

        Self::init(conn, config, path)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ClipError::storage(format!("Failed to open in-memory database: {}", e))
        })?;

        Self::init(conn, &DatabaseConfig::default(), Path::new(":memory:"))
    }

    /// Configure the connection and bring the schema up to date.
    fn init(mut conn: Connection, config: &DatabaseConfig, path: &Path) -> Result<Self> {
        Self::configure_connection(&conn, config)?;

        let version = migrate(&mut conn, migrations())?;

        info!(version, "Database opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            write_retries: config.write_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Configure SQLite connection for concurrent writers.
    fn configure_connection(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
        let journal_mode = if config.wal_mode { "WAL" } else { "DELETE" };
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = {};
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = {};
            PRAGMA busy_timeout = {};
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
            journal_mode, config.cache_size, config.busy_timeout_ms
        ))
        .map_err(|e| ClipError::storage(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    /// Execute a blocking operation on the connection.
    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ClipError::storage(e.to_string()))?;
        f(&conn)
    }

    /// Execute a mutable blocking operation on the connection.
    fn with_conn_mut<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ClipError::storage(e.to_string()))?;
        f(&mut conn)
    }

    /// Run a write, retrying while the database is busy or locked.
    async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: Fn(&mut Connection) -> Result<R> + Send,
        R: Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.with_conn_mut(&f);
            match result {
                Err(e) if e.is_retryable() && attempt < self.write_retries => {
                    warn!(attempt, "Database busy, retrying write: {}", e);
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn schema_version(&self) -> Result<u32> {
        self.with_conn(current_version)
    }

    // Source registry

    async fn register_source(&self, url: &str) -> Result<SourceHandle> {
        let canonical = canonicalize_url(url)?;

        self.write(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO sources (canonical_url, discovered_at) VALUES (?1, ?2)",
                    params![canonical, now_millis() as i64],
                )
                .map_err(db_err)?;

            let source = conn
                .query_row(
                    r#"
                    SELECT id, canonical_url, file_fingerprint, discovered_at
                    FROM sources WHERE canonical_url = ?1
                    "#,
                    params![canonical],
                    Self::row_to_source,
                )
                .map_err(db_err)?;

            if inserted > 0 {
                debug!(source_id = source.id, "Registered source: {}", canonical);
            }
            Ok(source)
        })
        .await
    }

    async fn get_source(&self, id: i64) -> Result<Option<SourceHandle>> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT id, canonical_url, file_fingerprint, discovered_at
                FROM sources WHERE id = ?1
                "#,
                params![id],
                Self::row_to_source,
            )
            .optional()
            .map_err(db_err)
        })
    }

    async fn list_sources(&self) -> Result<Vec<SourceHandle>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, canonical_url, file_fingerprint, discovered_at
                    FROM sources ORDER BY id
                    "#,
                )
                .map_err(db_err)?;

            let sources = stmt
                .query_map([], Self::row_to_source)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(sources)
        })
    }

    async fn link_source(&self, source_id: i64, file: &Fingerprint) -> Result<CommitOutcome> {
        let hex = file.to_hex();
        self.write(|conn| {
            let updated = conn
                .execute(
                    r#"
                    UPDATE sources SET file_fingerprint = ?2, linked_at = ?3
                    WHERE id = ?1 AND file_fingerprint IS NULL
                    "#,
                    params![source_id, hex, now_millis() as i64],
                )
                .map_err(db_err)?;

            if updated > 0 {
                debug!(source_id, file = %hex, "Linked source to file");
                return Ok(CommitOutcome::Created);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM sources WHERE id = ?1",
                    params![source_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            match exists {
                Some(_) => Ok(CommitOutcome::Duplicate),
                None => Err(ClipError::invalid_input(format!(
                    "unknown source id {}",
                    source_id
                ))),
            }
        })
        .await
    }

    // Content ledger

    async fn insert_file(&self, file: &FileHandle) -> Result<FileCommit> {
        let hex = file.fingerprint.to_hex();
        let stored_path = file.stored_path.to_string_lossy().into_owned();

        self.write(|conn| {
            let result = conn.execute(
                r#"
                INSERT INTO files (fingerprint, size_bytes, stored_path, media_id, first_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    hex,
                    file.size_bytes as i64,
                    stored_path,
                    file.media_id,
                    file.first_seen_at as i64,
                ],
            );

            match result {
                Ok(_) => {
                    debug!(file = %hex, "Inserted file");
                    Ok(FileCommit {
                        handle: file.clone(),
                        created: true,
                    })
                }
                Err(e) if is_unique_violation(&e) => {
                    let existing = Self::file_by_hex(conn, &hex)?.ok_or_else(|| {
                        ClipError::internal(format!("file {} vanished after conflict", hex))
                    })?;
                    Ok(FileCommit {
                        handle: existing,
                        created: false,
                    })
                }
                Err(e) => Err(db_err(e)),
            }
        })
        .await
    }

    async fn get_file(&self, fingerprint: &Fingerprint) -> Result<Option<FileHandle>> {
        let hex = fingerprint.to_hex();
        self.with_conn(|conn| Self::file_by_hex(conn, &hex))
    }

    // Segment store

    async fn insert_transcript(
        &self,
        file: &Fingerprint,
        segments: &[SegmentDraft],
        model: &str,
    ) -> Result<CommitOutcome> {
        for (i, seg) in segments.iter().enumerate() {
            if !seg.start_ts.is_finite() || !seg.end_ts.is_finite() || seg.end_ts < seg.start_ts {
                return Err(ClipError::invalid_input(format!(
                    "segment {} has invalid range {}..{}",
                    i, seg.start_ts, seg.end_ts
                )));
            }
        }

        let hex = file.to_hex();
        self.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let marker = tx.execute(
                r#"
                INSERT INTO transcriptions (file_fingerprint, segment_count, model, transcribed_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![hex, segments.len() as i64, model, now_millis() as i64],
            );
            match marker {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(CommitOutcome::Duplicate),
                Err(e) => return Err(db_err(e)),
            }

            {
                let mut stmt = tx
                    .prepare(
                        r#"
                        INSERT INTO segments (file_fingerprint, sequence_index, start_ts, end_ts, text)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                    )
                    .map_err(db_err)?;

                for (i, seg) in segments.iter().enumerate() {
                    stmt.execute(params![hex, i as i64, seg.start_ts, seg.end_ts, seg.text])
                        .map_err(db_err)?;
                }
            }

            tx.commit().map_err(db_err)?;
            debug!(file = %hex, segments = segments.len(), "Inserted transcript");
            Ok(CommitOutcome::Created)
        })
        .await
    }

    async fn segments_for_file(&self, file: &Fingerprint) -> Result<Vec<Segment>> {
        let hex = file.to_hex();
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, file_fingerprint, sequence_index, start_ts, end_ts, text
                    FROM segments WHERE file_fingerprint = ?1
                    ORDER BY sequence_index
                    "#,
                )
                .map_err(db_err)?;

            let segments = stmt
                .query_map(params![hex], Self::row_to_segment)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(segments)
        })
    }

    // Embedding store

    async fn insert_embedding(
        &self,
        segment_id: SegmentId,
        vector: &[f32],
        model: &str,
    ) -> Result<CommitOutcome> {
        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            return Err(ClipError::invalid_input(format!(
                "embedding for segment {} is empty or non-finite",
                segment_id
            )));
        }

        let bytes = Self::vec_to_bytes(vector);
        self.write(|conn| {
            let result = conn.execute(
                r#"
                INSERT INTO embeddings (segment_id, dimension, vector, model, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    segment_id,
                    vector.len() as i64,
                    bytes,
                    model,
                    now_millis() as i64
                ],
            );

            match result {
                Ok(_) => Ok(CommitOutcome::Created),
                Err(e) if is_unique_violation(&e) => Ok(CommitOutcome::Duplicate),
                Err(e) => Err(db_err(e)),
            }
        })
        .await
    }

    async fn get_embedding(&self, segment_id: SegmentId) -> Result<Option<Vec<f32>>> {
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT vector FROM embeddings WHERE segment_id = ?1",
                    params![segment_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            Ok(bytes.map(|b| Self::bytes_to_vec(&b)))
        })
    }

    // Contradiction ledger

    async fn insert_contradiction(&self, pair: PairKey, score: f32) -> Result<CommitOutcome> {
        if !score.is_finite() {
            return Err(ClipError::invalid_input(format!(
                "non-finite score for pair {}",
                pair
            )));
        }

        self.write(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let file_of = |id: SegmentId| -> Result<String> {
                tx.query_row(
                    "SELECT file_fingerprint FROM segments WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| ClipError::invalid_input(format!("unknown segment {}", id)))
            };

            let file_a = file_of(pair.a())?;
            let file_b = file_of(pair.b())?;
            if file_a == file_b {
                return Err(ClipError::invalid_input(format!(
                    "segments {} and {} belong to the same file",
                    pair.a(),
                    pair.b()
                )));
            }
            let (lo, hi) = if file_a < file_b {
                (file_a, file_b)
            } else {
                (file_b, file_a)
            };

            let result = tx.execute(
                r#"
                INSERT INTO contradictions
                    (segment_a_id, segment_b_id, score, detected_at, file_lo, file_hi)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    pair.a(),
                    pair.b(),
                    score as f64,
                    now_millis() as i64,
                    lo,
                    hi
                ],
            );
            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Ok(CommitOutcome::Duplicate),
                Err(e) => return Err(db_err(e)),
            }

            tx.commit().map_err(db_err)?;
            Ok(CommitOutcome::Created)
        })
        .await
    }

    async fn get_contradiction(&self, pair: PairKey) -> Result<Option<ContradictionRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT segment_a_id, segment_b_id, score, detected_at
                FROM contradictions WHERE segment_a_id = ?1 AND segment_b_id = ?2
                "#,
                params![pair.a(), pair.b()],
                Self::row_to_contradiction,
            )
            .optional()
            .map_err(db_err)
        })
    }

    async fn settle_comparisons(&self) -> Result<u64> {
        let settled = self
            .write(|conn| resolver::settle_comparisons(conn, now_millis()))
            .await?;
        if settled > 0 {
            debug!(settled, "Settled file comparisons");
        }
        Ok(settled)
    }

    // Stage resolver

    async fn pending(&self, stage: Stage) -> Result<Vec<WorkUnit>> {
        self.with_conn(|conn| resolver::pending(conn, stage))
    }

    async fn is_complete(&self, unit: &WorkUnit) -> Result<bool> {
        self.with_conn(|conn| resolver::is_complete(conn, unit))
    }

    // Selection & ordering

    async fn select_top_above(
        &self,
        n: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<ContradictionRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let min_score = min_score.map(f64::from);

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT segment_a_id, segment_b_id, score, detected_at
                    FROM contradictions
                    WHERE ?1 IS NULL OR score > ?1
                    ORDER BY score DESC, segment_a_id ASC, segment_b_id ASC
                    LIMIT ?2
                    "#,
                )
                .map_err(db_err)?;

            let records = stmt
                .query_map(params![min_score, limit], Self::row_to_contradiction)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(records)
        })
    }

    async fn contradiction_details(
        &self,
        records: &[ContradictionRecord],
    ) -> Result<Vec<ContradictionDetail>> {
        self.with_conn(|conn| {
            let side = |id: SegmentId| -> Result<ContradictionSide> {
                let segment = Self::segment_by_id(conn, id)?
                    .ok_or_else(|| ClipError::internal(format!("segment {} missing", id)))?;
                let file = Self::file_by_hex(conn, &segment.file.to_hex())?.ok_or_else(|| {
                    ClipError::internal(format!("file {} missing", segment.file))
                })?;
                Ok(ContradictionSide { segment, file })
            };

            records
                .iter()
                .map(|record| {
                    Ok(ContradictionDetail {
                        record: record.clone(),
                        a: side(record.pair.a())?,
                        b: side(record.pair.b())?,
                    })
                })
                .collect()
        })
    }

    // Bookkeeping

    async fn record_run(&self, report: &RunReport) -> Result<()> {
        let failures = serde_json::to_string(&report.failed)?;
        let run_id = report.run_id.to_string();

        self.write(|conn| {
            conn.execute(
                r#"
                INSERT INTO stage_runs (run_id, stage, processed, skipped, failed, interrupted,
                                        started_at, finished_at, failures_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    run_id,
                    report.stage.as_str(),
                    report.processed as i64,
                    report.skipped as i64,
                    report.failed_count() as i64,
                    report.interrupted,
                    report.started_at as i64,
                    report.finished_at as i64,
                    failures,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(db_err)
            };

            Ok(StoreStats {
                schema_version: current_version(conn)?,
                sources: count("SELECT COUNT(*) FROM sources")?,
                unfetched_sources: count(
                    "SELECT COUNT(*) FROM sources WHERE file_fingerprint IS NULL",
                )?,
                files: count("SELECT COUNT(*) FROM files")?,
                transcribed_files: count("SELECT COUNT(*) FROM transcriptions")?,
                segments: count("SELECT COUNT(*) FROM segments")?,
                embeddings: count("SELECT COUNT(*) FROM embeddings")?,
                contradictions: count("SELECT COUNT(*) FROM contradictions")?,
                settled_file_pairs: count("SELECT COUNT(*) FROM file_comparisons")?,
                storage_bytes: count("SELECT COALESCE(SUM(size_bytes), 0) FROM files")?,
            })
        })
    }
}

// Helper methods
impl SqliteStore {
    fn file_by_hex(conn: &Connection, hex: &str) -> Result<Option<FileHandle>> {
        conn.query_row(
            r#"
            SELECT fingerprint, size_bytes, stored_path, media_id, first_seen_at
            FROM files WHERE fingerprint = ?1
            "#,
            params![hex],
            Self::row_to_file,
        )
        .optional()
        .map_err(db_err)
    }

    fn segment_by_id(conn: &Connection, id: SegmentId) -> Result<Option<Segment>> {
        conn.query_row(
            r#"
            SELECT id, file_fingerprint, sequence_index, start_ts, end_ts, text
            FROM segments WHERE id = ?1
            "#,
            params![id],
            Self::row_to_segment,
        )
        .optional()
        .map_err(db_err)
    }

    /// Convert a row to a SourceHandle.
    fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceHandle> {
        let file: Option<String> = row.get(2)?;
        Ok(SourceHandle {
            id: row.get(0)?,
            canonical_url: row.get(1)?,
            file: file.map(|hex| parse_fingerprint(2, &hex)).transpose()?,
            discovered_at: row.get::<_, i64>(3)? as u64,
        })
    }

    /// Convert a row to a FileHandle.
    fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileHandle> {
        let hex: String = row.get(0)?;
        let stored_path: String = row.get(2)?;
        Ok(FileHandle {
            fingerprint: parse_fingerprint(0, &hex)?,
            size_bytes: row.get::<_, i64>(1)? as u64,
            stored_path: PathBuf::from(stored_path),
            media_id: row.get(3)?,
            first_seen_at: row.get::<_, i64>(4)? as u64,
        })
    }

    /// Convert a row to a Segment.
    fn row_to_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
        let hex: String = row.get(1)?;
        Ok(Segment {
            id: row.get(0)?,
            file: parse_fingerprint(1, &hex)?,
            sequence_index: row.get::<_, i64>(2)? as u32,
            start_ts: row.get(3)?,
            end_ts: row.get(4)?,
            text: row.get(5)?,
        })
    }

    /// Convert a row to a ContradictionRecord.
    fn row_to_contradiction(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContradictionRecord> {
        let a: i64 = row.get(0)?;
        let b: i64 = row.get(1)?;
        let pair = PairKey::new(a, b).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Integer,
                Box::new(ClipError::internal(format!("degenerate pair {}-{}", a, b))),
            )
        })?;
        Ok(ContradictionRecord {
            pair,
            score: row.get::<_, f64>(2)? as f32,
            detected_at: row.get::<_, i64>(3)? as u64,
        })
    }

    /// Convert f32 vector to bytes (little-endian).
    fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Convert little-endian bytes back to an f32 vector.
    fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

fn parse_fingerprint(idx: usize, hex: &str) -> rusqlite::Result<Fingerprint> {
    Fingerprint::from_hex(hex)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// True when the error is a UNIQUE or PRIMARY KEY violation.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Classify a rusqlite error into the pipeline taxonomy.
pub(crate) fn db_err(e: rusqlite::Error) -> ClipError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                ClipError::storage_busy(e.to_string())
            }
            ErrorCode::ConstraintViolation if is_unique_violation(&e) => {
                ClipError::duplicate("row", e.to_string())
            }
            ErrorCode::ConstraintViolation => ClipError::invalid_input(e.to_string()),
            _ => ClipError::storage(e.to_string()),
        },
        _ => ClipError::storage(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(tag: &str) -> FileHandle {
        let fingerprint = Fingerprint::of_bytes(tag.as_bytes());
        FileHandle {
            fingerprint,
            size_bytes: tag.len() as u64,
            stored_path: PathBuf::from(format!("/media/{}.mp4", fingerprint)),
            media_id: None,
            first_seen_at: now_millis(),
        }
    }

    fn drafts(texts: &[&str]) -> Vec<SegmentDraft> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| SegmentDraft {
                start_ts: i as f64 * 5.0,
                end_ts: i as f64 * 5.0 + 4.0,
                text: t.to_string(),
            })
            .collect()
    }

    async fn transcribed(store: &SqliteStore, tag: &str, texts: &[&str]) -> Vec<Segment> {
        let f = file(tag);
        store.insert_file(&f).await.unwrap();
        store
            .insert_transcript(&f.fingerprint, &drafts(texts), "test")
            .await
            .unwrap();
        store.segments_for_file(&f.fingerprint).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.schema_version().await.unwrap(), crate::SCHEMA_VERSION);
        assert!(store.list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_source_is_idempotent() {
        let store = SqliteStore::open_memory().unwrap();

        let a = store
            .register_source("https://Example.com/watch?v=1#t=3")
            .await
            .unwrap();
        let b = store
            .register_source("https://example.com/watch?v=1")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_sources().await.unwrap().len(), 1);

        let err = store.register_source("not a url").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_URL");
    }

    #[tokio::test]
    async fn test_link_source_once() {
        let store = SqliteStore::open_memory().unwrap();
        let source = store.register_source("https://example.com/a").await.unwrap();
        let f = file("a");
        store.insert_file(&f).await.unwrap();

        assert_eq!(
            store.link_source(source.id, &f.fingerprint).await.unwrap(),
            CommitOutcome::Created
        );
        assert_eq!(
            store.link_source(source.id, &f.fingerprint).await.unwrap(),
            CommitOutcome::Duplicate
        );
        let linked = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(linked.file, Some(f.fingerprint));

        assert!(store.link_source(999, &f.fingerprint).await.is_err());
    }

    #[tokio::test]
    async fn test_insert_file_duplicate_returns_existing() {
        let store = SqliteStore::open_memory().unwrap();
        let first = file("same bytes");
        let mut second = first.clone();
        second.stored_path = PathBuf::from("/elsewhere/copy.mp4");

        assert!(store.insert_file(&first).await.unwrap().created);
        let commit = store.insert_file(&second).await.unwrap();
        assert!(!commit.created);
        assert_eq!(commit.handle.stored_path, first.stored_path);
        assert_eq!(store.stats().await.unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_transcript_written_once() {
        let store = SqliteStore::open_memory().unwrap();
        let f = file("video");
        store.insert_file(&f).await.unwrap();

        let outcome = store
            .insert_transcript(&f.fingerprint, &drafts(&["one", "two"]), "m")
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Created);

        let again = store
            .insert_transcript(&f.fingerprint, &drafts(&["other"]), "m")
            .await
            .unwrap();
        assert_eq!(again, CommitOutcome::Duplicate);

        let segments = store.segments_for_file(&f.fingerprint).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].sequence_index, 0);
        assert_eq!(segments[1].text, "two");
    }

    #[tokio::test]
    async fn test_empty_transcript_marks_complete() {
        let store = SqliteStore::open_memory().unwrap();
        let f = file("silent");
        store.insert_file(&f).await.unwrap();
        assert_eq!(store.pending(Stage::Transcribe).await.unwrap().len(), 1);

        store
            .insert_transcript(&f.fingerprint, &[], "m")
            .await
            .unwrap();
        assert!(store.pending(Stage::Transcribe).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_roundtrip_and_duplicate() {
        let store = SqliteStore::open_memory().unwrap();
        let segments = transcribed(&store, "v", &["hello"]).await;
        let id = segments[0].id;

        let v = vec![0.25f32, -1.0, 3.5];
        assert_eq!(
            store.insert_embedding(id, &v, "hash").await.unwrap(),
            CommitOutcome::Created
        );
        assert_eq!(
            store.insert_embedding(id, &[9.0, 9.0, 9.0], "hash").await.unwrap(),
            CommitOutcome::Duplicate
        );
        assert_eq!(store.get_embedding(id).await.unwrap(), Some(v));
        assert!(store.insert_embedding(id, &[f32::NAN], "hash").await.is_err());
    }

    #[tokio::test]
    async fn test_contradiction_rejects_same_file() {
        let store = SqliteStore::open_memory().unwrap();
        let a = transcribed(&store, "a", &["x", "y"]).await;
        let b = transcribed(&store, "b", &["z"]).await;

        let same = PairKey::new(a[0].id, a[1].id).unwrap();
        let err = store.insert_contradiction(same, 0.9).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");

        let cross = PairKey::new(b[0].id, a[0].id).unwrap();
        assert_eq!(
            store.insert_contradiction(cross, 0.9).await.unwrap(),
            CommitOutcome::Created
        );
        let flipped = PairKey::new(a[0].id, b[0].id).unwrap();
        assert_eq!(
            store.insert_contradiction(flipped, 0.1).await.unwrap(),
            CommitOutcome::Duplicate
        );
        let stored = store.get_contradiction(cross).await.unwrap().unwrap();
        assert_eq!(stored.score, 0.9);
    }

    #[tokio::test]
    async fn test_select_top_breaks_ties_by_pair() {
        let store = SqliteStore::open_memory().unwrap();
        let a = transcribed(&store, "a", &["a0", "a1"]).await;
        let b = transcribed(&store, "b", &["b0", "b1"]).await;

        let scores = [
            (a[1].id, b[1].id, 0.5),
            (a[0].id, b[1].id, 0.9),
            (a[1].id, b[0].id, 0.9),
            (a[0].id, b[0].id, 0.2),
        ];
        for (x, y, s) in scores {
            store
                .insert_contradiction(PairKey::new(x, y).unwrap(), s)
                .await
                .unwrap();
        }

        let top = store.select_top(3).await.unwrap();
        let pairs: Vec<_> = top.iter().map(|r| (r.pair.a(), r.pair.b())).collect();
        assert_eq!(
            pairs,
            vec![(a[0].id, b[1].id), (a[1].id, b[0].id), (a[1].id, b[1].id)]
        );
        assert_eq!(store.select_top(3).await.unwrap(), top);

        let above = store.select_top_above(10, Some(0.5)).await.unwrap();
        assert_eq!(above.len(), 2);
        assert_eq!(store.select_top(10).await.unwrap().len(), 4);
        assert!(store.select_top(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_detect_requires_embeddings_and_settles() {
        let store = SqliteStore::open_memory().unwrap();
        let a = transcribed(&store, "a", &["a0"]).await;
        let b = transcribed(&store, "b", &["b0", "b1"]).await;

        assert!(store.pending(Stage::Detect).await.unwrap().is_empty());

        for seg in a.iter().chain(b.iter()) {
            store.insert_embedding(seg.id, &[1.0], "m").await.unwrap();
        }
        let pending = store.pending(Stage::Detect).await.unwrap();
        assert_eq!(pending.len(), 2);

        for unit in &pending {
            if let WorkUnit::Detect { pair, .. } = unit {
                store.insert_contradiction(*pair, 0.1).await.unwrap();
                assert!(store.is_complete(unit).await.unwrap());
            }
        }
        assert!(store.pending(Stage::Detect).await.unwrap().is_empty());
        assert_eq!(store.settle_comparisons().await.unwrap(), 1);
        assert_eq!(store.settle_comparisons().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().settled_file_pairs, 1);
    }

    #[tokio::test]
    async fn test_record_run_and_stats() {
        let store = SqliteStore::open_memory().unwrap();
        let mut report = RunReport::begin(Stage::Fetch);
        report.processed = 2;
        store.record_run(&report.finish()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.schema_version, crate::SCHEMA_VERSION);
        assert_eq!(stats.sources, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_connections_race_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let s1 = Arc::new(SqliteStore::open(&path).unwrap());
        let s2 = Arc::new(SqliteStore::open(&path).unwrap());
        let f = file("contested");

        let (r1, r2) = tokio::join!(
            {
                let s = s1.clone();
                let f = f.clone();
                async move { s.insert_file(&f).await }
            },
            {
                let s = s2.clone();
                let f = f.clone();
                async move { s.insert_file(&f).await }
            }
        );
        let created = [r1.unwrap().created, r2.unwrap().created];
        assert_eq!(created.iter().filter(|c| **c).count(), 1);
        assert_eq!(s1.stats().await.unwrap().files, 1);
    }
}
