//! Database schema definitions.
//!
//! The schema only ever grows: each migration adds tables, columns or
//! indexes, and is applied once in ascending version order.

/// Latest schema version this build understands.
pub const SCHEMA_VERSION: u32 = 3;

/// One forward-only schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Bookkeeping table holding the single schema version row.
pub(crate) const VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, 0);
"#;

const V1_INITIAL: &str = r#"
-- Stored media, one row per distinct byte content
CREATE TABLE files (
    fingerprint TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    stored_path TEXT NOT NULL,
    media_id TEXT,
    first_seen_at INTEGER NOT NULL
);

-- Registered input URLs
CREATE TABLE sources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_url TEXT NOT NULL UNIQUE,
    file_fingerprint TEXT REFERENCES files(fingerprint),
    discovered_at INTEGER NOT NULL,
    linked_at INTEGER
);

CREATE INDEX idx_sources_file ON sources(file_fingerprint);

-- Completion marker for a file's transcription pass
CREATE TABLE transcriptions (
    file_fingerprint TEXT PRIMARY KEY REFERENCES files(fingerprint),
    segment_count INTEGER NOT NULL,
    model TEXT NOT NULL,
    transcribed_at INTEGER NOT NULL
);

CREATE TABLE segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_fingerprint TEXT NOT NULL REFERENCES transcriptions(file_fingerprint),
    sequence_index INTEGER NOT NULL,
    start_ts REAL NOT NULL,
    end_ts REAL NOT NULL,
    text TEXT NOT NULL,
    UNIQUE (file_fingerprint, sequence_index)
);

CREATE TABLE embeddings (
    segment_id INTEGER PRIMARY KEY REFERENCES segments(id),
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    model TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- One row per unordered cross-file segment pair, smaller id first
CREATE TABLE contradictions (
    segment_a_id INTEGER NOT NULL REFERENCES segments(id),
    segment_b_id INTEGER NOT NULL REFERENCES segments(id),
    score REAL NOT NULL,
    detected_at INTEGER NOT NULL,
    PRIMARY KEY (segment_a_id, segment_b_id),
    CHECK (segment_a_id < segment_b_id)
);
"#;

const V2_COMPARISON_WATERMARK: &str = r#"
-- File pairs whose every cross pair has been scored
CREATE TABLE file_comparisons (
    file_a TEXT NOT NULL REFERENCES files(fingerprint),
    file_b TEXT NOT NULL REFERENCES files(fingerprint),
    pair_count INTEGER NOT NULL,
    settled_at INTEGER NOT NULL,
    PRIMARY KEY (file_a, file_b),
    CHECK (file_a < file_b)
);

ALTER TABLE contradictions ADD COLUMN file_lo TEXT;
ALTER TABLE contradictions ADD COLUMN file_hi TEXT;

UPDATE contradictions SET
    file_lo = MIN(
        (SELECT file_fingerprint FROM segments WHERE id = segment_a_id),
        (SELECT file_fingerprint FROM segments WHERE id = segment_b_id)),
    file_hi = MAX(
        (SELECT file_fingerprint FROM segments WHERE id = segment_a_id),
        (SELECT file_fingerprint FROM segments WHERE id = segment_b_id));

CREATE INDEX idx_contradictions_files ON contradictions(file_lo, file_hi);
CREATE INDEX idx_contradictions_score ON contradictions(score DESC, segment_a_id, segment_b_id);
"#;

const V3_STAGE_RUNS: &str = r#"
CREATE TABLE stage_runs (
    run_id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    processed INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    interrupted INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    failures_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX idx_stage_runs_stage ON stage_runs(stage, started_at);
"#;

/// All migrations, in ascending version order.
pub fn migrations() -> &'static [Migration] {
    const MIGRATIONS: &[Migration] = &[
        Migration {
            version: 1,
            description: "Initial schema: sources, files, transcriptions, segments, embeddings, contradictions",
            sql: V1_INITIAL,
        },
        Migration {
            version: 2,
            description: "Cross-file comparison watermark",
            sql: V2_COMPARISON_WATERMARK,
        },
        Migration {
            version: 3,
            description: "Stage run history",
            sql: V3_STAGE_RUNS,
        },
    ];
    MIGRATIONS
}
