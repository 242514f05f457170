//! Stage Resolver: pending work derived purely from persisted rows.

use std::path::PathBuf;

use rusqlite::{params, Connection};

use clip_core::{Fingerprint, PairKey, Result, Stage, WorkUnit};

use crate::sqlite::db_err;

/// Units for `stage` that lack a completed output record.
pub(crate) fn pending(conn: &Connection, stage: Stage) -> Result<Vec<WorkUnit>> {
    match stage {
        Stage::Fetch => pending_fetch(conn),
        Stage::Transcribe => pending_transcribe(conn),
        Stage::Embed => pending_embed(conn),
        Stage::Detect => pending_detect(conn),
        // Compilation consumes the selection, not per-unit work.
        Stage::Compile => Ok(Vec::new()),
    }
}

fn pending_fetch(conn: &Connection) -> Result<Vec<WorkUnit>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, canonical_url FROM sources
            WHERE file_fingerprint IS NULL
            ORDER BY id
            "#,
        )
        .map_err(db_err)?;

    let units = stmt
        .query_map([], |row| {
            Ok(WorkUnit::Fetch {
                source_id: row.get(0)?,
                url: row.get(1)?,
            })
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(units)
}

fn pending_transcribe(conn: &Connection) -> Result<Vec<WorkUnit>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT f.fingerprint, f.stored_path FROM files f
            WHERE NOT EXISTS (
                SELECT 1 FROM transcriptions t WHERE t.file_fingerprint = f.fingerprint
            )
            ORDER BY f.first_seen_at, f.fingerprint
            "#,
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    rows.into_iter()
        .map(|(hex, path)| {
            Ok(WorkUnit::Transcribe {
                fingerprint: Fingerprint::from_hex(&hex)?,
                path: PathBuf::from(path),
            })
        })
        .collect()
}

fn pending_embed(conn: &Connection) -> Result<Vec<WorkUnit>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT s.id, s.text FROM segments s
            WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.segment_id = s.id)
            ORDER BY s.id
            "#,
        )
        .map_err(db_err)?;

    let units = stmt
        .query_map([], |row| {
            Ok(WorkUnit::Embed {
                segment_id: row.get(0)?,
                text: row.get(1)?,
            })
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(units)
}

/// Cross-file pairs of embedded segments, minus settled file pairs and pairs
/// already scored.
///
/// The join order is pinned so file pairs are the outer loop: a settled file
/// pair is rejected before any of its segments are read.
pub(crate) const PENDING_DETECT_SQL: &str = r#"
    SELECT sa.id, sa.text, sb.id, sb.text
    FROM transcriptions ta
    CROSS JOIN transcriptions tb ON tb.file_fingerprint > ta.file_fingerprint
    CROSS JOIN segments sa ON sa.file_fingerprint = ta.file_fingerprint
    CROSS JOIN embeddings ea ON ea.segment_id = sa.id
    CROSS JOIN segments sb ON sb.file_fingerprint = tb.file_fingerprint
    CROSS JOIN embeddings eb ON eb.segment_id = sb.id
    WHERE NOT EXISTS (
        SELECT 1 FROM file_comparisons fc
        WHERE fc.file_a = ta.file_fingerprint AND fc.file_b = tb.file_fingerprint
    )
    AND NOT EXISTS (
        SELECT 1 FROM contradictions c
        WHERE c.segment_a_id = MIN(sa.id, sb.id) AND c.segment_b_id = MAX(sa.id, sb.id)
    )
    ORDER BY MIN(sa.id, sb.id), MAX(sa.id, sb.id)
"#;

fn pending_detect(conn: &Connection) -> Result<Vec<WorkUnit>> {
    let mut stmt = conn.prepare(PENDING_DETECT_SQL).map_err(db_err)?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(rows
        .into_iter()
        .filter_map(|(x, text_x, y, text_y)| {
            let pair = PairKey::new(x, y)?;
            // Sides come out in fingerprint order; texts follow the id order.
            let (text_a, text_b) = if pair.a() == x {
                (text_x, text_y)
            } else {
                (text_y, text_x)
            };
            Some(WorkUnit::Detect {
                pair,
                text_a,
                text_b,
            })
        })
        .collect())
}

/// Whether the unit's output row already exists.
pub(crate) fn is_complete(conn: &Connection, unit: &WorkUnit) -> Result<bool> {
    let found: i64 = match unit {
        WorkUnit::Fetch { source_id, .. } => conn.query_row(
            "SELECT COUNT(*) FROM sources WHERE id = ?1 AND file_fingerprint IS NOT NULL",
            params![source_id],
            |row| row.get(0),
        ),
        WorkUnit::Transcribe { fingerprint, .. } => conn.query_row(
            "SELECT COUNT(*) FROM transcriptions WHERE file_fingerprint = ?1",
            params![fingerprint.to_hex()],
            |row| row.get(0),
        ),
        WorkUnit::Embed { segment_id, .. } => conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE segment_id = ?1",
            params![segment_id],
            |row| row.get(0),
        ),
        WorkUnit::Detect { pair, .. } => conn.query_row(
            "SELECT COUNT(*) FROM contradictions WHERE segment_a_id = ?1 AND segment_b_id = ?2",
            params![pair.a(), pair.b()],
            |row| row.get(0),
        ),
    }
    .map_err(db_err)?;

    Ok(found > 0)
}

/// Record file pairs whose every cross pair now has a score.
///
/// Transcription is all-or-nothing per file, so a settled pair never gains
/// new segments and stays settled.
pub(crate) fn settle_comparisons(conn: &Connection, now: u64) -> Result<u64> {
    let settled = conn
        .execute(
            r#"
            INSERT OR IGNORE INTO file_comparisons (file_a, file_b, pair_count, settled_at)
            SELECT ta.file_fingerprint, tb.file_fingerprint,
                   ta.segment_count * tb.segment_count, ?1
            FROM transcriptions ta
            JOIN transcriptions tb ON ta.file_fingerprint < tb.file_fingerprint
            WHERE NOT EXISTS (
                SELECT 1 FROM file_comparisons fc
                WHERE fc.file_a = ta.file_fingerprint AND fc.file_b = tb.file_fingerprint
            )
            AND (
                SELECT COUNT(*) FROM contradictions c
                WHERE c.file_lo = ta.file_fingerprint AND c.file_hi = tb.file_fingerprint
            ) = ta.segment_count * tb.segment_count
            "#,
            params![now as i64],
        )
        .map_err(db_err)?;

    Ok(settled as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use crate::schema::migrations;

    fn db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, migrations()).unwrap();
        conn
    }

    /// Insert a transcribed, fully embedded file; returns its fingerprint hex.
    fn embedded_file(conn: &Connection, tag: &str, texts: &[&str]) -> String {
        let hex = Fingerprint::of_bytes(tag.as_bytes()).to_hex();
        conn.execute(
            "INSERT INTO files (fingerprint, size_bytes, stored_path, first_seen_at) VALUES (?1, 1, ?2, 0)",
            params![hex, format!("/media/{}.mp4", tag)],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO transcriptions (file_fingerprint, segment_count, model, transcribed_at) VALUES (?1, ?2, 'test', 0)",
            params![hex, texts.len() as i64],
        )
        .unwrap();
        for (i, text) in texts.iter().enumerate() {
            conn.execute(
                "INSERT INTO segments (file_fingerprint, sequence_index, start_ts, end_ts, text) VALUES (?1, ?2, 0, 1, ?3)",
                params![hex, i as i64, text],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO embeddings (segment_id, dimension, vector, model, created_at) VALUES (?1, 1, x'00000000', 'test', 0)",
                params![conn.last_insert_rowid()],
            )
            .unwrap();
        }
        hex
    }

    fn mark_compared(conn: &Connection, x: &str, y: &str) {
        let (a, b) = if x < y { (x, y) } else { (y, x) };
        conn.execute(
            "INSERT INTO file_comparisons (file_a, file_b, pair_count, settled_at) VALUES (?1, ?2, 0, 0)",
            params![a, b],
        )
        .unwrap();
    }

    #[test]
    fn test_detect_skips_compared_file_pairs() {
        let conn = db();
        let a = embedded_file(&conn, "a", &["a0", "a1"]);
        let b = embedded_file(&conn, "b", &["b0", "b1", "b2"]);
        let c = embedded_file(&conn, "c", &["c0"]);
        assert_eq!(pending(&conn, Stage::Detect).unwrap().len(), 2 * 3 + 2 + 3);

        mark_compared(&conn, &a, &b);
        let units = pending(&conn, Stage::Detect).unwrap();
        assert_eq!(units.len(), 2 + 3);
        for unit in &units {
            let WorkUnit::Detect {
                pair,
                text_a,
                text_b,
            } = unit
            else {
                panic!("unexpected unit {:?}", unit);
            };
            assert!(pair.a() < pair.b());
            // Exactly one side lives in the remaining file.
            assert!(text_a == "c0" || text_b == "c0");
            assert_ne!(text_a, text_b);
        }

        mark_compared(&conn, &a, &c);
        mark_compared(&conn, &b, &c);
        assert!(pending(&conn, Stage::Detect).unwrap().is_empty());
    }

    #[test]
    fn test_detect_texts_follow_canonical_pair() {
        let conn = db();
        // Whichever file sorts first by fingerprint, ids decide the sides.
        embedded_file(&conn, "first", &["said yes"]);
        embedded_file(&conn, "second", &["said no"]);

        let units = pending(&conn, Stage::Detect).unwrap();
        assert_eq!(units.len(), 1);
        let WorkUnit::Detect {
            pair,
            text_a,
            text_b,
        } = &units[0]
        else {
            panic!("unexpected unit");
        };
        assert_eq!((pair.a(), pair.b()), (1, 2));
        assert_eq!(text_a, "said yes");
        assert_eq!(text_b, "said no");
    }

    #[test]
    fn test_detect_plan_starts_from_file_pairs() {
        let conn = db();
        for tag in ["a", "b", "c", "d"] {
            embedded_file(&conn, tag, &["one", "two", "three"]);
        }

        let mut stmt = conn
            .prepare(&format!("EXPLAIN QUERY PLAN {}", PENDING_DETECT_SQL))
            .unwrap();
        let plan: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(3))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        let first_table = plan
            .iter()
            .find(|d| d.starts_with("SCAN") || d.starts_with("SEARCH"))
            .unwrap();
        assert!(first_table.contains(" ta"), "{:?}", plan);
        for side in ["sa", "sb"] {
            let step = plan
                .iter()
                .find(|d| d.starts_with(&format!("SEARCH {} ", side)))
                .unwrap_or_else(|| panic!("{} not searched by file: {:?}", side, plan));
            assert!(step.contains("file_fingerprint=?"), "{:?}", plan);
        }
        assert!(
            !plan.iter().any(|d| d.starts_with("SCAN sa") || d.starts_with("SCAN sb")),
            "{:?}",
            plan
        );
    }
}
