//! Schema Version Manager: applies pending migrations in order.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use clip_core::{ClipError, Result};

use crate::schema::{Migration, VERSION_TABLE};

/// Version recorded in the store, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    let has_table: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ClipError::storage(e.to_string()))?;

    if has_table.is_none() {
        return Ok(0);
    }

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| ClipError::storage(e.to_string()))?;

    Ok(version.unwrap_or(0) as u32)
}

/// Apply every migration newer than the stored version.
///
/// Each migration runs in its own transaction together with the version
/// bump, so a failing step leaves the store at the last applied version.
/// Returns the version the store ends at.
pub fn migrate(conn: &mut Connection, migrations: &[Migration]) -> Result<u32> {
    if migrations.windows(2).any(|w| w[0].version >= w[1].version) {
        return Err(ClipError::internal(
            "migrations must be listed in strictly ascending version order",
        ));
    }

    let supported = migrations.last().map(|m| m.version).unwrap_or(0);
    let current = current_version(conn)?;

    if current > supported {
        return Err(ClipError::SchemaTooNew {
            found: current,
            supported,
        });
    }

    conn.execute_batch(VERSION_TABLE)
        .map_err(|e| ClipError::storage(format!("Failed to create version table: {}", e)))?;

    let mut version = current;
    for migration in migrations.iter().filter(|m| m.version > current) {
        apply_one(conn, migration)?;
        version = migration.version;
        info!(
            version = migration.version,
            "Applied migration: {}", migration.description
        );
    }

    if version == current {
        debug!(version, "Schema up to date");
    }

    Ok(version)
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let fail = |e: rusqlite::Error| ClipError::Migration {
        version: migration.version,
        message: e.to_string(),
    };

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(fail)?;

    // Another process may have applied it while we waited for the lock.
    if current_version(&tx)? >= migration.version {
        return Ok(());
    }

    tx.execute_batch(migration.sql).map_err(fail)?;
    tx.execute(
        "UPDATE schema_version SET version = ?1 WHERE id = 1",
        params![migration.version],
    )
    .map_err(fail)?;
    tx.commit().map_err(fail)
}
