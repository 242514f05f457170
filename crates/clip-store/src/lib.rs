//! clip-store - SQLite storage layer for contradiction-clipper
//!
//! This crate persists sources, files, transcript segments, embeddings and
//! contradiction scores in a single SQLite database, applies forward-only
//! schema migrations, and resolves pending work for each pipeline stage.

mod ledger;
mod migrate;
mod resolver;
mod schema;
mod sqlite;

pub use ledger::{fingerprint_file, ContentLedger};
pub use migrate::{current_version, migrate};
pub use sqlite::SqliteStore;

// Re-export schema for testing/migrations
pub use schema::{migrations, Migration, SCHEMA_VERSION};
