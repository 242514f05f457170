//! clip-core - Core types and traits for contradiction-clipper
//!
//! This crate provides the domain types, error taxonomy, configuration and
//! collaborator traits shared by the store, the pipeline and the CLI.

pub mod canonical;
pub mod config;
pub mod error;
pub mod report;
pub mod traits;
pub mod types;

pub use canonical::canonicalize_url;
pub use config::*;
pub use error::{ClipError, ErrorKind, Result};
pub use report::{FailedUnit, RunReport};
pub use traits::*;
pub use types::*;
