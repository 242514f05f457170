//! Error types for the clipper pipeline.

use thiserror::Error;

/// Result type alias using ClipError.
pub type Result<T> = std::result::Result<T, ClipError>;

/// Coarse classification used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed URL, bad argument or bad input data. Fatal for that item only.
    InvalidInput,
    /// A unique-keyed row already exists. Resolved by using the existing row.
    DuplicateWrite,
    /// An external tool or model failed. The unit stays pending.
    Collaborator,
    /// Schema migration failed. Fatal for the whole process.
    Migration,
    /// Disk or lock failure in the store.
    Storage,
    /// Configuration problem or missing collaborator.
    Config,
    /// Anything unexpected.
    Internal,
}

/// Errors that can occur in the clipper pipeline.
#[derive(Error, Debug)]
pub enum ClipError {
    /// Invalid argument or input data.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Malformed source URL.
    #[error("Invalid URL: {url} - {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A row with this unique key already exists.
    #[error("Duplicate {entity}: {key}")]
    DuplicateWrite { entity: &'static str, key: String },

    /// External collaborator (fetcher, transcriber, embedder, scorer, compiler) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// A unit exceeded its time budget.
    #[error("Unit {unit} timed out after {seconds}s")]
    Timeout { unit: String, seconds: u64 },

    /// The stage needs a collaborator that is not configured.
    #[error("Stage '{stage}' requires a {collaborator}, but none is configured")]
    MissingCollaborator {
        stage: String,
        collaborator: &'static str,
    },

    /// A migration step failed; the store stays at the last applied version.
    #[error("Migration to version {version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The store was written by a newer build.
    #[error("Database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    /// Storage error. `retryable` marks busy/locked conditions.
    #[error("Storage error: {message}")]
    Storage { message: String, retryable: bool },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ClipError {
    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a duplicate write error.
    pub fn duplicate(entity: &'static str, key: impl Into<String>) -> Self {
        Self::DuplicateWrite {
            entity,
            key: key.into(),
        }
    }

    /// Create a collaborator failure.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Create a non-retryable storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a retryable storage error (busy or locked database).
    pub fn storage_busy(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } | Self::InvalidUrl { .. } => ErrorKind::InvalidInput,
            Self::DuplicateWrite { .. } => ErrorKind::DuplicateWrite,
            Self::Collaborator { .. } | Self::Timeout { .. } => ErrorKind::Collaborator,
            Self::Migration { .. } | Self::SchemaTooNew { .. } => ErrorKind::Migration,
            Self::Storage { .. } | Self::Io(_) => ErrorKind::Storage,
            Self::Config { .. } | Self::MissingCollaborator { .. } => ErrorKind::Config,
            Self::Serialization(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// True when the failure means the row already exists.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateWrite { .. })
    }

    /// True for busy/locked storage errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { retryable: true, .. })
    }

    /// Get the error code used in run reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::DuplicateWrite { .. } => "DUPLICATE_WRITE",
            Self::Collaborator { .. } => "COLLABORATOR_FAILURE",
            Self::Timeout { .. } => "UNIT_TIMEOUT",
            Self::MissingCollaborator { .. } => "MISSING_COLLABORATOR",
            Self::Migration { .. } => "MIGRATION_FAILURE",
            Self::SchemaTooNew { .. } => "SCHEMA_TOO_NEW",
            Self::Storage { .. } => "STORAGE_FAILURE",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
