use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule definition is malformed or can never fire.
    #[error("Invalid schedule: {0}")]
    InvalidScheduleSpec(String),

    /// Another job in the namespace already uses this name.
    #[error("Duplicate job name in namespace {namespace}: {name}")]
    DuplicateName { namespace: String, name: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    NotFound { id: String },

    /// The caller's version token is stale.
    #[error("Job {id} was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification { id: String, expected: i64, found: i64 },

    /// The occurrence was already claimed, or the job is no longer due.
    #[error("Job {id} already claimed")]
    AlreadyClaimed { id: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row violates the job invariants.
    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl SchedulerError {
    /// Short error code string for structured output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidScheduleSpec(_) => "INVALID_SCHEDULE",
            SchedulerError::DuplicateName { .. } => "DUPLICATE_NAME",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            SchedulerError::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Corrupt { .. } => "CORRUPT_RECORD",
        }
    }

    /// Store failures the loop must not retry: the database file is gone,
    /// unreadable or damaged.
    pub fn is_fatal(&self) -> bool {
        match self {
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
