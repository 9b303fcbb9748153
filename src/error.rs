//! Error types for mail-triage.

use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail provider error: {0}")]
    Mail(#[from] MailError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Importance weights must sum to 1.0, got {0}")]
    BadWeights(f32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail API request failed: {0}")]
    Request(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Message {id} not found")]
    MessageNotFound { id: String },

    #[error("Malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    #[error("Label operation failed for {label}: {reason}")]
    Label { label: String, reason: String },

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl MailError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_) | Self::RateLimited { .. })
    }
}

/// Classification backend errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    Request(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Authentication failed")]
    Auth,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClassifierError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_) | Self::RateLimited { .. })
    }
}

/// Calendar free/busy lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("FreeBusy request failed: {0}")]
    Request(String),

    #[error("Calendar scope not granted")]
    MissingScope,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl CalendarError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Per-item workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// External call failed but a retry could succeed.
    #[error("Transient failure at step {step}: {reason}")]
    Transient { step: String, reason: String },

    /// Unrecoverable input problem; retrying cannot help.
    #[error("Validation failure: {0}")]
    Validation(String),

    /// Retry budget exhausted; the item has been dead-lettered.
    #[error("Item {item_id} dead-lettered at step {step}: {reason}")]
    DeadLettered {
        item_id: uuid::Uuid,
        step: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Batch job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: String,
        action: String,
    },

    #[error("A job ({id}) is already active")]
    AlreadyActive { id: String },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Chunk failed for job {id}: {reason}")]
    ChunkFailed { id: String, reason: String },

    #[error("Dispatch failed for job {id}: {reason}")]
    DispatchFailed { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
