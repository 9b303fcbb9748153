//! Persistence layer.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    BatchJob, CheckpointRecord, ChunkOutcome, Database, DecisionType, FactorScores, FeedbackRecord,
    Importance, Item, ItemStatus, JobStatus, Resolution, ReviewEntry,
};
