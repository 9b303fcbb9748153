//! Storage abstraction and persistent domain models.
//!
//! The `Database` trait is the only storage seam the rest of the crate
//! sees. Production uses the libSQL backend; tests use the same backend
//! against `:memory:`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Lifecycle status of a triage item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ingested,
    Classifying,
    Categorized,
    ImportanceScored,
    Enriching,
    Finalized,
    AutoLabeled,
    PendingReview,
    Labeled,
    Failed,
    DeadLetter,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Classifying => "classifying",
            Self::Categorized => "categorized",
            Self::ImportanceScored => "importance_scored",
            Self::Enriching => "enriching",
            Self::Finalized => "finalized",
            Self::AutoLabeled => "auto_labeled",
            Self::PendingReview => "pending_review",
            Self::Labeled => "labeled",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "classifying" => Self::Classifying,
            "categorized" => Self::Categorized,
            "importance_scored" => Self::ImportanceScored,
            "enriching" => Self::Enriching,
            "finalized" => Self::Finalized,
            "auto_labeled" => Self::AutoLabeled,
            "pending_review" => Self::PendingReview,
            "labeled" => Self::Labeled,
            "failed" => Self::Failed,
            "dead_letter" => Self::DeadLetter,
            _ => Self::Ingested,
        }
    }

    /// Terminal states: no further workflow steps will run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Labeled | Self::DeadLetter)
    }
}

/// Importance level derived from the weighted score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Critical,
    High,
    Normal,
    Low,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Self::Critical,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }

    /// Map a weighted score to a level.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.9 {
            Self::Critical
        } else if score >= 0.7 {
            Self::High
        } else if score >= 0.4 {
            Self::Normal
        } else {
            Self::Low
        }
    }
}

/// A message being (or having been) triaged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    /// Provider-native message id. Unique; the idempotency key.
    pub external_id: String,
    pub thread_id: String,
    pub from_email: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub category: Option<String>,
    pub confidence: Option<f32>,
    pub rationale: Option<String>,
    #[serde(default)]
    pub key_phrases: Vec<String>,
    pub model: Option<String>,
    pub importance_score: Option<f32>,
    pub importance: Option<Importance>,
    pub has_event: bool,
    pub has_unsubscribe: bool,
    pub applied_labels: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(
        external_id: String,
        thread_id: String,
        from_email: String,
        subject: String,
        snippet: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id,
            thread_id,
            from_email,
            subject,
            snippet,
            received_at,
            status: ItemStatus::Ingested,
            category: None,
            confidence: None,
            rationale: None,
            key_phrases: Vec::new(),
            model: None,
            importance_score: None,
            importance: None,
            has_event: false,
            has_unsubscribe: false,
            applied_labels: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A durable snapshot of workflow state after a completed step.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub id: i64,
    pub item_id: Uuid,
    pub step: String,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// What kind of decision a review entry is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Categorization,
    Calendar,
    Unsubscribe,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categorization => "categorization",
            Self::Calendar => "calendar",
            Self::Unsubscribe => "unsubscribe",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "calendar" => Self::Calendar,
            "unsubscribe" => Self::Unsubscribe,
            _ => Self::Categorization,
        }
    }
}

/// Review entry resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Corrected,
    Denied,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Corrected => "corrected",
            Self::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "corrected" => Self::Corrected,
            "denied" => Self::Denied,
            _ => Self::Pending,
        }
    }
}

/// A pending (or resolved) human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub id: Uuid,
    pub item_id: Uuid,
    pub decision_type: DecisionType,
    /// What the pipeline proposed (category name, event JSON, unsubscribe URI).
    pub proposed: serde_json::Value,
    pub resolution: Resolution,
    /// Corrected value, for `Resolution::Corrected`.
    pub corrected: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewEntry {
    pub fn new(item_id: Uuid, decision_type: DecisionType, proposed: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_id,
            decision_type,
            proposed,
            resolution: Resolution::Pending,
            corrected: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// A recorded human decision, kept for future tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub item_id: Uuid,
    pub decision_type: DecisionType,
    pub proposed: String,
    pub resolution: Resolution,
    pub corrected: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Batch job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Active jobs block submission of a new one.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

/// A long-running batch backfill over a date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub query_template: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub chunk_size: u32,
    pub chunk_months: u32,
    pub status: JobStatus,
    pub chunks_completed: u32,
    pub chunks_total: u32,
    pub items_processed: u64,
    pub items_categorized: u64,
    pub items_labeled: u64,
    pub items_pending_review: u64,
    pub items_errors: u64,
    pub estimated_cost: Decimal,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub lock_holder: Option<Uuid>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Bounds of the chunk currently being processed, if any.
    pub current_chunk: Option<(NaiveDate, NaiveDate)>,
    /// Date ranges already committed, inclusive start and end.
    pub completed_ranges: Vec<(NaiveDate, NaiveDate)>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-chunk counters, folded into the job in one committed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub processed: u64,
    pub categorized: u64,
    pub labeled: u64,
    pub pending_review: u64,
    pub errors: u64,
}

/// Per-factor importance breakdown, persisted with the checkpoint state.
pub type FactorScores = BTreeMap<String, f32>;

/// Storage operations for the triage pipeline.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Items ───────────────────────────────────────────────────────

    /// Insert an item if its `external_id` is new.
    ///
    /// Returns the stored item and `true` if this call created it, or the
    /// existing row and `false` if it was already present.
    async fn ingest_item(&self, item: &Item) -> Result<(Item, bool), DatabaseError>;

    async fn get_item(&self, external_id: &str) -> Result<Option<Item>, DatabaseError>;

    async fn get_item_by_id(&self, id: Uuid) -> Result<Item, DatabaseError>;

    /// Persist all mutable fields of an item.
    async fn update_item(&self, item: &Item) -> Result<(), DatabaseError>;

    async fn dead_letter_items(&self) -> Result<Vec<Item>, DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn insert_checkpoint(
        &self,
        item_id: Uuid,
        step: &str,
        snapshot: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Most recent checkpoint for an item, if any.
    async fn latest_checkpoint(
        &self,
        item_id: Uuid,
    ) -> Result<Option<CheckpointRecord>, DatabaseError>;

    async fn checkpoints_for(&self, item_id: Uuid) -> Result<Vec<CheckpointRecord>, DatabaseError>;

    // ── Review queue ────────────────────────────────────────────────

    /// Insert a review entry unless an unresolved one of the same type
    /// already exists for the item. Returns `true` if inserted.
    async fn insert_review_entry(&self, entry: &ReviewEntry) -> Result<bool, DatabaseError>;

    async fn open_review_entries(&self) -> Result<Vec<ReviewEntry>, DatabaseError>;

    async fn get_review_entry(&self, id: Uuid) -> Result<ReviewEntry, DatabaseError>;

    async fn resolve_review_entry(
        &self,
        id: Uuid,
        resolution: Resolution,
        corrected: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<(), DatabaseError>;

    // ── Batch jobs ──────────────────────────────────────────────────

    async fn create_job(&self, job: &BatchJob) -> Result<(), DatabaseError>;

    async fn get_job(&self, job_id: &str) -> Result<BatchJob, DatabaseError>;

    /// The single active (pending/running/paused) job, if any.
    async fn active_job(&self) -> Result<Option<BatchJob>, DatabaseError>;

    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), DatabaseError>;

    /// Mark a chunk as in progress: running status, chunk bounds, activity
    /// timestamps. `started_at` is set on the first chunk only.
    async fn begin_chunk(
        &self,
        job_id: &str,
        range: (NaiveDate, NaiveDate),
    ) -> Result<(), DatabaseError>;

    /// Try to take the job's processing lock.
    ///
    /// Succeeds only when the lock is absent or older than `stale_before`.
    /// The write is conditional and verified by re-read, so two concurrent
    /// workers cannot both win.
    async fn try_acquire_job_lock(
        &self,
        job_id: &str,
        holder: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Release the lock if still held by `holder`.
    async fn release_job_lock(&self, job_id: &str, holder: Uuid) -> Result<(), DatabaseError>;

    /// Fold a finished chunk into the job in a single committed write:
    /// counters, completed range, chunk count, cost, retry count reset,
    /// lock release, last_activity.
    async fn commit_chunk(
        &self,
        job_id: &str,
        range: (NaiveDate, NaiveDate),
        outcome: &ChunkOutcome,
        cost_delta: Decimal,
    ) -> Result<(), DatabaseError>;

    /// Record a chunk-level failure and return the new consecutive retry
    /// count. Does not touch the lock; the failed chunk's lock stays in
    /// place until the staleness window lapses and another worker reclaims
    /// it.
    async fn record_chunk_failure(&self, job_id: &str, error: &str) -> Result<u32, DatabaseError>;
}
