//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All values are stored as
//! TEXT/INTEGER/REAL; timestamps are RFC 3339, JSON columns hold serialized
//! `serde_json` values, and `estimated_cost` is a decimal string.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    BatchJob, CheckpointRecord, ChunkOutcome, Database, DecisionType, FeedbackRecord, Importance,
    Item, ItemStatus, JobStatus, Resolution, ReviewEntry,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

const ITEM_COLUMNS: &str = "id, external_id, thread_id, from_email, subject, snippet, received_at, \
     status, category, confidence, rationale, key_phrases, model, importance_score, importance, \
     has_event, has_unsubscribe, applied_labels, last_error, created_at, updated_at";

fn row_to_item(row: &libsql::Row) -> Result<Item, DatabaseError> {
    let get_str = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
    };
    let get_opt = |idx: i32| -> Option<String> { row.get::<Option<String>>(idx).ok().flatten() };

    let importance = get_opt(14).map(|s| Importance::parse(&s));
    Ok(Item {
        id: Uuid::parse_str(&get_str(0)?).unwrap_or_else(|_| Uuid::nil()),
        external_id: get_str(1)?,
        thread_id: get_str(2)?,
        from_email: get_str(3)?,
        subject: get_str(4)?,
        snippet: get_str(5)?,
        received_at: parse_datetime(&get_str(6)?),
        status: ItemStatus::parse(&get_str(7)?),
        category: get_opt(8),
        confidence: row.get::<Option<f64>>(9).ok().flatten().map(|v| v as f32),
        rationale: get_opt(10),
        key_phrases: json_or_default(&get_str(11)?),
        model: get_opt(12),
        importance_score: row.get::<Option<f64>>(13).ok().flatten().map(|v| v as f32),
        importance,
        has_event: row.get::<i64>(15).unwrap_or(0) != 0,
        has_unsubscribe: row.get::<i64>(16).unwrap_or(0) != 0,
        applied_labels: json_or_default(&get_str(17)?),
        last_error: get_opt(18),
        created_at: parse_datetime(&get_str(19)?),
        updated_at: parse_datetime(&get_str(20)?),
    })
}

const JOB_COLUMNS: &str = "job_id, query_template, start_date, end_date, chunk_size, chunk_months, \
     status, chunks_completed, chunks_total, items_processed, items_categorized, items_labeled, \
     items_pending_review, items_errors, estimated_cost, retry_count, last_error, lock_holder, \
     lock_acquired_at, completed_ranges, started_at, completed_at, last_activity, created_at, \
     updated_at, current_chunk_start, current_chunk_end";

fn row_to_job(row: &libsql::Row) -> Result<BatchJob, DatabaseError> {
    let get_str = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
    };
    let get_opt = |idx: i32| -> Option<String> { row.get::<Option<String>>(idx).ok().flatten() };
    let get_u64 = |idx: i32| -> u64 { row.get::<i64>(idx).unwrap_or(0).max(0) as u64 };

    Ok(BatchJob {
        job_id: get_str(0)?,
        query_template: get_str(1)?,
        start_date: parse_date(&get_str(2)?),
        end_date: parse_date(&get_str(3)?),
        chunk_size: get_u64(4) as u32,
        chunk_months: get_u64(5) as u32,
        status: JobStatus::parse(&get_str(6)?),
        chunks_completed: get_u64(7) as u32,
        chunks_total: get_u64(8) as u32,
        items_processed: get_u64(9),
        items_categorized: get_u64(10),
        items_labeled: get_u64(11),
        items_pending_review: get_u64(12),
        items_errors: get_u64(13),
        estimated_cost: get_str(14)?.parse().unwrap_or_default(),
        retry_count: get_u64(15) as u32,
        last_error: get_opt(16),
        lock_holder: get_opt(17).and_then(|s| Uuid::parse_str(&s).ok()),
        lock_acquired_at: parse_optional_datetime(get_opt(18)),
        completed_ranges: json_or_default(&get_str(19)?),
        started_at: parse_optional_datetime(get_opt(20)),
        completed_at: parse_optional_datetime(get_opt(21)),
        last_activity: parse_datetime(&get_str(22)?),
        created_at: parse_datetime(&get_str(23)?),
        updated_at: parse_datetime(&get_str(24)?),
        current_chunk: match (get_opt(25), get_opt(26)) {
            (Some(start), Some(end)) => Some((parse_date(&start), parse_date(&end))),
            _ => None,
        },
    })
}

const REVIEW_COLUMNS: &str =
    "id, item_id, decision_type, proposed, resolution, corrected, created_at, resolved_at";

fn row_to_review(row: &libsql::Row) -> Result<ReviewEntry, DatabaseError> {
    let get_str = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
    };
    let get_opt = |idx: i32| -> Option<String> { row.get::<Option<String>>(idx).ok().flatten() };

    Ok(ReviewEntry {
        id: Uuid::parse_str(&get_str(0)?).unwrap_or_else(|_| Uuid::nil()),
        item_id: Uuid::parse_str(&get_str(1)?).unwrap_or_else(|_| Uuid::nil()),
        decision_type: DecisionType::parse(&get_str(2)?),
        proposed: serde_json::from_str(&get_str(3)?)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        resolution: Resolution::parse(&get_str(4)?),
        corrected: get_opt(5),
        created_at: parse_datetime(&get_str(6)?),
        resolved_at: parse_optional_datetime(get_opt(7)),
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<CheckpointRecord, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("checkpoint id: {e}")))?;
    let item_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("checkpoint item_id: {e}")))?;
    let step: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("checkpoint step: {e}")))?;
    let snapshot: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("checkpoint snapshot: {e}")))?;
    let created_at: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("checkpoint created_at: {e}")))?;

    Ok(CheckpointRecord {
        id,
        item_id: Uuid::parse_str(&item_id).unwrap_or_else(|_| Uuid::nil()),
        step,
        snapshot: serde_json::from_str(&snapshot)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        created_at: parse_datetime(&created_at),
    })
}

fn to_json_string<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn ingest_item(&self, item: &Item) -> Result<(Item, bool), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO items (id, external_id, thread_id, from_email, subject, snippet, \
                 received_at, status, key_phrases, applied_labels, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    item.id.to_string(),
                    item.external_id.clone(),
                    item.thread_id.clone(),
                    item.from_email.clone(),
                    item.subject.clone(),
                    item.snippet.clone(),
                    item.received_at.to_rfc3339(),
                    item.status.as_str(),
                    to_json_string(&item.key_phrases)?,
                    to_json_string(&item.applied_labels)?,
                    item.created_at.to_rfc3339(),
                    item.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ingest_item: {e}")))?;

        if changed > 0 {
            debug!(external_id = %item.external_id, "Ingested new item");
            return Ok((item.clone(), true));
        }

        // Conflict: someone already ingested this message
        let existing = self.get_item(&item.external_id).await?.ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "item".into(),
                id: item.external_id.clone(),
            }
        })?;
        Ok((existing, false))
    }

    async fn get_item(&self, external_id: &str) -> Result<Option<Item>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_item_by_id(&self, id: Uuid) -> Result<Item, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item_by_id: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item_by_id row: {e}")))?
        {
            Some(row) => row_to_item(&row),
            None => Err(DatabaseError::NotFound {
                entity: "item".into(),
                id: id.to_string(),
            }),
        }
    }

    async fn update_item(&self, item: &Item) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE items SET status = ?1, category = ?2, confidence = ?3, rationale = ?4, \
                 key_phrases = ?5, model = ?6, importance_score = ?7, importance = ?8, \
                 has_event = ?9, has_unsubscribe = ?10, applied_labels = ?11, last_error = ?12, \
                 updated_at = ?13 WHERE id = ?14",
                params![
                    item.status.as_str(),
                    item.category.clone(),
                    item.confidence.map(|c| c as f64),
                    item.rationale.clone(),
                    to_json_string(&item.key_phrases)?,
                    item.model.clone(),
                    item.importance_score.map(|s| s as f64),
                    item.importance.map(|i| i.as_str()),
                    item.has_event as i64,
                    item.has_unsubscribe as i64,
                    to_json_string(&item.applied_labels)?,
                    item.last_error.clone(),
                    Utc::now().to_rfc3339(),
                    item.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_item: {e}")))?;
        Ok(())
    }

    async fn dead_letter_items(&self) -> Result<Vec<Item>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items WHERE status = 'dead_letter' \
                     ORDER BY updated_at DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letter_items: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("dead_letter_items row: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    async fn insert_checkpoint(
        &self,
        item_id: Uuid,
        step: &str,
        snapshot: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO checkpoints (item_id, step, snapshot, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    item_id.to_string(),
                    step,
                    to_json_string(snapshot)?,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_checkpoint: {e}")))?;
        Ok(())
    }

    async fn latest_checkpoint(
        &self,
        item_id: Uuid,
    ) -> Result<Option<CheckpointRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, item_id, step, snapshot, created_at FROM checkpoints \
                 WHERE item_id = ?1 ORDER BY id DESC LIMIT 1",
                params![item_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_checkpoint: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_checkpoint row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_checkpoint(&row)?)),
            None => Ok(None),
        }
    }

    async fn checkpoints_for(&self, item_id: Uuid) -> Result<Vec<CheckpointRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, item_id, step, snapshot, created_at FROM checkpoints \
                 WHERE item_id = ?1 ORDER BY id ASC",
                params![item_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoints_for: {e}")))?;

        let mut checkpoints = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoints_for row: {e}")))?
        {
            checkpoints.push(row_to_checkpoint(&row)?);
        }
        Ok(checkpoints)
    }

    async fn insert_review_entry(&self, entry: &ReviewEntry) -> Result<bool, DatabaseError> {
        // The partial unique index on (item_id, decision_type) WHERE pending
        // makes the OR IGNORE a no-op when an open entry already exists.
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO review_queue \
                 (id, item_id, decision_type, proposed, resolution, corrected, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.item_id.to_string(),
                    entry.decision_type.as_str(),
                    to_json_string(&entry.proposed)?,
                    entry.resolution.as_str(),
                    entry.corrected.clone(),
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_review_entry: {e}")))?;
        Ok(changed > 0)
    }

    async fn open_review_entries(&self) -> Result<Vec<ReviewEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_queue \
                     WHERE resolution = 'pending' ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_review_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("open_review_entries row: {e}")))?
        {
            entries.push(row_to_review(&row)?);
        }
        Ok(entries)
    }

    async fn get_review_entry(&self, id: Uuid) -> Result<ReviewEntry, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REVIEW_COLUMNS} FROM review_queue WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_review_entry: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_review_entry row: {e}")))?
        {
            Some(row) => row_to_review(&row),
            None => Err(DatabaseError::NotFound {
                entity: "review_entry".into(),
                id: id.to_string(),
            }),
        }
    }

    async fn resolve_review_entry(
        &self,
        id: Uuid,
        resolution: Resolution,
        corrected: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE review_queue SET resolution = ?1, corrected = ?2, resolved_at = ?3 \
                 WHERE id = ?4 AND resolution = 'pending'",
                params![
                    resolution.as_str(),
                    corrected,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_review_entry: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "open review_entry".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO feedback (id, item_id, decision_type, proposed, resolution, \
                 corrected, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    feedback.id.to_string(),
                    feedback.item_id.to_string(),
                    feedback.decision_type.as_str(),
                    feedback.proposed.clone(),
                    feedback.resolution.as_str(),
                    feedback.corrected.clone(),
                    feedback.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_feedback: {e}")))?;
        Ok(())
    }

    async fn create_job(&self, job: &BatchJob) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO batch_jobs (job_id, query_template, start_date, end_date, \
                 chunk_size, chunk_months, status, chunks_completed, chunks_total, \
                 items_processed, items_categorized, items_labeled, items_pending_review, \
                 items_errors, estimated_cost, retry_count, completed_ranges, started_at, \
                 last_activity, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    job.job_id.clone(),
                    job.query_template.clone(),
                    job.start_date.to_string(),
                    job.end_date.to_string(),
                    job.chunk_size as i64,
                    job.chunk_months as i64,
                    job.status.as_str(),
                    job.chunks_completed as i64,
                    job.chunks_total as i64,
                    job.items_processed as i64,
                    job.items_categorized as i64,
                    job.items_labeled as i64,
                    job.items_pending_review as i64,
                    job.items_errors as i64,
                    job.estimated_cost.to_string(),
                    job.retry_count as i64,
                    to_json_string(&job.completed_ranges)?,
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.last_activity.to_rfc3339(),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<BatchJob, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE job_id = ?1"),
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job row: {e}")))?
        {
            Some(row) => row_to_job(&row),
            None => Err(DatabaseError::NotFound {
                entity: "batch_job".into(),
                id: job_id.to_string(),
            }),
        }
    }

    async fn active_job(&self) -> Result<Option<BatchJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM batch_jobs \
                     WHERE status IN ('pending', 'running', 'paused') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_job row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let completed_at =
            matches!(status, JobStatus::Completed | JobStatus::Failed).then(|| now.clone());
        let changed = self
            .conn()
            .execute(
                "UPDATE batch_jobs SET status = ?1, \
                 started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL THEN ?2 ELSE started_at END, \
                 completed_at = COALESCE(?3, completed_at), \
                 updated_at = ?2 WHERE job_id = ?4",
                params![status.as_str(), now.clone(), completed_at, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_job_status: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "batch_job".into(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn begin_chunk(
        &self,
        job_id: &str,
        range: (NaiveDate, NaiveDate),
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE batch_jobs SET status = 'running', \
                 current_chunk_start = ?1, current_chunk_end = ?2, \
                 started_at = COALESCE(started_at, ?3), \
                 last_activity = ?3, updated_at = ?3 WHERE job_id = ?4",
                params![range.0.to_string(), range.1.to_string(), now, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("begin_chunk: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "batch_job".into(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn try_acquire_job_lock(
        &self,
        job_id: &str,
        holder: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE batch_jobs SET lock_holder = ?1, lock_acquired_at = ?2 \
                 WHERE job_id = ?3 AND (lock_holder IS NULL OR lock_acquired_at < ?4)",
                params![
                    holder.to_string(),
                    Utc::now().to_rfc3339(),
                    job_id,
                    stale_before.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_job_lock: {e}")))?;

        // Re-read to verify we actually hold it
        let job = self.get_job(job_id).await?;
        Ok(job.lock_holder == Some(holder))
    }

    async fn release_job_lock(&self, job_id: &str, holder: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE batch_jobs SET lock_holder = NULL, lock_acquired_at = NULL \
                 WHERE job_id = ?1 AND lock_holder = ?2",
                params![job_id, holder.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_job_lock: {e}")))?;
        Ok(())
    }

    async fn commit_chunk(
        &self,
        job_id: &str,
        range: (NaiveDate, NaiveDate),
        outcome: &ChunkOutcome,
        cost_delta: Decimal,
    ) -> Result<(), DatabaseError> {
        let job = self.get_job(job_id).await?;

        let mut ranges = job.completed_ranges.clone();
        ranges.push(range);
        let cost = (job.estimated_cost + cost_delta).to_string();
        let now = Utc::now().to_rfc3339();

        // Single statement: counters, range bookkeeping, retry reset, lock release.
        self.conn()
            .execute(
                "UPDATE batch_jobs SET \
                 items_processed = items_processed + ?1, \
                 items_categorized = items_categorized + ?2, \
                 items_labeled = items_labeled + ?3, \
                 items_pending_review = items_pending_review + ?4, \
                 items_errors = items_errors + ?5, \
                 chunks_completed = chunks_completed + 1, \
                 completed_ranges = ?6, \
                 estimated_cost = ?7, \
                 retry_count = 0, \
                 last_error = NULL, \
                 lock_holder = NULL, \
                 lock_acquired_at = NULL, \
                 current_chunk_start = NULL, \
                 current_chunk_end = NULL, \
                 last_activity = ?8, \
                 updated_at = ?8 \
                 WHERE job_id = ?9",
                params![
                    outcome.processed as i64,
                    outcome.categorized as i64,
                    outcome.labeled as i64,
                    outcome.pending_review as i64,
                    outcome.errors as i64,
                    to_json_string(&ranges)?,
                    cost,
                    now,
                    job_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_chunk: {e}")))?;

        debug!(job_id, ?range, processed = outcome.processed, "Committed chunk");
        Ok(())
    }

    async fn record_chunk_failure(&self, job_id: &str, error: &str) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE batch_jobs SET retry_count = retry_count + 1, last_error = ?1, \
                 last_activity = ?2, updated_at = ?2 WHERE job_id = ?3",
                params![error, Utc::now().to_rfc3339(), job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_chunk_failure: {e}")))?;

        let job = self.get_job(job_id).await?;
        Ok(job.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn sample_item(external_id: &str) -> Item {
        Item::new(
            external_id.to_string(),
            "thread-1".to_string(),
            "sender@example.com".to_string(),
            "Test subject".to_string(),
            "A snippet".to_string(),
            Utc::now(),
        )
    }

    fn sample_job(job_id: &str) -> BatchJob {
        let now = Utc::now();
        BatchJob {
            job_id: job_id.to_string(),
            query_template: "after:{start} before:{end}".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            chunk_size: 500,
            chunk_months: 2,
            status: JobStatus::Pending,
            chunks_completed: 0,
            chunks_total: 3,
            items_processed: 0,
            items_categorized: 0,
            items_labeled: 0,
            items_pending_review: 0,
            items_errors: 0,
            estimated_cost: Decimal::ZERO,
            retry_count: 0,
            last_error: None,
            lock_holder: None,
            lock_acquired_at: None,
            current_chunk: None,
            completed_ranges: vec![],
            started_at: None,
            completed_at: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ingest_is_idempotent() {
        let db = backend().await;
        let item = sample_item("msg-1");

        let (first, created) = db.ingest_item(&item).await.unwrap();
        assert!(created);
        assert_eq!(first.external_id, "msg-1");

        // Second ingest with a different in-memory id returns the original row
        let duplicate = sample_item("msg-1");
        let (second, created) = db.ingest_item(&duplicate).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn concurrent_ingest_creates_one_row() {
        let db = Arc::new(backend().await);
        let a = sample_item("msg-race");
        let b = sample_item("msg-race");

        let (ra, rb) = tokio::join!(db.ingest_item(&a), db.ingest_item(&b));
        let (item_a, created_a) = ra.unwrap();
        let (item_b, created_b) = rb.unwrap();

        assert!(created_a ^ created_b, "exactly one insert must win");
        assert_eq!(item_a.id, item_b.id);
    }

    #[tokio::test]
    async fn update_and_fetch_item() {
        let db = backend().await;
        let (mut item, _) = db.ingest_item(&sample_item("msg-2")).await.unwrap();

        item.status = ItemStatus::Categorized;
        item.category = Some("Important".to_string());
        item.confidence = Some(0.92);
        item.key_phrases = vec!["deadline".to_string()];
        db.update_item(&item).await.unwrap();

        let fetched = db.get_item("msg-2").await.unwrap().unwrap();
        assert_eq!(fetched.status, ItemStatus::Categorized);
        assert_eq!(fetched.category.as_deref(), Some("Important"));
        assert!((fetched.confidence.unwrap() - 0.92).abs() < 1e-6);
        assert_eq!(fetched.key_phrases, vec!["deadline"]);
    }

    #[tokio::test]
    async fn checkpoints_are_ordered_and_latest_wins() {
        let db = backend().await;
        let (item, _) = db.ingest_item(&sample_item("msg-3")).await.unwrap();

        for step in ["ingest", "classify", "score_importance"] {
            db.insert_checkpoint(item.id, step, &serde_json::json!({ "step": step }))
                .await
                .unwrap();
        }

        let latest = db.latest_checkpoint(item.id).await.unwrap().unwrap();
        assert_eq!(latest.step, "score_importance");

        let all = db.checkpoints_for(item.id).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].step, "ingest");
        assert_eq!(all[2].step, "score_importance");
    }

    #[tokio::test]
    async fn duplicate_open_review_entry_is_ignored() {
        let db = backend().await;
        let (item, _) = db.ingest_item(&sample_item("msg-4")).await.unwrap();

        let entry =
            ReviewEntry::new(item.id, DecisionType::Categorization, serde_json::json!("X"));
        assert!(db.insert_review_entry(&entry).await.unwrap());

        let duplicate =
            ReviewEntry::new(item.id, DecisionType::Categorization, serde_json::json!("Y"));
        assert!(!db.insert_review_entry(&duplicate).await.unwrap());

        // Different decision type is a separate entry
        let other = ReviewEntry::new(item.id, DecisionType::Unsubscribe, serde_json::json!("Z"));
        assert!(db.insert_review_entry(&other).await.unwrap());

        assert_eq!(db.open_review_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resolving_twice_fails() {
        let db = backend().await;
        let (item, _) = db.ingest_item(&sample_item("msg-5")).await.unwrap();
        let entry =
            ReviewEntry::new(item.id, DecisionType::Categorization, serde_json::json!("X"));
        db.insert_review_entry(&entry).await.unwrap();

        db.resolve_review_entry(entry.id, Resolution::Approved, None)
            .await
            .unwrap();
        let err = db
            .resolve_review_entry(entry.id, Resolution::Denied, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn job_lock_is_exclusive() {
        let db = backend().await;
        db.create_job(&sample_job("job-1")).await.unwrap();

        let holder_a = Uuid::new_v4();
        let holder_b = Uuid::new_v4();
        let stale = Utc::now() - ChronoDuration::minutes(30);

        assert!(db.try_acquire_job_lock("job-1", holder_a, stale).await.unwrap());
        assert!(!db.try_acquire_job_lock("job-1", holder_b, stale).await.unwrap());

        db.release_job_lock("job-1", holder_a).await.unwrap();
        assert!(db.try_acquire_job_lock("job-1", holder_b, stale).await.unwrap());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimable() {
        let db = backend().await;
        db.create_job(&sample_job("job-2")).await.unwrap();

        let holder_a = Uuid::new_v4();
        let stale = Utc::now() - ChronoDuration::minutes(30);
        assert!(db.try_acquire_job_lock("job-2", holder_a, stale).await.unwrap());

        // With a cutoff in the future, holder_a's lock counts as stale
        let holder_b = Uuid::new_v4();
        let future_cutoff = Utc::now() + ChronoDuration::minutes(1);
        assert!(db
            .try_acquire_job_lock("job-2", holder_b, future_cutoff)
            .await
            .unwrap());

        let job = db.get_job("job-2").await.unwrap();
        assert_eq!(job.lock_holder, Some(holder_b));
    }

    #[tokio::test]
    async fn commit_chunk_folds_counters_and_releases_lock() {
        let db = backend().await;
        db.create_job(&sample_job("job-3")).await.unwrap();

        let holder = Uuid::new_v4();
        let stale = Utc::now() - ChronoDuration::minutes(30);
        db.try_acquire_job_lock("job-3", holder, stale).await.unwrap();

        let range = (
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        );
        db.begin_chunk("job-3", range).await.unwrap();

        let running = db.get_job("job-3").await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.current_chunk, Some(range));
        assert!(running.started_at.is_some());

        let outcome = ChunkOutcome {
            processed: 120,
            categorized: 118,
            labeled: 100,
            pending_review: 18,
            errors: 2,
        };
        db.commit_chunk("job-3", range, &outcome, dec!(0.1488))
            .await
            .unwrap();

        let job = db.get_job("job-3").await.unwrap();
        assert_eq!(job.items_processed, 120);
        assert_eq!(job.items_labeled, 100);
        assert_eq!(job.items_errors, 2);
        assert_eq!(job.chunks_completed, 1);
        assert_eq!(job.completed_ranges, vec![range]);
        assert_eq!(job.estimated_cost, dec!(0.1488));
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.lock_holder, None);
        assert_eq!(job.current_chunk, None);
    }

    #[tokio::test]
    async fn chunk_failure_increments_retry_and_keeps_lock() {
        let db = backend().await;
        db.create_job(&sample_job("job-4")).await.unwrap();

        let holder = Uuid::new_v4();
        let stale = Utc::now() - ChronoDuration::minutes(30);
        db.try_acquire_job_lock("job-4", holder, stale).await.unwrap();

        assert_eq!(db.record_chunk_failure("job-4", "boom").await.unwrap(), 1);
        assert_eq!(db.record_chunk_failure("job-4", "boom").await.unwrap(), 2);

        let job = db.get_job("job-4").await.unwrap();
        assert_eq!(job.lock_holder, Some(holder));
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn active_job_is_singular_view() {
        let db = backend().await;
        assert!(db.active_job().await.unwrap().is_none());

        db.create_job(&sample_job("job-5")).await.unwrap();
        assert_eq!(db.active_job().await.unwrap().unwrap().job_id, "job-5");

        db.set_job_status("job-5", JobStatus::Completed).await.unwrap();
        assert!(db.active_job().await.unwrap().is_none());

        let job = db.get_job("job-5").await.unwrap();
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("triage.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.ingest_item(&sample_item("persist-1")).await.unwrap();
        }

        // Reopen runs migrations again; they must be idempotent
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let item = db.get_item("persist-1").await.unwrap();
        assert!(item.is_some());
    }
}
