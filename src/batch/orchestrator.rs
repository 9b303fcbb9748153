//! Batch backfill orchestration.
//!
//! A job covers a date range, split into fixed-size chunks. Each worker
//! invocation acquires the job lock, processes exactly one chunk, commits
//! the results in a single write, and dispatches the next invocation. A
//! crash mid-chunk loses nothing: the chunk's range was never committed,
//! and the stale lock is reclaimed on the next invocation.

use std::sync::Arc;

use chrono::{Days, NaiveDate, TimeDelta, Utc};
use futures::StreamExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::dispatch::ChunkDispatcher;
use crate::config::AppConfig;
use crate::error::{JobError, MailError};
use crate::mail::MailProvider;
use crate::pipeline::{ClassificationWorkflow, ProcessOutcome};
use crate::store::{BatchJob, ChunkOutcome, Database, JobStatus};

/// Estimated model cost per processed item, in dollars.
pub const ITEM_COST: Decimal = dec!(0.00124);

/// What one worker invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    /// No ranges left; the job is now complete.
    Completed,
    /// One chunk processed and committed.
    ChunkCompleted {
        range: (NaiveDate, NaiveDate),
        outcome: ChunkOutcome,
    },
    /// The job is paused, completed, or failed; nothing ran.
    Skipped { reason: &'static str },
    /// Another worker holds the lock.
    LockBusy,
}

/// Split a date range into chunks of roughly `chunk_months` each.
///
/// Consecutive chunks share a boundary date; the provider query treats the
/// end date as exclusive, so nothing is double-counted.
pub fn generate_date_ranges(
    start: NaiveDate,
    end: NaiveDate,
    chunk_months: u32,
) -> Vec<(NaiveDate, NaiveDate)> {
    let step = Days::new(u64::from(chunk_months) * 30);
    let mut ranges = Vec::new();
    let mut current = start;
    while current < end {
        let chunk_end = current
            .checked_add_days(step)
            .map(|d| d.min(end))
            .unwrap_or(end);
        ranges.push((current, chunk_end));
        current = chunk_end;
    }
    ranges
}

/// Drives batch jobs chunk by chunk.
pub struct BatchOrchestrator {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailProvider>,
    workflow: Arc<ClassificationWorkflow>,
    dispatcher: Arc<dyn ChunkDispatcher>,
    config: AppConfig,
}

impl BatchOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailProvider>,
        workflow: Arc<ClassificationWorkflow>,
        dispatcher: Arc<dyn ChunkDispatcher>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            mail,
            workflow,
            dispatcher,
            config,
        }
    }

    /// Create a job covering `[start, end)` and dispatch its first chunk.
    ///
    /// Only one job may be active at a time.
    pub async fn submit(&self, start: NaiveDate, end: NaiveDate) -> Result<BatchJob, JobError> {
        if start >= end {
            return Err(JobError::InvalidRange(format!(
                "start {start} must be before end {end}"
            )));
        }
        if let Some(active) = self.db.active_job().await? {
            return Err(JobError::AlreadyActive { id: active.job_id });
        }

        let ranges = generate_date_ranges(start, end, self.config.chunk_months);
        let job_id: String = Uuid::new_v4().to_string().chars().take(8).collect();
        let now = Utc::now();
        let job = BatchJob {
            job_id: job_id.clone(),
            query_template: "after:{after} before:{before}".to_string(),
            start_date: start,
            end_date: end,
            chunk_size: self.config.chunk_size,
            chunk_months: self.config.chunk_months,
            status: JobStatus::Pending,
            chunks_completed: 0,
            chunks_total: ranges.len() as u32,
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
            completed_ranges: Vec::new(),
            started_at: None,
            completed_at: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
        };
        self.db.create_job(&job).await?;
        info!(job_id = %job_id, chunks = ranges.len(), %start, %end, "Batch job created");

        self.dispatcher
            .dispatch(&job_id, std::time::Duration::ZERO)
            .await?;
        Ok(job)
    }

    /// Process the next pending chunk of a job. One invocation, one chunk.
    pub async fn advance(&self, job_id: &str) -> Result<ChunkResult, JobError> {
        let job = self.db.get_job(job_id).await?;
        match job.status {
            JobStatus::Paused => return Ok(ChunkResult::Skipped { reason: "paused" }),
            JobStatus::Completed => return Ok(ChunkResult::Skipped { reason: "completed" }),
            JobStatus::Failed => return Ok(ChunkResult::Skipped { reason: "failed" }),
            JobStatus::Pending | JobStatus::Running => {}
        }

        let holder = Uuid::new_v4();
        let stale_before = Utc::now()
            - TimeDelta::from_std(self.config.lock_timeout)
                .unwrap_or_else(|_| TimeDelta::minutes(30));
        if !self
            .db
            .try_acquire_job_lock(job_id, holder, stale_before)
            .await?
        {
            debug!(job_id, "Lock busy, another worker is processing");
            return Ok(ChunkResult::LockBusy);
        }

        // Refresh the row now that we hold the lock: the previous holder may
        // have committed a chunk between our read and the acquisition
        let job = self.db.get_job(job_id).await?;
        let ranges = generate_date_ranges(job.start_date, job.end_date, job.chunk_months);
        let next = ranges
            .iter()
            .find(|r| !job.completed_ranges.contains(r))
            .copied();
        let Some(range) = next else {
            self.db.set_job_status(job_id, JobStatus::Completed).await?;
            self.db.release_job_lock(job_id, holder).await?;
            info!(job_id, "Batch job completed");
            return Ok(ChunkResult::Completed);
        };

        self.db.begin_chunk(job_id, range).await?;
        info!(job_id, start = %range.0, end = %range.1, "Processing chunk");

        match self.process_chunk(&job, range).await {
            Ok(outcome) => {
                let cost = Decimal::from(outcome.processed) * ITEM_COST;
                self.db.commit_chunk(job_id, range, &outcome, cost).await?;

                let remaining = ranges.len() as u32 - (job.chunks_completed + 1);
                info!(
                    job_id,
                    processed = outcome.processed,
                    errors = outcome.errors,
                    remaining,
                    "Chunk committed"
                );
                if remaining > 0 {
                    let task_id = self
                        .dispatcher
                        .dispatch(job_id, self.config.continuation_delay)
                        .await?;
                    debug!(job_id, %task_id, "Continuation dispatched");
                }
                Ok(ChunkResult::ChunkCompleted { range, outcome })
            }
            Err(e) => {
                error!(job_id, error = %e, "Chunk failed");
                let retries = self.db.record_chunk_failure(job_id, &e.to_string()).await?;
                if retries >= self.config.max_chunk_retries {
                    // Terminal: no retry is coming, so free the lock for a
                    // manual resume
                    self.db.set_job_status(job_id, JobStatus::Failed).await?;
                    self.db.release_job_lock(job_id, holder).await?;
                    error!(job_id, retries, "Job failed, retries exhausted");
                }
                // Otherwise the lock stays held; a retry has to wait out the
                // staleness window before reclaiming it
                Err(JobError::ChunkFailed {
                    id: job_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run every message in one chunk through the workflow.
    ///
    /// Per-item failures are counted, not fatal; only a listing failure
    /// fails the chunk.
    async fn process_chunk(
        &self,
        job: &BatchJob,
        range: (NaiveDate, NaiveDate),
    ) -> Result<ChunkOutcome, MailError> {
        let query = job
            .query_template
            .replace("{after}", &range.0.format("%Y/%m/%d").to_string())
            .replace("{before}", &range.1.format("%Y/%m/%d").to_string());
        let refs = self.mail.list_messages(&query, job.chunk_size).await?;
        debug!(job_id = %job.job_id, %query, count = refs.len(), "Listed chunk messages");

        let results: Vec<_> = futures::stream::iter(refs)
            .map(|msg_ref| {
                let workflow = self.workflow.clone();
                async move { workflow.process_message(&msg_ref).await }
            })
            .buffer_unordered(self.config.chunk_concurrency)
            .collect()
            .await;

        let mut outcome = ChunkOutcome::default();
        for result in results {
            outcome.processed += 1;
            match result {
                Ok(ProcessOutcome::AutoLabeled { .. }) => {
                    outcome.categorized += 1;
                    outcome.labeled += 1;
                }
                Ok(ProcessOutcome::PendingReview { .. }) => {
                    outcome.categorized += 1;
                    outcome.pending_review += 1;
                }
                Ok(ProcessOutcome::AlreadyProcessed) => {}
                Ok(ProcessOutcome::DeadLettered { .. }) => outcome.errors += 1,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Item failed in chunk");
                    outcome.errors += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Stop dispatching new chunks. The in-flight chunk, if any, finishes.
    pub async fn pause(&self, job_id: &str) -> Result<BatchJob, JobError> {
        let job = self.db.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            return Err(JobError::InvalidState {
                id: job_id.to_string(),
                status: job.status.as_str().to_string(),
                action: "pause".to_string(),
            });
        }
        self.db.set_job_status(job_id, JobStatus::Paused).await?;
        info!(job_id, "Job paused");
        self.db.get_job(job_id).await.map_err(JobError::from)
    }

    /// Resume a paused or failed job by dispatching a fresh invocation.
    pub async fn resume(&self, job_id: &str) -> Result<BatchJob, JobError> {
        let job = self.db.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Paused | JobStatus::Failed) {
            return Err(JobError::InvalidState {
                id: job_id.to_string(),
                status: job.status.as_str().to_string(),
                action: "resume".to_string(),
            });
        }
        self.db.set_job_status(job_id, JobStatus::Running).await?;
        let task_id = self
            .dispatcher
            .dispatch(job_id, std::time::Duration::ZERO)
            .await?;
        info!(job_id, %task_id, "Job resumed");
        self.db.get_job(job_id).await.map_err(JobError::from)
    }

    pub async fn status(&self, job_id: &str) -> Result<BatchJob, JobError> {
        self.db.get_job(job_id).await.map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::classify::{Classification, Classifier, ClassifyRequest, EventDetails, ModelTier};
    use crate::error::{ClassifierError, DatabaseError};
    use crate::mail::{MailMessage, MessageRef};
    use crate::store::{
        CheckpointRecord, FeedbackRecord, Item, LibSqlBackend, Resolution, ReviewEntry,
    };

    struct RecordingDispatcher {
        dispatched: Mutex<Vec<String>>,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self {
                dispatched: Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChunkDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            job_id: &str,
            _delay: std::time::Duration,
        ) -> Result<String, JobError> {
            self.dispatched.lock().unwrap().push(job_id.to_string());
            Ok("task".to_string())
        }
    }

    /// Two messages per queried range, ids derived from the query.
    struct RangeMail {
        fail_listing: AtomicBool,
    }

    impl RangeMail {
        fn new() -> Self {
            Self {
                fail_listing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MailProvider for RangeMail {
        async fn list_messages(
            &self,
            query: &str,
            _max_results: u32,
        ) -> Result<Vec<MessageRef>, MailError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(MailError::Request("listing down".into()));
            }
            let key = query.replace(['/', ' ', ':'], "-");
            Ok((0..2)
                .map(|i| MessageRef {
                    id: format!("{key}-{i}"),
                    thread_id: format!("t-{key}-{i}"),
                })
                .collect())
        }

        async fn get_message(&self, msg_ref: &MessageRef) -> Result<MailMessage, MailError> {
            Ok(MailMessage {
                message_id: msg_ref.id.clone(),
                thread_id: msg_ref.thread_id.clone(),
                from_email: "peer@example.com".into(),
                to_emails: vec!["me@example.com".into()],
                subject: "Status update".into(),
                body: "All quiet.".into(),
                snippet: "All quiet".into(),
                date: Utc::now(),
                headers: BTreeMap::new(),
                labels: vec![],
            })
        }

        async fn apply_label(&self, _message_id: &str, _label: &str) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct SureClassifier;

    #[async_trait]
    impl Classifier for SureClassifier {
        async fn classify(
            &self,
            _request: &ClassifyRequest,
            _tier: ModelTier,
        ) -> Result<Classification, ClassifierError> {
            Ok(Classification {
                label: "Professional/Work".into(),
                confidence: 0.93,
                rationale: "status".into(),
                key_phrases: vec![],
                model: "fast".into(),
            })
        }

        async fn extract_event(
            &self,
            _subject: &str,
            _from_email: &str,
            _body: &str,
        ) -> Result<Option<EventDetails>, ClassifierError> {
            Ok(None)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn orchestrator() -> (BatchOrchestrator, Arc<LibSqlBackend>, Arc<RecordingDispatcher>, Arc<RangeMail>)
    {
        orchestrator_with(AppConfig::default()).await
    }

    async fn orchestrator_with(
        config: AppConfig,
    ) -> (BatchOrchestrator, Arc<LibSqlBackend>, Arc<RecordingDispatcher>, Arc<RangeMail>)
    {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mail = Arc::new(RangeMail::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let workflow = Arc::new(ClassificationWorkflow::new(
            db.clone(),
            mail.clone(),
            Arc::new(SureClassifier),
            None,
            config.clone(),
        ));
        let orchestrator = BatchOrchestrator::new(
            db.clone(),
            mail.clone(),
            workflow,
            dispatcher.clone(),
            config,
        );
        (orchestrator, db, dispatcher, mail)
    }

    #[test]
    fn ranges_cover_span_in_two_month_chunks() {
        let ranges = generate_date_ranges(date(2026, 1, 1), date(2026, 6, 30), 2);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].0, date(2026, 1, 1));
        // Chunks are contiguous and end exactly at the requested end
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(ranges.last().unwrap().1, date(2026, 6, 30));
    }

    #[test]
    fn empty_and_short_spans() {
        assert!(generate_date_ranges(date(2026, 3, 1), date(2026, 3, 1), 2).is_empty());
        let short = generate_date_ranges(date(2026, 3, 1), date(2026, 3, 15), 2);
        assert_eq!(short, vec![(date(2026, 3, 1), date(2026, 3, 15))]);
    }

    #[tokio::test]
    async fn submit_creates_job_and_dispatches_first_chunk() {
        let (orchestrator, db, dispatcher, _mail) = orchestrator().await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 6, 30))
            .await
            .unwrap();
        assert_eq!(job.job_id.len(), 8);
        assert_eq!(job.chunks_total, 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(dispatcher.count(), 1);
        assert!(db.get_job(&job.job_id).await.is_ok());
    }

    #[tokio::test]
    async fn second_submit_is_rejected_while_active() {
        let (orchestrator, _db, _dispatcher, _mail) = orchestrator().await;
        orchestrator
            .submit(date(2026, 1, 1), date(2026, 3, 1))
            .await
            .unwrap();
        let err = orchestrator
            .submit(date(2026, 4, 1), date(2026, 6, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let (orchestrator, _db, _dispatcher, _mail) = orchestrator().await;
        let err = orchestrator
            .submit(date(2026, 6, 1), date(2026, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn advance_walks_all_chunks_to_completion() {
        let (orchestrator, db, dispatcher, _mail) = orchestrator().await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 6, 30))
            .await
            .unwrap();

        for expected_chunk in 1..=3u32 {
            let result = orchestrator.advance(&job.job_id).await.unwrap();
            let ChunkResult::ChunkCompleted { outcome, .. } = result else {
                panic!("expected chunk completion, got {result:?}");
            };
            assert_eq!(outcome.processed, 2);
            assert_eq!(outcome.labeled, 2);
            let stored = db.get_job(&job.job_id).await.unwrap();
            assert_eq!(stored.chunks_completed, expected_chunk);
            assert!(stored.lock_holder.is_none());
        }

        let stored = db.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.items_processed, 6);
        assert_eq!(stored.items_labeled, 6);
        assert_eq!(stored.estimated_cost, dec!(0.00744));
        assert_eq!(stored.completed_ranges.len(), 3);

        // A final invocation finds nothing left and completes the job
        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert_eq!(result, ChunkResult::Completed);
        let stored = db.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());

        // submit + 2 continuations; the last chunk dispatches none
        assert_eq!(dispatcher.count(), 3);
    }

    #[tokio::test]
    async fn paused_job_skips_and_resume_restarts() {
        let (orchestrator, _db, dispatcher, _mail) = orchestrator().await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 3, 1))
            .await
            .unwrap();

        orchestrator.pause(&job.job_id).await.unwrap();
        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert_eq!(result, ChunkResult::Skipped { reason: "paused" });

        let before = dispatcher.count();
        let resumed = orchestrator.resume(&job.job_id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(dispatcher.count(), before + 1);
    }

    #[tokio::test]
    async fn listing_failures_exhaust_retries_and_fail_the_job() {
        // Zero staleness window so each retry can reclaim the held lock
        let mut config = AppConfig::default();
        config.lock_timeout = Duration::ZERO;
        let (orchestrator, db, _dispatcher, mail) = orchestrator_with(config).await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 3, 1))
            .await
            .unwrap();
        mail.fail_listing.store(true, Ordering::SeqCst);

        for attempt in 1..=3u32 {
            let err = orchestrator.advance(&job.job_id).await.unwrap_err();
            assert!(matches!(err, JobError::ChunkFailed { .. }));
            let stored = db.get_job(&job.job_id).await.unwrap();
            assert_eq!(stored.retry_count, attempt);
            if attempt < 3 {
                // The failed chunk's lock is left in place
                assert!(stored.lock_holder.is_some());
            }
        }

        // Exhaustion fails the job and frees the lock for a manual resume
        let stored = db.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.lock_holder.is_none());
        assert!(stored.last_error.unwrap().contains("listing down"));

        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert_eq!(result, ChunkResult::Skipped { reason: "failed" });

        // A failed job can be resumed; successful chunks reset the counter
        mail.fail_listing.store(false, Ordering::SeqCst);
        orchestrator.resume(&job.job_id).await.unwrap();
        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert!(matches!(result, ChunkResult::ChunkCompleted { .. }));
        let stored = db.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn held_lock_blocks_other_workers() {
        let (orchestrator, db, _dispatcher, _mail) = orchestrator().await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 3, 1))
            .await
            .unwrap();

        let other = Uuid::new_v4();
        let stale = Utc::now() - TimeDelta::minutes(30);
        assert!(db
            .try_acquire_job_lock(&job.job_id, other, stale)
            .await
            .unwrap());

        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert_eq!(result, ChunkResult::LockBusy);
    }

    #[tokio::test]
    async fn failed_chunk_keeps_lock_and_throttles_retries() {
        let (orchestrator, db, _dispatcher, mail) = orchestrator().await;
        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 3, 1))
            .await
            .unwrap();
        mail.fail_listing.store(true, Ordering::SeqCst);

        let err = orchestrator.advance(&job.job_id).await.unwrap_err();
        assert!(matches!(err, JobError::ChunkFailed { .. }));
        let stored = db.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.lock_holder.is_some());

        // With the default staleness window the fresh lock cannot be
        // reclaimed, so an immediate re-invocation is a no-op
        let result = orchestrator.advance(&job.job_id).await.unwrap();
        assert_eq!(result, ChunkResult::LockBusy);
    }

    /// Delegates to the real backend, but commits the first chunk right
    /// before the first lock acquisition — the moment a racing holder
    /// would have finished.
    struct RacingCommitDb {
        inner: Arc<LibSqlBackend>,
        race_range: (NaiveDate, NaiveDate),
        raced: AtomicBool,
    }

    #[async_trait]
    impl Database for RacingCommitDb {
        async fn ingest_item(&self, item: &Item) -> Result<(Item, bool), DatabaseError> {
            self.inner.ingest_item(item).await
        }

        async fn get_item(&self, external_id: &str) -> Result<Option<Item>, DatabaseError> {
            self.inner.get_item(external_id).await
        }

        async fn get_item_by_id(&self, id: Uuid) -> Result<Item, DatabaseError> {
            self.inner.get_item_by_id(id).await
        }

        async fn update_item(&self, item: &Item) -> Result<(), DatabaseError> {
            self.inner.update_item(item).await
        }

        async fn dead_letter_items(&self) -> Result<Vec<Item>, DatabaseError> {
            self.inner.dead_letter_items().await
        }

        async fn insert_checkpoint(
            &self,
            item_id: Uuid,
            step: &str,
            snapshot: &serde_json::Value,
        ) -> Result<(), DatabaseError> {
            self.inner.insert_checkpoint(item_id, step, snapshot).await
        }

        async fn latest_checkpoint(
            &self,
            item_id: Uuid,
        ) -> Result<Option<CheckpointRecord>, DatabaseError> {
            self.inner.latest_checkpoint(item_id).await
        }

        async fn checkpoints_for(
            &self,
            item_id: Uuid,
        ) -> Result<Vec<CheckpointRecord>, DatabaseError> {
            self.inner.checkpoints_for(item_id).await
        }

        async fn insert_review_entry(&self, entry: &ReviewEntry) -> Result<bool, DatabaseError> {
            self.inner.insert_review_entry(entry).await
        }

        async fn open_review_entries(&self) -> Result<Vec<ReviewEntry>, DatabaseError> {
            self.inner.open_review_entries().await
        }

        async fn get_review_entry(&self, id: Uuid) -> Result<ReviewEntry, DatabaseError> {
            self.inner.get_review_entry(id).await
        }

        async fn resolve_review_entry(
            &self,
            id: Uuid,
            resolution: Resolution,
            corrected: Option<&str>,
        ) -> Result<(), DatabaseError> {
            self.inner.resolve_review_entry(id, resolution, corrected).await
        }

        async fn insert_feedback(&self, feedback: &FeedbackRecord) -> Result<(), DatabaseError> {
            self.inner.insert_feedback(feedback).await
        }

        async fn create_job(&self, job: &BatchJob) -> Result<(), DatabaseError> {
            self.inner.create_job(job).await
        }

        async fn get_job(&self, job_id: &str) -> Result<BatchJob, DatabaseError> {
            self.inner.get_job(job_id).await
        }

        async fn active_job(&self) -> Result<Option<BatchJob>, DatabaseError> {
            self.inner.active_job().await
        }

        async fn set_job_status(
            &self,
            job_id: &str,
            status: JobStatus,
        ) -> Result<(), DatabaseError> {
            self.inner.set_job_status(job_id, status).await
        }

        async fn begin_chunk(
            &self,
            job_id: &str,
            range: (NaiveDate, NaiveDate),
        ) -> Result<(), DatabaseError> {
            self.inner.begin_chunk(job_id, range).await
        }

        async fn try_acquire_job_lock(
            &self,
            job_id: &str,
            holder: Uuid,
            stale_before: DateTime<Utc>,
        ) -> Result<bool, DatabaseError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let outcome = ChunkOutcome {
                    processed: 2,
                    categorized: 2,
                    labeled: 2,
                    pending_review: 0,
                    errors: 0,
                };
                self.inner
                    .commit_chunk(job_id, self.race_range, &outcome, Decimal::ZERO)
                    .await?;
            }
            self.inner
                .try_acquire_job_lock(job_id, holder, stale_before)
                .await
        }

        async fn release_job_lock(&self, job_id: &str, holder: Uuid) -> Result<(), DatabaseError> {
            self.inner.release_job_lock(job_id, holder).await
        }

        async fn commit_chunk(
            &self,
            job_id: &str,
            range: (NaiveDate, NaiveDate),
            outcome: &ChunkOutcome,
            cost_delta: Decimal,
        ) -> Result<(), DatabaseError> {
            self.inner.commit_chunk(job_id, range, outcome, cost_delta).await
        }

        async fn record_chunk_failure(
            &self,
            job_id: &str,
            error: &str,
        ) -> Result<u32, DatabaseError> {
            self.inner.record_chunk_failure(job_id, error).await
        }
    }

    #[tokio::test]
    async fn advance_skips_chunk_committed_by_racing_holder() {
        let inner = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mail = Arc::new(RangeMail::new());
        let config = AppConfig::default();
        let ranges = generate_date_ranges(date(2026, 1, 1), date(2026, 5, 1), config.chunk_months);
        assert_eq!(ranges.len(), 2);

        let db: Arc<dyn Database> = Arc::new(RacingCommitDb {
            inner: inner.clone(),
            race_range: ranges[0],
            raced: AtomicBool::new(false),
        });
        let workflow = Arc::new(ClassificationWorkflow::new(
            db.clone(),
            mail.clone(),
            Arc::new(SureClassifier),
            None,
            config.clone(),
        ));
        let orchestrator = BatchOrchestrator::new(
            db,
            mail,
            workflow,
            Arc::new(RecordingDispatcher::new()),
            config,
        );

        let job = orchestrator
            .submit(date(2026, 1, 1), date(2026, 5, 1))
            .await
            .unwrap();
        let result = orchestrator.advance(&job.job_id).await.unwrap();
        let ChunkResult::ChunkCompleted { range, .. } = result else {
            panic!("expected chunk completion, got {result:?}");
        };
        // The first range was committed under our nose; this invocation
        // must move on to the second, not re-process it
        assert_eq!(range, ranges[1]);

        let stored = inner.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.completed_ranges, ranges);
        assert_eq!(stored.chunks_completed, 2);
        assert_eq!(stored.items_processed, 4);
    }
}
