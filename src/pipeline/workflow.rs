//! The per-message classification workflow.
//!
//! Each message moves through ingest → classify → score_importance →
//! enrich → finalize → label. After every completed step the full state is
//! checkpointed, so a crashed or interrupted run resumes at the step after
//! the last checkpoint without refetching or re-calling models. Steps are
//! retried with exponential backoff and jitter; exhausted retries and
//! validation failures dead-letter the item.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::ConflictChecker;
use crate::classify::{classify_with_escalation, Classifier, ClassifyRequest};
use crate::config::AppConfig;
use crate::error::WorkflowError;
use crate::mail::{MailProvider, MessageRef};
use crate::pipeline::calendar::{self, CalendarOutcome};
use crate::pipeline::importance::{ImportanceScorer, ScoringInput};
use crate::pipeline::state::{ItemState, Step};
use crate::pipeline::unsubscribe::{self, UNSUBSCRIBE_CATEGORIES};
use crate::store::{Database, DecisionType, Item, ItemStatus, ReviewEntry};

/// Label prefix for category labels.
const LABEL_ROOT: &str = "Triage";

/// What processing a message concluded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The item was already in a terminal state; nothing ran.
    AlreadyProcessed,
    /// Confident classification; labels applied without human input.
    AutoLabeled { category: String },
    /// Queued for human review; labels withheld.
    PendingReview { category: Option<String> },
    /// Retries exhausted or validation failed.
    DeadLettered { reason: String },
}

/// Orchestrates the per-message workflow.
pub struct ClassificationWorkflow {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailProvider>,
    classifier: Arc<dyn Classifier>,
    calendar: Option<Arc<dyn ConflictChecker>>,
    scorer: ImportanceScorer,
    config: AppConfig,
}

impl ClassificationWorkflow {
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailProvider>,
        classifier: Arc<dyn Classifier>,
        calendar: Option<Arc<dyn ConflictChecker>>,
        config: AppConfig,
    ) -> Self {
        let scorer = ImportanceScorer::new(config.importance.clone());
        Self {
            db,
            mail,
            classifier,
            calendar,
            scorer,
            config,
        }
    }

    /// Process one message end to end, resuming from a checkpoint if one
    /// exists.
    pub async fn process_message(
        &self,
        msg_ref: &MessageRef,
    ) -> Result<ProcessOutcome, WorkflowError> {
        // Fetch first so ingest can capture full content into the checkpoint
        let message = match self.mail.get_message(msg_ref).await {
            Ok(m) => m,
            Err(e) if e.is_transient() => {
                return Err(WorkflowError::Transient {
                    step: Step::Ingest.as_str().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                // Unfetchable or malformed: record and dead-letter a stub
                return self.dead_letter_stub(msg_ref, &e.to_string()).await;
            }
        };

        let candidate = Item::new(
            message.message_id.clone(),
            message.thread_id.clone(),
            message.from_email.clone(),
            message.subject.clone(),
            message.snippet.clone(),
            message.date,
        );
        let (mut item, created) = self.db.ingest_item(&candidate).await?;

        if !created && item.status.is_terminal() {
            debug!(external_id = %item.external_id, status = item.status.as_str(), "Skipping terminal item");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }
        // An item awaiting review only moves via a resolution
        if !created && item.status == ItemStatus::PendingReview {
            return Ok(ProcessOutcome::PendingReview {
                category: item.category.clone(),
            });
        }

        let (mut state, resume_from) = if created {
            let state = ItemState::from_message(&message);
            let snapshot = state
                .snapshot()
                .map_err(|e| WorkflowError::Validation(format!("state snapshot: {e}")))?;
            self.db
                .insert_checkpoint(item.id, Step::Ingest.as_str(), &snapshot)
                .await?;
            (state, Step::Classify)
        } else {
            self.resume_state(&item, &message).await?
        };

        info!(
            external_id = %item.external_id,
            resume_from = resume_from.as_str(),
            created,
            "Processing message"
        );

        let mut step = Some(resume_from);
        while let Some(current) = step {
            self.run_step_with_retry(current, &mut item, &mut state)
                .await?;

            let snapshot = state
                .snapshot()
                .map_err(|e| WorkflowError::Validation(format!("state snapshot: {e}")))?;
            self.db
                .insert_checkpoint(item.id, current.as_str(), &snapshot)
                .await?;
            self.db.update_item(&item).await?;

            // A review verdict pauses the workflow before labeling
            if current == Step::Finalize && state.needs_review {
                return Ok(ProcessOutcome::PendingReview {
                    category: item.category.clone(),
                });
            }
            step = current.after();
        }

        Ok(ProcessOutcome::AutoLabeled {
            category: item.category.clone().unwrap_or_default(),
        })
    }

    /// Re-enter the workflow at the label step after a review resolution.
    ///
    /// `category` overrides the classifier's label when the reviewer
    /// corrected it; `apply_labels` is false for denied reviews, which go
    /// terminal without touching the mailbox.
    pub async fn complete_with_resolution(
        &self,
        item_id: Uuid,
        category: Option<String>,
        apply_labels: bool,
    ) -> Result<(), WorkflowError> {
        let mut item = self.db.get_item_by_id(item_id).await?;
        if item.status.is_terminal() {
            return Ok(());
        }

        if let Some(category) = category {
            item.category = Some(category);
        }

        if apply_labels {
            let checkpoint = self.db.latest_checkpoint(item.id).await?;
            let state = checkpoint
                .as_ref()
                .and_then(|c| ItemState::from_snapshot(&c.snapshot).ok());
            let importance = state.as_ref().and_then(|s| s.importance.as_ref());
            let level = importance.map(|i| i.level).or(item.importance);
            self.apply_labels(&mut item, level).await?;
            item.status = ItemStatus::Labeled;
        } else {
            item.status = ItemStatus::Labeled;
        }
        self.db.update_item(&item).await?;
        info!(item_id = %item.id, status = item.status.as_str(), "Review resolution applied");
        Ok(())
    }

    /// Load the latest checkpoint and work out where to resume.
    async fn resume_state(
        &self,
        item: &Item,
        message: &crate::mail::MailMessage,
    ) -> Result<(ItemState, Step), WorkflowError> {
        match self.db.latest_checkpoint(item.id).await? {
            Some(checkpoint) => {
                let state = ItemState::from_snapshot(&checkpoint.snapshot)
                    .map_err(|e| WorkflowError::Validation(format!("corrupt checkpoint: {e}")))?;
                let completed = Step::parse(&checkpoint.step).ok_or_else(|| {
                    WorkflowError::Validation(format!("unknown checkpoint step {}", checkpoint.step))
                })?;
                let resume = completed.after().unwrap_or(Step::Label);
                debug!(item_id = %item.id, completed = completed.as_str(), "Resuming from checkpoint");
                Ok((state, resume))
            }
            // No checkpoint at all: start over from the fetched message
            None => Ok((ItemState::from_message(message), Step::Classify)),
        }
    }

    async fn run_step_with_retry(
        &self,
        step: Step,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_step(step, item, state).await {
                Ok(()) => {
                    if attempt > 1 {
                        item.last_error = None;
                    }
                    return Ok(());
                }
                Err(WorkflowError::Validation(reason)) => {
                    error!(item_id = %item.id, step = step.as_str(), %reason, "Validation failure");
                    return self.dead_letter(item, step, &reason).await;
                }
                Err(WorkflowError::Database(e)) => return Err(WorkflowError::Database(e)),
                Err(e) if attempt < self.config.max_step_attempts => {
                    item.status = ItemStatus::Failed;
                    item.last_error = Some(format!("{}: {e}", step.as_str()));
                    self.db.update_item(item).await?;
                    let delay = self.backoff(attempt);
                    warn!(
                        item_id = %item.id,
                        step = step.as_str(),
                        attempt,
                        ?delay,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(item_id = %item.id, step = step.as_str(), error = %e, "Retries exhausted");
                    return self.dead_letter(item, step, &e.to_string()).await;
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: Step,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        match step {
            Step::Ingest => Ok(()),
            Step::Classify => self.step_classify(item, state).await,
            Step::ScoreImportance => self.step_score_importance(item, state).await,
            Step::Enrich => self.step_enrich(item, state).await,
            Step::Finalize => self.step_finalize(item, state).await,
            Step::Label => self.step_label(item, state).await,
        }
    }

    async fn step_classify(
        &self,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        item.status = ItemStatus::Classifying;

        let request = ClassifyRequest {
            subject: state.subject.clone(),
            from_email: state.from_email.clone(),
            body: state.body.clone(),
        };
        let classification = classify_with_escalation(
            self.classifier.as_ref(),
            &request,
            self.config.escalation_threshold,
        )
        .await
        .map_err(|e| WorkflowError::Transient {
            step: Step::Classify.as_str().to_string(),
            reason: e.to_string(),
        })?;

        item.category = Some(classification.label.clone());
        item.confidence = Some(classification.confidence);
        item.rationale = Some(classification.rationale.clone());
        item.key_phrases = classification.key_phrases.clone();
        item.model = Some(classification.model.clone());
        item.status = ItemStatus::Categorized;
        state.classification = Some(classification);
        Ok(())
    }

    async fn step_score_importance(
        &self,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        // Best effort; scoring falls back to a neutral value without it
        if state.thread_len.is_none() {
            state.thread_len = self
                .mail
                .thread_len(&state.thread_id)
                .await
                .unwrap_or_default();
        }

        let result = self.scorer.score(&ScoringInput {
            from_email: &state.from_email,
            subject: &state.subject,
            body: &state.body,
            headers: &state.headers,
            thread_len: state.thread_len,
        });

        debug!(
            item_id = %item.id,
            score = result.score,
            level = result.level.as_str(),
            "Importance scored"
        );
        item.importance_score = Some(result.score);
        item.importance = Some(result.level);
        item.status = ItemStatus::ImportanceScored;
        state.importance = Some(result);
        Ok(())
    }

    async fn step_enrich(
        &self,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        item.status = ItemStatus::Enriching;
        let category = item.category.as_deref().unwrap_or_default();

        // Calendar extraction, gated on category/importance/keywords
        let outcome = if calendar::should_extract_event(
            category,
            item.importance,
            &state.subject,
            &state.body,
        ) {
            let event = self
                .classifier
                .extract_event(&state.subject, &state.from_email, &state.body)
                .await
                .map_err(|e| WorkflowError::Transient {
                    step: Step::Enrich.as_str().to_string(),
                    reason: e.to_string(),
                })?;

            match event {
                Some(mut event) => {
                    if event.virtual_link.is_none() {
                        if let Some(link) = calendar::extract_virtual_link(&state.body) {
                            event.virtual_link = Some(link);
                            event.is_virtual = true;
                        }
                    }
                    let busy = self.find_conflicts(&event).await;
                    CalendarOutcome::extracted(event, busy)
                }
                None => CalendarOutcome::no_event(),
            }
        } else {
            CalendarOutcome::skipped()
        };
        item.has_event = outcome.event.is_some();
        state.calendar = Some(outcome);

        // Unsubscribe detection for newsletter/marketing categories
        if UNSUBSCRIBE_CATEGORIES.contains(&category) {
            state.unsubscribe = unsubscribe::detect_unsubscribe(&state.headers, &state.from_email);
            item.has_unsubscribe = state.unsubscribe.is_some();
        }
        Ok(())
    }

    /// Free/busy lookup for an extracted event. Calendar problems never
    /// block the pipeline; they just mean no conflicts are found.
    async fn find_conflicts(
        &self,
        event: &crate::classify::EventDetails,
    ) -> Vec<crate::calendar::BusyInterval> {
        let Some(checker) = &self.calendar else {
            return Vec::new();
        };
        let Some((start, end)) = calendar::event_window(event) else {
            return Vec::new();
        };
        match checker
            .busy_between(start.and_utc(), end.and_utc())
            .await
        {
            Ok(busy) => busy,
            Err(e) => {
                warn!(error = %e, "Conflict check failed, continuing without");
                Vec::new()
            }
        }
    }

    async fn step_finalize(
        &self,
        item: &mut Item,
        state: &mut ItemState,
    ) -> Result<(), WorkflowError> {
        let confidence = item.confidence.unwrap_or(0.0);
        let calendar_review = state
            .calendar
            .as_ref()
            .map(|c| c.needs_review)
            .unwrap_or(false);

        // The auto-label gate is boundary-inclusive
        if confidence < self.config.autolabel_threshold {
            state.needs_review = true;
            state.review_reason = Some(DecisionType::Categorization);
            let entry = ReviewEntry::new(
                item.id,
                DecisionType::Categorization,
                serde_json::json!({
                    "category": item.category,
                    "confidence": confidence,
                    "rationale": item.rationale,
                }),
            );
            self.db.insert_review_entry(&entry).await?;
        } else if calendar_review {
            state.needs_review = true;
            state.review_reason = Some(DecisionType::Calendar);
            let proposed = serde_json::to_value(state.calendar.as_ref())
                .map_err(|e| WorkflowError::Validation(format!("calendar state: {e}")))?;
            let entry = ReviewEntry::new(item.id, DecisionType::Calendar, proposed);
            self.db.insert_review_entry(&entry).await?;
        }

        // An unsubscribe option opens its own review entry but never forces
        // the item itself into review
        if let Some(option) = &state.unsubscribe {
            let proposed = serde_json::to_value(option)
                .map_err(|e| WorkflowError::Validation(format!("unsubscribe state: {e}")))?;
            let entry = ReviewEntry::new(item.id, DecisionType::Unsubscribe, proposed);
            self.db.insert_review_entry(&entry).await?;
        }

        item.status = if state.needs_review {
            ItemStatus::PendingReview
        } else {
            ItemStatus::Finalized
        };
        Ok(())
    }

    async fn step_label(&self, item: &mut Item, state: &mut ItemState) -> Result<(), WorkflowError> {
        // The gate passed at finalize; record that before the external write
        item.status = ItemStatus::AutoLabeled;
        self.db.update_item(item).await?;

        let level = state.importance.as_ref().map(|i| i.level).or(item.importance);
        self.apply_labels(item, level).await?;
        item.status = ItemStatus::Labeled;
        Ok(())
    }

    /// Apply the category label and, for high/critical items, a priority
    /// label. Already-recorded labels are skipped so re-entry after a crash
    /// cannot double-apply.
    async fn apply_labels(
        &self,
        item: &mut Item,
        level: Option<crate::store::Importance>,
    ) -> Result<(), WorkflowError> {
        let category = item.category.clone().ok_or_else(|| {
            WorkflowError::Validation("cannot label an item without a category".into())
        })?;

        let mut labels = vec![format!("{LABEL_ROOT}/{category}")];
        if let Some(level @ (crate::store::Importance::Critical | crate::store::Importance::High)) =
            level
        {
            let name = match level {
                crate::store::Importance::Critical => "Critical",
                _ => "High",
            };
            labels.push(format!("{LABEL_ROOT}/Priority/{name}"));
        }

        for label in labels {
            if item.applied_labels.contains(&label) {
                continue;
            }
            self.mail
                .apply_label(&item.external_id, &label)
                .await
                .map_err(|e| WorkflowError::Transient {
                    step: Step::Label.as_str().to_string(),
                    reason: e.to_string(),
                })?;
            item.applied_labels.push(label);
            // Persist after each label so a crash between the two cannot
            // re-apply the first
            self.db.update_item(item).await?;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        item: &mut Item,
        step: Step,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        item.status = ItemStatus::DeadLetter;
        item.last_error = Some(format!("{}: {reason}", step.as_str()));
        self.db.update_item(item).await?;
        Err(WorkflowError::DeadLettered {
            item_id: item.id,
            step: step.as_str().to_string(),
            reason: reason.to_string(),
        })
    }

    /// Dead-letter a message we could not even fetch or parse.
    async fn dead_letter_stub(
        &self,
        msg_ref: &MessageRef,
        reason: &str,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let stub = Item::new(
            msg_ref.id.clone(),
            msg_ref.thread_id.clone(),
            String::new(),
            String::new(),
            String::new(),
            chrono::Utc::now(),
        );
        let (mut item, _) = self.db.ingest_item(&stub).await?;
        item.status = ItemStatus::DeadLetter;
        item.last_error = Some(format!("ingest: {reason}"));
        self.db.update_item(&item).await?;
        warn!(external_id = %msg_ref.id, %reason, "Dead-lettered unreadable message");
        Ok(ProcessOutcome::DeadLettered {
            reason: reason.to_string(),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.step_backoff_base * 2u32.saturating_pow(attempt - 1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        base + jitter
    }
}
