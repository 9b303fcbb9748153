//! End-to-end batch run over an in-memory store with fake providers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use mail_triage::batch::{BatchOrchestrator, ChunkDispatcher, ChunkResult};
use mail_triage::classify::{Classification, Classifier, ClassifyRequest, EventDetails, ModelTier};
use mail_triage::config::AppConfig;
use mail_triage::error::{ClassifierError, JobError, MailError};
use mail_triage::mail::{MailMessage, MailProvider, MessageRef};
use mail_triage::pipeline::ClassificationWorkflow;
use mail_triage::review::{ReviewDecision, ReviewQueue};
use mail_triage::store::{Database, ItemStatus, JobStatus, LibSqlBackend};

/// Three messages per queried range; every third one is ambiguous.
struct SeededMail;

#[async_trait]
impl MailProvider for SeededMail {
    async fn list_messages(
        &self,
        query: &str,
        _max_results: u32,
    ) -> Result<Vec<MessageRef>, MailError> {
        let key: String = query
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        Ok((0..3)
            .map(|i| MessageRef {
                id: format!("{key}-{i}"),
                thread_id: format!("t-{key}-{i}"),
            })
            .collect())
    }

    async fn get_message(&self, msg_ref: &MessageRef) -> Result<MailMessage, MailError> {
        let ambiguous = msg_ref.id.ends_with("-2");
        Ok(MailMessage {
            message_id: msg_ref.id.clone(),
            thread_id: msg_ref.thread_id.clone(),
            from_email: "sender@example.com".into(),
            to_emails: vec!["me@example.com".into()],
            subject: if ambiguous {
                "fwd: stuff".into()
            } else {
                "Build results".into()
            },
            body: "Nightly build finished.".into(),
            snippet: "Nightly build".into(),
            date: Utc::now(),
            headers: BTreeMap::new(),
            labels: vec![],
        })
    }

    async fn apply_label(&self, _message_id: &str, _label: &str) -> Result<(), MailError> {
        Ok(())
    }
}

/// Confidence keyed off the subject so outcomes are deterministic.
struct SubjectClassifier;

#[async_trait]
impl Classifier for SubjectClassifier {
    async fn classify(
        &self,
        request: &ClassifyRequest,
        _tier: ModelTier,
    ) -> Result<Classification, ClassifierError> {
        let confident = request.subject.starts_with("Build");
        Ok(Classification {
            label: "Professional/Work".into(),
            confidence: if confident { 0.91 } else { 0.55 },
            rationale: "subject".into(),
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

struct NoopDispatcher;

#[async_trait]
impl ChunkDispatcher for NoopDispatcher {
    async fn dispatch(
        &self,
        _job_id: &str,
        _delay: std::time::Duration,
    ) -> Result<String, JobError> {
        Ok("noop".to_string())
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn batch_job_runs_to_completion_and_feeds_the_review_queue() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mail = Arc::new(SeededMail);
    let config = AppConfig::default();
    let workflow = Arc::new(ClassificationWorkflow::new(
        db.clone(),
        mail.clone(),
        Arc::new(SubjectClassifier),
        None,
        config.clone(),
    ));
    let orchestrator = BatchOrchestrator::new(
        db.clone(),
        mail,
        workflow.clone(),
        Arc::new(NoopDispatcher),
        config,
    );

    // Four months in two-month chunks: two chunks of three messages each
    let job = orchestrator
        .submit(date(2026, 1, 1), date(2026, 4, 30))
        .await
        .unwrap();
    assert_eq!(job.chunks_total, 2);

    let mut completed = false;
    for _ in 0..10 {
        match orchestrator.advance(&job.job_id).await.unwrap() {
            ChunkResult::Completed => {
                completed = true;
                break;
            }
            ChunkResult::ChunkCompleted { outcome, .. } => {
                assert_eq!(outcome.processed, 3);
                assert_eq!(outcome.errors, 0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert!(completed, "job never completed");

    let stored = db.get_job(&job.job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.chunks_completed, 2);
    assert_eq!(stored.items_processed, 6);
    assert_eq!(stored.items_categorized, 6);
    assert_eq!(stored.items_labeled, 4);
    assert_eq!(stored.items_pending_review, 2);
    assert!(stored.completed_at.is_some());
    assert!(stored.lock_holder.is_none());

    // The ambiguous message from each chunk is waiting for review
    let reviews = ReviewQueue::new(db.clone(), workflow);
    let open = reviews.open().await.unwrap();
    assert_eq!(open.len(), 2);

    // Approving one drives its item to the labeled terminal state
    let entry = open[0].clone();
    reviews.resolve(entry.id, ReviewDecision::Approve).await.unwrap();
    let item = db.get_item_by_id(entry.item_id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Labeled);
    assert!(!item.applied_labels.is_empty());
    assert_eq!(reviews.open().await.unwrap().len(), 1);

    // A second submission is allowed once the first job is terminal
    let second = orchestrator
        .submit(date(2026, 5, 1), date(2026, 6, 30))
        .await;
    assert!(second.is_ok());
}
