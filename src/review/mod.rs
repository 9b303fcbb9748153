//! Human review queue.
//!
//! Items that fail the auto-label gate, calendar events that need
//! confirmation, and detected unsubscribe options all land here as open
//! entries. A resolution records feedback and, for item-blocking entries,
//! re-enters the workflow at the label step.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pipeline::ClassificationWorkflow;
use crate::store::{Database, DecisionType, FeedbackRecord, Resolution, ReviewEntry};

/// A reviewer's verdict on one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    /// The pipeline's proposal stands.
    Approve,
    /// The reviewer supplied a different category.
    Correct { category: String },
    /// The proposal is rejected; nothing is applied.
    Deny,
}

impl ReviewDecision {
    fn resolution(&self) -> Resolution {
        match self {
            Self::Approve => Resolution::Approved,
            Self::Correct { .. } => Resolution::Corrected,
            Self::Deny => Resolution::Denied,
        }
    }

    fn corrected(&self) -> Option<&str> {
        match self {
            Self::Correct { category } => Some(category),
            _ => None,
        }
    }
}

/// Front door for listing and resolving review entries.
pub struct ReviewQueue {
    db: Arc<dyn Database>,
    workflow: Arc<ClassificationWorkflow>,
}

impl ReviewQueue {
    pub fn new(db: Arc<dyn Database>, workflow: Arc<ClassificationWorkflow>) -> Self {
        Self { db, workflow }
    }

    /// All entries still awaiting a decision.
    pub async fn open(&self) -> Result<Vec<ReviewEntry>> {
        Ok(self.db.open_review_entries().await?)
    }

    pub async fn get(&self, entry_id: Uuid) -> Result<ReviewEntry> {
        Ok(self.db.get_review_entry(entry_id).await?)
    }

    /// Resolve one entry: persist the verdict, record feedback, and for
    /// categorization and calendar entries drive the item to its terminal
    /// labeled state. Unsubscribe entries never touch the item.
    pub async fn resolve(&self, entry_id: Uuid, decision: ReviewDecision) -> Result<ReviewEntry> {
        let entry = self.db.get_review_entry(entry_id).await?;
        self.db
            .resolve_review_entry(entry_id, decision.resolution(), decision.corrected())
            .await?;

        let feedback = FeedbackRecord {
            id: Uuid::new_v4(),
            item_id: entry.item_id,
            decision_type: entry.decision_type,
            proposed: entry.proposed.to_string(),
            resolution: decision.resolution(),
            corrected: decision.corrected().map(String::from),
            created_at: Utc::now(),
        };
        self.db.insert_feedback(&feedback).await?;

        if entry.decision_type != DecisionType::Unsubscribe {
            match &decision {
                ReviewDecision::Approve => {
                    self.workflow
                        .complete_with_resolution(entry.item_id, None, true)
                        .await
                        .map_err(Error::from)?;
                }
                ReviewDecision::Correct { category } => {
                    self.workflow
                        .complete_with_resolution(entry.item_id, Some(category.clone()), true)
                        .await
                        .map_err(Error::from)?;
                }
                ReviewDecision::Deny => {
                    self.workflow
                        .complete_with_resolution(entry.item_id, None, false)
                        .await
                        .map_err(Error::from)?;
                }
            }
        }

        info!(
            entry_id = %entry_id,
            item_id = %entry.item_id,
            decision_type = entry.decision_type.as_str(),
            resolution = decision.resolution().as_str(),
            "Review resolved"
        );
        self.get(entry_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    // Shadows the crate-level alias so the fake impls below can spell out
    // their provider error types
    use std::result::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::classify::{Classification, Classifier, ClassifyRequest, EventDetails, ModelTier};
    use crate::config::AppConfig;
    use crate::error::{ClassifierError, MailError};
    use crate::mail::{MailMessage, MailProvider, MessageRef};
    use crate::store::{ItemStatus, LibSqlBackend};

    struct StaticMail {
        message: MailMessage,
        label_calls: AtomicUsize,
    }

    #[async_trait]
    impl MailProvider for StaticMail {
        async fn list_messages(
            &self,
            _query: &str,
            _max_results: u32,
        ) -> Result<Vec<MessageRef>, MailError> {
            Ok(vec![])
        }

        async fn get_message(&self, _msg_ref: &MessageRef) -> Result<MailMessage, MailError> {
            Ok(self.message.clone())
        }

        async fn apply_label(&self, _message_id: &str, _label: &str) -> Result<(), MailError> {
            self.label_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Unsure;

    #[async_trait]
    impl Classifier for Unsure {
        async fn classify(
            &self,
            _request: &ClassifyRequest,
            _tier: ModelTier,
        ) -> Result<Classification, ClassifierError> {
            Ok(Classification {
                label: "Marketing/Promotions".into(),
                confidence: 0.55,
                rationale: "unclear".into(),
                key_phrases: vec![],
                model: "quality".into(),
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

    async fn queue_with_pending_item() -> (ReviewQueue, Arc<LibSqlBackend>, Arc<StaticMail>) {
        let message = MailMessage {
            message_id: "r1".into(),
            thread_id: "t-r1".into(),
            from_email: "deals@shop.example.com".into(),
            to_emails: vec!["me@example.com".into()],
            subject: "Big sale".into(),
            body: "Everything must go".into(),
            snippet: "Everything".into(),
            date: Utc::now(),
            headers: BTreeMap::new(),
            labels: vec![],
        };
        let mail = Arc::new(StaticMail {
            message,
            label_calls: AtomicUsize::new(0),
        });
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workflow = Arc::new(ClassificationWorkflow::new(
            db.clone(),
            mail.clone(),
            Arc::new(Unsure),
            None,
            AppConfig::default(),
        ));
        workflow
            .process_message(&MessageRef {
                id: "r1".into(),
                thread_id: "t-r1".into(),
            })
            .await
            .unwrap();
        (ReviewQueue::new(db.clone(), workflow), db, mail)
    }

    #[tokio::test]
    async fn approve_labels_with_proposed_category() {
        let (queue, db, mail) = queue_with_pending_item().await;
        let entry = queue.open().await.unwrap().remove(0);

        let resolved = queue.resolve(entry.id, ReviewDecision::Approve).await.unwrap();
        assert_eq!(resolved.resolution, Resolution::Approved);
        assert!(resolved.resolved_at.is_some());

        let item = db.get_item("r1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Labeled);
        assert!(item
            .applied_labels
            .contains(&"Triage/Marketing/Promotions".to_string()));
        assert!(mail.label_calls.load(Ordering::SeqCst) >= 1);
        assert!(queue.open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn correction_overrides_category_and_records_feedback() {
        let (queue, db, _mail) = queue_with_pending_item().await;
        let entry = queue.open().await.unwrap().remove(0);

        queue
            .resolve(
                entry.id,
                ReviewDecision::Correct {
                    category: "Purchases/Orders".into(),
                },
            )
            .await
            .unwrap();

        let item = db.get_item("r1").await.unwrap().unwrap();
        assert_eq!(item.category.as_deref(), Some("Purchases/Orders"));
        assert!(item
            .applied_labels
            .contains(&"Triage/Purchases/Orders".to_string()));

        let resolved = queue.get(entry.id).await.unwrap();
        assert_eq!(resolved.resolution, Resolution::Corrected);
        assert_eq!(resolved.corrected.as_deref(), Some("Purchases/Orders"));
    }

    #[tokio::test]
    async fn deny_closes_entry_without_labels() {
        let (queue, db, mail) = queue_with_pending_item().await;
        let entry = queue.open().await.unwrap().remove(0);

        queue.resolve(entry.id, ReviewDecision::Deny).await.unwrap();

        let item = db.get_item("r1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Labeled);
        assert!(item.applied_labels.is_empty());
        assert_eq!(mail.label_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resolving_twice_fails() {
        let (queue, _db, _mail) = queue_with_pending_item().await;
        let entry = queue.open().await.unwrap().remove(0);

        queue.resolve(entry.id, ReviewDecision::Approve).await.unwrap();
        let err = queue.resolve(entry.id, ReviewDecision::Deny).await;
        assert!(err.is_err());
    }
}
