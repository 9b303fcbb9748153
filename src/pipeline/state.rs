//! Workflow steps and the checkpointed state that flows between them.
//!
//! `ItemState` is a full snapshot: it carries the message content itself,
//! so resuming from a checkpoint never refetches from the mail provider.
//! Fields added later default on deserialize, which keeps old checkpoints
//! readable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::Classification;
use crate::mail::MailMessage;
use crate::pipeline::calendar::CalendarOutcome;
use crate::pipeline::importance::ImportanceResult;
use crate::pipeline::unsubscribe::UnsubscribeOption;
use crate::store::DecisionType;

/// Workflow steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Ingest,
    Classify,
    ScoreImportance,
    Enrich,
    Finalize,
    Label,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Classify => "classify",
            Self::ScoreImportance => "score_importance",
            Self::Enrich => "enrich",
            Self::Finalize => "finalize",
            Self::Label => "label",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "classify" => Some(Self::Classify),
            "score_importance" => Some(Self::ScoreImportance),
            "enrich" => Some(Self::Enrich),
            "finalize" => Some(Self::Finalize),
            "label" => Some(Self::Label),
            _ => None,
        }
    }

    /// The step that runs after this one, or `None` at the end.
    pub fn after(&self) -> Option<Step> {
        match self {
            Self::Ingest => Some(Self::Classify),
            Self::Classify => Some(Self::ScoreImportance),
            Self::ScoreImportance => Some(Self::Enrich),
            Self::Enrich => Some(Self::Finalize),
            Self::Finalize => Some(Self::Label),
            Self::Label => None,
        }
    }
}

/// Checkpointed workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemState {
    // Message content, captured at ingest
    pub external_id: String,
    pub thread_id: String,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub subject: String,
    pub body: String,
    pub snippet: String,
    pub date: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,

    // Step outputs, filled in as the workflow advances
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub importance: Option<ImportanceResult>,
    #[serde(default)]
    pub thread_len: Option<usize>,
    #[serde(default)]
    pub calendar: Option<CalendarOutcome>,
    #[serde(default)]
    pub unsubscribe: Option<UnsubscribeOption>,

    // Finalize decision
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub review_reason: Option<DecisionType>,
}

impl ItemState {
    /// Capture a fetched message as initial workflow state.
    pub fn from_message(message: &MailMessage) -> Self {
        Self {
            external_id: message.message_id.clone(),
            thread_id: message.thread_id.clone(),
            from_email: message.from_email.clone(),
            to_emails: message.to_emails.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            snippet: message.snippet.clone(),
            date: message.date,
            headers: message.headers.clone(),
            classification: None,
            importance: None,
            thread_len: None,
            calendar: None,
            unsubscribe: None,
            needs_review: false,
            review_reason: None,
        }
    }

    pub fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_snapshot(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
