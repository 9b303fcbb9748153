//! LLM classification boundary.
//!
//! Two model tiers: a fast/cheap model for the first pass and a quality
//! model the pipeline escalates to when confidence falls below the
//! configured threshold. The escalated result is accepted as-is, even if
//! its confidence is lower than the fast model's.

pub mod anthropic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ClassifierError;

/// Which model tier to use for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Fast,
    Accurate,
}

/// Input to a classification call.
#[derive(Debug, Clone)]
pub struct ClassifyRequest {
    pub subject: String,
    pub from_email: String,
    pub body: String,
}

/// Result of a classification call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
    pub rationale: String,
    #[serde(default)]
    pub key_phrases: Vec<String>,
    /// Model that produced the final result.
    pub model: String,
}

/// Event details extracted from a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetails {
    pub title: String,
    pub start: Option<chrono::NaiveDateTime>,
    pub end: Option<chrono::NaiveDateTime>,
    pub duration_minutes: Option<u32>,
    pub location: Option<String>,
    pub is_virtual: bool,
    pub virtual_link: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
    pub description: Option<String>,
    pub confidence: f32,
}

/// Classification backend.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a message into one of the configured categories.
    async fn classify(
        &self,
        request: &ClassifyRequest,
        tier: ModelTier,
    ) -> Result<Classification, ClassifierError>;

    /// Extract a calendar event from message text, if one is present.
    async fn extract_event(
        &self,
        subject: &str,
        from_email: &str,
        body: &str,
    ) -> Result<Option<EventDetails>, ClassifierError>;
}

/// Classify with the fast tier, escalating below `threshold`.
///
/// The quality model's answer always replaces the fast one once escalation
/// fires; there is no "best of both" comparison.
pub async fn classify_with_escalation(
    classifier: &dyn Classifier,
    request: &ClassifyRequest,
    threshold: f32,
) -> Result<Classification, ClassifierError> {
    let first = classifier.classify(request, ModelTier::Fast).await?;
    if first.confidence >= threshold {
        return Ok(first);
    }

    info!(
        label = %first.label,
        confidence = first.confidence,
        model = %first.model,
        "Low confidence, escalating to quality model"
    );
    classifier.classify(request, ModelTier::Accurate).await
}

/// Pull a JSON object out of model output, tolerating markdown fences and
/// surrounding prose.
pub(crate) fn extract_json_object(text: &str) -> Result<serde_json::Value, ClassifierError> {
    let trimmed = text.trim();
    let candidate = if trimmed.starts_with("```") {
        let inner = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```");
        inner.trim()
    } else {
        trimmed
    };

    if let Ok(value) = serde_json::from_str(candidate) {
        return Ok(value);
    }

    // Fall back to the outermost braces
    let start = candidate.find('{');
    let end = candidate.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            return serde_json::from_str(&candidate[start..=end]).map_err(Into::into);
        }
    }

    Err(ClassifierError::InvalidResponse(format!(
        "no JSON object in output: {}",
        anthropic::truncate(text, 120)
    )))
}
