//! Anthropic Messages API classifier.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::classify::{
    extract_json_object, Classification, Classifier, ClassifyRequest, EventDetails, ModelTier,
};
use crate::config::{ClassifierConfig, CATEGORIES};
use crate::error::ClassifierError;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_ATTEMPTS: u32 = 3;

/// How much body text goes into the classification prompt.
const CLASSIFY_BODY_LIMIT: usize = 10_000;
const EVENT_BODY_LIMIT: usize = 5_000;

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You are an expert email classifier. Your job is to categorize emails accurately and explain your reasoning.

You must respond with ONLY a valid JSON object in this exact format:
{
  "category": "<exact category name from the list>",
  "confidence": <number between 0.0 and 1.0>,
  "reasoning": "<brief explanation of why this category was chosen>",
  "key_phrases": ["<phrase1>", "<phrase2>"]
}

Confidence guidelines:
- 0.9-1.0: Very certain (clear domain match, obvious keywords)
- 0.7-0.9: Confident (good keyword/pattern match)
- 0.5-0.7: Uncertain (ambiguous, could fit multiple categories)
- Below 0.5: Low confidence (no clear signals)

Be conservative with confidence scores. If unsure, use a lower score."#;

const EVENT_SYSTEM_PROMPT: &str = r#"You are an expert at extracting calendar event details from emails.
Extract event information including date, time, location, and any relevant details.

IMPORTANT:
- Only extract if there is a clear, specific event with a date/time
- For dates, convert to ISO 8601 format (YYYY-MM-DDTHH:MM:SS)
- Assume the user's local timezone if not specified
- Include confirmation numbers, booking references in the description
- Set is_virtual to true for video calls, webinars, online meetings

Respond with ONLY a valid JSON object in this format:
{
  "title": "Event title",
  "start_datetime": "2025-01-15T14:00:00",
  "end_datetime": "2025-01-15T15:00:00",
  "duration_minutes": 60,
  "location": "123 Main St, City" or null,
  "is_virtual": false,
  "virtual_link": null or "https://...",
  "attendees": ["email@example.com"],
  "description": "Confirmation #12345, any other details",
  "confidence": 0.85
}

If no clear event is found, respond with: {"no_event": true}

Confidence guidelines:
- 0.9-1.0: Clear date/time, specific event
- 0.7-0.9: Date/time present but some ambiguity
- 0.5-0.7: Probable event, missing some details
- Below 0.5: Very uncertain"#;

/// Classifier backed by the Anthropic Messages API.
pub struct AnthropicClassifier {
    http: reqwest::Client,
    config: ClassifierConfig,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl AnthropicClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.config.fast_model,
            ModelTier::Accurate => &self.config.quality_model,
        }
    }

    /// Call the Messages API, retrying rate limits and 5xx with backoff.
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, ClassifierError> {
        let payload = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .post(API_URL)
                .header("x-api-key", self.config.api_key.expose_secret())
                .header("anthropic-version", API_VERSION)
                .json(&payload)
                .send()
                .await;

            let retry_delay = Duration::from_secs(4 * 2u64.saturating_pow(attempt - 1));
            match result {
                Ok(resp) if resp.status().is_success() => {
                    let body: MessagesResponse = resp
                        .json()
                        .await
                        .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
                    return body
                        .content
                        .first()
                        .map(|block| block.text.clone())
                        .ok_or_else(|| {
                            ClassifierError::InvalidResponse("empty content".into())
                        });
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
                    return Err(ClassifierError::Auth);
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ClassifierError::RateLimited { retry_after: None });
                    }
                    warn!(attempt, ?retry_delay, "Rate limited by Anthropic API");
                    tokio::time::sleep(retry_delay).await;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    let status = resp.status();
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ClassifierError::Request(format!("status {status}")));
                    }
                    warn!(%status, attempt, "Anthropic API server error, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    error!(%status, "Anthropic API request rejected");
                    return Err(ClassifierError::Request(format!("status {status}: {text}")));
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ClassifierError::Request(e.to_string()));
                    }
                    warn!(error = %e, attempt, "Anthropic request failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

fn category_listing() -> String {
    CATEGORIES
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Classifier for AnthropicClassifier {
    async fn classify(
        &self,
        request: &ClassifyRequest,
        tier: ModelTier,
    ) -> Result<Classification, ClassifierError> {
        let model = self.model_for(tier).to_string();
        let user_prompt = format!(
            "Classify this email into exactly ONE of these categories:\n\n\
             {}\n\n\
             Email to classify:\n\
             From: {}\n\
             Subject: {}\n\
             Body:\n{}\n\n\
             Respond with ONLY a JSON object, no other text.",
            category_listing(),
            request.from_email,
            request.subject,
            truncate(&request.body, CLASSIFY_BODY_LIMIT),
        );

        let text = self
            .complete(&model, CLASSIFY_SYSTEM_PROMPT, &user_prompt, 500)
            .await?;
        let value = extract_json_object(&text)?;

        let label = value["category"]
            .as_str()
            .ok_or_else(|| ClassifierError::InvalidResponse("missing category".into()))?
            .to_string();
        let confidence = value["confidence"].as_f64().unwrap_or(0.0) as f32;

        info!(%label, confidence, %model, "Classified message");

        Ok(Classification {
            label,
            confidence,
            rationale: value["reasoning"].as_str().unwrap_or_default().to_string(),
            key_phrases: value["key_phrases"]
                .as_array()
                .map(|phrases| {
                    phrases
                        .iter()
                        .filter_map(|p| p.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            model,
        })
    }

    async fn extract_event(
        &self,
        subject: &str,
        from_email: &str,
        body: &str,
    ) -> Result<Option<EventDetails>, ClassifierError> {
        let user_prompt = format!(
            "Extract calendar event from this email:\n\n\
             Subject: {subject}\n\
             From: {from_email}\n\n\
             Body:\n{}\n\n\
             Respond with ONLY a JSON object.",
            truncate(body, EVENT_BODY_LIMIT),
        );

        let text = self
            .complete(
                &self.config.fast_model,
                EVENT_SYSTEM_PROMPT,
                &user_prompt,
                500,
            )
            .await?;
        let value = extract_json_object(&text)?;

        if value["no_event"].as_bool().unwrap_or(false) {
            return Ok(None);
        }

        let parse_dt = |key: &str| {
            value[key]
                .as_str()
                .and_then(|s| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
        };

        Ok(Some(EventDetails {
            title: value["title"].as_str().unwrap_or("Untitled Event").to_string(),
            start: parse_dt("start_datetime"),
            end: parse_dt("end_datetime"),
            duration_minutes: value["duration_minutes"].as_u64().map(|m| m as u32),
            location: value["location"].as_str().map(String::from),
            is_virtual: value["is_virtual"].as_bool().unwrap_or(false),
            virtual_link: value["virtual_link"].as_str().map(String::from),
            attendees: value["attendees"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            description: value["description"].as_str().map(String::from),
            confidence: value["confidence"].as_f64().unwrap_or(0.5) as f32,
        }))
    }
}
