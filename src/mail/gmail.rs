//! Gmail REST API client.
//!
//! Uses a pre-obtained OAuth bearer token (refreshed out-of-band). Messages
//! are fetched in `raw` format and parsed with `mail-parser`; labels are
//! created on demand and cached.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::MailError;
use crate::mail::{MailMessage, MailProvider, MessageRef, PAGE_SIZE};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Attempts per API call before giving up.
const MAX_ATTEMPTS: u32 = 3;

/// Gmail REST client.
pub struct GmailClient {
    http: reqwest::Client,
    token: SecretString,
    /// Label path → label id, populated lazily.
    label_cache: RwLock<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListEntry>,
}

#[derive(Deserialize)]
struct ListEntry {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[derive(Deserialize)]
struct RawMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(default)]
    raw: String,
    #[serde(rename = "internalDate", default)]
    internal_date: String,
}

#[derive(Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct Label {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

impl GmailClient {
    /// Create a client with a bearer token.
    pub fn new(token: SecretString) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token,
            label_cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Issue a GET with retry/backoff on rate limits and 5xx.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .http
                .get(url)
                .bearer_auth(self.token.expose_secret())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| MailError::Request(format!("decode failed: {e}")));
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(MailError::MessageNotFound { id: url.to_string() });
                }
                Ok(resp)
                    if resp.status() == reqwest::StatusCode::UNAUTHORIZED
                        || resp.status() == reqwest::StatusCode::FORBIDDEN =>
                {
                    return Err(MailError::Auth(format!("status {}", resp.status())));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= MAX_ATTEMPTS {
                        return Err(MailError::Request(format!("status {status}")));
                    }
                    let delay = backoff(attempt);
                    warn!(%status, attempt, ?delay, "Gmail API error, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(MailError::Request(e.to_string()));
                    }
                    let delay = backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "Gmail request failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, MailError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| MailError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MailError::Request(format!("status {status}: {text}")));
        }
        resp.json()
            .await
            .map_err(|e| MailError::Request(format!("decode failed: {e}")))
    }

    /// Resolve a label path to its id, creating the label if missing.
    async fn ensure_label(&self, label_path: &str) -> Result<String, MailError> {
        if let Some(id) = self.label_cache.read().await.get(label_path) {
            return Ok(id.clone());
        }

        // Refresh the cache from the label list first
        let list: LabelList = self.get_json(&format!("{API_BASE}/labels")).await?;
        {
            let mut cache = self.label_cache.write().await;
            for label in &list.labels {
                cache.insert(label.name.clone(), label.id.clone());
            }
            if let Some(id) = cache.get(label_path) {
                return Ok(id.clone());
            }
        }

        // Not found — create it
        let created = self
            .post_json(
                &format!("{API_BASE}/labels"),
                &serde_json::json!({
                    "name": label_path,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }),
            )
            .await
            .map_err(|e| MailError::Label {
                label: label_path.to_string(),
                reason: e.to_string(),
            })?;

        let id = created["id"]
            .as_str()
            .ok_or_else(|| MailError::Label {
                label: label_path.to_string(),
                reason: "create response missing id".into(),
            })?
            .to_string();

        info!(label = label_path, "Created Gmail label");
        self.label_cache
            .write()
            .await
            .insert(label_path.to_string(), id.clone());
        Ok(id)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, MailError> {
        let capped = max_results.min(PAGE_SIZE);
        let url = format!(
            "{API_BASE}/messages?q={}&maxResults={capped}",
            urlencode(query)
        );
        let list: ListResponse = self.get_json(&url).await?;
        debug!(query, count = list.messages.len(), "Listed messages");
        Ok(list
            .messages
            .into_iter()
            .map(|m| MessageRef {
                id: m.id,
                thread_id: m.thread_id,
            })
            .collect())
    }

    async fn get_message(&self, msg_ref: &MessageRef) -> Result<MailMessage, MailError> {
        let url = format!("{API_BASE}/messages/{}?format=raw", msg_ref.id);
        let raw: RawMessage = self.get_json(&url).await?;

        let bytes = base64::engine::general_purpose::URL_SAFE
            .decode(raw.raw.as_bytes())
            .map_err(|e| MailError::MalformedMessage {
                id: raw.id.clone(),
                reason: format!("raw decode: {e}"),
            })?;

        parse_rfc822(&raw, &bytes)
    }

    async fn apply_label(&self, message_id: &str, label_path: &str) -> Result<(), MailError> {
        let label_id = self.ensure_label(label_path).await?;
        self.post_json(
            &format!("{API_BASE}/messages/{message_id}/modify"),
            &serde_json::json!({ "addLabelIds": [label_id] }),
        )
        .await
        .map_err(|e| MailError::Label {
            label: label_path.to_string(),
            reason: e.to_string(),
        })?;
        debug!(message_id, label = label_path, "Applied label");
        Ok(())
    }

    async fn thread_len(&self, thread_id: &str) -> Result<Option<usize>, MailError> {
        let url = format!("{API_BASE}/threads/{thread_id}?format=minimal");
        let thread: ThreadResponse = self.get_json(&url).await?;
        Ok(Some(thread.messages.len()))
    }
}

/// Parse a raw RFC 822 payload into a `MailMessage`.
fn parse_rfc822(raw: &RawMessage, bytes: &[u8]) -> Result<MailMessage, MailError> {
    let parsed = mail_parser::MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| MailError::MalformedMessage {
            id: raw.id.clone(),
            reason: "unparseable RFC 822 payload".into(),
        })?;

    let from_email = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .unwrap_or_default()
        .to_string();

    let to_emails: Vec<String> = parsed
        .to()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|a| a.address())
                .map(|a| a.to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut headers = BTreeMap::new();
    for header in parsed.headers() {
        headers.insert(
            header.name().to_ascii_lowercase(),
            header.value().as_text().unwrap_or_default().to_string(),
        );
    }

    let date = raw
        .internal_date
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(MailMessage {
        message_id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        from_email,
        to_emails,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body: parsed
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default(),
        snippet: raw.snippet.clone(),
        date,
        headers,
        labels: raw.label_ids.clone(),
    })
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(1000 * 2u64.saturating_pow(attempt - 1))
}

/// Minimal percent-encoding for Gmail query strings.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b':' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
