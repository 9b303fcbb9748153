//! Mail provider boundary — listing, fetching, and labeling messages.
//!
//! The pipeline only ever talks to `MailProvider`; the Gmail REST client in
//! `gmail.rs` is the production implementation, tests use in-memory fakes.

pub mod gmail;

pub use gmail::GmailClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;

/// Provider page size cap for list calls.
pub const PAGE_SIZE: u32 = 100;

/// A lightweight reference to a message, returned by list calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
}

/// A fully fetched mail message.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Provider-native message id — the pipeline's stable external identifier.
    pub message_id: String,
    pub thread_id: String,
    pub from_email: String,
    pub to_emails: Vec<String>,
    pub subject: String,
    pub body: String,
    pub snippet: String,
    pub date: DateTime<Utc>,
    /// Lowercase header name → value.
    pub headers: BTreeMap<String, String>,
    pub labels: Vec<String>,
}

/// Mail provider operations the pipeline needs.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// List message refs matching a provider query, up to `max_results`.
    ///
    /// Queries use the provider's search syntax (e.g. `is:unread`,
    /// `after:2024/01/01 before:2024/03/01`).
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, MailError>;

    /// Fetch the full message for a ref.
    async fn get_message(&self, msg_ref: &MessageRef) -> Result<MailMessage, MailError>;

    /// Apply a label (created on demand) to a message.
    async fn apply_label(&self, message_id: &str, label_path: &str) -> Result<(), MailError>;

    /// Number of messages in a thread. Used as an importance signal; a
    /// provider that cannot answer cheaply may return `None`.
    async fn thread_len(&self, thread_id: &str) -> Result<Option<usize>, MailError> {
        let _ = thread_id;
        Ok(None)
    }
}
