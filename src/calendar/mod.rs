//! Calendar conflict detection.
//!
//! A thin free/busy boundary. The pipeline holds an `Option<Arc<dyn
//! ConflictChecker>>` and degrades gracefully when no calendar access is
//! configured: events are still extracted, conflicts are just never found.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::CalendarError;

/// A busy interval on the user's calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Free/busy lookup for conflict detection.
#[async_trait]
pub trait ConflictChecker: Send + Sync {
    /// Busy intervals overlapping `[start, end)` on the primary calendar.
    async fn busy_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError>;
}

/// Google Calendar FreeBusy client.
///
/// Requires the `calendar.readonly` scope on the same OAuth token the mail
/// client uses; without it the API returns 403 and we surface `MissingScope`.
pub struct GoogleFreeBusy {
    http: reqwest::Client,
    token: SecretString,
}

#[derive(Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: std::collections::BTreeMap<String, CalendarBusy>,
}

#[derive(Deserialize)]
struct CalendarBusy {
    #[serde(default)]
    busy: Vec<BusySlot>,
}

#[derive(Deserialize)]
struct BusySlot {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl GoogleFreeBusy {
    pub fn new(token: SecretString) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token,
        }
    }
}

#[async_trait]
impl ConflictChecker for GoogleFreeBusy {
    async fn busy_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        let resp = self
            .http
            .post("https://www.googleapis.com/calendar/v3/freeBusy")
            .bearer_auth(self.token.expose_secret())
            .json(&serde_json::json!({
                "timeMin": start.to_rfc3339(),
                "timeMax": end.to_rfc3339(),
                "items": [{"id": "primary"}],
            }))
            .send()
            .await
            .map_err(|e| CalendarError::Request(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(CalendarError::MissingScope);
        }
        if !status.is_success() {
            return Err(CalendarError::Request(format!("status {status}")));
        }

        let body: FreeBusyResponse = resp
            .json()
            .await
            .map_err(|e| CalendarError::InvalidResponse(e.to_string()))?;

        let busy: Vec<BusyInterval> = body
            .calendars
            .get("primary")
            .map(|c| {
                c.busy
                    .iter()
                    .map(|slot| BusyInterval {
                        start: slot.start,
                        end: slot.end,
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(%start, %end, conflicts = busy.len(), "FreeBusy lookup");
        Ok(busy)
    }
}
