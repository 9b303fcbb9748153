//! Calendar enrichment gating and outcome shaping.
//!
//! Decides whether a message warrants event extraction, finds virtual
//! meeting links, and turns an extracted event plus free/busy results into
//! an outcome the finalize step can act on.

use std::sync::OnceLock;

use chrono::{NaiveDateTime, TimeDelta};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::calendar::BusyInterval;
use crate::classify::EventDetails;
use crate::store::Importance;

/// Categories where calendar extraction runs, gated on importance.
pub const CALENDAR_CATEGORIES: &[&str] =
    &["Professional/Work", "Professional/Recruiters", "Important"];

/// Keywords that trigger extraction regardless of category.
pub const CALENDAR_KEYWORDS: &[&str] = &[
    "meeting",
    "appointment",
    "interview",
    "reservation",
    "flight",
    "hotel",
    "conference",
    "call",
    "webinar",
    "scheduled",
    "invite",
    "calendar",
    "booking",
    "confirmation",
];

/// Events longer than this need human confirmation.
const LONG_EVENT_MINUTES: u32 = 120;

/// Extraction confidence below this needs human confirmation.
const EVENT_CONFIDENCE_FLOOR: f32 = 0.8;

/// What the calendar step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarAction {
    /// Gating said this message isn't calendar material.
    Skipped,
    /// Extraction ran but found no concrete event.
    NoEvent,
    /// Event extracted cleanly.
    Extracted,
    /// Event extracted and overlaps something on the calendar.
    Conflict,
}

/// Calendar step result carried in workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarOutcome {
    pub action: CalendarAction,
    pub event: Option<EventDetails>,
    #[serde(default)]
    pub conflicts: Vec<(NaiveDateTime, NaiveDateTime)>,
    /// Whether the finalize step must route this to human review.
    pub needs_review: bool,
}

impl CalendarOutcome {
    pub fn skipped() -> Self {
        Self {
            action: CalendarAction::Skipped,
            event: None,
            conflicts: Vec::new(),
            needs_review: false,
        }
    }

    pub fn no_event() -> Self {
        Self {
            action: CalendarAction::NoEvent,
            event: None,
            conflicts: Vec::new(),
            needs_review: false,
        }
    }

    /// Build the outcome for an extracted event.
    ///
    /// Review is required when the event conflicts with the calendar, when
    /// extraction confidence is low, or when the event runs long.
    pub fn extracted(event: EventDetails, busy: Vec<BusyInterval>) -> Self {
        let conflicts: Vec<(NaiveDateTime, NaiveDateTime)> = busy
            .iter()
            .map(|b| (b.start.naive_utc(), b.end.naive_utc()))
            .collect();

        let long_event = event
            .duration_minutes
            .map(|m| m > LONG_EVENT_MINUTES)
            .unwrap_or(false);
        let low_confidence = event.confidence < EVENT_CONFIDENCE_FLOOR;
        let has_conflict = !conflicts.is_empty();

        Self {
            action: if has_conflict {
                CalendarAction::Conflict
            } else {
                CalendarAction::Extracted
            },
            needs_review: has_conflict || low_confidence || long_event,
            event: Some(event),
            conflicts,
        }
    }
}

/// Whether calendar extraction should run for this message.
pub fn should_extract_event(
    category: &str,
    importance: Option<Importance>,
    subject: &str,
    body: &str,
) -> bool {
    if CALENDAR_CATEGORIES.contains(&category)
        && matches!(importance, Some(Importance::Critical | Importance::High))
    {
        return true;
    }

    let text = format!("{} {}", subject, truncate(body, 1000)).to_lowercase();
    CALENDAR_KEYWORDS.iter().any(|kw| text.contains(kw))
}

/// The time window an event occupies, defaulting the end to one hour out.
pub fn event_window(event: &EventDetails) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = event.start?;
    let end = event.end.unwrap_or_else(|| {
        let minutes = event.duration_minutes.unwrap_or(60);
        start + TimeDelta::minutes(minutes as i64)
    });
    Some((start, end))
}

fn virtual_link_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        vec![
            Regex::new(r#"(?i)https://[a-z0-9-]+\.zoom\.us/[^\s<>"]+"#).unwrap(),
            Regex::new(r"(?i)https://meet\.google\.com/[a-z-]+").unwrap(),
            Regex::new(r#"(?i)https://teams\.microsoft\.com/[^\s<>"]+"#).unwrap(),
            Regex::new(r#"(?i)https://[a-z0-9-]+\.webex\.com/[^\s<>"]+"#).unwrap(),
        ]
    })
}

/// Find a video conferencing link in message text.
pub fn extract_virtual_link(text: &str) -> Option<String> {
    virtual_link_regexes()
        .iter()
        .find_map(|re| re.find(text).map(|m| m.as_str().to_string()))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
