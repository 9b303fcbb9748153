//! Multi-factor importance scoring.
//!
//! Six weighted signals: sender authority (VIP list and domains), urgency
//! keywords, deadline proximity, financial content, thread activity, and
//! recipient position. Entirely deterministic; no model calls.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ImportanceConfig;
use crate::store::{FactorScores, Importance};

const URGENCY_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "deadline",
    "action required",
    "time sensitive",
    "critical",
    "important",
    "priority",
    "respond",
    "by today",
    "by tomorrow",
    "end of day",
    "eod",
    "cob",
    "final notice",
    "last chance",
    "expiring",
    "expires",
];

const FINANCIAL_KEYWORDS: &[&str] = &[
    "invoice",
    "payment",
    "contract",
    "agreement",
    "quote",
    "proposal",
    "purchase order",
    "po #",
    "amount due",
    "balance",
    "overdue",
    "wire transfer",
    "ach",
    "payable",
    "receivable",
    "billing",
    "$",
    "usd",
    "eur",
    "gbp",
];

/// Input to one scoring pass.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub from_email: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    /// Lowercase header name → value.
    pub headers: &'a BTreeMap<String, String>,
    /// Messages in the thread, when the provider could tell us.
    pub thread_len: Option<usize>,
}

/// Result of a scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceResult {
    pub score: f32,
    pub level: Importance,
    pub factors: FactorScores,
}

/// Weighted importance scorer.
pub struct ImportanceScorer {
    config: ImportanceConfig,
}

impl ImportanceScorer {
    pub fn new(config: ImportanceConfig) -> Self {
        Self { config }
    }

    /// Score a message and derive its importance level.
    pub fn score(&self, input: &ScoringInput<'_>) -> ImportanceResult {
        let weights = &self.config.weights;
        let mut factors = BTreeMap::new();
        factors.insert(
            "sender_authority".to_string(),
            self.score_sender_authority(input.from_email),
        );
        factors.insert(
            "urgency_keywords".to_string(),
            score_urgency_keywords(input.subject, input.body),
        );
        factors.insert(
            "deadline_detection".to_string(),
            score_deadline(input.subject, input.body),
        );
        factors.insert(
            "financial_signals".to_string(),
            score_financial(input.subject, input.body),
        );
        factors.insert(
            "thread_activity".to_string(),
            score_thread_activity(input.thread_len),
        );
        factors.insert(
            "recipient_position".to_string(),
            score_recipient_position(input.headers),
        );

        let score = factors["sender_authority"] * weights.sender_authority
            + factors["urgency_keywords"] * weights.urgency_keywords
            + factors["deadline_detection"] * weights.deadline_detection
            + factors["financial_signals"] * weights.financial_signals
            + factors["thread_activity"] * weights.thread_activity
            + factors["recipient_position"] * weights.recipient_position;

        ImportanceResult {
            score,
            level: Importance::from_score(score),
            factors,
        }
    }

    /// VIP senders first (exact or `%` wildcard), then VIP domains, else 0.3.
    fn score_sender_authority(&self, from_email: &str) -> f32 {
        let from_email = from_email.to_lowercase();

        for vip in &self.config.vip_senders {
            let pattern = vip.pattern.to_lowercase();
            let matched = if pattern.contains('%') {
                let regex_pattern = format!("^{}$", regex::escape(&pattern).replace("%", ".*"));
                Regex::new(&regex_pattern)
                    .map(|re| re.is_match(&from_email))
                    .unwrap_or(false)
            } else {
                from_email == pattern
            };
            if matched {
                return (0.7 + vip.boost).min(1.0);
            }
        }

        for domain in &self.config.vip_domains {
            let suffix = format!("@{}", domain.domain.to_lowercase());
            if from_email.ends_with(&suffix) {
                return (0.5 + domain.boost).min(1.0);
            }
        }

        0.3
    }
}

fn score_urgency_keywords(subject: &str, body: &str) -> f32 {
    let text = format!("{} {}", subject, truncate(body, 2000)).to_lowercase();
    let matches = URGENCY_KEYWORDS.iter().filter(|kw| text.contains(**kw)).count();
    match matches {
        0 => 0.0,
        1 => 0.5,
        2 => 0.7,
        n => (0.8 + (n as f32 - 2.0) * 0.1).min(1.0),
    }
}

fn deadline_regexes() -> &'static [Regex; 4] {
    static REGEXES: OnceLock<[Regex; 4]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            Regex::new(r"\b(today|by today|end of day|eod)\b").unwrap(),
            Regex::new(r"\b(tomorrow|by tomorrow)\b").unwrap(),
            Regex::new(r"\b(this week|by friday|by monday|within \d+ days?|in \d+ days?)\b")
                .unwrap(),
            Regex::new(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b").unwrap(),
        ]
    })
}

fn score_deadline(subject: &str, body: &str) -> f32 {
    let text = format!("{} {}", subject, truncate(body, 3000)).to_lowercase();
    let [today, tomorrow, week, date] = deadline_regexes();
    if today.is_match(&text) {
        1.0
    } else if tomorrow.is_match(&text) {
        0.8
    } else if week.is_match(&text) {
        0.5
    } else if date.is_match(&text) {
        0.4
    } else {
        0.0
    }
}

fn currency_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"[$£€]\s*[\d,]+\.?\d*").unwrap())
}

fn score_financial(subject: &str, body: &str) -> f32 {
    let text = format!("{} {}", subject, truncate(body, 2000)).to_lowercase();
    let keyword_matches = FINANCIAL_KEYWORDS
        .iter()
        .filter(|kw| text.contains(**kw))
        .count();
    let currency_matches = currency_regex().find_iter(&text).count();

    match keyword_matches + currency_matches {
        0 => 0.0,
        1..=2 => 0.5,
        3..=4 => 0.7,
        _ => 0.9,
    }
}

fn score_thread_activity(thread_len: Option<usize>) -> f32 {
    match thread_len {
        None => 0.3,
        Some(0..=1) => 0.2,
        Some(2..=3) => 0.5,
        Some(4..=5) => 0.7,
        Some(_) => 0.9,
    }
}

fn score_recipient_position(headers: &BTreeMap<String, String>) -> f32 {
    let to_field = headers.get("to").map(String::as_str).unwrap_or("");
    let cc_field = headers.get("cc").map(String::as_str).unwrap_or("");

    if !to_field.is_empty() && cc_field.is_empty() {
        return 0.8;
    }
    if !to_field.is_empty() && !cc_field.is_empty() {
        let to_count = to_field.split(',').count();
        return if to_count <= 2 {
            0.7
        } else if to_count <= 5 {
            0.5
        } else {
            0.3
        };
    }
    0.5
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
