//! Unsubscribe detection from message headers (RFC 2369, RFC 8058).
//!
//! Body link scanning is intentionally not implemented; header-based
//! detection is the only reliable signal.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Categories that trigger unsubscribe detection.
pub const UNSUBSCRIBE_CATEGORIES: &[&str] = &["Newsletters/Subscriptions", "Marketing/Promotions"];

/// How an unsubscribe would be performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum UnsubscribeMethod {
    /// RFC 8058 one-click: POST to an https URL, no interaction needed.
    OneClick { url: String },
    Http { url: String },
    Mailto { email: String },
}

/// A detected unsubscribe option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeOption {
    #[serde(flatten)]
    pub method: UnsubscribeMethod,
    pub confidence: f32,
    pub sender_domain: String,
}

enum ParsedUri {
    Http(String),
    Mailto(String),
}

fn angle_bracket_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"<([^>]+)>").unwrap())
}

/// Extract the URIs from a `List-Unsubscribe` header value.
fn parse_header(value: &str) -> Vec<ParsedUri> {
    angle_bracket_regex()
        .captures_iter(value)
        .filter_map(|cap| {
            let uri = cap[1].trim();
            if let Some(rest) = uri.strip_prefix("mailto:") {
                // Strip mailto parameters (?subject=...)
                let email = rest.split('?').next().unwrap_or(rest);
                Some(ParsedUri::Mailto(email.to_string()))
            } else if uri.starts_with("http://") || uri.starts_with("https://") {
                Some(ParsedUri::Http(uri.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Detect the best unsubscribe method from message headers.
///
/// Priority: RFC 8058 one-click (needs `List-Unsubscribe-Post` and an https
/// link), then https, then http, then mailto.
pub fn detect_unsubscribe(
    headers: &BTreeMap<String, String>,
    from_email: &str,
) -> Option<UnsubscribeOption> {
    let list_unsub = headers.get("list-unsubscribe")?;
    let parsed = parse_header(list_unsub);
    if parsed.is_empty() {
        return None;
    }

    let has_one_click = headers
        .get("list-unsubscribe-post")
        .map(|v| v.contains("List-Unsubscribe=One-Click"))
        .unwrap_or(false);

    let sender_domain = extract_sender_domain(from_email);
    let https: Vec<&String> = parsed
        .iter()
        .filter_map(|p| match p {
            ParsedUri::Http(url) if url.starts_with("https://") => Some(url),
            _ => None,
        })
        .collect();
    let http: Vec<&String> = parsed
        .iter()
        .filter_map(|p| match p {
            ParsedUri::Http(url) => Some(url),
            _ => None,
        })
        .collect();
    let mailto: Vec<&String> = parsed
        .iter()
        .filter_map(|p| match p {
            ParsedUri::Mailto(email) => Some(email),
            _ => None,
        })
        .collect();

    if has_one_click {
        if let Some(url) = https.first() {
            return Some(UnsubscribeOption {
                method: UnsubscribeMethod::OneClick {
                    url: (*url).clone(),
                },
                confidence: 0.95,
                sender_domain,
            });
        }
    }
    if let Some(url) = https.first() {
        return Some(UnsubscribeOption {
            method: UnsubscribeMethod::Http { url: (*url).clone() },
            confidence: 0.90,
            sender_domain,
        });
    }
    if let Some(url) = http.first() {
        return Some(UnsubscribeOption {
            method: UnsubscribeMethod::Http { url: (*url).clone() },
            confidence: 0.85,
            sender_domain,
        });
    }
    if let Some(email) = mailto.first() {
        return Some(UnsubscribeOption {
            method: UnsubscribeMethod::Mailto {
                email: (*email).clone(),
            },
            confidence: 0.80,
            sender_domain,
        });
    }
    None
}

/// Domain portion of a sender address, handling `Name <email@domain>` form.
pub fn extract_sender_domain(from_email: &str) -> String {
    let email = angle_bracket_regex()
        .captures(from_email)
        .map(|cap| cap[1].to_string())
        .unwrap_or_else(|| from_email.to_string());

    email
        .split_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .unwrap_or_default()
}
