//! Configuration types.
//!
//! All configuration is loaded once at process start (`AppConfig::from_env`)
//! and passed explicitly to each component. Nothing reads ambient state after
//! startup.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// A single classification category with its matching hints.
///
/// The hints (keywords, domains) are included in the classifier prompt;
/// they are not matched locally.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: &'static str,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
    pub domains: &'static [&'static str],
}

/// Categories the classifier may assign.
pub const CATEGORIES: &[Category] = &[
    Category {
        name: "Important",
        description: "Time-sensitive or critical emails requiring immediate attention",
        keywords: &["urgent", "deadline", "interview", "offer", "critical", "action required"],
        domains: &[],
    },
    Category {
        name: "Personal/Friends",
        description: "Emails from friends with informal tone",
        keywords: &[],
        domains: &["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"],
    },
    Category {
        name: "Personal/Family",
        description: "Emails from family members",
        keywords: &["family", "reunion"],
        domains: &[],
    },
    Category {
        name: "Professional/Recruiters",
        description: "Job-related emails from recruiters",
        keywords: &["opportunity", "position", "interview", "role", "hiring", "candidate"],
        domains: &["linkedin.com", "greenhouse.io", "lever.co"],
    },
    Category {
        name: "Professional/Work",
        description: "Work-related professional correspondence",
        keywords: &["meeting", "project", "deadline", "deliverable", "report"],
        domains: &[],
    },
    Category {
        name: "Purchases/Orders",
        description: "Order confirmations and shipping notifications",
        keywords: &["order", "shipped", "delivery", "tracking", "receipt"],
        domains: &["amazon.com", "etsy.com", "ebay.com", "shopify.com"],
    },
    Category {
        name: "Newsletters/Subscriptions",
        description: "Newsletter and subscription emails",
        keywords: &["unsubscribe", "newsletter", "digest", "weekly"],
        domains: &["substack.com"],
    },
    Category {
        name: "Marketing/Promotions",
        description: "Promotional and marketing emails",
        keywords: &["sale", "discount", "promo", "offer", "deal", "limited time"],
        domains: &[],
    },
];

/// A VIP sender pattern for importance scoring.
///
/// `pattern` is either an exact address or a `%` wildcard pattern
/// (SQL LIKE style, e.g. `%@acme.com`).
#[derive(Debug, Clone)]
pub struct VipSender {
    pub pattern: String,
    pub name: Option<String>,
    pub boost: f32,
}

/// A VIP domain with its importance boost.
#[derive(Debug, Clone)]
pub struct VipDomain {
    pub domain: String,
    pub boost: f32,
}

/// Weights for the six importance signals. Must sum to 1.0.
#[derive(Debug, Clone)]
pub struct ImportanceWeights {
    pub sender_authority: f32,
    pub urgency_keywords: f32,
    pub deadline_detection: f32,
    pub financial_signals: f32,
    pub thread_activity: f32,
    pub recipient_position: f32,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            sender_authority: 0.25,
            urgency_keywords: 0.20,
            deadline_detection: 0.20,
            financial_signals: 0.15,
            thread_activity: 0.10,
            recipient_position: 0.10,
        }
    }
}

impl ImportanceWeights {
    fn sum(&self) -> f32 {
        self.sender_authority
            + self.urgency_keywords
            + self.deadline_detection
            + self.financial_signals
            + self.thread_activity
            + self.recipient_position
    }

    /// Validate that weights sum to 1.0 (within float tolerance).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.sum();
        if (sum - 1.0).abs() > 1e-4 {
            return Err(ConfigError::BadWeights(sum));
        }
        Ok(())
    }
}

/// Importance scoring configuration.
#[derive(Debug, Clone, Default)]
pub struct ImportanceConfig {
    pub weights: ImportanceWeights,
    pub vip_senders: Vec<VipSender>,
    pub vip_domains: Vec<VipDomain>,
}

/// Classifier (Anthropic API) configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: SecretString,
    /// Fast/cheap tier for first-pass classification.
    pub fast_model: String,
    /// Slow/accurate tier for low-confidence escalation.
    pub quality_model: String,
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Escalate to the quality model below this classification confidence.
    pub escalation_threshold: f32,
    /// Auto-label at or above this final confidence; queue for review below.
    pub autolabel_threshold: f32,
    /// Maximum messages fetched per provider page.
    pub page_size: u32,
    /// Maximum attempts per workflow step before dead-lettering.
    pub max_step_attempts: u32,
    /// Base delay for per-step exponential backoff.
    pub step_backoff_base: Duration,
    /// Months of mail covered by one batch chunk.
    pub chunk_months: u32,
    /// Maximum items processed per chunk.
    pub chunk_size: u32,
    /// Job locks older than this are stale and reclaimable.
    pub lock_timeout: Duration,
    /// Consecutive chunk failures before a job is marked failed.
    pub max_chunk_retries: u32,
    /// Delay before dispatching the next chunk after one completes.
    pub continuation_delay: Duration,
    /// Concurrent items in flight within one chunk.
    pub chunk_concurrency: usize,
    pub importance: ImportanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 0.7,
            autolabel_threshold: 0.8,
            page_size: 100,
            max_step_attempts: 3,
            step_backoff_base: Duration::from_millis(500),
            chunk_months: 2,
            chunk_size: 500,
            lock_timeout: Duration::from_secs(30 * 60),
            max_chunk_retries: 3,
            continuation_delay: Duration::from_secs(5),
            chunk_concurrency: 4,
            importance: ImportanceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// VIP senders come from `TRIAGE_VIP_SENDERS` as a comma-separated list of
    /// `pattern[:boost]` entries; VIP domains from `TRIAGE_VIP_DOMAINS` likewise.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TRIAGE_ESCALATION_THRESHOLD") {
            config.escalation_threshold = parse_var("TRIAGE_ESCALATION_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("TRIAGE_AUTOLABEL_THRESHOLD") {
            config.autolabel_threshold = parse_var("TRIAGE_AUTOLABEL_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("TRIAGE_CHUNK_MONTHS") {
            config.chunk_months = parse_var("TRIAGE_CHUNK_MONTHS", &v)?;
        }
        if let Ok(v) = std::env::var("TRIAGE_CHUNK_SIZE") {
            config.chunk_size = parse_var("TRIAGE_CHUNK_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("TRIAGE_LOCK_TIMEOUT_MINUTES") {
            let minutes: u64 = parse_var("TRIAGE_LOCK_TIMEOUT_MINUTES", &v)?;
            config.lock_timeout = Duration::from_secs(minutes * 60);
        }
        if let Ok(v) = std::env::var("TRIAGE_VIP_SENDERS") {
            config.importance.vip_senders = parse_vip_senders(&v);
        }
        if let Ok(v) = std::env::var("TRIAGE_VIP_DOMAINS") {
            config.importance.vip_domains = parse_vip_domains(&v);
        }

        config.importance.weights.validate()?;
        Ok(config)
    }
}

impl ClassifierConfig {
    /// Load classifier configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
        Ok(Self {
            api_key: SecretString::from(api_key),
            fast_model: std::env::var("TRIAGE_FAST_MODEL")
                .unwrap_or_else(|_| "claude-3-haiku-20240307".to_string()),
            quality_model: std::env::var("TRIAGE_QUALITY_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_vip_senders(raw: &str) -> Vec<VipSender> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (pattern, boost) = match entry.split_once(':') {
                Some((p, b)) => (p.to_string(), b.parse().unwrap_or(0.3)),
                None => (entry.to_string(), 0.3),
            };
            VipSender {
                pattern,
                name: None,
                boost,
            }
        })
        .collect()
}

fn parse_vip_domains(raw: &str) -> Vec<VipDomain> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (domain, boost) = match entry.split_once(':') {
                Some((d, b)) => (d.to_string(), b.parse().unwrap_or(0.2)),
                None => (entry.to_string(), 0.2),
            };
            VipDomain { domain, boost }
        })
        .collect()
}
