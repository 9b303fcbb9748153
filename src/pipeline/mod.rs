//! Message triage pipeline.
//!
//! Every message flows through the same checkpointed workflow:
//! 1. ingest — fetch and persist the item idempotently
//! 2. classify — two-tier model classification with escalation
//! 3. score_importance — deterministic weighted scoring
//! 4. enrich — calendar extraction and unsubscribe detection
//! 5. finalize — auto-label gate or human review routing
//! 6. label — apply mailbox labels
//!
//! Labels are only ever applied automatically above the confidence gate;
//! everything else waits for a review resolution.

pub mod calendar;
pub mod importance;
pub mod state;
pub mod unsubscribe;
pub mod workflow;

pub use importance::{ImportanceResult, ImportanceScorer, ScoringInput};
pub use state::{ItemState, Step};
pub use unsubscribe::{UnsubscribeMethod, UnsubscribeOption};
pub use workflow::{ClassificationWorkflow, ProcessOutcome};
