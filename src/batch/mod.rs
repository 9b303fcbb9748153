//! Chunked batch backfill over historical mail.

pub mod dispatch;
pub mod orchestrator;

pub use dispatch::{ChunkDispatcher, HttpDispatcher, LocalDispatcher};
pub use orchestrator::{generate_date_ranges, BatchOrchestrator, ChunkResult, ITEM_COST};
