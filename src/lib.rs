//! Mail Triage — resumable batch email classification.

pub mod batch;
pub mod calendar;
pub mod classify;
pub mod config;
pub mod error;
pub mod mail;
pub mod pipeline;
pub mod review;
pub mod server;
pub mod store;
