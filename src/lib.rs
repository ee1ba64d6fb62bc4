//! lantern — a social-feed backend built around a persistent
//! semantic-matching engine between posts and standing queries.
//!
//! Subsystems, leaves first: `embedding` (fragment store + vector
//! index), `judge` (cached LLM scoring), `storage` (SQLite pool and
//! typed stores), `matcher` (the reconciliation engine and its worker
//! queue), `notify` (push fan-out), `http` (the request surface).

// Core types
pub mod config;
pub mod constants;
pub mod error;
pub mod post;
pub mod user;

// Sub-systems
pub mod embedding;
pub mod http;
pub mod judge;
pub mod matcher;
pub mod notify;
pub mod storage;
pub mod tracing_init;

#[cfg(test)]
pub mod test_helpers;

pub use error::{AppError, AppResult};
