//! Compliance Guardian Agent
//!
//! Continuous threshold monitoring with degraded-mode orchestration:
//! metric aggregation over independently operated collaborators, violation
//! classification, time-bounded consultation for moderate violations, and
//! per-dependency circuit breaking with invariant-preserving fallbacks.
//!
//! # Design Principles
//! - Deterministic: decisions come from explicit vote and hook seams,
//!   never from randomized outcomes
//! - Fail-safe: partial source availability degrades scores, it never
//!   crashes the monitor
//! - Idempotent: at most one rollback plan per unresolved violation

pub mod breaker;
pub mod client;
pub mod engine;
pub mod error;
pub mod handler;
pub mod notify;
pub mod telemetry;

// Re-export contracts
#[path = "../contracts/mod.rs"]
pub mod contracts;

pub use contracts::*;
pub use error::{GuardianError, Result};
