#![deny(missing_docs)]
//! Oxide dispatch core library.
//!
//! Resilient request orchestration for rate-limited, quota-bearing LLM
//! providers: key rotation, circuit breaking, per-caller admission, retries
//! with model fallback, and partitioned request queues.

/// Settings loading and defaults.
pub mod config;
/// Terminal error taxonomy.
pub mod error;
/// Provider adapters and request/response types.
pub mod llm;
/// Orchestrator facade.
pub mod orchestrator;
/// Partitioned request queues.
pub mod queue;
/// Key pools, breakers, rate limiting and retries.
pub mod resilience;

pub use error::DispatchError;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};

#[cfg(test)]
pub mod testing;
