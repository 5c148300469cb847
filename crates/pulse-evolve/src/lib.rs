//! # pulse-evolve
//!
//! Self-modification for Pulse. The agent rewrites its own motivational
//! parameters by submitting mutation commands — through the `mutations.json`
//! queue file or `POST /config` — and the [`Mutator`] validates each one
//! against the [`Guardrails`] before touching anything. Every attempt,
//! applied or rejected, lands in the audit log exactly once.
//!
//! The agent can rewire its cortex; it can't stop its own heart.

pub mod guardrails;
pub mod mutator;

pub use guardrails::Guardrails;
pub use mutator::Mutator;
