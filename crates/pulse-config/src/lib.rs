//! # pulse-config
//!
//! Configuration for the Pulse daemon — maps to `pulse.toml`. The schema is
//! closed: every tunable is a named field, and the loader validates ranges
//! before the daemon starts. The mutable subset (threshold, rate, cooldown,
//! turns-per-hour, drive weights) can later be changed at runtime through the
//! mutation path; everything else is immutable once loaded.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{ConfigWarning, PulseConfig, WarningSeverity};
