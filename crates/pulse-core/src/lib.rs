//! # pulse-core
//!
//! Core types, traits, and primitives for the Pulse initiative daemon.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: drives, trigger decisions, mutations, audit entries, sensor
//! readings, the unified error type, the injectable clock, and the event bus.

pub mod clock;
pub mod error;
pub mod event;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PulseError, Result};
pub use event::{EventBus, PulseEvent};
pub use types::*;
