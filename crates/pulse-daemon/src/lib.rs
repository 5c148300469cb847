//! # pulse-daemon
//!
//! The persistent cognitive loop. Runs continuously, evaluating drives
//! against sensor input, and wakes the agent over the webhook when it
//! should think. One logical main loop owns the drive engine and mutator;
//! the HTTP surface and sensors communicate with it through channels and
//! snapshots, never by sharing mutable state.

pub mod daemon;

pub use daemon::PulseDaemon;
