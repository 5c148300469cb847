//! # pulse-cli
//!
//! The `pulse` command: start the daemon, or talk to a running one over
//! its health server.

pub mod commands;

pub use commands::Cli;
