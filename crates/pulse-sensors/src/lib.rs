//! # pulse-sensors
//!
//! Passive environment monitoring. Sensors watch the world without making
//! model calls and feed raw signals into the drive engine: filesystem
//! events, conversation activity, system health, and cheap mtime scans of
//! drive source files.
//!
//! The contract: `read()` never blocks the main loop. Inner I/O is either
//! event-buffered (filesystem), mtime-cached (conversation, sources), or
//! timed out at a short budget with the last known reading returned stale
//! (system). Sensors never mutate drive state — everything they know flows
//! out through the returned [`Reading`].

pub mod conversation;
pub mod filesystem;
pub mod manager;
pub mod sources;
pub mod system;

pub use conversation::ConversationSensor;
pub use filesystem::{FilesystemSensor, SelfWriteRegistry};
pub use manager::SensorManager;
pub use sources::{SourceScrapeSensor, SourceWatchlist};
pub use system::SystemSensor;

use async_trait::async_trait;
use pulse_core::{ConversationReading, FilesystemReading, SpikeDirective, SystemReading};

/// Typed payload of one sensor read.
#[derive(Debug, Clone)]
pub enum ReadingPayload {
    Filesystem(FilesystemReading),
    Conversation(ConversationReading),
    System(SystemReading),
    /// Source scrapes only emit spike directives.
    Sources,
}

/// One sensor's output for one tick.
#[derive(Debug, Clone)]
pub struct Reading {
    pub timestamp: f64,
    pub payload: ReadingPayload,
    pub spikes: Vec<SpikeDirective>,
}

/// The narrow contract every sensor implements.
#[async_trait]
pub trait Sensor: Send {
    fn name(&self) -> &'static str;

    /// Acquire resources. Must be idempotent.
    async fn initialize(&mut self) -> pulse_core::Result<()>;

    /// Produce a reading for this tick without blocking the loop.
    async fn read(&mut self, now: f64) -> pulse_core::Result<Reading>;

    /// Release resources.
    async fn stop(&mut self);
}
