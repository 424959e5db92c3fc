//! Channel mirroring engine.
//!
//! Inbound content events become prioritized tasks, are paced per destination
//! around flood-wait signals, optionally merged into batches or media groups,
//! and executed by a worker pool against a pluggable [`Transport`]. Mappings
//! and toggles come from a [`SettingsStore`], which also persists the message
//! id cache.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod governor;
pub mod monitor;
pub mod pending;
pub mod queue;
pub mod snapshot;
pub mod strategy;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, CacheRecord, MessageCache};
pub use config::{BatchConfig, EngineConfig, MirrorOptions};
pub use engine::{EngineStatus, IngestOutcome, MirrorEngine};
pub use error::{MirrorError, Result, TransportError, TransportResult};
pub use governor::{FloodSnapshot, Gate, RateGovernor};
pub use monitor::{Degradation, FailureRecord, PerformanceMonitor, Stats, StatsCounters};
pub use pending::PendingSet;
pub use queue::TaskQueue;
pub use snapshot::EngineSnapshot;
pub use strategy::Strategy;
pub use traits::{ByteStream, EditContent, MediaUpload, SettingsStore, Transport};
pub use types::{
    ChatId, EventKind, FormattedText, InboundEvent, MediaDescriptor, MediaKind, MessageId,
    MessageRef, MirrorTask, Payload, Priority, TaskKind, TextEntity,
};
