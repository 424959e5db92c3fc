use crate::cache::CacheRecord;
use crate::monitor::StatsCounters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable engine state handed to the settings store: the message id cache
/// (oldest insertion first) and the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    #[serde(default)]
    pub message_cache: Vec<CacheRecord>,
    #[serde(default)]
    pub stats: StatsCounters,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}
