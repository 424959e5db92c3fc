//! Engine tuning knobs and operator toggles.

use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Queued tasks whose destination is cooling down for longer than this
    /// are passed over by `dequeue` instead of blocking the head of the queue.
    #[serde(default = "default_cooldown_skip_threshold_ms")]
    pub cooldown_skip_threshold_ms: u64,
    /// Minimum spacing between any two outbound dispatches. 0 disables pacing.
    #[serde(default = "default_global_min_interval_ms")]
    pub global_min_interval_ms: u64,
    /// Media at or above this size goes through the streaming pipeline.
    #[serde(default = "default_large_media_bytes")]
    pub large_media_bytes: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    #[serde(default = "default_recent_failures")]
    pub recent_failures: usize,
    #[serde(default = "default_queue_depth_watermark")]
    pub queue_depth_watermark: usize,
    #[serde(default = "default_latency_watermark_ms")]
    pub latency_watermark_ms: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// How long shutdown waits for queued work to drain before dropping it.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_max_items")]
    pub max_items: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Only texts up to this many characters are batchable.
    #[serde(default = "default_batch_max_item_chars")]
    pub max_item_chars: usize,
    /// Upper bound for the merged message, separators included.
    #[serde(default = "default_batch_max_batch_chars")]
    pub max_batch_chars: usize,
    #[serde(default = "default_batch_separator")]
    pub separator: String,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_cooldown_skip_threshold_ms() -> u64 {
    1_000
}

fn default_global_min_interval_ms() -> u64 {
    35
}

fn default_large_media_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_latency_window() -> usize {
    1_000
}

fn default_recent_failures() -> usize {
    50
}

fn default_queue_depth_watermark() -> usize {
    500
}

fn default_latency_watermark_ms() -> u64 {
    30_000
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_batch_max_items() -> usize {
    10
}

fn default_batch_max_wait_ms() -> u64 {
    2_000
}

fn default_batch_max_item_chars() -> usize {
    280
}

fn default_batch_max_batch_chars() -> usize {
    4096
}

fn default_batch_separator() -> String {
    "\n\n".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: default_batch_max_items(),
            max_wait_ms: default_batch_max_wait_ms(),
            max_item_chars: default_batch_max_item_chars(),
            max_batch_chars: default_batch_max_batch_chars(),
            separator: default_batch_separator(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            cooldown_skip_threshold_ms: default_cooldown_skip_threshold_ms(),
            global_min_interval_ms: default_global_min_interval_ms(),
            large_media_bytes: default_large_media_bytes(),
            cache_capacity: default_cache_capacity(),
            latency_window: default_latency_window(),
            recent_failures: default_recent_failures(),
            queue_depth_watermark: default_queue_depth_watermark(),
            latency_watermark_ms: default_latency_watermark_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            batch: BatchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(MirrorError::InvalidConfig("workers must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(MirrorError::InvalidConfig("max_attempts must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(MirrorError::InvalidConfig(
                "cache_capacity must be > 0".into(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(MirrorError::InvalidConfig(format!(
                "backoff_base_ms ({}) must not exceed backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.batch.max_items == 0 {
            return Err(MirrorError::InvalidConfig(
                "batch.max_items must be > 0".into(),
            ));
        }
        if self.batch.max_item_chars > self.batch.max_batch_chars {
            return Err(MirrorError::InvalidConfig(
                "batch.max_item_chars must not exceed batch.max_batch_chars".into(),
            ));
        }
        Ok(())
    }

    pub fn cooldown_skip_threshold(&self) -> Duration {
        Duration::from_millis(self.cooldown_skip_threshold_ms)
    }

    pub fn global_min_interval(&self) -> Duration {
        Duration::from_millis(self.global_min_interval_ms)
    }

    pub fn latency_watermark(&self) -> Duration {
        Duration::from_millis(self.latency_watermark_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl BatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Runtime toggles owned by the settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorOptions {
    #[serde(default = "default_true")]
    pub mirror_enabled: bool,
    #[serde(default = "default_true")]
    pub mirror_text: bool,
    #[serde(default = "default_true")]
    pub mirror_media: bool,
    #[serde(default = "default_true")]
    pub mirror_edits: bool,
    #[serde(default = "default_true")]
    pub mirror_deletes: bool,
    #[serde(default = "default_true")]
    pub bypass_restriction: bool,
    #[serde(default)]
    pub batching_enabled: bool,
    #[serde(default)]
    pub smart_mode: bool,
    #[serde(default = "default_true")]
    pub text_fallback: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            mirror_enabled: true,
            mirror_text: true,
            mirror_media: true,
            mirror_edits: true,
            mirror_deletes: true,
            bypass_restriction: true,
            batching_enabled: false,
            smart_mode: false,
            text_fallback: true,
        }
    }
}
