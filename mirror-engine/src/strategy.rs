//! Delivery strategy selection. Pure functions of task metadata and config.

use crate::config::{EngineConfig, MirrorOptions};
use crate::types::{MirrorTask, Payload, Priority, TaskKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Relay by reference; no content fetch.
    Direct,
    /// Fetch into memory, publish as new content.
    Bypass,
    /// Streamed fetch-and-publish for large media.
    Optimized,
    /// Merge with other small texts for the same destination.
    Batch,
    /// Decide among Direct/Optimized/Batch at send time.
    Smart,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Bypass => "bypass",
            Self::Optimized => "optimized",
            Self::Batch => "batch",
            Self::Smart => "smart",
        }
    }
}

/// First match wins:
/// 1. EDIT/DELETE are addressed through the cache, never by content.
/// 2. Already-aggregated payloads: text batches are batches, albums relay.
/// 3. Protected content with bypass enabled.
/// 4. Small plain text, batching on, normal priority.
/// 5. Media known to be large goes through the streaming pipeline.
/// 6. Media of unknown size is deferred to send time in smart mode.
/// 7. Everything else relays directly.
pub fn select(task: &MirrorTask, options: &MirrorOptions, config: &EngineConfig) -> Strategy {
    if matches!(task.kind, TaskKind::Edit | TaskKind::Delete) {
        return Strategy::Direct;
    }
    match task.payload {
        Payload::Batch { .. } => return Strategy::Batch,
        Payload::Album { .. } => return Strategy::Direct,
        _ => {}
    }
    if task.is_protected && options.bypass_restriction {
        return Strategy::Bypass;
    }
    if is_batchable(task, options, config) {
        return Strategy::Batch;
    }
    if let Some(media) = task.payload.media() {
        match media.size {
            Some(size) if size >= config.large_media_bytes => return Strategy::Optimized,
            None if options.smart_mode => return Strategy::Smart,
            _ => {}
        }
    }
    Strategy::Direct
}

/// Send-time resolution of [`Strategy::Smart`] once the content size is known.
pub fn resolve_smart(
    task: &MirrorTask,
    size: Option<u64>,
    options: &MirrorOptions,
    config: &EngineConfig,
) -> Strategy {
    if task.payload.media().is_some() {
        if size.is_some_and(|size| size >= config.large_media_bytes) {
            return Strategy::Optimized;
        }
        return Strategy::Direct;
    }
    if is_batchable(task, options, config) {
        return Strategy::Batch;
    }
    Strategy::Direct
}

/// Plain-text NEW task at normal priority, within the per-item size limit and
/// not headed for bypass.
pub fn is_batchable(task: &MirrorTask, options: &MirrorOptions, config: &EngineConfig) -> bool {
    if !options.batching_enabled || !task.batchable {
        return false;
    }
    if task.kind != TaskKind::New || task.priority != Priority::Normal {
        return false;
    }
    if task.is_protected && options.bypass_restriction {
        return false;
    }
    match &task.payload {
        Payload::Text { text, .. } => {
            let chars = text.chars().count();
            chars > 0 && chars <= config.batch.max_item_chars
        }
        _ => false,
    }
}

/// Album part that would otherwise relay directly, so it can travel with
/// its siblings as one media group.
pub fn is_groupable(task: &MirrorTask, options: &MirrorOptions, config: &EngineConfig) -> bool {
    if task.kind != TaskKind::AlbumPart || task.media_group.is_none() {
        return false;
    }
    if !task.batchable || !task.relayable {
        return false;
    }
    if task.is_protected && options.bypass_restriction {
        return false;
    }
    match task.payload.media().map(|media| media.size) {
        Some(Some(size)) => size < config.large_media_bytes,
        Some(None) => !options.smart_mode,
        None => false,
    }
}
