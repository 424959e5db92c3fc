//! Per-destination windows that hold small items back to send them together.
//!
//! Text windows merge small plain texts into one send. Album windows gather
//! the parts of one source album so they relay as a single media group. A
//! destination has at most one open window, and it flushes on whichever comes
//! first: its item limit, or `max_wait` since it opened. An item that would
//! push merged text past `max_batch_chars`, an item for a different kind of
//! window, and any task that bypasses the window all flush it first, so
//! per-destination arrival order holds.

use crate::config::{EngineConfig, MirrorOptions};
use crate::monitor::PerformanceMonitor;
use crate::queue::TaskQueue;
use crate::strategy;
use crate::types::{ChatId, FormattedText, MirrorTask, Payload, Priority, TaskKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

/// Upper bound of a platform media group.
const ALBUM_MAX_PARTS: usize = 10;

#[derive(Debug)]
pub enum Offer {
    Accepted,
    /// Not batchable; the caller enqueues it directly.
    Rejected(MirrorTask),
}

#[derive(Debug)]
pub enum Amend {
    /// The buffered item now carries the edited content.
    Applied,
    /// The source message is not waiting in any window.
    NotBuffered(MirrorTask),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WindowKind {
    Text,
    /// Media group ids are only unique within their source chat.
    Album { source: ChatId, group: String },
}

#[derive(Debug)]
struct BatchWindow {
    kind: WindowKind,
    parts: Vec<MirrorTask>,
    chars: usize,
    generation: u64,
}

#[derive(Debug, Default)]
struct Windows {
    by_target: HashMap<ChatId, BatchWindow>,
    next_generation: u64,
}

pub struct BatchAggregator {
    config: EngineConfig,
    windows: Mutex<Windows>,
    queue: Arc<TaskQueue>,
    monitor: Arc<PerformanceMonitor>,
}

impl BatchAggregator {
    pub fn new(
        config: EngineConfig,
        queue: Arc<TaskQueue>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
            queue,
            monitor,
        }
    }

    pub fn offer(self: &Arc<Self>, task: MirrorTask, options: &MirrorOptions) -> Offer {
        let kind = if strategy::is_batchable(&task, options, &self.config) {
            WindowKind::Text
        } else if strategy::is_groupable(&task, options, &self.config) {
            match &task.media_group {
                Some(group) => WindowKind::Album {
                    source: task.source_chat_id,
                    group: group.clone(),
                },
                None => return Offer::Rejected(task),
            }
        } else {
            return Offer::Rejected(task);
        };

        let separator_chars = self.config.batch.separator.chars().count();
        let item_chars = text_chars(&task);
        let target = task.target_chat_id;
        let mut ready = Vec::new();
        let mut timer = None;
        {
            let mut windows = self.lock();
            let must_flush = windows.by_target.get(&target).is_some_and(|window| {
                window.kind != kind
                    || (kind == WindowKind::Text
                        && window.chars + separator_chars + item_chars
                            > self.config.batch.max_batch_chars)
            });
            if must_flush {
                if let Some(window) = windows.by_target.remove(&target) {
                    ready.push(window);
                }
            }

            if !windows.by_target.contains_key(&target) {
                let generation = windows.next_generation;
                windows.next_generation = windows.next_generation.wrapping_add(1);
                windows.by_target.insert(
                    target,
                    BatchWindow {
                        kind: kind.clone(),
                        parts: Vec::new(),
                        chars: 0,
                        generation,
                    },
                );
                timer = Some(generation);
            }

            if let Some(window) = windows.by_target.get_mut(&target) {
                if !window.parts.is_empty() {
                    window.chars += separator_chars;
                }
                window.chars += item_chars;
                window.parts.push(task);
                if window.parts.len() >= self.part_limit(&kind) {
                    if let Some(window) = windows.by_target.remove(&target) {
                        ready.push(window);
                    }
                }
            }
        }

        for window in ready {
            self.dispatch(target, window);
        }
        if let Some(generation) = timer {
            self.spawn_window_timer(target, generation);
        }
        Offer::Accepted
    }

    /// Applies an edit to a source message that is still buffered. When the
    /// edited content no longer belongs in the window, the window is split
    /// around it and all three pieces are queued in their original order.
    pub fn amend(&self, edit: MirrorTask, options: &MirrorOptions) -> Amend {
        let target = edit.target_chat_id;
        let source = edit.source();
        let mut ready = Vec::new();
        {
            let mut windows = self.lock();
            let Some(window) = windows.by_target.get_mut(&target) else {
                return Amend::NotBuffered(edit);
            };
            let Some(index) = window.parts.iter().position(|part| part.source() == source) else {
                return Amend::NotBuffered(edit);
            };

            let mut amended = window.parts[index].clone();
            amended.payload = edit.payload;
            amended.relayable = edit.relayable;
            let chars = window
                .chars
                .saturating_sub(text_chars(&window.parts[index]))
                + text_chars(&amended);
            let fits = match &window.kind {
                WindowKind::Text => {
                    strategy::is_batchable(&amended, options, &self.config)
                        && chars <= self.config.batch.max_batch_chars
                }
                WindowKind::Album { .. } => strategy::is_groupable(&amended, options, &self.config),
            };
            if fits {
                window.chars = chars;
                window.parts[index] = amended;
                tracing::debug!(
                    source_chat = %source.chat_id,
                    source_message = %source.message_id,
                    "edit applied to buffered item"
                );
                return Amend::Applied;
            }

            if let Some(mut window) = windows.by_target.remove(&target) {
                let after = window.parts.split_off(index + 1);
                window.parts.truncate(index);
                amended.batchable = false;
                let kind = window.kind.clone();
                ready.push(window);
                ready.push(BatchWindow {
                    kind: kind.clone(),
                    parts: vec![amended],
                    chars: 0,
                    generation: 0,
                });
                ready.push(BatchWindow {
                    kind,
                    parts: after,
                    chars: 0,
                    generation: 0,
                });
            }
        }

        tracing::debug!(
            source_chat = %source.chat_id,
            source_message = %source.message_id,
            "edited item no longer fits its window; window split"
        );
        for window in ready {
            self.dispatch(target, window);
        }
        Amend::Applied
    }

    /// Flushes the destination's open window, if any.
    pub fn flush(&self, target: ChatId) {
        let window = self.lock().by_target.remove(&target);
        if let Some(window) = window {
            self.dispatch(target, window);
        }
    }

    /// Flushes every open window immediately.
    pub fn flush_all(&self) {
        let drained: Vec<(ChatId, BatchWindow)> = self.lock().by_target.drain().collect();
        for (target, window) in drained {
            self.dispatch(target, window);
        }
    }

    pub fn open_windows(&self) -> usize {
        self.lock().by_target.len()
    }

    pub fn buffered_items(&self) -> usize {
        self.lock()
            .by_target
            .values()
            .map(|window| window.parts.len())
            .sum()
    }

    fn part_limit(&self, kind: &WindowKind) -> usize {
        match kind {
            WindowKind::Text => self.config.batch.max_items,
            WindowKind::Album { .. } => ALBUM_MAX_PARTS,
        }
    }

    fn spawn_window_timer(self: &Arc<Self>, target: ChatId, generation: u64) {
        let this = Arc::clone(self);
        let deadline = Instant::now() + self.config.batch.max_wait();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.flush_expired(target, generation);
        });
    }

    fn flush_expired(&self, target: ChatId, generation: u64) {
        let window = {
            let mut windows = self.lock();
            // The window may already have flushed on size and been reopened.
            let current = windows
                .by_target
                .get(&target)
                .is_some_and(|window| window.generation == generation);
            if !current {
                return;
            }
            match windows.by_target.remove(&target) {
                Some(window) => window,
                None => return,
            }
        };
        self.dispatch(target, window);
    }

    fn dispatch(&self, target: ChatId, window: BatchWindow) {
        let task = match window.kind {
            WindowKind::Text => build_batch_task(target, window.parts),
            WindowKind::Album { .. } => build_album_task(target, window.parts),
        };
        let Some(task) = task else {
            return;
        };
        tracing::debug!(
            target_chat = %target,
            task_id = %task.id,
            payload = task.payload.label(),
            "batch window flushed"
        );
        let depth = self.queue.enqueue(task);
        self.monitor.observe_queue_depth(depth);
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn text_chars(task: &MirrorTask) -> usize {
    task.payload.text().map_or(0, |text| text.chars().count())
}

/// Turns flushed text window contents into one task. A single buffered item
/// is sent as itself so it keeps an individually addressable cache entry.
pub fn build_batch_task(target: ChatId, parts: Vec<MirrorTask>) -> Option<MirrorTask> {
    assemble(target, parts, |parts| Payload::Batch { parts })
}

/// Same as [`build_batch_task`] for album parts, ordered by source message
/// id as the platform requires for a group relay.
pub fn build_album_task(target: ChatId, mut parts: Vec<MirrorTask>) -> Option<MirrorTask> {
    parts.sort_by_key(|part| part.source_message_id);
    assemble(target, parts, |parts| Payload::Album { parts })
}

fn assemble(
    target: ChatId,
    mut parts: Vec<MirrorTask>,
    wrap: impl FnOnce(Vec<MirrorTask>) -> Payload,
) -> Option<MirrorTask> {
    if parts.len() <= 1 {
        return parts.pop().map(|mut part| {
            part.batchable = false;
            part
        });
    }
    let enqueued_at = parts.iter().map(|part| part.enqueued_at).min()?;
    let first = &parts[0];
    let (source_chat_id, source_message_id) = (first.source_chat_id, first.source_message_id);
    let media_group = first.media_group.clone();
    Some(MirrorTask {
        id: Uuid::new_v4(),
        source_chat_id,
        source_message_id,
        kind: TaskKind::AlbumPart,
        priority: Priority::Normal,
        is_protected: false,
        target_chat_id: target,
        enqueued_at,
        not_before: None,
        attempt_count: 0,
        throttled_count: 0,
        batchable: false,
        relayable: false,
        media_group,
        payload: wrap(parts),
    })
}

/// Concatenates part texts in arrival order, keeping their formatting.
pub fn merged_text(parts: &[MirrorTask], separator: &str) -> FormattedText {
    let texts: Vec<FormattedText> = parts
        .iter()
        .filter_map(|part| part.payload.formatted())
        .collect();
    FormattedText::join(&texts, separator)
}

/// Splits a failed batch or album back into standalone tasks at their
/// original priority and queue position. Parts never rejoin a window.
pub fn decompose(task: MirrorTask) -> Vec<MirrorTask> {
    match task.payload {
        Payload::Batch { parts } | Payload::Album { parts } => parts
            .into_iter()
            .map(|mut part| {
                part.batchable = false;
                part.not_before = None;
                part.attempt_count = 0;
                part
            })
            .collect(),
        payload => vec![MirrorTask { payload, ..task }],
    }
}
