//! Engine facade: event intake, lifecycle, persistence, and status.

use crate::batch::{Amend, BatchAggregator, Offer};
use crate::cache::MessageCache;
use crate::config::{EngineConfig, MirrorOptions};
use crate::dispatcher::Dispatcher;
use crate::error::{MirrorError, Result};
use crate::governor::{FloodSnapshot, RateGovernor};
use crate::monitor::{Degradation, PerformanceMonitor, Stats};
use crate::pending::PendingSet;
use crate::queue::TaskQueue;
use crate::snapshot::EngineSnapshot;
use crate::traits::{SettingsStore, Transport};
use crate::types::{EventKind, InboundEvent, MirrorTask, Payload, TaskKind};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued { task_id: Uuid, depth: usize },
    /// Buffered in a batch window for the destination.
    Batched,
    Ignored(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub running: bool,
    pub transport: String,
    pub mapping_count: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub open_batches: usize,
    pub buffered_items: usize,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    /// Source operations accepted but not yet settled.
    pub pending: usize,
    pub cooldowns: Vec<FloodSnapshot>,
    pub options: MirrorOptions,
    pub stats: Stats,
}

enum Lifecycle {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

pub struct MirrorEngine {
    config: EngineConfig,
    queue: Arc<TaskQueue>,
    governor: Arc<RateGovernor>,
    cache: Arc<MessageCache>,
    monitor: Arc<PerformanceMonitor>,
    aggregator: Arc<BatchAggregator>,
    pending: Arc<PendingSet>,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsStore>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl MirrorEngine {
    /// Builds an engine with its own queue, cooldown table, cache, and
    /// counters. Nothing runs until [`MirrorEngine::start`].
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        config.validate()?;

        let governor = Arc::new(RateGovernor::new(
            config.global_min_interval(),
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        ));
        let queue = Arc::new(TaskQueue::new(
            governor.clone(),
            config.cooldown_skip_threshold(),
        ));
        let cache = Arc::new(MessageCache::new(config.cache_capacity));
        let monitor = Arc::new(PerformanceMonitor::new(
            config.latency_window,
            config.recent_failures,
            config.queue_depth_watermark,
            config.latency_watermark(),
        ));
        let aggregator = Arc::new(BatchAggregator::new(
            config.clone(),
            queue.clone(),
            monitor.clone(),
        ));
        let pending = Arc::new(PendingSet::new());
        let dispatcher = Arc::new(Dispatcher {
            config: config.clone(),
            queue: queue.clone(),
            governor: governor.clone(),
            cache: cache.clone(),
            monitor: monitor.clone(),
            aggregator: aggregator.clone(),
            pending: pending.clone(),
            transport: transport.clone(),
            settings: settings.clone(),
        });

        Ok(Self {
            config,
            queue,
            governor,
            cache,
            monitor,
            aggregator,
            pending,
            transport,
            settings,
            dispatcher,
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Restores the persisted snapshot, then spawns the worker pool and the
    /// periodic snapshot loop. An engine starts at most once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => {
                return Err(MirrorError::Lifecycle("engine already running".into()));
            }
            Lifecycle::Stopped => {
                return Err(MirrorError::Lifecycle("engine was shut down".into()));
            }
        }

        if let Some(snapshot) = self.settings.load_snapshot().await? {
            let restored = self.cache.restore(&snapshot.message_cache);
            self.monitor.restore(&snapshot.stats);
            tracing::info!(
                cache_entries = restored,
                saved_at = ?snapshot.saved_at,
                "restored mirror engine snapshot"
            );
        }

        let mut handles = self.dispatcher.spawn_workers(&self.shutdown);
        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.run_snapshot_loop().await }));
        *lifecycle = Lifecycle::Running(handles);

        tracing::info!(
            workers = self.config.workers,
            transport = self.transport.transport_id(),
            mappings = self.settings.mapping_count(),
            "mirror engine started"
        );
        Ok(())
    }

    /// Flushes open batch windows, waits up to the configured grace period
    /// for queued work, stops the workers, and saves a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        let handles = {
            let mut lifecycle = self.lifecycle.lock().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(handles) => handles,
                Lifecycle::Idle | Lifecycle::Stopped => Vec::new(),
            }
        };

        self.aggregator.flush_all();
        if !handles.is_empty() {
            self.drain(self.config.shutdown_grace()).await;
        }

        self.shutdown.cancel();
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(?error, "mirror engine task join failed");
            }
        }

        let dropped = self.queue.len();
        if dropped > 0 {
            tracing::warn!(dropped, "mirror engine stopped with undelivered tasks");
        }
        self.persist().await?;
        tracing::info!("mirror engine stopped");
        Ok(())
    }

    async fn drain(&self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            while !self.queue.is_empty() || self.queue.in_flight() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                pending = self.queue.len(),
                ?grace,
                "shutdown grace elapsed before queue drained"
            );
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_snapshot_loop(self: Arc<Self>) {
        let period = self.config.snapshot_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.persist().await {
                        tracing::warn!(%error, "periodic snapshot failed");
                    }
                }
            }
        }
    }

    /// Saves the message cache and counters through the settings store.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = EngineSnapshot {
            message_cache: self.cache.records(),
            stats: self.monitor.counters(),
            saved_at: Some(Utc::now()),
        };
        self.settings.save_snapshot(&snapshot).await?;
        tracing::debug!(
            cache_entries = snapshot.message_cache.len(),
            "saved mirror engine snapshot"
        );
        Ok(())
    }

    /// Converts an inbound event into a task for its mapped destination.
    /// Events rejected by the operator toggles are ignored, never queued, and
    /// so are redeliveries of work that is mirrored or still outstanding.
    pub fn ingest(&self, event: InboundEvent) -> IngestOutcome {
        if self.shutdown.is_cancelled() {
            return IngestOutcome::Ignored("engine stopped");
        }
        let options = self.settings.options();
        if !options.mirror_enabled {
            return IngestOutcome::Ignored("mirroring disabled");
        }
        let Some(target) = self.settings.target_for(event.source.chat_id) else {
            return IngestOutcome::Ignored("unmapped source chat");
        };

        match event.kind {
            EventKind::Edit if !options.mirror_edits => {
                return IngestOutcome::Ignored("edits disabled");
            }
            EventKind::Delete if !options.mirror_deletes => {
                return IngestOutcome::Ignored("deletes disabled");
            }
            _ => {}
        }

        let (payload, relayable) = if event.kind == EventKind::Delete {
            (Payload::Empty, true)
        } else {
            match filter_payload(event.payload, &options) {
                Ok(filtered) => filtered,
                Err(reason) => {
                    tracing::trace!(
                        source_chat = %event.source.chat_id,
                        source_message = %event.source.message_id,
                        reason,
                        "inbound event ignored"
                    );
                    return IngestOutcome::Ignored(reason);
                }
            }
        };

        let mut task = MirrorTask::new(
            event.source,
            TaskKind::from(event.kind),
            event.priority.unwrap_or_default(),
            payload,
            target,
        )
        .protected(event.is_protected);
        task.relayable = relayable;
        task.media_group = event.media_group;

        if matches!(task.kind, TaskKind::New | TaskKind::AlbumPart)
            && self.cache.get(&task.source()).is_some()
        {
            return IngestOutcome::Ignored("already mirrored");
        }
        if !self.pending.claim(&task) {
            tracing::debug!(
                source_chat = %task.source_chat_id,
                source_message = %task.source_message_id,
                kind = ?task.kind,
                "duplicate event for outstanding work"
            );
            return IngestOutcome::Ignored("already pending");
        }

        if task.kind == TaskKind::Edit {
            match self.aggregator.amend(task, &options) {
                Amend::Applied => return IngestOutcome::Batched,
                Amend::NotBuffered(edit) => task = edit,
            }
        }
        match self.aggregator.offer(task, &options) {
            Offer::Accepted => return IngestOutcome::Batched,
            Offer::Rejected(rejected) => task = rejected,
        }
        // Anything buffered for this destination arrived first and must be queued first.
        self.aggregator.flush(target);

        let task_id = task.id;
        let depth = self.queue.enqueue(task);
        self.monitor.observe_queue_depth(depth);
        tracing::debug!(%task_id, target_chat = %target, depth, "mirror task queued");
        IngestOutcome::Queued { task_id, depth }
    }

    pub fn status(&self) -> EngineStatus {
        let running = !self.shutdown.is_cancelled()
            && self
                .lifecycle
                .try_lock()
                .map(|lifecycle| matches!(*lifecycle, Lifecycle::Running(_)))
                .unwrap_or(true);
        let options = self.settings.options();
        EngineStatus {
            enabled: options.mirror_enabled,
            running,
            transport: self.transport.transport_id().to_string(),
            mapping_count: self.settings.mapping_count(),
            queue_depth: self.queue.len(),
            in_flight: self.queue.in_flight(),
            open_batches: self.aggregator.open_windows(),
            buffered_items: self.aggregator.buffered_items(),
            cache_entries: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            pending: self.pending.len(),
            cooldowns: self.governor.snapshot(),
            options,
            stats: self.stats(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.monitor.observe_queue_depth(self.queue.len());
        self.monitor.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn degradation(&self) -> Degradation {
        self.monitor.degradation()
    }

    /// Advisory signal for intake sources that want to slow down.
    pub fn subscribe_degradation(&self) -> watch::Receiver<Degradation> {
        self.monitor.subscribe()
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }
}

/// Applies the content toggles. Returns the payload to mirror and whether it
/// still matches the source item.
fn filter_payload(
    payload: Payload,
    options: &MirrorOptions,
) -> std::result::Result<(Payload, bool), &'static str> {
    match payload {
        Payload::Empty => Err("empty event"),
        Payload::Batch { .. } | Payload::Album { .. } => {
            Err("aggregated payloads are engine-internal")
        }
        Payload::Text {
            text,
            entities,
            link_preview,
        } => {
            if !options.mirror_text {
                return Err("text disabled");
            }
            if text.trim().is_empty() {
                return Err("empty event");
            }
            Ok((
                Payload::Text {
                    text,
                    entities,
                    link_preview,
                },
                true,
            ))
        }
        Payload::Media {
            media,
            caption,
            entities,
        } => {
            if options.mirror_media {
                return Ok((
                    Payload::Media {
                        media,
                        caption,
                        entities,
                    },
                    true,
                ));
            }
            match caption.filter(|c| !c.trim().is_empty()) {
                Some(text) if options.mirror_text => Ok((
                    Payload::Text {
                        text,
                        entities,
                        link_preview: false,
                    },
                    false,
                )),
                _ => Err("media disabled"),
            }
        }
        other @ (Payload::Poll { .. } | Payload::Location { .. }) => Ok((other, true)),
    }
}
