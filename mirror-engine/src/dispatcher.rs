//! Worker pool draining the task queue.
//!
//! Every failure is resolved here, per task: reschedule, decompose, or report
//! as terminal. Nothing escapes a worker into the queue or other tasks.

use crate::batch::{self, BatchAggregator};
use crate::cache::{CacheEntry, MessageCache};
use crate::config::{EngineConfig, MirrorOptions};
use crate::error::{TransportError, TransportResult};
use crate::governor::{Gate, RateGovernor};
use crate::monitor::{FailureRecord, Outcome, PerformanceMonitor};
use crate::pending::{self, PendingSet};
use crate::queue::TaskQueue;
use crate::strategy::{self, Strategy};
use crate::traits::{EditContent, MediaUpload, SettingsStore, Transport};
use crate::types::{FormattedText, MediaDescriptor, MessageId, MirrorTask, Payload, TaskKind};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared state every worker needs. Injected by the engine.
pub struct Dispatcher {
    pub(crate) config: EngineConfig,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) governor: Arc<RateGovernor>,
    pub(crate) cache: Arc<MessageCache>,
    pub(crate) monitor: Arc<PerformanceMonitor>,
    pub(crate) aggregator: Arc<BatchAggregator>,
    pub(crate) pending: Arc<PendingSet>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: Arc<dyn SettingsStore>,
}

/// Result of one successful outbound operation.
struct Delivered {
    message_id: MessageId,
    media: bool,
}

impl Dispatcher {
    pub fn spawn_workers(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let this = Arc::clone(self);
                let shutdown = shutdown.child_token();
                tokio::spawn(async move { this.run_worker(worker, shutdown).await })
            })
            .collect()
    }

    #[tracing::instrument(level = "info", skip(self, shutdown))]
    async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("mirror worker received shutdown signal");
                    break;
                }
                task = self.queue.dequeue() => task,
            };
            self.monitor.observe_queue_depth(self.queue.len());
            self.handle(task).await;
        }
    }

    /// Processes a dequeued task, then settles its pending keys and frees
    /// the destination for the next task.
    pub async fn handle(&self, task: MirrorTask) {
        let target = task.target_chat_id;
        let keys = pending::keys_of(&task);
        self.process(task).await;
        self.pending.release(&keys);
        self.queue.release(target);
    }

    /// Handles one dequeued task to completion or reschedule.
    pub async fn process(&self, task: MirrorTask) {
        let Some(task) = self.drop_cancelled(task) else {
            return;
        };

        if let Gate::WaitFor(wait) = self.governor.before_send(task.target_chat_id) {
            tracing::trace!(
                task_id = %task.id,
                target_chat = %task.target_chat_id,
                ?wait,
                "destination gated; rescheduling"
            );
            let mut task = task;
            task.not_before = Some(Instant::now() + wait);
            self.requeue(task);
            return;
        }

        let options = self.settings.options();
        match task.kind {
            TaskKind::Edit => self.execute_edit(task, &options).await,
            TaskKind::Delete => self.execute_delete(task).await,
            TaskKind::New | TaskKind::AlbumPart => self.execute_new(task, &options).await,
        }
    }

    /// Mapping validity is re-checked right before execution so tasks queued
    /// for a since-removed mapping never fire.
    fn drop_cancelled(&self, mut task: MirrorTask) -> Option<MirrorTask> {
        let target = task.target_chat_id;
        let still_mapped =
            |part: &MirrorTask| self.settings.target_for(part.source_chat_id) == Some(target);

        if let Some(parts) = task.payload.parts_mut() {
            let before = parts.len();
            parts.retain(|part| still_mapped(part));
            let cancelled = before - parts.len();
            for _ in 0..cancelled {
                self.monitor.record(Outcome::Cancelled, None);
            }
            if cancelled > 0 {
                tracing::info!(
                    target_chat = %target,
                    cancelled,
                    "dropped aggregated parts for removed mappings"
                );
            }
            return match parts.len() {
                0 => None,
                1 => batch::decompose(task).pop(),
                _ => Some(task),
            };
        }

        if still_mapped(&task) {
            return Some(task);
        }
        tracing::info!(
            task_id = %task.id,
            source_chat = %task.source_chat_id,
            target_chat = %target,
            "mapping removed while queued; task cancelled"
        );
        self.monitor.record(Outcome::Cancelled, None);
        None
    }

    async fn execute_new(&self, task: MirrorTask, options: &MirrorOptions) {
        let mut strategy = strategy::select(&task, options, &self.config);
        if strategy == Strategy::Smart {
            strategy = self.resolve_smart(&task, options).await;
        }
        if strategy == Strategy::Batch && !matches!(task.payload, Payload::Batch { .. }) {
            // Windows are only joined at ingest; a late joiner would jump ahead
            // of work already queued for the destination.
            strategy = Strategy::Direct;
        }
        self.deliver(task, strategy, options).await;
    }

    async fn resolve_smart(&self, task: &MirrorTask, options: &MirrorOptions) -> Strategy {
        let size = match task.payload.media() {
            Some(media) => match self.transport.content_size(task.source(), media).await {
                Ok(size) => size.or(media.size),
                Err(error) => {
                    tracing::debug!(%error, task_id = %task.id, "content size lookup failed");
                    media.size
                }
            },
            None => None,
        };
        let resolved = strategy::resolve_smart(task, size, options, &self.config);
        tracing::debug!(
            task_id = %task.id,
            ?size,
            strategy = resolved.as_str(),
            "smart strategy resolved"
        );
        resolved
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            task_id = %task.id,
            source_chat = %task.source_chat_id,
            source_message = %task.source_message_id,
            target_chat = %task.target_chat_id,
            strategy = strategy.as_str(),
            attempt = task.attempt_count,
        )
    )]
    async fn deliver(&self, task: MirrorTask, strategy: Strategy, options: &MirrorOptions) {
        if matches!(task.payload, Payload::Album { .. }) {
            return self.deliver_album(task).await;
        }
        let result = match strategy {
            Strategy::Batch => self.send_batch(&task).await,
            Strategy::Bypass => self.send_bypass(&task, options).await,
            Strategy::Optimized => self.send_optimized(&task, options).await,
            Strategy::Direct | Strategy::Smart => self.send_direct(&task).await,
        };

        match result {
            Ok(delivered) => self.on_delivered(&task, delivered),
            Err(error) => self.on_failure(task, error).await,
        }
    }

    async fn deliver_album(&self, task: MirrorTask) {
        let messages: Vec<MessageId> = task
            .payload
            .parts()
            .unwrap_or_default()
            .iter()
            .map(|part| part.source_message_id)
            .collect();
        match self
            .transport
            .relay_group(task.target_chat_id, task.source_chat_id, &messages)
            .await
        {
            Ok(mirrored) => self.on_album_delivered(&task, &mirrored),
            Err(error) => self.on_failure(task, error).await,
        }
    }

    async fn send_direct(&self, task: &MirrorTask) -> TransportResult<Delivered> {
        let target = task.target_chat_id;
        let message_id = match &task.payload {
            Payload::Text { .. } if !task.relayable => self.send_formatted(task).await?,
            Payload::Text { .. }
            | Payload::Media { .. }
            | Payload::Poll { .. }
            | Payload::Location { .. } => self.transport.relay(target, task.source()).await?,
            Payload::Batch { .. } | Payload::Album { .. } => return self.send_batch(task).await,
            Payload::Empty => {
                return Err(TransportError::Rejected("nothing to deliver".to_string()));
            }
        };
        Ok(Delivered {
            message_id,
            media: task.payload.media().is_some(),
        })
    }

    async fn send_batch(&self, task: &MirrorTask) -> TransportResult<Delivered> {
        let Payload::Batch { parts } = &task.payload else {
            return Err(TransportError::Rejected(format!(
                "{} payload is not a batch",
                task.payload.label()
            )));
        };
        let text = batch::merged_text(parts, &self.config.batch.separator);
        let message_id = self.transport.send_text(task.target_chat_id, &text).await?;
        Ok(Delivered {
            message_id,
            media: false,
        })
    }

    async fn send_bypass(
        &self,
        task: &MirrorTask,
        options: &MirrorOptions,
    ) -> TransportResult<Delivered> {
        let target = task.target_chat_id;
        match &task.payload {
            Payload::Text { .. } => Ok(Delivered {
                message_id: self.send_formatted(task).await?,
                media: false,
            }),
            Payload::Media { media, .. } => {
                let data = match self.transport.fetch(task.source(), media).await {
                    Ok(data) => data,
                    Err(TransportError::ContentUnavailable(reason)) => {
                        return self
                            .send_unavailable_fallback(task, media, reason, options)
                            .await;
                    }
                    Err(error) => return Err(error),
                };
                let upload = MediaUpload {
                    media: media.clone(),
                    caption: task.payload.formatted(),
                    data,
                };
                // The upload owns the only copy of the buffer and is consumed
                // by this call whether it succeeds or fails.
                let message_id = self.transport.send_media(target, upload).await?;
                Ok(Delivered {
                    message_id,
                    media: true,
                })
            }
            Payload::Poll { question } => Ok(Delivered {
                message_id: self
                    .transport
                    .send_text(target, &FormattedText::plain(render_poll(question)))
                    .await?,
                media: false,
            }),
            Payload::Location {
                latitude,
                longitude,
            } => Ok(Delivered {
                message_id: self
                    .transport
                    .send_text(
                        target,
                        &FormattedText::plain(render_location(*latitude, *longitude)),
                    )
                    .await?,
                media: false,
            }),
            Payload::Batch { .. } | Payload::Album { .. } => self.send_batch(task).await,
            Payload::Empty => Err(TransportError::Rejected("nothing to deliver".to_string())),
        }
    }

    async fn send_optimized(
        &self,
        task: &MirrorTask,
        options: &MirrorOptions,
    ) -> TransportResult<Delivered> {
        let Payload::Media { media, .. } = &task.payload else {
            return self.send_direct(task).await;
        };
        let body = match self.transport.fetch_stream(task.source(), media).await {
            Ok(body) => body,
            Err(TransportError::ContentUnavailable(reason)) => {
                return self
                    .send_unavailable_fallback(task, media, reason, options)
                    .await;
            }
            Err(error) => return Err(error),
        };
        let caption = task.payload.formatted();
        let message_id = self
            .transport
            .send_media_stream(task.target_chat_id, media, caption.as_ref(), body)
            .await?;
        Ok(Delivered {
            message_id,
            media: true,
        })
    }

    async fn send_unavailable_fallback(
        &self,
        task: &MirrorTask,
        media: &MediaDescriptor,
        reason: String,
        options: &MirrorOptions,
    ) -> TransportResult<Delivered> {
        if !options.text_fallback {
            return Err(TransportError::ContentUnavailable(reason));
        }
        tracing::warn!(
            task_id = %task.id,
            media_kind = media.kind.as_str(),
            %reason,
            "source media unavailable; sending text fallback"
        );
        let text = match task
            .payload
            .formatted()
            .filter(|caption| !caption.text.trim().is_empty())
        {
            Some(caption) => caption,
            None => FormattedText::plain(format!("[{} unavailable]", media.kind.as_str())),
        };
        let message_id = self.transport.send_text(task.target_chat_id, &text).await?;
        Ok(Delivered {
            message_id,
            media: false,
        })
    }

    async fn send_formatted(&self, task: &MirrorTask) -> TransportResult<MessageId> {
        let text = task.payload.formatted().ok_or_else(|| {
            TransportError::Rejected(format!("{} payload has no text", task.payload.label()))
        })?;
        self.transport.send_text(task.target_chat_id, &text).await
    }

    async fn execute_edit(&self, mut task: MirrorTask, options: &MirrorOptions) {
        let source = task.source();
        let Some(entry) = self.cache.get(&source) else {
            // Edit raced ahead of its NEW (or the entry was evicted).
            tracing::debug!(
                task_id = %task.id,
                source_chat = %source.chat_id,
                source_message = %source.message_id,
                "no cache entry for edit; mirroring as new"
            );
            task.kind = TaskKind::New;
            return self.execute_new(task, options).await;
        };

        if entry.batched {
            tracing::warn!(
                source_chat = %source.chat_id,
                source_message = %source.message_id,
                target_message = %entry.target_message_id,
                "edit of a batched message is unsupported; skipping"
            );
            self.monitor.record(Outcome::Skipped, None);
            return;
        }

        // The mirror's own kind decides the call: media mirrors only carry captions.
        let content = match (&task.payload, task.payload.formatted()) {
            (Payload::Text { .. } | Payload::Media { .. }, caption) if entry.media => {
                EditContent::Caption(caption)
            }
            (Payload::Text { .. } | Payload::Media { .. }, Some(text)) => EditContent::Text(text),
            (other, _) => {
                tracing::debug!(
                    payload = other.label(),
                    media_mirror = entry.media,
                    "edit has nothing to apply to the mirror; skipping"
                );
                self.monitor.record(Outcome::Skipped, None);
                return;
            }
        };

        match self
            .transport
            .edit(entry.target_chat_id, entry.target_message_id, &content)
            .await
        {
            Ok(()) | Err(TransportError::NotModified) => {
                self.governor.record_success(task.target_chat_id);
                self.monitor
                    .record(Outcome::Edited, Some(task.enqueued_at.elapsed()));
                tracing::info!(
                    source_message = %source.message_id,
                    target_message = %entry.target_message_id,
                    "mirrored edit"
                );
            }
            Err(error) => self.on_failure(task, error).await,
        }
    }

    async fn execute_delete(&self, task: MirrorTask) {
        let source = task.source();
        let Some(entry) = self.cache.get(&source) else {
            tracing::debug!(
                source_chat = %source.chat_id,
                source_message = %source.message_id,
                "no cache entry for delete; nothing to do"
            );
            self.monitor.record(Outcome::Skipped, None);
            return;
        };

        if entry.batched {
            self.cache.remove(&source);
            tracing::warn!(
                source_chat = %source.chat_id,
                source_message = %source.message_id,
                target_message = %entry.target_message_id,
                "delete of a batched message is unsupported; dropped cache entry only"
            );
            self.monitor.record(Outcome::Skipped, None);
            return;
        }

        match self
            .transport
            .delete(entry.target_chat_id, entry.target_message_id)
            .await
        {
            Ok(()) => {
                self.cache.remove(&source);
                self.governor.record_success(task.target_chat_id);
                self.monitor
                    .record(Outcome::Deleted, Some(task.enqueued_at.elapsed()));
                tracing::info!(
                    source_message = %source.message_id,
                    target_message = %entry.target_message_id,
                    "mirrored delete"
                );
            }
            Err(error) => self.on_failure(task, error).await,
        }
    }

    fn on_delivered(&self, task: &MirrorTask, delivered: Delivered) {
        let target = task.target_chat_id;
        self.governor.record_success(target);
        let latency = Some(task.enqueued_at.elapsed());

        if let Payload::Batch { parts } = &task.payload {
            for part in parts {
                self.cache_entry(part, delivered.message_id, true, false);
            }
            self.monitor.record(Outcome::BatchSent, None);
            self.monitor.record(
                Outcome::Mirrored {
                    items: parts.len() as u64,
                    media: false,
                },
                latency,
            );
            tracing::info!(
                target_chat = %target,
                items = parts.len(),
                target_message = %delivered.message_id,
                "mirrored batch"
            );
            return;
        }

        self.cache_entry(task, delivered.message_id, false, delivered.media);
        self.monitor.record(
            Outcome::Mirrored {
                items: 1,
                media: delivered.media,
            },
            latency,
        );
        tracing::info!(
            source_message = %task.source_message_id,
            target_message = %delivered.message_id,
            "mirrored message"
        );
    }

    fn on_album_delivered(&self, task: &MirrorTask, mirrored: &[MessageId]) {
        let target = task.target_chat_id;
        self.governor.record_success(target);
        let parts = task.payload.parts().unwrap_or_default();
        if mirrored.len() != parts.len() {
            tracing::warn!(
                target_chat = %target,
                expected = parts.len(),
                returned = mirrored.len(),
                "media group relay returned a different message count; caching matched parts only"
            );
        }
        for (part, message_id) in parts.iter().zip(mirrored) {
            self.cache_entry(part, *message_id, false, true);
        }
        self.monitor.record(
            Outcome::Mirrored {
                items: parts.len() as u64,
                media: true,
            },
            Some(task.enqueued_at.elapsed()),
        );
        tracing::info!(
            target_chat = %target,
            items = parts.len(),
            media_group = task.media_group.as_deref().unwrap_or_default(),
            "mirrored album"
        );
    }

    fn cache_entry(
        &self,
        task: &MirrorTask,
        target_message_id: MessageId,
        batched: bool,
        media: bool,
    ) {
        let evicted = self.cache.insert(
            task.source(),
            CacheEntry {
                target_chat_id: task.target_chat_id,
                target_message_id,
                batched,
                media,
            },
        );
        if !evicted.is_empty() {
            tracing::trace!(evicted = evicted.len(), "message cache evicted oldest entries");
        }
    }

    async fn on_failure(&self, mut task: MirrorTask, error: TransportError) {
        if let TransportError::RateLimited { retry_after } = error {
            let open_at = self
                .governor
                .record_rate_limited(task.target_chat_id, retry_after);
            task.throttled_count = task.throttled_count.saturating_add(1);
            task.not_before = Some(open_at);
            self.monitor.record(Outcome::Throttled, None);
            self.requeue(task);
            return;
        }

        if let TransportError::Forbidden(reason) = &error {
            // The mapping is gone, so retrying any part would only be cancelled.
            self.report_forbidden(&task, reason).await;
            return self.report_terminal(&task, &error);
        }

        if task.payload.parts().is_some() {
            let label = task.payload.label();
            let parts = batch::decompose(task);
            tracing::warn!(
                %error,
                payload = label,
                items = parts.len(),
                "aggregated send failed; falling back to per-item delivery"
            );
            for part in parts {
                self.requeue(part);
            }
            return;
        }

        match error {
            TransportError::Transient(_) => {
                task.attempt_count = task.attempt_count.saturating_add(1);
                if task.attempt_count >= self.config.max_attempts {
                    return self.report_terminal(&task, &error);
                }
                let delay = self.governor.backoff_delay(task.attempt_count);
                tracing::warn!(
                    %error,
                    task_id = %task.id,
                    attempt = task.attempt_count,
                    ?delay,
                    "transient delivery failure; retrying with backoff"
                );
                task.not_before = Some(Instant::now() + delay);
                self.monitor.record(Outcome::Retried, None);
                self.requeue(task);
            }
            _ => self.report_terminal(&task, &error),
        }
    }

    async fn report_forbidden(&self, task: &MirrorTask, reason: &str) {
        tracing::error!(
            source_chat = %task.source_chat_id,
            target_chat = %task.target_chat_id,
            %reason,
            "destination forbids writes; removing mapping"
        );
        if let Err(error) = self
            .settings
            .report_invalid_mapping(task.source_chat_id, task.target_chat_id, reason)
            .await
        {
            tracing::error!(%error, "failed to report invalid mapping");
        }
    }

    fn report_terminal(&self, task: &MirrorTask, error: &TransportError) {
        tracing::error!(
            %error,
            task_id = %task.id,
            source_chat = %task.source_chat_id,
            source_message = %task.source_message_id,
            target_chat = %task.target_chat_id,
            attempts = task.attempt_count,
            items = task.payload.parts().map_or(1, <[MirrorTask]>::len),
            "mirror task failed permanently"
        );
        self.monitor.record_failure(FailureRecord {
            at: Utc::now(),
            source_chat_id: task.source_chat_id,
            source_message_id: task.source_message_id,
            target_chat_id: task.target_chat_id,
            kind: error.label(),
            reason: error.to_string(),
        });
    }

    fn requeue(&self, task: MirrorTask) {
        self.pending.hold(&task);
        let depth = self.queue.enqueue(task);
        self.monitor.observe_queue_depth(depth);
    }
}

pub fn render_poll(question: &str) -> String {
    format!("📊 Poll: {question}\n(Polls cannot be forwarded directly)")
}

pub fn render_location(latitude: f64, longitude: f64) -> String {
    format!("📍 Location: {latitude}, {longitude}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MemorySettings, MemoryTransport};
    use crate::types::{ChatId, MediaKind, MessageRef, Priority, TextEntity};
    use std::time::Duration;

    const SOURCE: i64 = -100;
    const TARGET: i64 = -200;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        transport: Arc<MemoryTransport>,
        settings: Arc<MemorySettings>,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            Self::with_transport(config, MemoryTransport::default())
        }

        fn with_transport(config: EngineConfig, transport: MemoryTransport) -> Self {
            let transport = Arc::new(transport);
            let settings = Arc::new(MemorySettings::with_mapping(SOURCE, TARGET));
            let governor = Arc::new(RateGovernor::new(
                config.global_min_interval(),
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ));
            let queue = Arc::new(TaskQueue::new(
                governor.clone(),
                config.cooldown_skip_threshold(),
            ));
            let monitor = Arc::new(PerformanceMonitor::new(100, 10, 0, Duration::ZERO));
            let aggregator = Arc::new(BatchAggregator::new(
                config.clone(),
                queue.clone(),
                monitor.clone(),
            ));
            let dispatcher = Arc::new(Dispatcher {
                cache: Arc::new(MessageCache::new(config.cache_capacity)),
                config,
                queue,
                governor,
                monitor,
                aggregator,
                pending: Arc::new(PendingSet::new()),
                transport: transport.clone(),
                settings: settings.clone(),
            });
            Self {
                dispatcher,
                transport,
                settings,
            }
        }

        fn enqueue(&self, task: MirrorTask) {
            self.dispatcher.queue.enqueue(task);
        }

        /// Dequeues and processes one ready task; false when none is ready.
        async fn step(&self) -> bool {
            let Some(task) = self.dispatcher.queue.try_dequeue() else {
                return false;
            };
            self.dispatcher.handle(task).await;
            true
        }

        fn counters(&self) -> crate::monitor::StatsCounters {
            self.dispatcher.monitor.counters()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            global_min_interval_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn task(message: i64, kind: TaskKind, payload: Payload) -> MirrorTask {
        MirrorTask::new(
            MessageRef::new(ChatId::new(SOURCE), MessageId::new(message)),
            kind,
            Priority::Normal,
            payload,
            ChatId::new(TARGET),
        )
    }

    fn text(value: &str) -> Payload {
        Payload::plain_text(value)
    }

    fn bold(offset: usize, length: usize) -> TextEntity {
        TextEntity {
            kind: "bold".to_string(),
            offset,
            length,
            extra: serde_json::Map::new(),
        }
    }

    fn photo(caption: Option<&str>) -> Payload {
        Payload::Media {
            media: MediaDescriptor {
                kind: MediaKind::Photo,
                file_id: "photo-file".to_string(),
                file_name: None,
                mime_type: Some("image/jpeg".to_string()),
                size: Some(2048),
                duration: None,
                width: Some(800),
                height: Some(600),
            },
            caption: caption.map(str::to_string),
            entities: Vec::new(),
        }
    }

    fn album_part(message: i64) -> MirrorTask {
        let mut part = task(message, TaskKind::AlbumPart, photo(None));
        part.media_group = Some("album".to_string());
        part
    }

    fn source(message: i64) -> MessageRef {
        MessageRef::new(ChatId::new(SOURCE), MessageId::new(message))
    }

    #[tokio::test(start_paused = true)]
    async fn new_message_relays_and_caches_target_id() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, text("hello")));
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound(),
            vec![Call::Relay {
                target: ChatId::new(TARGET),
                source: source(1),
            }]
        );
        let entry = h.dispatcher.cache.get(&source(1)).expect("cached");
        assert_eq!(entry.target_message_id, MessageId::new(1000));
        assert!(!entry.batched);
        assert_eq!(h.counters().messages_mirrored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_targets_the_message_created_by_new() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, text("hello")));
        h.enqueue(task(1, TaskKind::Edit, text("hello, edited")));
        assert!(h.step().await);
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound()[1],
            Call::Edit {
                target: ChatId::new(TARGET),
                message: MessageId::new(1000),
                content: EditContent::Text(FormattedText::plain("hello, edited")),
            }
        );
        assert_eq!(h.counters().edits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_without_cache_entry_is_mirrored_as_new() {
        let h = Harness::new(config());
        h.enqueue(task(7, TaskKind::Edit, text("late edit")));
        assert!(h.step().await);

        assert!(matches!(h.transport.outbound()[0], Call::Relay { .. }));
        assert!(h.dispatcher.cache.get(&source(7)).is_some());
        assert_eq!(h.counters().messages_mirrored, 1);
        assert_eq!(h.counters().edits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_modified_edit_counts_as_success() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, photo(Some("caption"))));
        assert!(h.step().await);
        h.transport.fail_next(TransportError::NotModified);
        h.enqueue(task(1, TaskKind::Edit, photo(Some("caption"))));
        assert!(h.step().await);

        assert_eq!(h.counters().edits, 1);
        assert_eq!(h.counters().errors, 0);
        assert!(h.dispatcher.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_without_cache_entry_is_a_silent_no_op() {
        let h = Harness::new(config());
        h.enqueue(task(9, TaskKind::Delete, Payload::Empty));
        assert!(h.step().await);

        assert!(h.transport.calls().is_empty());
        assert_eq!(h.counters().errors, 0);
        assert_eq!(h.counters().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_mirrored_message_and_entry() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, text("bye")));
        h.enqueue(task(1, TaskKind::Delete, Payload::Empty));
        assert!(h.step().await);
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound()[1],
            Call::Delete {
                target: ChatId::new(TARGET),
                message: MessageId::new(1000),
            }
        );
        assert!(h.dispatcher.cache.get(&source(1)).is_none());
        assert_eq!(h.counters().deletes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_reschedules_after_retry_after() {
        let h = Harness::new(config());
        h.transport.fail_next(TransportError::RateLimited {
            retry_after: Duration::from_secs(5),
        });
        h.enqueue(task(1, TaskKind::New, text("hello")));
        assert!(h.step().await);

        assert_eq!(h.counters().throttled, 1);
        assert_eq!(h.dispatcher.queue.len(), 1);
        let remaining = h
            .dispatcher
            .governor
            .cooldown_remaining(ChatId::new(TARGET), Instant::now())
            .expect("cooling down");
        assert_eq!(remaining, Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(!h.step().await, "destination is still cooling down");

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(h.step().await);
        assert_eq!(h.transport.outbound().len(), 2);
        assert_eq!(h.counters().messages_mirrored, 1);
        assert_eq!(h.counters().errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_uploads_fetched_media() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, photo(Some("secret"))).protected(true));
        assert!(h.step().await);

        let calls = h.transport.calls();
        assert_eq!(calls[0], Call::Fetch { source: source(1) });
        assert!(matches!(calls[1], Call::SendMedia { bytes, .. } if bytes > 0));
        assert_eq!(h.counters().media_mirrored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_unavailable_without_fallback_records_error() {
        let h = Harness::new(config());
        h.settings.set_options(MirrorOptions {
            text_fallback: false,
            ..MirrorOptions::default()
        });
        h.transport
            .fail_fetch(TransportError::ContentUnavailable("file is gone".to_string()));
        h.enqueue(task(1, TaskKind::New, photo(None)).protected(true));
        assert!(h.step().await);

        assert!(h.transport.outbound().is_empty());
        assert_eq!(h.counters().errors, 1);
        assert!(h.dispatcher.queue.is_empty());
        let stats = h.dispatcher.monitor.snapshot();
        assert_eq!(stats.recent_failures[0].kind, "content_unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_unavailable_falls_back_to_caption() {
        let h = Harness::new(config());
        h.transport
            .fail_fetch(TransportError::ContentUnavailable("file is gone".to_string()));
        h.enqueue(task(1, TaskKind::New, photo(Some("look at this"))).protected(true));
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound(),
            vec![Call::SendText {
                target: ChatId::new(TARGET),
                text: "look at this".to_string(),
            }]
        );
        assert_eq!(h.counters().errors, 0);
        assert_eq!(h.counters().messages_mirrored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn large_media_streams_through_optimized_path() {
        let h = Harness::new(EngineConfig {
            large_media_bytes: 1024,
            ..config()
        });
        h.enqueue(task(1, TaskKind::New, photo(None)));
        assert!(h.step().await);

        let calls = h.transport.calls();
        assert_eq!(calls[0], Call::FetchStream { source: source(1) });
        assert!(matches!(calls[1], Call::SendStream { bytes, .. } if bytes == 11));
    }

    #[tokio::test(start_paused = true)]
    async fn smart_mode_uses_send_time_size() {
        let h = Harness::with_transport(
            EngineConfig {
                large_media_bytes: 1024,
                ..config()
            },
            MemoryTransport::with_size(4096),
        );
        h.settings.set_options(MirrorOptions {
            smart_mode: true,
            ..MirrorOptions::default()
        });
        let mut unknown = task(1, TaskKind::New, photo(None));
        if let Payload::Media { media, .. } = &mut unknown.payload {
            media.size = None;
        }
        h.enqueue(unknown);
        assert!(h.step().await);

        assert!(matches!(h.transport.calls()[0], Call::FetchStream { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_render_as_text_under_bypass() {
        let h = Harness::new(config());
        let poll = Payload::Poll {
            question: "Lunch?".to_string(),
        };
        h.enqueue(task(1, TaskKind::New, poll).protected(true));
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound(),
            vec![Call::SendText {
                target: ChatId::new(TARGET),
                text: render_poll("Lunch?"),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stripped_media_sends_caption_text() {
        let h = Harness::new(config());
        let mut caption_only = task(1, TaskKind::New, text("caption only"));
        caption_only.relayable = false;
        h.enqueue(caption_only);
        assert!(h.step().await);

        assert!(matches!(h.transport.outbound()[0], Call::SendText { .. }));
    }

    fn batch_of(messages: &[i64]) -> MirrorTask {
        let parts = messages
            .iter()
            .map(|m| task(*m, TaskKind::New, text(&format!("item {m}"))))
            .collect();
        batch::build_batch_task(ChatId::new(TARGET), parts).expect("batch")
    }

    #[tokio::test(start_paused = true)]
    async fn batch_send_caches_every_part_as_batched() {
        let h = Harness::new(config());
        h.enqueue(batch_of(&[1, 2, 3]));
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound(),
            vec![Call::SendText {
                target: ChatId::new(TARGET),
                text: "item 1\n\nitem 2\n\nitem 3".to_string(),
            }]
        );
        for m in [1, 2, 3] {
            let entry = h.dispatcher.cache.get(&source(m)).expect("cached");
            assert!(entry.batched);
            assert_eq!(entry.target_message_id, MessageId::new(1000));
        }
        assert_eq!(h.counters().batches_sent, 1);
        assert_eq!(h.counters().messages_mirrored, 3);

        h.enqueue(task(2, TaskKind::Edit, text("changed")));
        assert!(h.step().await);
        assert_eq!(h.transport.outbound().len(), 1, "batched edit is skipped");
        assert_eq!(h.counters().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_decomposed_into_parts() {
        let h = Harness::new(config());
        h.transport
            .fail_next(TransportError::Transient("bad gateway".to_string()));
        h.enqueue(batch_of(&[1, 2, 3]));
        assert!(h.step().await);

        assert_eq!(h.dispatcher.queue.len(), 3);
        assert_eq!(h.counters().errors, 0);

        for _ in 0..3 {
            assert!(h.step().await);
        }
        let relayed: Vec<MessageRef> = h
            .transport
            .outbound()
            .into_iter()
            .filter_map(|call| match call {
                Call::Relay { source, .. } => Some(source),
                _ => None,
            })
            .collect();
        assert_eq!(relayed, vec![source(1), source(2), source(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_attempts_run_out() {
        let h = Harness::new(EngineConfig {
            max_attempts: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..config()
        });
        h.transport
            .fail_next(TransportError::Transient("timeout".to_string()));
        h.transport
            .fail_next(TransportError::Transient("timeout".to_string()));
        h.enqueue(task(1, TaskKind::New, text("hello")));

        assert!(h.step().await);
        assert_eq!(h.counters().retries, 1);
        assert_eq!(h.dispatcher.queue.len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.step().await);
        assert_eq!(h.counters().errors, 1);
        assert!(h.dispatcher.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_not_retried() {
        let h = Harness::new(config());
        h.transport
            .fail_next(TransportError::Rejected("bad request".to_string()));
        h.enqueue(task(1, TaskKind::New, text("hello")));
        assert!(h.step().await);

        assert_eq!(h.counters().errors, 1);
        assert_eq!(h.counters().retries, 0);
        assert!(h.dispatcher.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_reports_invalid_mapping() {
        let h = Harness::new(config());
        h.transport
            .fail_next(TransportError::Forbidden("bot was kicked".to_string()));
        h.enqueue(task(1, TaskKind::New, text("hello")));
        h.enqueue(task(2, TaskKind::New, text("world")));
        assert!(h.step().await);

        let reports = h.settings.invalid_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, ChatId::new(TARGET));
        assert_eq!(h.counters().errors, 1);

        // The queued follow-up is cancelled now that the mapping is gone.
        assert!(h.step().await);
        assert_eq!(h.counters().cancelled, 1);
        assert_eq!(h.transport.outbound().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remapped_source_cancels_queued_task() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, text("hello")));
        h.settings.map(SOURCE, -300);
        assert!(h.step().await);

        assert!(h.transport.calls().is_empty());
        assert_eq!(h.counters().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_pacing_reschedules_instead_of_sleeping() {
        let h = Harness::new(EngineConfig {
            global_min_interval_ms: 50,
            ..config()
        });
        let other = MirrorTask::new(
            MessageRef::new(ChatId::new(-101), MessageId::new(1)),
            TaskKind::New,
            Priority::Normal,
            text("other"),
            ChatId::new(-201),
        );
        h.settings.map(-101, -201);
        h.enqueue(task(1, TaskKind::New, text("first")));
        h.enqueue(other);

        assert!(h.step().await);
        assert!(h.step().await);
        assert_eq!(h.transport.outbound().len(), 1);
        assert_eq!(h.dispatcher.queue.len(), 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(h.step().await);
        assert_eq!(h.transport.outbound().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn album_relays_as_one_group_and_caches_each_part() {
        let h = Harness::new(config());
        let album =
            batch::build_album_task(ChatId::new(TARGET), vec![album_part(6), album_part(5)])
                .expect("album");
        h.enqueue(album);
        assert!(h.step().await);

        assert_eq!(
            h.transport.outbound(),
            vec![Call::RelayGroup {
                target: ChatId::new(TARGET),
                sources: vec![source(5), source(6)],
            }]
        );
        for (message, mirrored) in [(5, 1000), (6, 1001)] {
            let entry = h.dispatcher.cache.get(&source(message)).expect("cached");
            assert_eq!(entry.target_message_id, MessageId::new(mirrored));
            assert!(entry.media);
            assert!(!entry.batched);
        }
        assert_eq!(h.counters().messages_mirrored, 2);
        assert_eq!(h.counters().media_mirrored, 2);
        assert!(h.dispatcher.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_album_relays_parts_one_by_one() {
        let h = Harness::new(config());
        h.transport
            .fail_next(TransportError::Transient("bad gateway".to_string()));
        let album = batch::build_album_task(ChatId::new(TARGET), vec![album_part(1), album_part(2)])
            .expect("album");
        h.enqueue(album);
        assert!(h.step().await);
        assert_eq!(h.dispatcher.queue.len(), 2);

        assert!(h.step().await);
        assert!(h.step().await);
        let outbound = h.transport.outbound();
        assert_eq!(
            outbound[1..],
            [
                Call::Relay {
                    target: ChatId::new(TARGET),
                    source: source(1),
                },
                Call::Relay {
                    target: ChatId::new(TARGET),
                    source: source(2),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn edit_of_media_mirror_changes_its_caption() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, photo(Some("before"))));
        assert!(h.step().await);
        assert!(h.dispatcher.cache.get(&source(1)).expect("cached").media);

        h.enqueue(task(1, TaskKind::Edit, photo(Some("after"))));
        h.enqueue(task(1, TaskKind::Edit, text("caption moved to text")));
        h.enqueue(task(1, TaskKind::Edit, photo(None)));
        for _ in 0..3 {
            assert!(h.step().await);
        }

        let contents: Vec<EditContent> = h
            .transport
            .outbound()
            .into_iter()
            .filter_map(|call| match call {
                Call::Edit { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(
            contents,
            vec![
                EditContent::Caption(Some(FormattedText {
                    link_preview: false,
                    ..FormattedText::plain("after")
                })),
                EditContent::Caption(Some(FormattedText::plain("caption moved to text"))),
                EditContent::Caption(None),
            ]
        );
        assert_eq!(h.counters().edits, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_removing_text_of_text_mirror_is_skipped() {
        let h = Harness::new(config());
        h.enqueue(task(1, TaskKind::New, text("hello")));
        assert!(h.step().await);
        h.enqueue(task(1, TaskKind::Edit, photo(None)));
        assert!(h.step().await);

        assert_eq!(h.transport.outbound().len(), 1);
        assert_eq!(h.counters().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_batch_is_one_terminal_failure() {
        let h = Harness::new(config());
        h.transport
            .fail_next(TransportError::Forbidden("bot was kicked".to_string()));
        h.enqueue(batch_of(&[1, 2, 3]));
        assert!(h.step().await);

        assert!(h.dispatcher.queue.is_empty(), "parts are not retried");
        assert_eq!(h.settings.invalid_reports().len(), 1);
        let stats = h.dispatcher.monitor.snapshot();
        assert_eq!(stats.counters.errors, 1);
        assert_eq!(stats.recent_failures[0].kind, "forbidden");
        assert_eq!(stats.recent_failures[0].source_message_id, MessageId::new(1));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_keeps_part_formatting() {
        let h = Harness::new(config());
        let parts = vec![
            task(
                1,
                TaskKind::New,
                Payload::Text {
                    text: "héllo".to_string(),
                    entities: vec![bold(0, 5)],
                    link_preview: true,
                },
            ),
            task(
                2,
                TaskKind::New,
                Payload::Text {
                    text: "🙂 world".to_string(),
                    entities: vec![bold(3, 5)],
                    link_preview: false,
                },
            ),
        ];
        h.enqueue(batch::build_batch_task(ChatId::new(TARGET), parts).expect("batch"));
        assert!(h.step().await);

        // "héllo\n\n" is 7 UTF-16 units.
        assert_eq!(h.transport.sent_entities(), vec![vec![bold(0, 5), bold(10, 5)]]);
    }

    #[tokio::test(start_paused = true)]
    async fn batchable_task_reaching_a_worker_is_sent_directly() {
        let h = Harness::new(config());
        h.settings.set_options(MirrorOptions {
            batching_enabled: true,
            ..MirrorOptions::default()
        });
        h.enqueue(task(1, TaskKind::New, text("short")));
        assert!(h.step().await);

        assert!(matches!(h.transport.outbound()[0], Call::Relay { .. }));
        assert_eq!(h.dispatcher.aggregator.open_windows(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_task_keeps_its_pending_key() {
        let h = Harness::new(config());
        let first = task(1, TaskKind::New, text("hello"));
        assert!(h.dispatcher.pending.claim(&first));
        h.transport
            .fail_next(TransportError::Transient("timeout".to_string()));
        h.enqueue(first);
        assert!(h.step().await);
        assert!(!h.dispatcher.pending.claim(&task(1, TaskKind::New, text("again"))));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(h.step().await);
        assert!(h.dispatcher.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_queue_and_stop_on_shutdown() {
        let h = Harness::new(EngineConfig {
            workers: 2,
            ..config()
        });
        let shutdown = CancellationToken::new();
        let handles = h.dispatcher.spawn_workers(&shutdown);
        for m in 1..=4 {
            h.enqueue(task(m, TaskKind::New, text("x")));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.counters().messages_mirrored, 4);

        shutdown.cancel();
        for handle in handles {
            handle.await.expect("worker joins");
        }
    }
}
