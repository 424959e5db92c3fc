//! Rolling delivery statistics and the advisory degradation signal.

use crate::types::{ChatId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `items` source messages landed; `media` when any carried media.
    Mirrored { items: u64, media: bool },
    Edited,
    Deleted,
    /// Benign no-op (missing cache entry, unsupported post-batch edit).
    Skipped,
    Throttled,
    Retried,
    Cancelled,
    BatchSent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsCounters {
    #[serde(default)]
    pub messages_mirrored: u64,
    #[serde(default)]
    pub media_mirrored: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub edits: u64,
    #[serde(default)]
    pub deletes: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub throttled: u64,
    #[serde(default)]
    pub retries: u64,
    #[serde(default)]
    pub cancelled: u64,
    #[serde(default)]
    pub batches_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub source_chat_id: ChatId,
    pub source_message_id: MessageId,
    pub target_chat_id: ChatId,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Degradation {
    pub queue_depth_exceeded: bool,
    pub latency_exceeded: bool,
}

impl Degradation {
    pub fn is_degraded(&self) -> bool {
        self.queue_depth_exceeded || self.latency_exceeded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    #[serde(flatten)]
    pub counters: StatsCounters,
    pub average_latency_ms: f64,
    pub latency_samples: usize,
    pub throughput_per_minute: u64,
    pub queue_depth: usize,
    pub degradation: Degradation,
    pub recent_failures: Vec<FailureRecord>,
}

#[derive(Debug, Default)]
struct Counters {
    messages_mirrored: AtomicU64,
    media_mirrored: AtomicU64,
    errors: AtomicU64,
    edits: AtomicU64,
    deletes: AtomicU64,
    skipped: AtomicU64,
    throttled: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
    batches_sent: AtomicU64,
}

#[derive(Debug, Default)]
struct Samples {
    latencies: VecDeque<(Instant, Duration)>,
    latency_sum: Duration,
    /// Completed source messages per whole second since `origin`.
    completions: VecDeque<(u64, u64)>,
    failures: VecDeque<FailureRecord>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    counters: Counters,
    samples: Mutex<Samples>,
    queue_depth: AtomicUsize,
    latency_window: usize,
    failure_window: usize,
    queue_depth_watermark: usize,
    latency_watermark: Duration,
    degradation: watch::Sender<Degradation>,
    origin: Instant,
}

impl PerformanceMonitor {
    pub fn new(
        latency_window: usize,
        failure_window: usize,
        queue_depth_watermark: usize,
        latency_watermark: Duration,
    ) -> Self {
        let (degradation, _) = watch::channel(Degradation::default());
        Self {
            counters: Counters::default(),
            samples: Mutex::new(Samples::default()),
            queue_depth: AtomicUsize::new(0),
            latency_window: latency_window.max(1),
            failure_window: failure_window.max(1),
            queue_depth_watermark,
            latency_watermark,
            degradation,
            origin: Instant::now(),
        }
    }

    pub fn record(&self, outcome: Outcome, latency: Option<Duration>) {
        let c = &self.counters;
        match outcome {
            Outcome::Mirrored { items, media } => {
                c.messages_mirrored.fetch_add(items, Ordering::Relaxed);
                if media {
                    c.media_mirrored.fetch_add(items, Ordering::Relaxed);
                }
            }
            Outcome::Edited => {
                c.edits.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Deleted => {
                c.deletes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Skipped => {
                c.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Throttled => {
                c.throttled.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Retried => {
                c.retries.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Cancelled => {
                c.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::BatchSent => {
                c.batches_sent.fetch_add(1, Ordering::Relaxed);
            }
        }

        let completed = match outcome {
            Outcome::Mirrored { items, .. } => items,
            Outcome::Edited | Outcome::Deleted => 1,
            _ => 0,
        };
        if completed > 0 {
            let second = self.second_of(Instant::now());
            let mut samples = self.lock();
            match samples.completions.back_mut() {
                Some((at, count)) if *at == second => *count += completed,
                _ => samples.completions.push_back((second, completed)),
            }
            prune_completions(&mut samples.completions, second);
        }

        let Some(latency) = latency else {
            return;
        };
        let average = {
            let mut samples = self.lock();
            samples.latencies.push_back((Instant::now(), latency));
            samples.latency_sum += latency;
            while samples.latencies.len() > self.latency_window {
                if let Some((_, old)) = samples.latencies.pop_front() {
                    samples.latency_sum = samples.latency_sum.saturating_sub(old);
                }
            }
            average_of(&samples)
        };
        let exceeded = !self.latency_watermark.is_zero() && average > self.latency_watermark;
        self.update_degradation(|d| d.latency_exceeded = exceeded);
    }

    /// Terminal failure: counted in `errors` and kept for operator inspection.
    pub fn record_failure(&self, failure: FailureRecord) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.lock();
        samples.failures.push_back(failure);
        while samples.failures.len() > self.failure_window {
            samples.failures.pop_front();
        }
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        let exceeded = self.queue_depth_watermark > 0 && depth >= self.queue_depth_watermark;
        self.update_degradation(|d| d.queue_depth_exceeded = exceeded);
    }

    pub fn subscribe(&self) -> watch::Receiver<Degradation> {
        self.degradation.subscribe()
    }

    pub fn degradation(&self) -> Degradation {
        *self.degradation.borrow()
    }

    pub fn counters(&self) -> StatsCounters {
        let c = &self.counters;
        StatsCounters {
            messages_mirrored: c.messages_mirrored.load(Ordering::Relaxed),
            media_mirrored: c.media_mirrored.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            edits: c.edits.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            batches_sent: c.batches_sent.load(Ordering::Relaxed),
        }
    }

    /// Seeds counters from a persisted snapshot.
    pub fn restore(&self, counters: &StatsCounters) {
        let c = &self.counters;
        c.messages_mirrored
            .store(counters.messages_mirrored, Ordering::Relaxed);
        c.media_mirrored
            .store(counters.media_mirrored, Ordering::Relaxed);
        c.errors.store(counters.errors, Ordering::Relaxed);
        c.edits.store(counters.edits, Ordering::Relaxed);
        c.deletes.store(counters.deletes, Ordering::Relaxed);
        c.skipped.store(counters.skipped, Ordering::Relaxed);
        c.throttled.store(counters.throttled, Ordering::Relaxed);
        c.retries.store(counters.retries, Ordering::Relaxed);
        c.cancelled.store(counters.cancelled, Ordering::Relaxed);
        c.batches_sent.store(counters.batches_sent, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        let now = self.second_of(Instant::now());
        let mut samples = self.lock();
        prune_completions(&mut samples.completions, now);
        let throughput_per_minute = samples.completions.iter().map(|(_, count)| count).sum();
        Stats {
            counters: self.counters(),
            average_latency_ms: average_of(&samples).as_secs_f64() * 1000.0,
            latency_samples: samples.latencies.len(),
            throughput_per_minute,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            degradation: self.degradation(),
            recent_failures: samples.failures.iter().rev().cloned().collect(),
        }
    }

    fn update_degradation(&self, apply: impl FnOnce(&mut Degradation)) {
        self.degradation.send_if_modified(|current| {
            let before = *current;
            apply(current);
            if *current == before {
                return false;
            }
            if current.is_degraded() {
                tracing::warn!(
                    queue_depth_exceeded = current.queue_depth_exceeded,
                    latency_exceeded = current.latency_exceeded,
                    queue_depth = self.queue_depth.load(Ordering::Relaxed),
                    "mirror engine degraded"
                );
            } else if before.is_degraded() {
                tracing::info!("mirror engine recovered from degradation");
            }
            true
        });
    }

    fn second_of(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_secs()
    }

    fn lock(&self) -> MutexGuard<'_, Samples> {
        self.samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn prune_completions(completions: &mut VecDeque<(u64, u64)>, now: u64) {
    let window = THROUGHPUT_WINDOW.as_secs();
    while completions
        .front()
        .is_some_and(|(at, _)| now.saturating_sub(*at) >= window)
    {
        completions.pop_front();
    }
}

fn average_of(samples: &Samples) -> Duration {
    match samples.latencies.len() {
        0 => Duration::ZERO,
        n => samples.latency_sum / n as u32,
    }
}
