//! Stable priority queue of pending mirror tasks.
//!
//! Order is (priority desc, enqueued_at asc, arrival seq asc). `dequeue` passes
//! over destinations that are cooling down, waiting out a reschedule, or
//! already have a task in flight, so one stalled chat never blocks the rest.

use crate::governor::RateGovernor;
use crate::types::{ChatId, MirrorTask, Priority};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    enqueued_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    pending: BTreeMap<QueueKey, MirrorTask>,
    in_flight: HashSet<ChatId>,
    next_seq: u64,
}

enum Pick {
    Ready(MirrorTask),
    /// Nothing dispatchable now; wake at the given instant (if any) or on
    /// the next enqueue/release.
    Wait(Option<Instant>),
}

#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    governor: Arc<RateGovernor>,
    skip_threshold: Duration,
}

impl TaskQueue {
    pub fn new(governor: Arc<RateGovernor>, skip_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            governor,
            skip_threshold,
        }
    }

    /// Inserts a task. The queue never drops tasks; returns the new depth.
    pub fn enqueue(&self, task: MirrorTask) -> usize {
        let depth = {
            let mut inner = self.lock();
            let key = QueueKey {
                priority: Reverse(task.priority),
                enqueued_at: task.enqueued_at,
                seq: inner.next_seq,
            };
            inner.next_seq = inner.next_seq.wrapping_add(1);
            inner.pending.insert(key, task);
            inner.pending.len()
        };
        self.notify.notify_waiters();
        depth
    }

    /// Waits until a dispatchable task exists and returns it. The returned
    /// task's destination stays marked in flight until [`TaskQueue::release`].
    pub async fn dequeue(&self) -> MirrorTask {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.pick(Instant::now()) {
                Pick::Ready(task) => return task,
                Pick::Wait(wake_at) => wake_at,
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`TaskQueue::dequeue`].
    pub fn try_dequeue(&self) -> Option<MirrorTask> {
        match self.pick(Instant::now()) {
            Pick::Ready(task) => Some(task),
            Pick::Wait(_) => None,
        }
    }

    /// Marks the destination free for the next task.
    pub fn release(&self, chat_id: ChatId) {
        self.lock().in_flight.remove(&chat_id);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn pick(&self, now: Instant) -> Pick {
        let mut inner = self.lock();
        let mut cooled: HashSet<ChatId> = HashSet::new();
        let mut waiting: HashSet<(ChatId, Priority)> = HashSet::new();
        let mut wake_at: Option<Instant> = None;
        let mut chosen = None;

        for (key, task) in &inner.pending {
            let chat = task.target_chat_id;
            if inner.in_flight.contains(&chat) || cooled.contains(&chat) {
                continue;
            }
            // A rescheduled task holds back later tasks of the same chat and
            // tier so per-destination order survives retries.
            if waiting.contains(&(chat, task.priority)) {
                continue;
            }
            if let Some(not_before) = task.not_before.filter(|at| *at > now) {
                waiting.insert((chat, task.priority));
                wake_at = Some(wake_at.map_or(not_before, |w| w.min(not_before)));
                continue;
            }
            if let Some(remaining) = self.governor.cooldown_remaining(chat, now) {
                if remaining > self.skip_threshold {
                    cooled.insert(chat);
                    let open_at = now + remaining;
                    wake_at = Some(wake_at.map_or(open_at, |w| w.min(open_at)));
                    continue;
                }
            }
            chosen = Some(*key);
            break;
        }

        let Some(key) = chosen else {
            return Pick::Wait(wake_at);
        };
        match inner.pending.remove(&key) {
            Some(task) => {
                inner.in_flight.insert(task.target_chat_id);
                Pick::Ready(task)
            }
            None => Pick::Wait(wake_at),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
