//! Source messages with mirror work outstanding.
//!
//! A key is claimed when an event is accepted and released once the dispatcher
//! settles the task. Requeues hold the key again before the worker releases
//! it, so a retried task never looks finished.

use crate::types::{MessageRef, MirrorTask, TaskKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

pub type PendingKey = (MessageRef, TaskKind);

#[derive(Debug, Default)]
pub struct PendingSet {
    holds: DashMap<PendingKey, usize>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the key for a freshly ingested task. False when the same
    /// operation on the same source message is already outstanding.
    pub fn claim(&self, task: &MirrorTask) -> bool {
        let Some(key) = tracked_key(task) else {
            return true;
        };
        match self.holds.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(1);
                true
            }
        }
    }

    /// Adds a hold for every key the task carries.
    pub fn hold(&self, task: &MirrorTask) {
        for key in keys_of(task) {
            *self.holds.entry(key).or_insert(0) += 1;
        }
    }

    /// Drops one hold per key; keys without holds are forgotten.
    pub fn release(&self, keys: &[PendingKey]) {
        for key in keys {
            if let Entry::Occupied(mut held) = self.holds.entry(*key) {
                let remaining = held.get().saturating_sub(1);
                if remaining == 0 {
                    held.remove();
                } else {
                    *held.get_mut() = remaining;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.holds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holds.is_empty()
    }
}

/// Keys a task accounts for: one per part of an aggregated payload.
pub fn keys_of(task: &MirrorTask) -> Vec<PendingKey> {
    match task.payload.parts() {
        Some(parts) => parts.iter().filter_map(tracked_key).collect(),
        None => tracked_key(task).into_iter().collect(),
    }
}

/// Edits are not deduplicated: two quick edits of one message are both real.
fn tracked_key(task: &MirrorTask) -> Option<PendingKey> {
    match task.kind {
        TaskKind::New | TaskKind::AlbumPart | TaskKind::Delete => Some((task.source(), task.kind)),
        TaskKind::Edit => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch;
    use crate::types::{ChatId, MessageId, Payload, Priority};

    fn task(message: i64, kind: TaskKind) -> MirrorTask {
        MirrorTask::new(
            MessageRef::new(ChatId::new(-1), MessageId::new(message)),
            kind,
            Priority::Normal,
            Payload::plain_text("x"),
            ChatId::new(-2),
        )
    }

    #[test]
    fn second_claim_for_same_operation_is_refused() {
        let pending = PendingSet::new();
        assert!(pending.claim(&task(1, TaskKind::New)));
        assert!(!pending.claim(&task(1, TaskKind::New)));
        assert!(pending.claim(&task(1, TaskKind::Delete)));
        assert!(pending.claim(&task(1, TaskKind::Edit)));
        assert!(pending.claim(&task(1, TaskKind::Edit)));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn requeue_hold_outlives_the_worker_release() {
        let pending = PendingSet::new();
        let first = task(1, TaskKind::New);
        pending.claim(&first);
        let keys = keys_of(&first);

        pending.hold(&first);
        pending.release(&keys);
        assert!(!pending.claim(&task(1, TaskKind::New)), "still retrying");

        pending.release(&keys);
        assert!(pending.is_empty());
        assert!(pending.claim(&task(1, TaskKind::New)));
    }

    #[test]
    fn aggregated_payload_releases_every_part() {
        let pending = PendingSet::new();
        let parts: Vec<MirrorTask> = (1..=3).map(|m| task(m, TaskKind::New)).collect();
        for part in &parts {
            pending.claim(part);
        }
        let merged = batch::build_batch_task(ChatId::new(-2), parts).expect("batch");
        pending.release(&keys_of(&merged));
        assert!(pending.is_empty());
    }
}
