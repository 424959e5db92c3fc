//! Bounded source→target message id map used to address edits and deletes.
//!
//! Eviction is strictly by insertion order. Reads never refresh an entry.

use crate::types::{ChatId, MessageId, MessageRef};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub target_chat_id: ChatId,
    pub target_message_id: MessageId,
    /// Set when several source messages were merged into this target message.
    #[serde(default)]
    pub batched: bool,
    /// The mirror is a media message, so edits go through its caption.
    #[serde(default)]
    pub media: bool,
}

/// Persisted form of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    #[serde(flatten)]
    pub entry: CacheEntry,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<MessageRef, Slot>,
    /// Insertion log. Stale generations (overwritten or removed keys) are
    /// skipped on eviction and compacted once the log doubles the capacity.
    order: VecDeque<(MessageRef, u64)>,
    next_generation: u64,
}

#[derive(Debug)]
pub struct MessageCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts or replaces the entry for `source`. A replaced key counts as a
    /// fresh insertion. Returns the keys evicted to stay within capacity.
    pub fn insert(&self, source: MessageRef, entry: CacheEntry) -> Vec<MessageRef> {
        let mut inner = self.lock();
        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        inner.entries.insert(source, Slot { entry, generation });
        inner.order.push_back((source, generation));

        let mut evicted = Vec::new();
        while inner.entries.len() > self.capacity {
            let Some((key, generation)) = inner.order.pop_front() else {
                break;
            };
            let live = inner
                .entries
                .get(&key)
                .is_some_and(|slot| slot.generation == generation);
            if live {
                inner.entries.remove(&key);
                evicted.push(key);
            }
        }

        if inner.order.len() > self.capacity.saturating_mul(2) {
            compact(&mut inner);
        }
        evicted
    }

    pub fn get(&self, source: &MessageRef) -> Option<CacheEntry> {
        self.lock().entries.get(source).map(|slot| slot.entry)
    }

    pub fn remove(&self, source: &MessageRef) -> Option<CacheEntry> {
        self.lock().entries.remove(source).map(|slot| slot.entry)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries, oldest insertion first.
    pub fn records(&self) -> Vec<CacheRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|(key, generation)| {
                let slot = inner.entries.get(key)?;
                (slot.generation == *generation).then(|| CacheRecord {
                    key: key.cache_key(),
                    entry: slot.entry,
                })
            })
            .collect()
    }

    /// Replays persisted records in their stored order. Unparseable keys are
    /// skipped.
    pub fn restore(&self, records: &[CacheRecord]) -> usize {
        let mut restored = 0;
        for record in records {
            let Some(source) = MessageRef::parse_cache_key(&record.key) else {
                tracing::warn!(key = %record.key, "skipping malformed cache record");
                continue;
            };
            self.insert(source, record.entry);
            restored += 1;
        }
        restored
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single insert/remove.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn compact(inner: &mut Inner) {
    let entries = &inner.entries;
    inner.order.retain(|(key, generation)| {
        entries
            .get(key)
            .is_some_and(|slot| slot.generation == *generation)
    });
}
