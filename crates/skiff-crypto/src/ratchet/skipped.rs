//! Bounded cache of skipped message keys.
//!
//! Keys are indexed by `(epoch, counter)` and remembered in derivation order.
//! Two bounds apply, both enforced on every insert:
//!
//! - Count: at most `max_entries` keys; the oldest is evicted first.
//! - Distance: a key derived more than `max_distance` derivations before the
//!   receive frontier is evicted.
//!
//! An evicted message is unrecoverable and fails with `KeyExpired`.

use std::collections::{HashMap, VecDeque};

use super::chain::MessageKey;

#[derive(Debug)]
pub(crate) struct SkippedKeys {
    keys: HashMap<(u32, u32), MessageKey>,
    /// Insertion order with the derivation ordinal of each key. Entries whose
    /// key was already taken are skipped lazily.
    order: VecDeque<((u32, u32), u64)>,
    max_entries: usize,
    max_distance: u64,
}

impl SkippedKeys {
    pub(crate) fn new(max_entries: usize, max_distance: u64) -> Self {
        Self { keys: HashMap::new(), order: VecDeque::new(), max_entries, max_distance }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn get(&self, epoch: u32, counter: u32) -> Option<&MessageKey> {
        self.keys.get(&(epoch, counter))
    }

    pub(crate) fn take(&mut self, epoch: u32, counter: u32) -> Option<MessageKey> {
        self.keys.remove(&(epoch, counter))
    }

    /// Store a key derived at `ordinal`, then enforce both bounds against
    /// `frontier`.
    pub(crate) fn insert(&mut self, key: MessageKey, ordinal: u64, frontier: u64) {
        let id = (key.epoch(), key.counter());
        self.keys.insert(id, key);
        self.order.push_back((id, ordinal));
        self.evict(frontier);
    }

    pub(crate) fn evict(&mut self, frontier: u64) {
        while let Some(&(id, ordinal)) = self.order.front() {
            let too_far = frontier.saturating_sub(ordinal) > self.max_distance;
            let too_many = self.keys.len() > self.max_entries;
            let stale = !self.keys.contains_key(&id);
            if !(too_far || too_many || stale) {
                break;
            }
            self.order.pop_front();
            self.keys.remove(&id);
        }
    }
}
