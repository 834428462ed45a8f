//! Map whose entries disappear after a per-entry TTL.
//!
//! Deadlines are queued in insertion order next to the map. Eviction pops the
//! queue head while it is due, so each insert is popped at most once and the
//! cost is amortized O(1) per operation. Overwriting a key leaves its old
//! deadline in the queue; a generation number makes that stale entry a no-op.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    deadline: Instant,
    generation: u64,
}

#[derive(Debug)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    queue: VecDeque<(Instant, K, u64)>,
    next_generation: u64,
}

impl<K: Eq + Hash + Clone, V> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            next_generation: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` for `ttl`. With mixed TTLs an entry is freed no earlier
    /// than the ones queued before it, but never returned past its deadline.
    pub fn insert(&mut self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        self.evict(now);

        let deadline = now + ttl;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.queue.push_back((deadline, key.clone(), generation));
        self.entries.insert(
            key,
            Entry {
                value,
                deadline,
                generation,
            },
        );
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Instant::now();
        self.evict(now);
        self.entries
            .get(key)
            .filter(|entry| entry.deadline > now)
            .map(|entry| &entry.value)
    }

    /// Time left before `key` expires.
    pub fn remaining(&mut self, key: &K) -> Option<Duration> {
        let now = Instant::now();
        self.evict(now);
        self.entries
            .get(key)
            .filter(|entry| entry.deadline > now)
            .map(|entry| entry.deadline - now)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Live entries (expired ones are evicted first).
    pub fn len(&mut self) -> usize {
        self.evict(Instant::now());
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn evict(&mut self, now: Instant) {
        while let Some((deadline, _, _)) = self.queue.front() {
            if *deadline > now {
                break;
            }
            let Some((_, key, generation)) = self.queue.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                self.entries.remove(&key);
            }
        }
    }
}
