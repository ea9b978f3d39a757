// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded cache of recently seen event ids.
//!
//! The broker publishes every local send to the cloud relay; the relay echoes
//! it back on the websocket with the same event id. Preseeding the cache at
//! local-send time means the echo is recognized and dropped instead of being
//! injected a second time.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default maximum number of cached event ids.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default time-to-live for a cached event id.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    inserted_at: Instant,
    recency: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Recency index → event id, for O(log n) LRU eviction.
    by_recency: BTreeMap<u64, String>,
    next_recency: u64,
}

/// Size-bounded, TTL-evicting set of event ids. Thread-safe; all operations
/// are short critical sections under a single mutex.
pub struct DedupCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_recency: BTreeMap::new(),
                next_recency: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// True when `event_id` was inserted within the TTL. Refreshes the
    /// entry's LRU position on hit.
    pub fn contains(&self, event_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let Some(entry) = inner.entries.get(event_id) else {
            return false;
        };

        if now.duration_since(entry.inserted_at) > self.ttl {
            let recency = entry.recency;
            inner.entries.remove(event_id);
            inner.by_recency.remove(&recency);
            return false;
        }

        // Touch: move to the most-recent position.
        let old = inner.entries.get(event_id).map(|e| e.recency);
        if let Some(old) = old {
            inner.by_recency.remove(&old);
            let fresh = inner.next_recency;
            inner.next_recency += 1;
            inner.by_recency.insert(fresh, event_id.to_owned());
            if let Some(entry) = inner.entries.get_mut(event_id) {
                entry.recency = fresh;
            }
        }
        true
    }

    /// Record `event_id` as seen, evicting expired then least-recently-used
    /// entries as needed.
    pub fn insert(&self, event_id: &str) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        // Drop the old position if re-inserting.
        if let Some(prev) = inner.entries.remove(event_id) {
            inner.by_recency.remove(&prev.recency);
        }

        // TTL sweep from the LRU end; expired entries cluster there in
        // steady state.
        while let Some((&recency, id)) = inner.by_recency.iter().next() {
            let expired = inner
                .entries
                .get(id)
                .map(|e| now.duration_since(e.inserted_at) > self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let id = id.clone();
            inner.by_recency.remove(&recency);
            inner.entries.remove(&id);
        }

        // Size bound.
        while inner.entries.len() >= self.capacity {
            let Some((&recency, id)) = inner.by_recency.iter().next() else {
                break;
            };
            let id = id.clone();
            inner.by_recency.remove(&recency);
            inner.entries.remove(&id);
        }

        let recency = inner.next_recency;
        inner.next_recency += 1;
        inner.entries.insert(event_id.to_owned(), Entry { inserted_at: now, recency });
        inner.by_recency.insert(recency, event_id.to_owned());
    }

    /// Identical to [`insert`](Self::insert); named for the local-send call
    /// site where the id is recorded *before* the cloud publish to close the
    /// echo race.
    pub fn preseed(&self, event_id: &str) {
        self.insert(event_id);
    }

    /// Number of live entries (expired entries may linger until touched).
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;
