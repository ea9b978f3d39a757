// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-worker delivery counters surfaced by `get_metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifetime counters for one worker. All fields are monotonic except
/// `current_delay_ms` and `consecutive_successes`, which mirror the
/// throttle's live state.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub queued: AtomicU64,
    pub injected: AtomicU64,
    pub verified: AtomicU64,
    pub active: AtomicU64,
    pub failed: AtomicU64,
    pub current_delay_ms: AtomicU64,
    pub consecutive_successes: AtomicU64,
    pub output_bytes: AtomicU64,
    pub last_activity_ms: AtomicU64,
}

/// Serializable snapshot of one worker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub worker: String,
    pub queued: u64,
    pub injected: u64,
    pub verified: u64,
    pub active: u64,
    pub failed: u64,
    pub current_delay_ms: u64,
    pub consecutive_successes: u64,
    pub output_bytes: u64,
    pub last_activity_ms: u64,
}

/// Registry of per-worker counters. Entries survive worker exit so clients
/// can read final numbers until the broker restarts.
#[derive(Debug, Default)]
pub struct Metrics {
    workers: RwLock<HashMap<String, Arc<WorkerMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter handle for a worker, created on first touch.
    pub fn for_worker(&self, name: &str) -> Arc<WorkerMetrics> {
        if let Some(existing) = self.workers.read().get(name) {
            return Arc::clone(existing);
        }
        let mut map = self.workers.write();
        Arc::clone(map.entry(name.to_owned()).or_default())
    }

    pub fn snapshot_one(&self, name: &str) -> Option<MetricsSnapshot> {
        let map = self.workers.read();
        map.get(name).map(|m| snapshot(name, m))
    }

    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let map = self.workers.read();
        let mut out: Vec<MetricsSnapshot> =
            map.iter().map(|(name, m)| snapshot(name, m)).collect();
        out.sort_by(|a, b| a.worker.cmp(&b.worker));
        out
    }
}

fn snapshot(name: &str, m: &WorkerMetrics) -> MetricsSnapshot {
    MetricsSnapshot {
        worker: name.to_owned(),
        queued: m.queued.load(Ordering::Relaxed),
        injected: m.injected.load(Ordering::Relaxed),
        verified: m.verified.load(Ordering::Relaxed),
        active: m.active.load(Ordering::Relaxed),
        failed: m.failed.load(Ordering::Relaxed),
        current_delay_ms: m.current_delay_ms.load(Ordering::Relaxed),
        consecutive_successes: m.consecutive_successes.load(Ordering::Relaxed),
        output_bytes: m.output_bytes.load(Ordering::Relaxed),
        last_activity_ms: m.last_activity_ms.load(Ordering::Relaxed),
    }
}
