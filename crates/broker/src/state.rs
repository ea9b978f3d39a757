// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic JSON persistence of broker state for crash recovery.
//!
//! Writes go to `<path>.tmp` then rename over the target, so a concurrent
//! reader sees either the previous committed file or the new one, never a
//! partial write. Missing or corrupt files load as empty state.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::delivery::DeliveryState;
use crate::worker::WorkerSpec;

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 1;

/// Snapshot of broker state as written to `broker.state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub workers: Vec<PersistedWorker>,
    #[serde(default)]
    pub pending_deliveries: Vec<PersistedDelivery>,
}

/// Identity of a running worker, enough to attempt reattach after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedWorker {
    pub name: String,
    pub pid: u32,
    pub cli: String,
    pub spec: WorkerSpec,
    pub spawned_at_unix_ms: u64,
}

/// Serializable subset of an in-flight delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDelivery {
    pub delivery_id: String,
    pub event_id: String,
    pub worker_name: String,
    pub formatted_text: String,
    pub attempt: u32,
    pub state: DeliveryState,
    pub created_at: u64,
}

/// Load persisted state. Missing, corrupt, or future-versioned files start
/// the broker fresh.
pub fn load(path: &Path) -> PersistedState {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
        Err(e) => {
            warn!("unreadable state file {}: {e}", path.display());
            return PersistedState::default();
        }
    };

    match serde_json::from_str::<PersistedState>(&contents) {
        Ok(state) if state.version <= STATE_VERSION => state,
        Ok(state) => {
            warn!(
                "state file {} has version {} (supported {STATE_VERSION}); starting fresh",
                path.display(),
                state.version
            );
            PersistedState::default()
        }
        Err(e) => {
            warn!("corrupt state file {}: {e}; starting fresh", path.display());
            PersistedState::default()
        }
    }
}

/// Save state atomically (write tmp + rename).
pub fn save(path: &Path, state: &PersistedState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Save the deliveries section on its own (`pending.json`), same atomicity.
pub fn save_pending(path: &Path, pending: &[PersistedDelivery]) -> anyhow::Result<()> {
    let state = PersistedState {
        version: STATE_VERSION,
        workers: vec![],
        pending_deliveries: pending.to_vec(),
    };
    save(path, &state)
}

/// Closure producing the current state snapshot. The registry and engine
/// are captured behind it so this module stays a leaf.
pub type SnapshotFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = PersistedState> + Send>> + Send + Sync>;

/// Dedicated persistence task. Components nudge it over an mpsc channel;
/// nudges are coalesced, the snapshot closure is polled, and both state
/// files are rewritten atomically. Save failures are logged and retried on
/// the next nudge; they never terminate the broker.
pub struct Persister {
    rx: mpsc::Receiver<()>,
    snapshot_fn: SnapshotFn,
    state_path: PathBuf,
    pending_path: PathBuf,
}

impl Persister {
    pub fn new(
        rx: mpsc::Receiver<()>,
        snapshot_fn: SnapshotFn,
        state_path: PathBuf,
        pending_path: PathBuf,
    ) -> Self {
        Self { rx, snapshot_fn, state_path, pending_path }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                nudge = self.rx.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                    // Coalesce bursts of nudges into one write.
                    while self.rx.try_recv().is_ok() {}
                    self.save_snapshot().await;
                }
            }
        }

        // Final snapshot so a clean shutdown leaves accurate state behind.
        self.save_snapshot().await;
        debug!("persister stopped");
    }

    async fn save_snapshot(&self) {
        let state = (self.snapshot_fn)().await;

        if let Err(e) = save(&self.state_path, &state) {
            warn!("state save failed: {e:#}");
        }
        if let Err(e) = save_pending(&self.pending_path, &state.pending_deliveries) {
            warn!("pending save failed: {e:#}");
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
