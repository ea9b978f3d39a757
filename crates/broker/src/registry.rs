// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide worker registry: name → worker, plus channel membership.
//!
//! The registry exclusively owns each [`PtyWorker`]. Everything else refers
//! to workers by name and resolves through a read view on each operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorCode, WireError};
use crate::event::BrokerEvent;
use crate::state::PersistedWorker;
use crate::worker::{AgentInfo, PtyWorker, WorkerEvent, WorkerSpec};

/// Resolved set of local targets for a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet {
    pub names: Vec<String>,
}

type WorkerMap = Arc<RwLock<HashMap<String, Arc<PtyWorker>>>>;
type ChannelMap = Arc<RwLock<HashMap<String, HashSet<String>>>>;

pub struct WorkerRegistry {
    workers: WorkerMap,
    /// Channel name → member worker names.
    channels: ChannelMap,
    /// Workers recovered from persisted state but not re-adopted; they are
    /// listed but refuse injections until released and respawned.
    unadopted: RwLock<HashMap<String, PersistedWorker>>,
    events: broadcast::Sender<BrokerEvent>,
    persist_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    config: Arc<Config>,
}

impl WorkerRegistry {
    pub fn new(
        config: Arc<Config>,
        events: broadcast::Sender<BrokerEvent>,
        persist_tx: mpsc::Sender<()>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            unadopted: RwLock::new(HashMap::new()),
            events,
            persist_tx,
            shutdown,
            config,
        })
    }

    /// Spawn a new worker. Fails with `already_exists` when the name is
    /// taken by a live worker, `invalid_payload` on a bad spec.
    pub async fn spawn(&self, spec: WorkerSpec) -> Result<Arc<PtyWorker>, WireError> {
        spec.validate()?;

        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&spec.name) {
            if !existing.is_exited() {
                return Err(WireError::new(
                    ErrorCode::AlreadyExists,
                    format!("worker {} already exists", spec.name),
                ));
            }
            workers.remove(&spec.name);
        }

        // Respawning under a recovered name re-adopts it.
        self.unadopted.write().await.remove(&spec.name);

        let worker = PtyWorker::spawn(spec, &self.config, &self.shutdown)
            .map_err(|e| WireError::internal(format!("spawn failed: {e:#}")))?;

        workers.insert(worker.spec.name.clone(), Arc::clone(&worker));
        drop(workers);

        {
            let mut channels = self.channels.write().await;
            for channel in &worker.spec.channels {
                channels.entry(channel.clone()).or_default().insert(worker.spec.name.clone());
            }
        }

        let _ = self.events.send(BrokerEvent::AgentSpawned {
            name: worker.spec.name.clone(),
            pid: worker.pid,
            cli: worker.spec.cli.clone(),
        });

        self.spawn_monitor(&worker);
        let _ = self.persist_tx.try_send(());
        Ok(worker)
    }

    /// Forward a worker's lifecycle to the broker event stream and drop it
    /// from the registry on exit.
    fn spawn_monitor(&self, worker: &Arc<PtyWorker>) {
        let workers = Arc::clone(&self.workers);
        let channels = Arc::clone(&self.channels);
        let events = self.events.clone();
        let persist_tx = self.persist_tx.clone();
        let name = worker.spec.name.clone();
        let mut rx = worker.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(WorkerEvent::Ready) => {
                        let _ = events.send(BrokerEvent::AgentReady { name: name.clone() });
                    }
                    Ok(WorkerEvent::Exited(status)) => {
                        remove_worker(&workers, &channels, &name).await;
                        let _ = events.send(BrokerEvent::AgentExited {
                            name: name.clone(),
                            exit_code: status.code,
                            signal: status.signal,
                        });
                        let _ = persist_tx.try_send(());
                        return;
                    }
                    Ok(WorkerEvent::Output(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(worker = %name, "lifecycle monitor lagged {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn remove(&self, name: &str) {
        remove_worker(&self.workers, &self.channels, name).await;
    }

    /// Release a worker: signal, await exit within the grace window, then
    /// SIGKILL. Idempotent; unknown names are a successful no-op.
    ///
    /// Returns true when a worker (live or unadopted) was released.
    pub async fn release(&self, name: &str, reason: Option<String>) -> bool {
        if self.unadopted.write().await.remove(name).is_some() {
            let _ = self.events.send(BrokerEvent::AgentReleased {
                name: name.to_owned(),
                reason,
            });
            let _ = self.persist_tx.try_send(());
            return true;
        }

        let worker = match self.workers.read().await.get(name) {
            Some(w) => Arc::clone(w),
            None => return false,
        };

        let _ = self.events.send(BrokerEvent::AgentReleased {
            name: name.to_owned(),
            reason,
        });

        worker.cancel.cancel();
        worker.signal(Signal::SIGTERM);

        let grace = self.config.release_grace();
        if !wait_for_exit(&worker, grace).await {
            warn!(worker = %name, "did not exit within {grace:?}, sending SIGKILL");
            worker.signal(Signal::SIGKILL);
            wait_for_exit(&worker, Duration::from_secs(2)).await;
        }

        // The exit monitor removes the entry; make sure it is gone even if
        // the monitor lagged.
        self.remove(name).await;
        let _ = self.persist_tx.try_send(());
        true
    }

    /// Release every worker in parallel (global shutdown).
    pub async fn release_all(&self, reason: Option<String>) {
        let names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        let futures: Vec<_> =
            names.iter().map(|name| self.release(name, reason.clone())).collect();
        futures_util::future::join_all(futures).await;
    }

    pub async fn get(&self, name: &str) -> Option<Arc<PtyWorker>> {
        self.workers.read().await.get(name).map(Arc::clone)
    }

    pub async fn is_unadopted(&self, name: &str) -> bool {
        self.unadopted.read().await.contains_key(name)
    }

    /// All live + unadopted workers, for `list_agents`.
    pub async fn list(&self) -> Vec<AgentInfo> {
        let mut out: Vec<AgentInfo> = {
            let workers = self.workers.read().await;
            workers.values().map(|w| w.info(true)).collect()
        };

        for persisted in self.unadopted.read().await.values() {
            out.push(AgentInfo {
                name: persisted.name.clone(),
                cli: persisted.cli.clone(),
                kind: crate::cli::CliKind::from_command(&persisted.cli),
                pid: persisted.pid,
                state: "unadopted".to_owned(),
                model: persisted.spec.model.clone(),
                channels: persisted.spec.channels.clone(),
                team: persisted.spec.team.clone(),
                shadow_of: persisted.spec.shadow_of.clone(),
                shadow_mode: persisted.spec.shadow_mode.clone(),
                spawned_at_unix_ms: persisted.spawned_at_unix_ms,
                adopted: false,
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Resolve a send target to a set of local worker names.
    ///
    /// - `*` — all live workers except `from`
    /// - `#channel` — current channel members
    /// - plain name — that worker
    pub async fn resolve_target(&self, to: &str, from: &str) -> Result<TargetSet, WireError> {
        if to == "*" {
            let workers = self.workers.read().await;
            let mut names: Vec<String> =
                workers.keys().filter(|n| n.as_str() != from).cloned().collect();
            names.sort();
            return Ok(TargetSet { names });
        }

        if let Some(channel) = to.strip_prefix('#') {
            let channels = self.channels.read().await;
            let members = channels
                .get(channel)
                .ok_or_else(|| WireError::not_found(format!("#{channel}")))?;
            let workers = self.workers.read().await;
            let mut names: Vec<String> = members
                .iter()
                .filter(|n| workers.contains_key(*n) && n.as_str() != from)
                .cloned()
                .collect();
            names.sort();
            return Ok(TargetSet { names });
        }

        if self.workers.read().await.contains_key(to) {
            return Ok(TargetSet { names: vec![to.to_owned()] });
        }
        if self.is_unadopted(to).await {
            return Err(WireError::new(
                ErrorCode::WorkerExited,
                format!("{to} is not adopted; release and respawn it first"),
            ));
        }
        Err(WireError::not_found(to))
    }

    /// Join a worker to a channel at runtime.
    pub async fn join_channel(&self, channel: &str, name: &str) {
        self.channels.write().await.entry(channel.to_owned()).or_default().insert(name.to_owned());
    }

    /// Best-effort reattach of persisted workers after a broker restart.
    ///
    /// A persisted worker whose PID is alive and whose process image matches
    /// the expected CLI is kept as `unadopted`; everything else is dropped.
    pub async fn reattach(&self, persisted: Vec<PersistedWorker>) -> usize {
        let mut kept = 0;
        let mut unadopted = self.unadopted.write().await;

        for worker in persisted {
            if !pid_alive(worker.pid) {
                debug!(worker = %worker.name, pid = worker.pid, "persisted worker is gone");
                continue;
            }
            match comm_matches(worker.pid, &worker.cli) {
                Some(false) => {
                    debug!(
                        worker = %worker.name,
                        pid = worker.pid,
                        "pid reused by a different binary; dropping"
                    );
                    continue;
                }
                Some(true) => {}
                None => {
                    warn!(
                        worker = %worker.name,
                        pid = worker.pid,
                        "cannot inspect process image; keeping as unadopted"
                    );
                }
            }
            info!(worker = %worker.name, pid = worker.pid, "surviving worker found (unadopted)");
            unadopted.insert(worker.name.clone(), worker);
            kept += 1;
        }

        kept
    }

    /// Snapshot for persistence.
    pub async fn persist_snapshot(&self) -> Vec<PersistedWorker> {
        let mut out: Vec<PersistedWorker> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .map(|w| PersistedWorker {
                    name: w.spec.name.clone(),
                    pid: w.pid,
                    cli: w.spec.cli.clone(),
                    spec: w.spec.clone(),
                    spawned_at_unix_ms: w.spawned_at_unix_ms,
                })
                .collect()
        };
        out.extend(self.unadopted.read().await.values().cloned());
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn unadopted_count(&self) -> usize {
        self.unadopted.read().await.len()
    }
}

async fn remove_worker(workers: &WorkerMap, channels: &ChannelMap, name: &str) {
    workers.write().await.remove(name);
    let mut channels = channels.write().await;
    for members in channels.values_mut() {
        members.remove(name);
    }
    channels.retain(|_, members| !members.is_empty());
}

/// Wait until the worker's backend reports exit, bounded by `timeout`.
async fn wait_for_exit(worker: &Arc<PtyWorker>, timeout: Duration) -> bool {
    let mut rx = worker.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;

    while !worker.is_exited() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return worker.is_exited();
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(WorkerEvent::Exited(_))) => return true,
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => return true,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Err(_) => return worker.is_exited(),
        }
    }
    true
}

fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Compare `/proc/<pid>/comm` against the CLI binary basename.
/// `None` when the process image cannot be inspected (non-procfs systems).
fn comm_matches(pid: u32, cli: &str) -> Option<bool> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let comm = comm.trim();
    let expected = cli.rsplit('/').next().unwrap_or(cli);
    // comm is truncated to 15 bytes by the kernel.
    let expected_short = &expected[..expected.len().min(15)];
    Some(comm == expected_short)
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
