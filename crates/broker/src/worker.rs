// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY worker runtime: one agent CLI child process under PTY control.
//!
//! Each worker runs a backend task (PTY I/O pump) and a read task that feeds
//! the output tail, answers interactive prompts locally, and broadcasts
//! chunks to subscribers (the delivery engine, status handlers). Message
//! injection flows the other way through a bounded input channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{profile_for, CliKind, CliProfile, InjectionStep};
use crate::config::Config;
use crate::error::{ErrorCode, WireError};
use crate::event::epoch_ms;
use crate::pty::{ExitStatus, NativePty};
use crate::ring::OutputTail;
use crate::verify::VerifyWindow;

/// Visible-text window used for prompt/ready/activity scanning.
const SCAN_WINDOW_CAP: usize = 2048;

/// Client-provided worker description. Also the persisted spec shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub cli: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_mode: Option<String>,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // literal pattern, exercised by tests
        let pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap();
        pattern
    })
}

impl WorkerSpec {
    /// Validate client-supplied fields before spawning.
    pub fn validate(&self) -> Result<(), WireError> {
        if !name_pattern().is_match(&self.name) {
            return Err(WireError::invalid(format!(
                "invalid worker name {:?} (alphanumeric, dot, dash, underscore; max 64)",
                self.name
            )));
        }
        if self.cli.trim().is_empty() {
            return Err(WireError::invalid("cli must not be empty"));
        }
        for channel in &self.channels {
            if channel.is_empty() || channel.starts_with('#') {
                return Err(WireError::invalid(format!(
                    "invalid channel {channel:?} (bare name, no leading #)"
                )));
            }
        }
        Ok(())
    }
}

/// Snapshot returned by `list_agents` / `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub cli: String,
    pub kind: CliKind,
    pub pid: u32,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_mode: Option<String>,
    pub spawned_at_unix_ms: u64,
    /// False for workers recovered from persisted state but not re-adopted.
    pub adopted: bool,
}

/// Events broadcast by a worker's read loop.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Raw PTY output chunk.
    Output(Bytes),
    /// The CLI reached its idle prompt for the first time.
    Ready,
    /// The child exited; no further events follow.
    Exited(ExitStatus),
}

/// Narrow seam between a worker and the delivery engine. Tests substitute a
/// fake port backed by their own channels.
#[derive(Clone)]
pub struct WorkerPort {
    pub name: String,
    pub input_tx: mpsc::Sender<Bytes>,
    pub events: broadcast::Sender<WorkerEvent>,
    pub profile: Arc<dyn CliProfile>,
    pub exited: Arc<AtomicBool>,
}

impl WorkerPort {
    /// Write an injection sequence, honoring per-step settle delays.
    pub async fn write_steps(&self, steps: &[InjectionStep]) -> Result<(), WireError> {
        for step in steps {
            self.write_raw(Bytes::from(step.bytes.clone())).await?;
            if let Some(delay) = step.delay_after {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    pub async fn write_raw(&self, data: Bytes) -> Result<(), WireError> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| WireError::new(ErrorCode::WorkerExited, format!("{} has exited", self.name)))
    }
}

/// One running PTY-wrapped agent CLI. Owned exclusively by the registry.
pub struct PtyWorker {
    pub spec: WorkerSpec,
    pub kind: CliKind,
    pub pid: u32,
    pub spawned_at_unix_ms: u64,
    /// Child of the global shutdown token; cancelled on release.
    pub cancel: CancellationToken,
    profile: Arc<dyn CliProfile>,
    input_tx: mpsc::Sender<Bytes>,
    events: broadcast::Sender<WorkerEvent>,
    tail: Mutex<OutputTail>,
    current_model: Mutex<Option<String>>,
    pub last_activity_ms: AtomicU64,
    ready: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    exit_status: Mutex<Option<ExitStatus>>,
}

impl PtyWorker {
    /// Spawn the child on a fresh PTY and start its backend + read tasks.
    pub fn spawn(
        spec: WorkerSpec,
        config: &Config,
        parent_cancel: &CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let kind = CliKind::from_command(&spec.cli);
        let profile = profile_for(kind);

        let mut command = vec![spec.cli.clone()];
        command.extend(spec.args.iter().cloned());

        let env = vec![("AGENT_RELAY_NAME".to_owned(), spec.name.clone())];
        let mut pty = NativePty::spawn(
            &command,
            spec.cwd.as_deref(),
            &env,
            config.cols,
            config.rows,
        )?;
        let pid = pty.child_pid();

        let (pty_out_tx, pty_out_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
        let (events, _) = broadcast::channel::<WorkerEvent>(256);

        let worker = Arc::new(Self {
            kind,
            pid,
            spawned_at_unix_ms: epoch_ms(),
            cancel: parent_cancel.child_token(),
            profile: Arc::clone(&profile),
            input_tx,
            events: events.clone(),
            tail: Mutex::new(OutputTail::new(config.tail_size)),
            current_model: Mutex::new(spec.model.clone()),
            last_activity_ms: AtomicU64::new(0),
            ready: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            exit_status: Mutex::new(None),
            spec,
        });

        // Backend task: pump the PTY until the child exits, then announce it.
        {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let status = match pty.run(pty_out_tx, input_rx).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(worker = %worker.spec.name, "pty backend error: {e:#}");
                        ExitStatus::exited(1)
                    }
                };
                worker.exited.store(true, Ordering::Release);
                *worker.exit_status.lock() = Some(status);
                worker.cancel.cancel();
                let _ = worker.events.send(WorkerEvent::Exited(status));
                debug!(
                    worker = %worker.spec.name,
                    code = ?status.code,
                    signal = ?status.signal,
                    "worker exited"
                );
            });
        }

        // Read task: tail ring, prompt parser, ready/activity scan, fan-out.
        {
            let worker = Arc::clone(&worker);
            let auto_approve = config.effective_auto_approve();
            tokio::spawn(async move {
                worker.read_loop(pty_out_rx, auto_approve).await;
            });
        }

        // Cancellation watcher: release (or global shutdown) cancels the
        // worker token; a live child gets SIGTERM on its process group.
        {
            let cancel = worker.cancel.clone();
            let exited = Arc::clone(&worker.exited);
            tokio::spawn(async move {
                cancel.cancelled().await;
                if !exited.load(Ordering::Acquire) {
                    let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);
                }
            });
        }

        info!(worker = %worker.spec.name, pid, cli = %worker.kind, "worker spawned");
        Ok(worker)
    }

    async fn read_loop(&self, mut pty_out_rx: mpsc::Receiver<Bytes>, auto_approve: bool) {
        let mut scan = VerifyWindow::new(SCAN_WINDOW_CAP);

        while let Some(chunk) = pty_out_rx.recv().await {
            self.tail.lock().write(&chunk);
            scan.push_chunk(&chunk);
            let text = scan.text();

            // Interactive prompts are answered here so they never reach the
            // delivery pipeline as agent output.
            if let Some(action) = self.profile.detect_prompt(&text) {
                if auto_approve || !action.needs_auto_approve {
                    debug!(worker = %self.spec.name, kind = ?action.kind, "answering prompt");
                    for step in &action.steps {
                        if self.input_tx.send(Bytes::from(step.bytes.clone())).await.is_err() {
                            break;
                        }
                        if let Some(delay) = step.delay_after {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    // Forget the answered prompt so it is not re-answered on
                    // the next redraw of the same screen region.
                    scan.clear();
                }
            }

            if !self.ready.load(Ordering::Acquire) && self.profile.is_ready(&text) {
                self.ready.store(true, Ordering::Release);
                let _ = self.events.send(WorkerEvent::Ready);
            }

            if self.profile.is_activity(&text) {
                self.last_activity_ms.store(epoch_ms(), Ordering::Relaxed);
            }

            let _ = self.events.send(WorkerEvent::Output(chunk));
        }
    }

    /// Engine-facing handle.
    pub fn port(&self) -> WorkerPort {
        WorkerPort {
            name: self.spec.name.clone(),
            input_tx: self.input_tx.clone(),
            events: self.events.clone(),
            profile: Arc::clone(&self.profile),
            exited: Arc::clone(&self.exited),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Raw input write (the `send_input` request).
    pub async fn write_raw(&self, data: Bytes) -> Result<(), WireError> {
        if self.is_exited() {
            return Err(WireError::new(
                ErrorCode::WorkerExited,
                format!("{} has exited", self.spec.name),
            ));
        }
        self.input_tx
            .send(data)
            .await
            .map_err(|_| WireError::new(ErrorCode::WorkerExited, "input channel closed"))
    }

    /// Deliver a signal to the worker's process group.
    pub fn signal(&self, signal: Signal) {
        let _ = kill(Pid::from_raw(-(self.pid as i32)), signal);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_status.lock()
    }

    pub fn model(&self) -> Option<String> {
        self.current_model.lock().clone()
    }

    pub fn set_model_name(&self, model: &str) {
        *self.current_model.lock() = Some(model.to_owned());
    }

    pub fn profile(&self) -> Arc<dyn CliProfile> {
        Arc::clone(&self.profile)
    }

    /// Visible tail of recent output (lossy UTF-8 of raw bytes).
    pub fn tail_string(&self) -> String {
        self.tail.lock().tail_string()
    }

    pub fn output_bytes(&self) -> u64 {
        self.tail.lock().total_written()
    }

    pub fn info(&self, adopted: bool) -> AgentInfo {
        let state = if self.is_exited() {
            "exited"
        } else if self.is_ready() {
            "ready"
        } else {
            "starting"
        };
        AgentInfo {
            name: self.spec.name.clone(),
            cli: self.spec.cli.clone(),
            kind: self.kind,
            pid: self.pid,
            state: state.to_owned(),
            model: self.model(),
            channels: self.spec.channels.clone(),
            team: self.spec.team.clone(),
            shadow_of: self.spec.shadow_of.clone(),
            shadow_mode: self.spec.shadow_mode.clone(),
            spawned_at_unix_ms: self.spawned_at_unix_ms,
            adopted,
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
