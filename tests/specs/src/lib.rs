// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `agent-relay` binary as a subprocess and drives the
//! newline-delimited JSON protocol over piped stdin/stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Resolve the path to the compiled `agent-relay` binary.
pub fn broker_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("agent-relay")
}

/// A running `agent-relay` process, killed on drop.
pub struct BrokerProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    project_dir: PathBuf,
    _dir: Option<tempfile::TempDir>,
    next_id: u64,
}

impl BrokerProcess {
    /// Start a broker in a fresh temporary project directory.
    pub async fn start(extra_args: &[&str]) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut broker = Self::start_in(dir.path(), extra_args).await?;
        broker._dir = Some(dir);
        Ok(broker)
    }

    /// Start a broker in an existing project directory (shared across
    /// restarts for crash-recovery tests).
    pub async fn start_in(project_dir: &Path, extra_args: &[&str]) -> anyhow::Result<Self> {
        let binary = broker_binary();
        anyhow::ensure!(binary.exists(), "agent-relay binary not found at {}", binary.display());

        let mut args: Vec<String> = vec![
            "--project-dir".into(),
            project_dir.to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        args.extend(extra_args.iter().map(|s| (*s).to_string()));

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout pipe"))?;

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            project_dir: project_dir.to_owned(),
            _dir: None,
            next_id: 0,
        })
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Read the next protocol frame, bounded by `timeout`.
    pub async fn next_frame(&mut self, timeout: Duration) -> anyhow::Result<serde_json::Value> {
        let line = tokio::time::timeout(timeout, self.lines.next_line())
            .await
            .map_err(|_| anyhow::anyhow!("no frame within {timeout:?}"))??
            .ok_or_else(|| anyhow::anyhow!("broker stdout closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Skip frames until an event of `kind` arrives.
    pub async fn event_of_kind(
        &mut self,
        kind: &str,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("no {kind} event within {timeout:?}"))?;
            let frame = self.next_frame(remaining).await?;
            if frame["kind"] == kind {
                return Ok(frame);
            }
        }
    }

    /// Send a request and wait for its reply, skipping interleaved events.
    pub async fn request(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);

        let frame = serde_json::json!({ "id": id, "kind": kind, "payload": payload });
        self.stdin.write_all(frame.to_string().as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("no reply to {kind} within 15s"))?;
            let reply = self.next_frame(remaining).await?;
            if reply.get("id").and_then(|v| v.as_str()) == Some(id.as_str()) {
                return Ok(reply);
            }
        }
    }

    /// Send a request and unwrap its `ok` payload.
    pub async fn request_ok(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let reply = self.request(kind, payload).await?;
        anyhow::ensure!(
            reply["kind"] == "ok",
            "{kind} failed: {}",
            reply["payload"].to_string()
        );
        Ok(reply["payload"].clone())
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        tokio::time::timeout(timeout, self.child.wait())
            .await
            .map_err(|_| anyhow::anyhow!("broker did not exit within {timeout:?}"))?
            .map_err(Into::into)
    }

    /// SIGKILL the broker (crash simulation).
    pub async fn kill(&mut self) -> anyhow::Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

impl Drop for BrokerProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}
