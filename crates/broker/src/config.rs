// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::throttle::ThrottleConfig;

/// Local agent-relay broker for PTY-wrapped AI CLI tools.
#[derive(Debug, Parser)]
#[command(name = "agent-relay", version, about)]
pub struct Config {
    /// Project directory owning `.agent-relay/` (lock + state files).
    #[arg(long, env = "AGENT_RELAY_PROJECT_DIR", default_value = ".")]
    pub project_dir: PathBuf,

    /// Relaycast websocket URL (ws:// or wss://). Omit for local-only mode.
    #[arg(long, env = "AGENT_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Log format (json or text). Logs always go to stderr.
    #[arg(long, env = "AGENT_RELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AGENT_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Terminal columns for worker PTYs.
    #[arg(long, env = "AGENT_RELAY_COLS", default_value = "200")]
    pub cols: u16,

    /// Terminal rows for worker PTYs.
    #[arg(long, env = "AGENT_RELAY_ROWS", default_value = "50")]
    pub rows: u16,

    /// Echo verification window per injection attempt, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_VERIFY_WINDOW_MS", default_value = "3000")]
    pub verify_window_ms: u64,

    /// Activity-marker window after verification, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_ACTIVITY_WINDOW_MS", default_value = "5000")]
    pub activity_window_ms: u64,

    /// Maximum injection attempts per delivery.
    #[arg(long, env = "AGENT_RELAY_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Minimum inter-injection delay per worker, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_THROTTLE_FLOOR_MS", default_value = "100")]
    pub throttle_floor_ms: u64,

    /// Maximum inter-injection delay per worker, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_THROTTLE_CEILING_MS", default_value = "5000")]
    pub throttle_ceiling_ms: u64,

    /// Pending-delivery queue capacity per worker.
    #[arg(long, env = "AGENT_RELAY_QUEUE_CAP", default_value = "256")]
    pub queue_cap: usize,

    /// Grace period between release signal and SIGKILL, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_RELEASE_GRACE_MS", default_value = "5000")]
    pub release_grace_ms: u64,

    /// Dedup cache capacity (event ids).
    #[arg(long, env = "AGENT_RELAY_DEDUP_CAPACITY", default_value = "4096")]
    pub dedup_capacity: usize,

    /// Dedup cache TTL, in seconds.
    #[arg(long, env = "AGENT_RELAY_DEDUP_TTL_SECS", default_value = "300")]
    pub dedup_ttl_secs: u64,

    /// Output-tail ring size per worker, in bytes.
    #[arg(long, env = "AGENT_RELAY_TAIL_SIZE", default_value = "16384")]
    pub tail_size: usize,

    /// Minimum gap between cloud publishes, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_PUBLISH_MIN_GAP_MS", default_value = "50")]
    pub publish_min_gap_ms: u64,

    /// Outbound publish queue capacity; oldest entries drop on overflow.
    #[arg(long, env = "AGENT_RELAY_PUBLISH_QUEUE_CAP", default_value = "1024")]
    pub publish_queue_cap: usize,

    /// Websocket connect/handshake timeout, in milliseconds.
    #[arg(long, env = "AGENT_RELAY_WS_HANDSHAKE_TIMEOUT_MS", default_value = "10000")]
    pub ws_handshake_timeout_ms: u64,

    /// What an expired activity window means: "ok" promotes the delivery to
    /// active with a warning; "fail" marks it failed (retryable).
    #[arg(long, env = "AGENT_RELAY_NO_ACTIVITY_POLICY", default_value = "ok")]
    pub no_activity_policy: String,

    /// Auto-answer startup prompts (workspace trust, permission bypass).
    /// Default: true.
    #[arg(long, env = "AGENT_RELAY_AUTO_APPROVE")]
    pub auto_approve: Option<bool>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("--cols and --rows must be non-zero");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be at least 1");
        }
        if self.throttle_floor_ms == 0 || self.throttle_floor_ms > self.throttle_ceiling_ms {
            anyhow::bail!(
                "--throttle-floor-ms must be non-zero and no greater than --throttle-ceiling-ms"
            );
        }
        if self.queue_cap == 0 {
            anyhow::bail!("--queue-cap must be at least 1");
        }
        if self.tail_size < 1024 {
            anyhow::bail!("--tail-size must be at least 1024 bytes");
        }
        match self.no_activity_policy.as_str() {
            "ok" | "fail" => {}
            other => anyhow::bail!("invalid --no-activity-policy: {other} (expected ok or fail)"),
        }
        if let Some(ref url) = self.relay_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                anyhow::bail!("--relay-url must be a ws:// or wss:// URL");
            }
        }
        Ok(())
    }

    /// Directory holding the lock and state files.
    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(".agent-relay")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("broker.lock")
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join("broker.state.json")
    }

    pub fn pending_path(&self) -> PathBuf {
        self.state_dir().join("pending.json")
    }

    pub fn verify_window(&self) -> Duration {
        Duration::from_millis(self.verify_window_ms)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_millis(self.activity_window_ms)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn publish_min_gap(&self) -> Duration {
        Duration::from_millis(self.publish_min_gap_ms)
    }

    pub fn ws_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_handshake_timeout_ms)
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            floor: Duration::from_millis(self.throttle_floor_ms),
            ceiling: Duration::from_millis(self.throttle_ceiling_ms),
        }
    }

    /// Whether an expired activity window fails the delivery.
    pub fn no_activity_fails(&self) -> bool {
        self.no_activity_policy == "fail"
    }

    /// Resolve startup-prompt auto-answering. Defaults to enabled.
    pub fn effective_auto_approve(&self) -> bool {
        self.auto_approve.unwrap_or(true)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
