// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-CLI behavior: prompt detection, activity markers, ready markers, and
//! injection encoding differ across agent CLIs. Each variant gets a profile;
//! unknown binaries fall back to the generic profile.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod generic;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Known agent CLI families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliKind {
    Claude,
    Codex,
    Gemini,
    Aider,
    Goose,
    Other,
}

impl CliKind {
    /// Classify a CLI command string by its binary basename.
    pub fn from_command(cli: &str) -> Self {
        let basename = cli.rsplit('/').next().unwrap_or(cli);
        match basename {
            "claude" => Self::Claude,
            "codex" => Self::Codex,
            "gemini" => Self::Gemini,
            "aider" => Self::Aider,
            "goose" => Self::Goose,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Aider => "aider",
            Self::Goose => "goose",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for CliKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a PTY injection sequence: raw bytes plus an optional settle
/// delay before the next step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionStep {
    pub bytes: Vec<u8>,
    pub delay_after: Option<Duration>,
}

/// Classification of an interactive prompt found in worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Workspace-trust dialog.
    Trust,
    /// Tool-permission / bypass-permissions dialog.
    BypassPermissions,
    /// Model-switch menu (confirm the highlighted entry).
    ModelMenu,
    /// Generic "press enter to continue".
    PressEnter,
}

/// A detected prompt and the keystrokes that dismiss it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptAction {
    pub kind: PromptKind,
    pub steps: Vec<InjectionStep>,
    /// Trust/permission answers are applied only when auto-approve is on;
    /// enter-to-continue and menu confirmation are always safe.
    pub needs_auto_approve: bool,
}

/// Capability set implemented per CLI family.
pub trait CliProfile: Send + Sync {
    fn kind(&self) -> CliKind;

    /// Scan the visible output tail for an interactive prompt that must be
    /// handled locally (before delivery verification ever sees it).
    fn detect_prompt(&self, tail: &str) -> Option<PromptAction>;

    /// True when the tail shows the CLI making progress (tool use, thinking
    /// indicator, spinner).
    fn is_activity(&self, tail: &str) -> bool;

    /// True when the tail shows the CLI idle at its input prompt.
    fn is_ready(&self, tail: &str) -> bool;

    /// Encode a formatted message into PTY write steps (text, settle delay,
    /// submit).
    fn injection_steps(&self, text: &str) -> Vec<InjectionStep>;

    /// The command injected by `set_model`, or `None` when the CLI has no
    /// model switch.
    fn model_command(&self, model: &str) -> Option<String>;
}

/// Resolve the profile for a CLI family.
pub fn profile_for(kind: CliKind) -> Arc<dyn CliProfile> {
    match kind {
        CliKind::Claude => Arc::new(claude::ClaudeProfile),
        CliKind::Codex => Arc::new(codex::CodexProfile),
        CliKind::Gemini => Arc::new(gemini::GeminiProfile),
        CliKind::Aider | CliKind::Goose | CliKind::Other => Arc::new(generic::GenericProfile),
    }
}

/// Base delay between typing a message and pressing enter.
const SUBMIT_DELAY_BASE: Duration = Duration::from_millis(150);

/// Extra per-byte delay for messages longer than 256 bytes.
const SUBMIT_DELAY_PER_BYTE: Duration = Duration::from_micros(500);

/// Ceiling on the scaled submit delay.
const SUBMIT_DELAY_MAX: Duration = Duration::from_millis(2000);

/// Type-then-submit encoding shared by all profiles: the message bytes, a
/// settle delay scaled to message length, then a carriage return.
pub(crate) fn type_and_submit(text: &str) -> Vec<InjectionStep> {
    let extra = text.len().saturating_sub(256) as u32;
    let delay = (SUBMIT_DELAY_BASE + SUBMIT_DELAY_PER_BYTE * extra).min(SUBMIT_DELAY_MAX);
    vec![
        InjectionStep { bytes: text.as_bytes().to_vec(), delay_after: Some(delay) },
        InjectionStep { bytes: b"\r".to_vec(), delay_after: None },
    ]
}

/// Last `n` characters of the tail, for marker scans that should only look
/// at recent output.
pub(crate) fn recent(tail: &str, n: usize) -> &str {
    let start = tail.char_indices().rev().nth(n.saturating_sub(1)).map(|(i, _)| i).unwrap_or(0);
    &tail[start..]
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
