// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Claude Code profile.
//!
//! Claude presents startup dialogs (workspace trust, permission bypass) and
//! a model-switch menu that must be answered locally; during a turn it shows
//! a spinner with an "esc to interrupt" hint, and idles at a `❯` prompt.

use super::{
    recent, type_and_submit, CliKind, CliProfile, InjectionStep, PromptAction, PromptKind,
};

/// How much recent output a marker scan considers.
const SCAN_WINDOW: usize = 400;

pub struct ClaudeProfile;

/// Spinner glyphs Claude cycles through while working.
const SPINNER_GLYPHS: [&str; 4] = ["✻", "✽", "✢", "·"];

impl CliProfile for ClaudeProfile {
    fn kind(&self) -> CliKind {
        CliKind::Claude
    }

    fn detect_prompt(&self, tail: &str) -> Option<PromptAction> {
        let window = recent(tail, SCAN_WINDOW).to_lowercase();

        if window.contains("do you trust the files in this folder")
            || window.contains("trust this folder")
            || window.contains("trust this workspace")
        {
            return Some(PromptAction {
                kind: PromptKind::Trust,
                steps: vec![InjectionStep { bytes: b"y\r".to_vec(), delay_after: None }],
                needs_auto_approve: true,
            });
        }

        if window.contains("bypass permissions")
            || window.contains("dangerously-skip-permissions")
            || window.contains("allow tool use without prompting")
        {
            return Some(PromptAction {
                kind: PromptKind::BypassPermissions,
                steps: vec![InjectionStep { bytes: b"y\r".to_vec(), delay_after: None }],
                needs_auto_approve: true,
            });
        }

        if window.contains("select a model") || window.contains("switch model") {
            return Some(PromptAction {
                kind: PromptKind::ModelMenu,
                steps: vec![InjectionStep { bytes: b"\r".to_vec(), delay_after: None }],
                needs_auto_approve: false,
            });
        }

        if window.contains("press enter to continue") {
            return Some(PromptAction {
                kind: PromptKind::PressEnter,
                steps: vec![InjectionStep { bytes: b"\r".to_vec(), delay_after: None }],
                needs_auto_approve: false,
            });
        }

        None
    }

    fn is_activity(&self, tail: &str) -> bool {
        let window = recent(tail, SCAN_WINDOW);
        if window.contains("esc to interrupt") || window.contains("Thinking") {
            return true;
        }
        SPINNER_GLYPHS.iter().any(|g| window.contains(g))
    }

    fn is_ready(&self, tail: &str) -> bool {
        recent(tail, SCAN_WINDOW).contains('❯')
    }

    fn injection_steps(&self, text: &str) -> Vec<InjectionStep> {
        type_and_submit(text)
    }

    fn model_command(&self, model: &str) -> Option<String> {
        Some(format!("/model {model}"))
    }
}

#[cfg(test)]
#[path = "claude_tests.rs"]
mod tests;
