// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Codex CLI profile.

use super::{
    recent, type_and_submit, CliKind, CliProfile, InjectionStep, PromptAction, PromptKind,
};

const SCAN_WINDOW: usize = 400;

pub struct CodexProfile;

impl CliProfile for CodexProfile {
    fn kind(&self) -> CliKind {
        CliKind::Codex
    }

    fn detect_prompt(&self, tail: &str) -> Option<PromptAction> {
        let window = recent(tail, SCAN_WINDOW).to_lowercase();

        if window.contains("allow command") || window.contains("approve this command") {
            return Some(PromptAction {
                kind: PromptKind::BypassPermissions,
                steps: vec![InjectionStep { bytes: b"y\r".to_vec(), delay_after: None }],
                needs_auto_approve: true,
            });
        }

        if window.contains("select model") {
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
        window.contains("Working")
            || window.contains("Thinking")
            || window.contains("Running command")
            || window.contains("esc to interrupt")
    }

    fn is_ready(&self, tail: &str) -> bool {
        let window = recent(tail, SCAN_WINDOW);
        window.contains('›') || window.contains("▌")
    }

    fn injection_steps(&self, text: &str) -> Vec<InjectionStep> {
        type_and_submit(text)
    }

    fn model_command(&self, model: &str) -> Option<String> {
        Some(format!("/model {model}"))
    }
}

#[cfg(test)]
#[path = "codex_tests.rs"]
mod tests;
