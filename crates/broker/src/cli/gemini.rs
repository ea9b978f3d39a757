// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gemini CLI profile.

use super::{
    recent, type_and_submit, CliKind, CliProfile, InjectionStep, PromptAction, PromptKind,
};

const SCAN_WINDOW: usize = 400;

pub struct GeminiProfile;

impl CliProfile for GeminiProfile {
    fn kind(&self) -> CliKind {
        CliKind::Gemini
    }

    fn detect_prompt(&self, tail: &str) -> Option<PromptAction> {
        let window = recent(tail, SCAN_WINDOW).to_lowercase();

        if window.contains("do you trust this folder") {
            return Some(PromptAction {
                kind: PromptKind::Trust,
                steps: vec![InjectionStep { bytes: b"y\r".to_vec(), delay_after: None }],
                needs_auto_approve: true,
            });
        }

        if window.contains("allow execution") || window.contains("always allow") {
            return Some(PromptAction {
                kind: PromptKind::BypassPermissions,
                steps: vec![InjectionStep { bytes: b"y\r".to_vec(), delay_after: None }],
                needs_auto_approve: true,
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
        window.contains('✦') || window.contains("esc to cancel") || window.contains("Loading")
    }

    fn is_ready(&self, tail: &str) -> bool {
        recent(tail, SCAN_WINDOW).contains('>')
    }

    fn injection_steps(&self, text: &str) -> Vec<InjectionStep> {
        type_and_submit(text)
    }

    fn model_command(&self, _model: &str) -> Option<String> {
        // Gemini's model is fixed at launch (`--model` flag); no runtime switch.
        None
    }
}

#[cfg(test)]
#[path = "gemini_tests.rs"]
mod tests;
