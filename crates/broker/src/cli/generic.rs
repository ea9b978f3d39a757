// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fallback profile for Aider, Goose, and unknown CLIs.
//!
//! No prompt table and no model switch; any output counts as ready, and
//! common "busy" words count as activity.

use super::{recent, type_and_submit, CliKind, CliProfile, InjectionStep, PromptAction};

const SCAN_WINDOW: usize = 400;

pub struct GenericProfile;

impl CliProfile for GenericProfile {
    fn kind(&self) -> CliKind {
        CliKind::Other
    }

    fn detect_prompt(&self, tail: &str) -> Option<PromptAction> {
        let window = recent(tail, SCAN_WINDOW).to_lowercase();
        if window.contains("press enter to continue") {
            return Some(PromptAction {
                kind: super::PromptKind::PressEnter,
                steps: vec![InjectionStep { bytes: b"\r".to_vec(), delay_after: None }],
                needs_auto_approve: false,
            });
        }
        None
    }

    fn is_activity(&self, tail: &str) -> bool {
        let window = recent(tail, SCAN_WINDOW).to_lowercase();
        window.contains("thinking") || window.contains("working") || window.contains("running")
    }

    fn is_ready(&self, tail: &str) -> bool {
        // Unknown CLIs have no known idle marker; first output means ready.
        !tail.is_empty()
    }

    fn injection_steps(&self, text: &str) -> Vec<InjectionStep> {
        type_and_submit(text)
    }

    fn model_command(&self, _model: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
#[path = "generic_tests.rs"]
mod tests;
