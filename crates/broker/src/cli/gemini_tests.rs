// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn trust_prompt_is_detected() {
    let action =
        GeminiProfile.detect_prompt("Do you trust this folder? (y/n)").expect("trust prompt");
    assert_eq!(action.kind, PromptKind::Trust);
    assert!(action.needs_auto_approve);
}

#[test]
fn execution_approval_is_detected() {
    let action = GeminiProfile.detect_prompt("Allow execution of `ls`?").expect("approval");
    assert_eq!(action.kind, PromptKind::BypassPermissions);
}

#[yare::parameterized(
    sparkle = { "✦ Generating" },
    cancel_hint = { "working (esc to cancel)" },
)]
fn activity_markers(tail: &str) {
    assert!(GeminiProfile.is_activity(tail));
}

#[test]
fn no_runtime_model_switch() {
    assert_eq!(GeminiProfile.model_command("pro"), None);
}
