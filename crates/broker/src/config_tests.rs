// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use clap::Parser;

fn parse(args: &[&str]) -> Config {
    let mut full = vec!["agent-relay"];
    full.extend_from_slice(args);
    Config::parse_from(full)
}

#[test]
fn defaults_are_valid() {
    let config = parse(&[]);
    config.validate().expect("default config should validate");

    assert_eq!(config.verify_window(), Duration::from_millis(3000));
    assert_eq!(config.activity_window(), Duration::from_millis(5000));
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.queue_cap, 256);
    assert_eq!(config.throttle().floor, Duration::from_millis(100));
    assert_eq!(config.throttle().ceiling, Duration::from_millis(5000));
    assert!(config.effective_auto_approve());
    assert!(!config.no_activity_fails());
}

#[test]
fn state_paths_live_under_project_dir() {
    let config = parse(&["--project-dir", "/tmp/proj"]);
    assert_eq!(config.lock_path(), PathBuf::from("/tmp/proj/.agent-relay/broker.lock"));
    assert_eq!(config.state_path(), PathBuf::from("/tmp/proj/.agent-relay/broker.state.json"));
    assert_eq!(config.pending_path(), PathBuf::from("/tmp/proj/.agent-relay/pending.json"));
}

#[yare::parameterized(
    zero_cols = { &["--cols", "0"] },
    zero_attempts = { &["--max-attempts", "0"] },
    floor_above_ceiling = { &["--throttle-floor-ms", "6000"] },
    zero_queue = { &["--queue-cap", "0"] },
    tiny_tail = { &["--tail-size", "100"] },
    bad_policy = { &["--no-activity-policy", "maybe"] },
    bad_relay_url = { &["--relay-url", "http://not-a-ws"] },
)]
fn invalid_configs_are_rejected(args: &[&str]) {
    let config = parse(args);
    assert!(config.validate().is_err());
}

#[test]
fn relay_url_accepts_ws_schemes() {
    parse(&["--relay-url", "ws://relay.local:8080/v1"]).validate().expect("ws url");
    parse(&["--relay-url", "wss://relay.example.com/v1"]).validate().expect("wss url");
}

#[test]
fn no_activity_fail_policy() {
    let config = parse(&["--no-activity-policy", "fail"]);
    config.validate().expect("fail policy is valid");
    assert!(config.no_activity_fails());
}

#[test]
fn auto_approve_flag_overrides_default() {
    let config = parse(&["--auto-approve", "false"]);
    assert!(!config.effective_auto_approve());
}
