// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use clap::Parser;

fn test_config() -> Config {
    Config::parse_from(["agent-relay"])
}

fn spec(name: &str, cli: &str) -> WorkerSpec {
    WorkerSpec {
        name: name.to_owned(),
        cli: cli.to_owned(),
        args: vec![],
        task: None,
        channels: vec![],
        model: None,
        cwd: None,
        team: None,
        shadow_of: None,
        shadow_mode: None,
    }
}

#[test]
fn spec_validation_accepts_reasonable_names() {
    for name in ["Worker1", "lead", "a", "dev-2", "x.y_z"] {
        spec(name, "claude").validate().expect("valid name");
    }
}

#[yare::parameterized(
    empty = { "" },
    leading_dash = { "-worker" },
    spaces = { "two words" },
    hash = { "#channel" },
)]
fn spec_validation_rejects_bad_names(name: &str) {
    let err = spec(name, "claude").validate().err().expect("must reject");
    assert_eq!(err.code, crate::error::ErrorCode::InvalidPayload);
}

#[test]
fn spec_validation_rejects_overlong_names() {
    let name = "x".repeat(65);
    assert!(spec(&name, "claude").validate().is_err());
    let name = "x".repeat(64);
    spec(&name, "claude").validate().expect("64 chars is the limit");
}

#[test]
fn spec_validation_rejects_empty_cli() {
    let err = spec("w", "  ").validate().err().expect("must reject");
    assert_eq!(err.code, crate::error::ErrorCode::InvalidPayload);
}

#[test]
fn spec_validation_rejects_hash_prefixed_channels() {
    let mut s = spec("w", "claude");
    s.channels = vec!["#general".to_owned()];
    assert!(s.validate().is_err());
}

#[test]
fn spec_serde_defaults_optional_fields() {
    let json = r#"{"name":"W","cli":"claude"}"#;
    let s: WorkerSpec = serde_json::from_str(json).expect("deserialize");
    assert_eq!(s.name, "W");
    assert!(s.args.is_empty());
    assert!(s.channels.is_empty());
    assert!(s.shadow_of.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn spawned_cat_echoes_input() {
    let config = test_config();
    let cancel = CancellationToken::new();
    let worker = PtyWorker::spawn(spec("echoer", "cat"), &config, &cancel)
        .expect("spawn cat under pty");

    let mut rx = worker.subscribe();
    worker.write_raw(Bytes::from_static(b"pty-roundtrip\r")).await.expect("write");

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut seen = String::new();
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("echo before deadline")
            .expect("worker events open");
        if let WorkerEvent::Output(chunk) = event {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("pty-roundtrip") {
                break;
            }
        }
    }

    assert!(worker.tail_string().contains("pty-roundtrip"));
    assert!(worker.is_ready(), "generic profile is ready after first output");

    worker.signal(nix::sys::signal::Signal::SIGKILL);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if worker.is_exited() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker must exit after SIGKILL");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(worker.exit_status().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn press_enter_prompt_is_answered_locally() {
    let config = test_config();
    let cancel = CancellationToken::new();

    // A stand-in CLI that blocks on a prompt until enter is pressed.
    let mut s = spec("prompter", "sh");
    s.args = vec![
        "-c".to_owned(),
        "echo 'Press enter to continue'; read line; echo continued-ok; sleep 1".to_owned(),
    ];
    let worker = PtyWorker::spawn(s, &config, &cancel).expect("spawn prompter");

    let mut rx = worker.subscribe();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut seen = String::new();
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("prompt answered before deadline")
            .expect("worker events open");
        if let WorkerEvent::Output(chunk) = event {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("continued-ok") {
                break;
            }
        }
    }

    worker.signal(nix::sys::signal::Signal::SIGKILL);
}

#[tokio::test(flavor = "multi_thread")]
async fn exited_worker_rejects_raw_input() {
    let config = test_config();
    let cancel = CancellationToken::new();
    let worker =
        PtyWorker::spawn(spec("short", "true"), &config, &cancel).expect("spawn true");

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !worker.is_exited() {
        assert!(tokio::time::Instant::now() < deadline, "true exits quickly");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let err = worker.write_raw(Bytes::from_static(b"x")).await.err().expect("must reject");
    assert_eq!(err.code, crate::error::ErrorCode::WorkerExited);
}
