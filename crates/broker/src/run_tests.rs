// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::lock::AlreadyRunning;
use crate::state::{PersistedDelivery, PersistedWorker};
use crate::worker::WorkerSpec;

fn config_in(dir: &std::path::Path) -> Config {
    Config::parse_from([
        "agent-relay",
        "--project-dir",
        dir.to_str().expect("utf8 path"),
        "--log-level",
        "error",
        "--release-grace-ms",
        "1000",
    ])
}

#[tokio::test]
async fn second_broker_in_same_project_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");

    let first = prepare(config_in(dir.path())).await.expect("first prepare");
    let second = prepare(config_in(dir.path())).await;
    let err = second.err().expect("second prepare must fail");
    assert!(err.downcast_ref::<AlreadyRunning>().is_some());

    drop(first);
    prepare(config_in(dir.path())).await.expect("lock released on drop");
}

#[tokio::test(flavor = "multi_thread")]
async fn broker_serves_stdio_and_exits_zero_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = prepare(config_in(dir.path())).await.expect("prepare");

    let (mut to_broker, broker_in) = tokio::io::duplex(64 * 1024);
    let (broker_out, from_broker) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(broker.run(broker_in, broker_out));

    let mut lines = BufReader::new(from_broker).lines();
    let hello = lines.next_line().await.expect("read").expect("hello frame");
    let hello: serde_json::Value = serde_json::from_str(&hello).expect("json");
    assert_eq!(hello["kind"], "hello_ack");

    to_broker
        .write_all(b"{\"id\":\"r1\",\"kind\":\"shutdown\"}\n")
        .await
        .expect("send shutdown");

    // The reply arrives before the stream ends.
    let mut saw_reply = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let frame: serde_json::Value = serde_json::from_str(&line).expect("json");
        if frame.get("id").and_then(|v| v.as_str()) == Some("r1") {
            assert_eq!(frame["kind"], "ok");
            saw_reply = true;
        }
    }
    assert!(saw_reply, "shutdown must be acknowledged");

    let result = handle.await.expect("join").expect("run");
    assert_eq!(result.exit_code, 0);

    // Clean shutdown leaves a committed (empty) state file behind.
    let state = crate::state::load(&dir.path().join(".agent-relay/broker.state.json"));
    assert!(state.workers.is_empty());
    assert!(state.pending_deliveries.is_empty());
}

#[tokio::test]
async fn prepare_recovers_persisted_pending_deliveries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config_in(dir.path());

    let spec = WorkerSpec {
        name: "W".to_owned(),
        cli: "claude".to_owned(),
        args: vec![],
        task: None,
        channels: vec![],
        model: None,
        cwd: None,
        team: None,
        shadow_of: None,
        shadow_mode: None,
    };
    crate::state::save(
        &config.state_path(),
        &PersistedState {
            version: STATE_VERSION,
            workers: vec![PersistedWorker {
                name: "W".to_owned(),
                pid: 0x7fff_fffe, // long dead
                cli: "claude".to_owned(),
                spec,
                spawned_at_unix_ms: 1,
            }],
            pending_deliveries: vec![PersistedDelivery {
                delivery_id: "d_1".to_owned(),
                event_id: "sdk_1".to_owned(),
                worker_name: "W".to_owned(),
                formatted_text: "Relay message from H [sdk_1]: resume".to_owned(),
                attempt: 0,
                state: crate::delivery::DeliveryState::Queued,
                created_at: 1,
            }],
        },
    )
    .expect("seed state");

    let broker = prepare(config).await.expect("prepare");

    // Dead PID is dropped; its delivery waits for a respawn.
    assert_eq!(broker.ctx.registry.unadopted_count().await, 0);
    assert_eq!(broker.ctx.engine.orphan_count(), 1);
}
