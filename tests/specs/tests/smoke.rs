// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `agent-relay` binary and drive
//! the stdio protocol with stub CLIs (`cat`, `sh`) standing in for agents.

use std::time::Duration;

use agent_relay_specs::{broker_binary, BrokerProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn hello_ack_greets_the_client() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&[]).await?;

    let hello = broker.next_frame(TIMEOUT).await?;
    assert_eq!(hello["kind"], "hello_ack");
    assert!(hello["payload"]["version"].is_string());

    Ok(())
}

#[tokio::test]
async fn spawn_lists_and_releases_a_worker() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&[]).await?;
    broker.next_frame(TIMEOUT).await?; // hello_ack

    let spawned = broker
        .request_ok("spawn", serde_json::json!({ "name": "W", "cli": "cat" }))
        .await?;
    assert_eq!(spawned["name"], "W");
    assert!(spawned["pid"].as_u64().unwrap_or(0) > 0);

    let agents = broker.request_ok("list_agents", serde_json::json!({})).await?;
    let names: Vec<&str> = agents["agents"]
        .as_array()
        .map(|a| a.iter().filter_map(|w| w["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["W"]);

    // spawn → release → spawn with the same name succeeds.
    let released = broker.request_ok("release", serde_json::json!({ "name": "W" })).await?;
    assert_eq!(released["released"], true);
    broker.event_of_kind("agent_exited", TIMEOUT).await?;

    broker.request_ok("spawn", serde_json::json!({ "name": "W", "cli": "cat" })).await?;

    // Releasing an unknown name is an idempotent no-op.
    let noop = broker.request_ok("release", serde_json::json!({ "name": "ghost" })).await?;
    assert_eq!(noop["released"], false);

    broker.request_ok("shutdown", serde_json::json!({})).await?;
    let status = broker.wait_exit(TIMEOUT).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn local_send_is_verified_against_the_echo() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&["--activity-window-ms", "500"]).await?;
    broker.next_frame(TIMEOUT).await?; // hello_ack

    broker.request_ok("spawn", serde_json::json!({ "name": "W", "cli": "cat" })).await?;
    broker.event_of_kind("agent_ready", TIMEOUT).await?;

    let sent = broker
        .request_ok(
            "send_message",
            serde_json::json!({ "to": "W", "text": "ping", "from": "H" }),
        )
        .await?;
    let event_id = sent["event_id"].as_str().unwrap_or_default().to_owned();
    assert!(event_id.starts_with("sdk_"));
    assert_eq!(sent["targets"], serde_json::json!(["W"]));

    let queued = broker.event_of_kind("delivery_queued", TIMEOUT).await?;
    assert_eq!(queued["payload"]["event_id"], event_id.as_str());

    let injected = broker.event_of_kind("delivery_injected", TIMEOUT).await?;
    assert_eq!(injected["payload"]["attempt"], 0);

    let verified = broker.event_of_kind("delivery_verified", TIMEOUT).await?;
    assert_eq!(verified["payload"]["event_id"], event_id.as_str());
    assert_eq!(verified["payload"]["worker_name"], "W");

    broker.event_of_kind("delivery_active", TIMEOUT).await?;

    // Metrics saw the whole lifecycle.
    let metrics =
        broker.request_ok("get_metrics", serde_json::json!({ "agent": "W" })).await?;
    let m = &metrics["metrics"][0];
    assert_eq!(m["queued"], 1);
    assert_eq!(m["verified"], 1);

    broker.request_ok("shutdown", serde_json::json!({})).await?;
    broker.wait_exit(TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
async fn injections_stay_within_the_attempt_cap() -> anyhow::Result<()> {
    // A PTY with echo disabled and a sleeping child: nothing ever comes
    // back, so every attempt times out.
    let mut broker = BrokerProcess::start(&["--verify-window-ms", "300"]).await?;
    broker.next_frame(TIMEOUT).await?;

    broker
        .request_ok(
            "spawn",
            serde_json::json!({
                "name": "Mute",
                "cli": "sh",
                "args": ["-c", "stty -echo; sleep 60"],
            }),
        )
        .await?;

    broker
        .request_ok(
            "send_message",
            serde_json::json!({ "to": "Mute", "text": "anyone there", "from": "H" }),
        )
        .await?;

    let mut injected = 0;
    loop {
        let frame = broker.next_frame(TIMEOUT).await?;
        match frame["kind"].as_str() {
            Some("delivery_injected") => injected += 1,
            Some("delivery_failed") => {
                assert_eq!(frame["payload"]["reason"], "verification_timeout");
                break;
            }
            Some("delivery_verified") => anyhow::bail!("echo-less PTY must not verify"),
            _ => {}
        }
    }
    assert_eq!(injected, 3, "attempts are capped");

    broker.request_ok("shutdown", serde_json::json!({})).await?;
    broker.wait_exit(TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
async fn channel_send_fans_out_to_members() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&[]).await?;
    broker.next_frame(TIMEOUT).await?;

    for (name, channels) in [("A", vec!["dev"]), ("B", vec!["dev"]), ("C", vec![])] {
        broker
            .request_ok(
                "spawn",
                serde_json::json!({ "name": name, "cli": "cat", "channels": channels }),
            )
            .await?;
    }

    let sent = broker
        .request_ok(
            "send_message",
            serde_json::json!({ "to": "#dev", "text": "standup", "from": "Lead" }),
        )
        .await?;
    assert_eq!(sent["targets"], serde_json::json!(["A", "B"]));

    // One verification per member, none for the outsider.
    let mut verified = std::collections::HashSet::new();
    while verified.len() < 2 {
        let frame = broker.event_of_kind("delivery_verified", TIMEOUT).await?;
        let worker = frame["payload"]["worker_name"].as_str().unwrap_or_default().to_owned();
        assert_ne!(worker, "C");
        verified.insert(worker);
    }

    // Unknown channels are an error.
    let reply = broker
        .request(
            "send_message",
            serde_json::json!({ "to": "#nope", "text": "x", "from": "Lead" }),
        )
        .await?;
    assert_eq!(reply["payload"]["code"], "not_found");

    broker.request_ok("shutdown", serde_json::json!({})).await?;
    broker.wait_exit(TIMEOUT).await?;
    Ok(())
}

#[tokio::test]
async fn second_broker_exits_one_within_a_second() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&[]).await?;
    broker.next_frame(TIMEOUT).await?;

    let started = std::time::Instant::now();
    let status = std::process::Command::new(broker_binary())
        .args([
            "--project-dir",
            &broker.project_dir().to_string_lossy(),
            "--log-level",
            "error",
        ])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;

    assert_eq!(status.code(), Some(1));
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_workers_and_pending_deliveries() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&["--verify-window-ms", "5000"]).await?;
    broker.next_frame(TIMEOUT).await?;

    for name in ["A", "B"] {
        broker
            .request_ok(
                "spawn",
                serde_json::json!({
                    "name": name,
                    "cli": "sh",
                    "args": ["-c", "stty -echo; sleep 60"],
                }),
            )
            .await?;
    }

    // Two deliveries per worker, none of which can verify.
    for name in ["A", "B"] {
        for n in 0..2 {
            broker
                .request_ok(
                    "send_message",
                    serde_json::json!({ "to": name, "text": format!("m{n}"), "from": "H" }),
                )
                .await?;
        }
    }

    broker.request_ok("shutdown", serde_json::json!({})).await?;

    let mut cancelled = 0;
    let mut exited = 0;
    while cancelled < 4 || exited < 2 {
        let frame = broker.next_frame(TIMEOUT).await?;
        match frame["kind"].as_str() {
            Some("delivery_failed") if frame["payload"]["reason"] == "cancelled" => {
                cancelled += 1;
            }
            Some("agent_exited") => exited += 1,
            _ => {}
        }
    }

    let status = broker.wait_exit(TIMEOUT).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn crash_recovery_reattaches_surviving_workers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let worker_pid = {
        let mut broker = BrokerProcess::start_in(dir.path(), &[]).await?;
        broker.next_frame(TIMEOUT).await?;

        // The stand-in agent ignores SIGHUP so it outlives the dying
        // broker's PTY master.
        let spawned = broker
            .request_ok(
                "spawn",
                serde_json::json!({
                    "name": "Survivor",
                    "cli": "sh",
                    "args": ["-c", "trap '' HUP; sleep 60"],
                }),
            )
            .await?;
        let pid = spawned["pid"].as_u64().unwrap_or(0);
        assert!(pid > 0);

        // Let the persister commit the spawn before the crash.
        let status = broker.request_ok("get_status", serde_json::json!({})).await?;
        assert_eq!(status["workers"][0]["name"], "Survivor");
        tokio::time::sleep(Duration::from_millis(300)).await;

        broker.kill().await?;
        pid
    };

    // The worker runs in its own session and survives the broker's death.
    let mut broker = BrokerProcess::start_in(dir.path(), &[]).await?;
    broker.next_frame(TIMEOUT).await?;

    let agents = broker.request_ok("list_agents", serde_json::json!({})).await?;
    let survivor = &agents["agents"][0];
    assert_eq!(survivor["name"], "Survivor");
    assert_eq!(survivor["state"], "unadopted");
    assert_eq!(survivor["adopted"], false);
    assert_eq!(survivor["pid"].as_u64().unwrap_or(0), worker_pid);

    // Unadopted workers refuse injections until respawned.
    let reply = broker
        .request(
            "send_message",
            serde_json::json!({ "to": "Survivor", "text": "hi", "from": "H" }),
        )
        .await?;
    assert_eq!(reply["kind"], "err");
    assert_eq!(reply["payload"]["code"], "worker_exited");

    broker.request_ok("release", serde_json::json!({ "name": "Survivor" })).await?;
    broker.request_ok("shutdown", serde_json::json!({})).await?;
    broker.wait_exit(TIMEOUT).await?;

    // Clean up the orphaned sleep.
    let _ = std::process::Command::new("kill").arg(worker_pid.to_string()).status();
    Ok(())
}

#[tokio::test]
async fn draining_broker_rejects_new_requests() -> anyhow::Result<()> {
    let mut broker = BrokerProcess::start(&[]).await?;
    broker.next_frame(TIMEOUT).await?;

    broker.request_ok("shutdown", serde_json::json!({})).await?;
    // The broker exits shortly after; any request racing the drain gets a
    // cancelled error rather than silence.
    if let Ok(reply) = broker.request("list_agents", serde_json::json!({})).await {
        assert_eq!(reply["payload"]["code"], "cancelled");
    }

    let status = broker.wait_exit(TIMEOUT).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}
