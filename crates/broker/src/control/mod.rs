// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control plane: framed JSON-over-stdio server for SDK clients.
//!
//! stdout carries protocol frames exclusively (logs go to stderr). A single
//! writer task serializes all output: request replies from per-request
//! handler tasks and server-pushed events from the broker event stream.

pub mod protocol;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::delivery::DeliveryEngine;
use crate::error::{ErrorCode, WireError};
use crate::event::BrokerEvent;
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;
use crate::router::Router;
use crate::worker::WorkerSpec;

use protocol::{
    err_frame, err_frame_parts, event_frame, ok_frame, parse_payload, parse_request,
    GetMetricsPayload, ReleasePayload, RequestFrame, SendInputPayload, SendMessagePayload,
    SetModelPayload,
};

/// Capabilities advertised in `hello_ack`.
const CAPABILITIES: [&str; 5] =
    ["spawn", "send_message", "channels", "metrics", "crash_recovery"];

/// Everything request handlers need, wired once by the supervisor.
pub struct BrokerCtx {
    pub config: Arc<Config>,
    pub registry: Arc<WorkerRegistry>,
    pub engine: Arc<DeliveryEngine>,
    pub router: Arc<Router>,
    pub metrics: Arc<Metrics>,
    pub events: broadcast::Sender<BrokerEvent>,
    /// Requests the graceful drain (shutdown request, signal, stdin EOF).
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

pub struct ControlPlane {
    ctx: Arc<BrokerCtx>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<BrokerCtx>) -> Self {
        Self { ctx }
    }

    /// Serve the stdio protocol until `terminate` fires.
    ///
    /// `shutdown` (on the ctx) only stops intake of new work; the event
    /// stream keeps flowing so drain receipts reach the client. The
    /// supervisor fires `terminate` once the drain is complete.
    pub async fn run<R, W>(
        &self,
        reader: R,
        writer: W,
        terminate: CancellationToken,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<String>(1024);

        let writer_handle = tokio::spawn(write_loop(writer, out_rx));

        // Event pump: broker events → client frames.
        {
            let mut events_rx = self.ctx.events.subscribe();
            let out_tx = out_tx.clone();
            let terminate = terminate.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = terminate.cancelled() => return,
                        event = events_rx.recv() => match event {
                            Ok(event) => {
                                if out_tx.send(event_frame(&event)).await.is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("event pump lagged {n} events");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });
        }

        let _ = out_tx
            .send(event_frame(&BrokerEvent::HelloAck {
                version: env!("CARGO_PKG_VERSION").to_owned(),
                capabilities: CAPABILITIES.iter().map(|c| (*c).to_owned()).collect(),
            }))
            .await;

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = terminate.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    // Client went away: drain and let the supervisor finish.
                    debug!("control stdin closed, requesting shutdown");
                    self.ctx.shutdown.cancel();
                    terminate.cancelled().await;
                    break;
                }
                Err(e) => {
                    warn!("control read error: {e}");
                    self.ctx.shutdown.cancel();
                    terminate.cancelled().await;
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let frame = match parse_request(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    // Best effort: salvage the id so the client can correlate.
                    let id = serde_json::from_str::<serde_json::Value>(&line)
                        .ok()
                        .and_then(|v| v.get("id").and_then(|i| i.as_str()).map(String::from))
                        .unwrap_or_default();
                    let _ = out_tx.send(err_frame(&id, &e)).await;
                    continue;
                }
            };

            // Drain mode: replies only, no new work.
            if self.ctx.shutdown.is_cancelled() && frame.kind != "shutdown" {
                let _ = out_tx
                    .send(err_frame_parts(&frame.id, ErrorCode::Cancelled, "broker is draining"))
                    .await;
                continue;
            }

            let ctx = Arc::clone(&self.ctx);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                dispatch(ctx, frame, out_tx).await;
            });
        }

        drop(out_tx);
        let _ = writer_handle.await;
        Ok(())
    }
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = out_rx.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err() {
            return;
        }
        if writer.write_all(b"\n").await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

async fn dispatch(ctx: Arc<BrokerCtx>, frame: RequestFrame, out_tx: mpsc::Sender<String>) {
    let id = frame.id.clone();
    let is_shutdown = frame.kind == "shutdown";

    let reply = match handle(&ctx, frame).await {
        Ok(payload) => ok_frame(&id, payload),
        Err(e) => err_frame(&id, &e),
    };
    let _ = out_tx.send(reply).await;

    // The reply is queued ahead of the drain receipts; cancel after.
    if is_shutdown {
        ctx.shutdown.cancel();
    }
}

async fn handle(
    ctx: &Arc<BrokerCtx>,
    frame: RequestFrame,
) -> Result<serde_json::Value, WireError> {
    match frame.kind.as_str() {
        "spawn" => {
            let spec: WorkerSpec = parse_payload(&frame)?;
            let worker = ctx.registry.spawn(spec).await?;
            let recovered = ctx.engine.adopt_orphans(&worker.port());
            Ok(serde_json::json!({
                "name": worker.spec.name,
                "pid": worker.pid,
                "cli": worker.spec.cli,
                "recovered_deliveries": recovered,
            }))
        }

        "send_message" => {
            let payload: SendMessagePayload = parse_payload(&frame)?;
            if payload.text.is_empty() {
                return Err(WireError::invalid("text must not be empty"));
            }
            if payload.from.is_empty() {
                return Err(WireError::invalid("from must not be empty"));
            }
            let outcome = ctx
                .router
                .send_message(
                    &payload.to,
                    &payload.text,
                    &payload.from,
                    payload.thread_id,
                    payload.priority,
                )
                .await?;
            Ok(serde_json::json!({
                "event_id": outcome.event_id,
                "targets": outcome.targets,
            }))
        }

        "send_input" => {
            let payload: SendInputPayload = parse_payload(&frame)?;
            let worker = ctx
                .registry
                .get(&payload.name)
                .await
                .ok_or_else(|| WireError::not_found(&payload.name))?;
            worker.write_raw(Bytes::from(payload.data.into_bytes())).await?;
            Ok(serde_json::json!({}))
        }

        "release" => {
            let payload: ReleasePayload = parse_payload(&frame)?;
            ctx.engine.cancel_worker(&payload.name, crate::delivery::FailReason::Cancelled);
            let released = ctx.registry.release(&payload.name, payload.reason).await;
            Ok(serde_json::json!({ "released": released }))
        }

        "list_agents" => {
            let agents = ctx.registry.list().await;
            Ok(serde_json::json!({ "agents": agents }))
        }

        "get_status" => {
            let agents = ctx.registry.list().await;
            let mut workers = Vec::with_capacity(agents.len());
            for agent in &agents {
                workers.push(serde_json::json!({
                    "name": agent.name,
                    "cli": agent.cli,
                    "state": agent.state,
                    "pid": agent.pid,
                    "pending": ctx.engine.pending_count(&agent.name),
                }));
            }
            Ok(serde_json::json!({
                "pid": std::process::id(),
                "uptime_ms": ctx.started_at.elapsed().as_millis() as u64,
                "relay": ctx.router.relay_state(),
                "workers": workers,
                "unadopted": ctx.registry.unadopted_count().await,
                "recovered_pending": ctx.engine.orphan_count(),
            }))
        }

        "set_model" => {
            let payload: SetModelPayload = parse_payload(&frame)?;
            let worker = ctx
                .registry
                .get(&payload.name)
                .await
                .ok_or_else(|| WireError::not_found(&payload.name))?;

            let command = worker.profile().model_command(&payload.model).ok_or_else(|| {
                WireError::new(
                    ErrorCode::UnsupportedOperation,
                    format!("{} has no model switch", worker.spec.cli),
                )
            })?;

            let steps = worker.profile().injection_steps(&command);
            let timeout =
                std::time::Duration::from_millis(payload.timeout_ms.unwrap_or(5000));
            tokio::time::timeout(timeout, worker.port().write_steps(&steps))
                .await
                .map_err(|_| {
                    WireError::new(ErrorCode::Internal, "model command write timed out")
                })??;
            worker.set_model_name(&payload.model);
            Ok(serde_json::json!({ "name": payload.name, "model": payload.model }))
        }

        "get_metrics" => {
            let payload: GetMetricsPayload = if frame.payload.is_null() {
                GetMetricsPayload::default()
            } else {
                parse_payload(&frame)?
            };
            let mut snapshots = match payload.agent {
                Some(name) => {
                    if ctx.registry.get(&name).await.is_some() {
                        // A live worker always has a (possibly zeroed) row.
                        let _ = ctx.metrics.for_worker(&name);
                    }
                    let snapshot = ctx
                        .metrics
                        .snapshot_one(&name)
                        .ok_or_else(|| WireError::not_found(&name))?;
                    vec![snapshot]
                }
                None => ctx.metrics.snapshot_all(),
            };
            // Output volume and activity live on the worker itself.
            for snapshot in &mut snapshots {
                if let Some(worker) = ctx.registry.get(&snapshot.worker).await {
                    snapshot.output_bytes = worker.output_bytes();
                    snapshot.last_activity_ms =
                        worker.last_activity_ms.load(std::sync::atomic::Ordering::Relaxed);
                }
            }
            Ok(serde_json::json!({ "metrics": snapshots }))
        }

        "shutdown" => Ok(serde_json::json!({ "stopping": true })),

        other => Err(WireError::new(
            ErrorCode::UnsupportedOperation,
            format!("unknown request kind: {other}"),
        )),
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
