// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level broker runner — shared by `main` and the end-to-end tests.
//!
//! Construction order: lock → persisted state → registry → dedup → engine →
//! router → relay link → persister → control plane. Teardown runs in
//! reverse on shutdown: stop intake, drain deliveries, release workers,
//! final state save, then stop the control plane.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::control::{BrokerCtx, ControlPlane};
use crate::dedup::DedupCache;
use crate::delivery::{DeliveryEngine, EngineSettings, FailReason};
use crate::lock::SingletonGuard;
use crate::metrics::Metrics;
use crate::registry::WorkerRegistry;
use crate::relaycast::{LinkSettings, RelaycastLink};
use crate::router::Router;
use crate::state::{self, PersistedState, Persister, SnapshotFn, STATE_VERSION};

pub struct RunResult {
    pub exit_code: i32,
}

/// A fully-wired broker ready to serve its control plane.
pub struct PreparedBroker {
    pub ctx: Arc<BrokerCtx>,
    terminate: CancellationToken,
    persist_stop: CancellationToken,
    persist_tx: mpsc::Sender<()>,
    persister_handle: JoinHandle<()>,
    // Held for the broker's lifetime; the advisory lock dies with it.
    _lock: SingletonGuard,
}

/// Initialize tracing from config. Logs go to stderr — stdout belongs to
/// the stdio protocol. `try_init` so tests may call this repeatedly.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / AGENT_RELAY_LOG_LEVEL > RUST_LOG > "info".
    let filter = if std::env::var("AGENT_RELAY_LOG_LEVEL").is_err() && config.log_level == "info"
    {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Run a broker to completion on real stdio.
pub async fn run(config: Config) -> anyhow::Result<RunResult> {
    let broker = prepare(config).await?;
    broker.run(tokio::io::stdin(), tokio::io::stdout()).await
}

/// Wire the broker: acquire the singleton lock, recover persisted state,
/// and construct every service in dependency order.
pub async fn prepare(config: Config) -> anyhow::Result<PreparedBroker> {
    init_tracing(&config);
    let config = Arc::new(config);

    // 1. One broker per project directory.
    let lock = SingletonGuard::acquire(&config.lock_path())?;
    info!(lock = %lock.path().display(), "broker lock acquired");

    // 2. Crash-recovery state.
    let persisted = state::load(&config.state_path());

    // 3. Core channels and services.
    let (events, _) = broadcast::channel(1024);
    let (persist_tx, persist_rx) = mpsc::channel(256);
    let shutdown = CancellationToken::new();

    let registry = WorkerRegistry::new(
        Arc::clone(&config),
        events.clone(),
        persist_tx.clone(),
        shutdown.clone(),
    );
    let metrics = Arc::new(Metrics::new());
    let engine = DeliveryEngine::new(
        EngineSettings::from_config(&config),
        events.clone(),
        Arc::clone(&metrics),
        persist_tx.clone(),
    );
    let dedup = Arc::new(DedupCache::new(config.dedup_capacity, config.dedup_ttl()));

    // 4. Reattach surviving workers; stash their pending deliveries.
    let kept = registry.reattach(persisted.workers).await;
    if kept > 0 {
        info!(workers = kept, "recovered workers from previous run (unadopted)");
    }
    if !persisted.pending_deliveries.is_empty() {
        info!(
            deliveries = persisted.pending_deliveries.len(),
            "recovered pending deliveries; requeued when their workers respawn"
        );
        engine.set_orphans(persisted.pending_deliveries);
    }

    // 5. Cloud link (optional) and router.
    let relay = config.relay_url.as_ref().map(|url| {
        RelaycastLink::new(
            LinkSettings {
                url: url.clone(),
                handshake_timeout: config.ws_handshake_timeout(),
                publish_min_gap: config.publish_min_gap(),
                queue_cap: config.publish_queue_cap,
            },
            events.clone(),
        )
    });
    let router = Router::new(
        Arc::clone(&registry),
        Arc::clone(&engine),
        dedup,
        relay.clone(),
        events.clone(),
    );

    if let Some(relay) = relay {
        let router = Arc::clone(&router);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            relay.run(router, shutdown).await;
        });
    }

    // 6. Persistence task.
    let persist_stop = CancellationToken::new();
    let snapshot_fn: SnapshotFn = {
        let registry = Arc::clone(&registry);
        let engine = Arc::clone(&engine);
        Arc::new(move || {
            let registry = Arc::clone(&registry);
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                PersistedState {
                    version: STATE_VERSION,
                    workers: registry.persist_snapshot().await,
                    pending_deliveries: engine.pending_snapshot(),
                }
            })
        })
    };
    let persister_handle = tokio::spawn(
        Persister::new(
            persist_rx,
            snapshot_fn,
            config.state_path(),
            config.pending_path(),
        )
        .run(persist_stop.clone()),
    );

    // 7. OS signals request the same graceful drain as a shutdown frame.
    spawn_signal_handler(shutdown.clone());

    let ctx = Arc::new(BrokerCtx {
        config,
        registry,
        engine,
        router,
        metrics,
        events,
        shutdown,
        started_at: Instant::now(),
    });

    Ok(PreparedBroker {
        ctx,
        terminate: CancellationToken::new(),
        persist_stop,
        persist_tx,
        persister_handle,
        _lock: lock,
    })
}

impl PreparedBroker {
    /// Serve the control plane until shutdown, then drain and exit cleanly.
    pub async fn run<R, W>(self, reader: R, writer: W) -> anyhow::Result<RunResult>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let control_handle = {
            let ctx = Arc::clone(&self.ctx);
            let terminate = self.terminate.clone();
            tokio::spawn(async move {
                let plane = ControlPlane::new(ctx);
                if let Err(e) = plane.run(reader, writer, terminate).await {
                    warn!("control plane error: {e:#}");
                }
            })
        };

        // Serve until a shutdown request, signal, or client disconnect.
        self.ctx.shutdown.cancelled().await;
        info!("shutdown requested, draining");

        // Drain: cancel pending deliveries, release workers. Receipts and
        // exit events still flow to the client while this runs.
        self.ctx.engine.cancel_all(FailReason::Cancelled);
        self.ctx.registry.release_all(Some("shutdown".to_owned())).await;

        // Final state snapshot reflects the drained broker.
        let _ = self.persist_tx.try_send(());
        self.persist_stop.cancel();
        let _ = self.persister_handle.await;

        // Give the writer a beat to flush trailing receipts, then stop the
        // control plane.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.terminate.cancel();
        let _ = control_handle.await;

        info!("broker stopped");
        Ok(RunResult { exit_code: 0 })
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGINT handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = int.recv() => info!("SIGINT received"),
        }
        shutdown.cancel();
    });
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
