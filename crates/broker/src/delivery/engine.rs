// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delivery engine: one queue task per worker driving the state machine
//!
//! ```text
//! Queued → Injected → Verified → Active
//!             ↺ retry (attempt+1, throttle backoff)   ↘ Failed{reason}
//! ```
//!
//! Per-worker ordering is strict FIFO modulo an explicit priority bump.
//! Receipts for every transition stream out on the broker event channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorCode, WireError};
use crate::event::{BrokerEvent, Receipt};
use crate::metrics::{Metrics, WorkerMetrics};
use crate::state::PersistedDelivery;
use crate::throttle::{Outcome, Throttle, ThrottleConfig};
use crate::verify::{VerifyWindow, DEFAULT_WINDOW_CAP};
use crate::worker::{WorkerEvent, WorkerPort};

use super::{Delivery, DeliveryState, FailReason};

/// Engine tuning, resolved from [`Config`] at startup.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub verify_window: Duration,
    pub activity_window: Duration,
    pub max_attempts: u32,
    pub queue_cap: usize,
    pub throttle: ThrottleConfig,
    pub no_activity_fails: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            verify_window: config.verify_window(),
            activity_window: config.activity_window(),
            max_attempts: config.max_attempts,
            queue_cap: config.queue_cap,
            throttle: config.throttle(),
            no_activity_fails: config.no_activity_fails(),
        }
    }
}

/// Shared state between the engine facade and one worker's queue task.
struct QueueState {
    pending: Mutex<VecDeque<Delivery>>,
    in_flight: Mutex<Option<Delivery>>,
    notify: Notify,
    cancel: CancellationToken,
    /// Reason applied to drained deliveries when `cancel` fires.
    fail_reason: Mutex<FailReason>,
}

impl QueueState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(None),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            fail_reason: Mutex::new(FailReason::Cancelled),
        })
    }
}

type QueueMap = Arc<Mutex<HashMap<String, Arc<QueueState>>>>;

/// Queue + state machine for all deliveries. Holds worker *names* only and
/// talks to workers through their narrow [`WorkerPort`] seam.
pub struct DeliveryEngine {
    settings: EngineSettings,
    queues: QueueMap,
    events: broadcast::Sender<BrokerEvent>,
    metrics: Arc<Metrics>,
    persist_tx: mpsc::Sender<()>,
    /// Persisted deliveries recovered at startup whose worker has not been
    /// respawned yet.
    orphans: Mutex<Vec<PersistedDelivery>>,
}

impl DeliveryEngine {
    pub fn new(
        settings: EngineSettings,
        events: broadcast::Sender<BrokerEvent>,
        metrics: Arc<Metrics>,
        persist_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            queues: Arc::new(Mutex::new(HashMap::new())),
            events,
            metrics,
            persist_tx,
            orphans: Mutex::new(Vec::new()),
        })
    }

    /// Queue one delivery for the worker behind `port`.
    ///
    /// Emits `delivery_queued` on success. Fails fast with `queue_full` or
    /// `worker_exited`; both leave the queue untouched.
    pub fn enqueue(&self, port: &WorkerPort, mut delivery: Delivery) -> Result<(), WireError> {
        if port.exited.load(Ordering::Acquire) {
            return Err(WireError::new(
                ErrorCode::WorkerExited,
                format!("{} has exited", port.name),
            ));
        }

        let state = self.queue_for(port);
        let delivery_id = delivery.delivery_id.clone();

        {
            let mut pending = state.pending.lock();
            if pending.len() >= self.settings.queue_cap {
                return Err(WireError::new(
                    ErrorCode::QueueFull,
                    format!("{} has {} pending deliveries", port.name, pending.len()),
                ));
            }

            delivery.state = DeliveryState::Queued;
            let receipt = Receipt::now(&delivery.delivery_id, &delivery.event_id, &port.name);

            // Priority bias: ahead of strictly-lower priorities, FIFO within
            // the same priority. Never preempts the in-flight injection.
            let pos = pending
                .iter()
                .position(|d| d.priority < delivery.priority)
                .unwrap_or(pending.len());
            pending.insert(pos, delivery);

            let worker_metrics = self.metrics.for_worker(&port.name);
            worker_metrics.queued.fetch_add(1, Ordering::Relaxed);
            let _ = self.events.send(BrokerEvent::DeliveryQueued { receipt });
        }

        state.notify.notify_one();

        // The queue task may have drained between lookup and insert; pull
        // the delivery back out rather than stranding it.
        if state.cancel.is_cancelled() {
            let mut pending = state.pending.lock();
            if let Some(pos) = pending.iter().position(|d| d.delivery_id == delivery_id) {
                pending.remove(pos);
                return Err(WireError::new(
                    ErrorCode::WorkerExited,
                    format!("{} has exited", port.name),
                ));
            }
        }

        let _ = self.persist_tx.try_send(());
        Ok(())
    }

    /// Cancel everything queued or in flight for `name`. The queue task
    /// drains with `reason` and removes itself.
    pub fn cancel_worker(&self, name: &str, reason: FailReason) {
        let state = self.queues.lock().get(name).map(Arc::clone);
        if let Some(state) = state {
            *state.fail_reason.lock() = reason;
            state.cancel.cancel();
        }
    }

    /// Cancel all workers' deliveries (global shutdown drain).
    pub fn cancel_all(&self, reason: FailReason) {
        let states: Vec<Arc<QueueState>> =
            self.queues.lock().values().map(Arc::clone).collect();
        for state in states {
            *state.fail_reason.lock() = reason;
            state.cancel.cancel();
        }
    }

    /// Pending deliveries for one worker (queued + in flight).
    pub fn pending_count(&self, name: &str) -> usize {
        match self.queues.lock().get(name) {
            Some(state) => {
                state.pending.lock().len() + usize::from(state.in_flight.lock().is_some())
            }
            None => 0,
        }
    }

    /// Serializable snapshot of every non-terminal delivery, including
    /// recovered orphans not yet re-adopted.
    pub fn pending_snapshot(&self) -> Vec<PersistedDelivery> {
        let mut out = Vec::new();
        for (_, state) in self.queues.lock().iter() {
            if let Some(d) = state.in_flight.lock().as_ref() {
                out.push(persisted(d));
            }
            for d in state.pending.lock().iter() {
                out.push(persisted(d));
            }
        }
        out.extend(self.orphans.lock().iter().cloned());
        out
    }

    /// Stash deliveries recovered from disk whose workers are not running.
    pub fn set_orphans(&self, orphans: Vec<PersistedDelivery>) {
        *self.orphans.lock() = orphans;
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Requeue recovered deliveries for a worker respawned under the same
    /// name. Returns how many were requeued.
    pub fn adopt_orphans(&self, port: &WorkerPort) -> usize {
        let matching: Vec<PersistedDelivery> = {
            let mut orphans = self.orphans.lock();
            let (take, keep): (Vec<_>, Vec<_>) =
                orphans.drain(..).partition(|d| d.worker_name == port.name);
            *orphans = keep;
            take
        };

        let mut adopted = 0;
        for persisted in &matching {
            let delivery = Delivery::from_persisted(persisted);
            match self.enqueue(port, delivery) {
                Ok(()) => adopted += 1,
                Err(e) => {
                    warn!(worker = %port.name, "recovered delivery dropped: {e}");
                }
            }
        }
        adopted
    }

    /// Find (or start) the queue task for a worker.
    fn queue_for(&self, port: &WorkerPort) -> Arc<QueueState> {
        let mut queues = self.queues.lock();

        if let Some(existing) = queues.get(&port.name) {
            if !existing.cancel.is_cancelled() {
                return Arc::clone(existing);
            }
        }

        let state = QueueState::new();
        queues.insert(port.name.clone(), Arc::clone(&state));

        let task = QueueTask {
            name: port.name.clone(),
            state: Arc::clone(&state),
            port: port.clone(),
            settings: self.settings,
            events: self.events.clone(),
            metrics: self.metrics.for_worker(&port.name),
            persist_tx: self.persist_tx.clone(),
            queues: Arc::clone(&self.queues),
        };
        tokio::spawn(task.run());

        state
    }
}

fn persisted(d: &Delivery) -> PersistedDelivery {
    PersistedDelivery {
        delivery_id: d.delivery_id.clone(),
        event_id: d.event_id.clone(),
        worker_name: d.worker_name.clone(),
        formatted_text: d.formatted_text.clone(),
        attempt: d.attempt,
        state: d.state,
        created_at: d.created_at_ms,
    }
}

/// Why delivery processing stopped for this worker.
enum StopReason {
    /// Worker exited or its channels closed.
    WorkerGone,
    /// The queue was cancelled (release or shutdown).
    Cancelled,
}

/// Per-worker queue driver.
struct QueueTask {
    name: String,
    state: Arc<QueueState>,
    port: WorkerPort,
    settings: EngineSettings,
    events: broadcast::Sender<BrokerEvent>,
    metrics: Arc<WorkerMetrics>,
    persist_tx: mpsc::Sender<()>,
    queues: QueueMap,
}

impl QueueTask {
    async fn run(self) {
        debug!(worker = %self.name, "delivery queue started");
        let mut throttle = Throttle::new(self.settings.throttle);
        self.publish_throttle_gauges(&throttle);
        let mut lifecycle_rx = self.port.events.subscribe();

        let stop = loop {
            // Wait for the next delivery, watching for exit/cancel.
            let delivery = loop {
                if self.state.cancel.is_cancelled() {
                    break None;
                }
                if self.port.exited.load(Ordering::Acquire) {
                    break None;
                }
                let head = self.state.pending.lock().pop_front();
                if let Some(d) = head {
                    break Some(d);
                }

                tokio::select! {
                    _ = self.state.notify.notified() => {}
                    _ = self.state.cancel.cancelled() => {}
                    event = lifecycle_rx.recv() => match event {
                        Ok(WorkerEvent::Exited(_)) | Err(broadcast::error::RecvError::Closed) => {
                            break None;
                        }
                        _ => {}
                    },
                }
            };

            let Some(mut delivery) = delivery else {
                break if self.state.cancel.is_cancelled() {
                    StopReason::Cancelled
                } else {
                    StopReason::WorkerGone
                };
            };

            *self.state.in_flight.lock() = Some(delivery.clone());
            let outcome = self.process(&mut delivery, &mut throttle, &mut lifecycle_rx).await;
            *self.state.in_flight.lock() = None;
            let _ = self.persist_tx.try_send(());

            if let Some(stop) = outcome {
                break stop;
            }
        };

        self.drain(match stop {
            StopReason::WorkerGone => FailReason::WorkerExited,
            StopReason::Cancelled => *self.state.fail_reason.lock(),
        });

        // Mark this queue dead so a racing enqueue for a respawned worker
        // starts a fresh one instead of feeding a draining task.
        self.state.cancel.cancel();

        // Deregister, unless a respawn already replaced this queue.
        let mut queues = self.queues.lock();
        if let Some(current) = queues.get(&self.name) {
            if Arc::ptr_eq(current, &self.state) {
                queues.remove(&self.name);
            }
        }
        debug!(worker = %self.name, "delivery queue stopped");
    }

    /// Drive one delivery through inject → verify (→ retry). Returns
    /// `Some(stop)` when the whole queue must stop.
    async fn process(
        &self,
        delivery: &mut Delivery,
        throttle: &mut Throttle,
        lifecycle_rx: &mut broadcast::Receiver<WorkerEvent>,
    ) -> Option<StopReason> {
        loop {
            // Throttle gate.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(throttle.next_allowed_at()) => break,
                    _ = self.state.cancel.cancelled() => {
                        self.fail(delivery, *self.state.fail_reason.lock());
                        return Some(StopReason::Cancelled);
                    }
                    event = lifecycle_rx.recv() => match event {
                        Ok(WorkerEvent::Exited(_)) | Err(broadcast::error::RecvError::Closed) => {
                            self.fail(delivery, FailReason::WorkerExited);
                            return Some(StopReason::WorkerGone);
                        }
                        _ => {}
                    },
                }
            }

            // Subscribe before writing so a fast echo cannot be missed.
            let mut echo_rx = self.port.events.subscribe();

            delivery.push_state(DeliveryState::Injected);
            self.metrics.injected.fetch_add(1, Ordering::Relaxed);
            let _ = self.events.send(BrokerEvent::DeliveryInjected {
                receipt: self.receipt(delivery),
                attempt: delivery.attempt,
            });

            let steps = self.port.profile.injection_steps(&delivery.formatted_text);
            if self.port.write_steps(&steps).await.is_err() {
                self.fail(delivery, FailReason::WorkerExited);
                return Some(StopReason::WorkerGone);
            }
            throttle.mark_injection();

            // Watch for the echo within the verification window.
            let deadline = tokio::time::Instant::now() + self.settings.verify_window;
            let mut window = VerifyWindow::new(DEFAULT_WINDOW_CAP);
            let verified = loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break false,
                    _ = self.state.cancel.cancelled() => {
                        self.fail(delivery, *self.state.fail_reason.lock());
                        return Some(StopReason::Cancelled);
                    }
                    event = echo_rx.recv() => match event {
                        Ok(WorkerEvent::Output(chunk)) => {
                            window.push_chunk(&chunk);
                            if window.contains(&delivery.formatted_text) {
                                break true;
                            }
                        }
                        Ok(WorkerEvent::Exited(_)) | Err(broadcast::error::RecvError::Closed) => {
                            self.fail(delivery, FailReason::WorkerExited);
                            return Some(StopReason::WorkerGone);
                        }
                        Ok(WorkerEvent::Ready) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(worker = %self.name, "echo watch lagged {n} events");
                        }
                    },
                }
            };

            if verified {
                throttle.record(Outcome::Success);
                self.publish_throttle_gauges(throttle);

                delivery.push_state(DeliveryState::Verified);
                self.metrics.verified.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .events
                    .send(BrokerEvent::DeliveryVerified { receipt: self.receipt(delivery) });

                self.spawn_activity_watcher(delivery);
                return None;
            }

            // Echo never showed: count the timeout and either retry or fail.
            throttle.record(Outcome::Timeout);
            self.publish_throttle_gauges(throttle);

            if delivery.attempt + 1 >= self.settings.max_attempts {
                self.fail(delivery, FailReason::VerificationTimeout);
                return None;
            }

            delivery.attempt += 1;
            delivery.push_state(DeliveryState::Queued);
            debug!(
                worker = %self.name,
                delivery = %delivery.delivery_id,
                attempt = delivery.attempt,
                "verification window expired, retrying"
            );
        }
    }

    /// Post-verification activity scan, detached so the queue can move on
    /// to the next injection.
    fn spawn_activity_watcher(&self, delivery: &Delivery) {
        let port = self.port.clone();
        let receipt_base = self.receipt(delivery);
        let settings = self.settings;
        let events = self.events.clone();
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let mut rx = port.events.subscribe();
            let mut window = VerifyWindow::new(4096);
            let deadline = tokio::time::Instant::now() + settings.activity_window;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if settings.no_activity_fails {
                            metrics.failed.fetch_add(1, Ordering::Relaxed);
                            let _ = events.send(BrokerEvent::DeliveryFailed {
                                receipt: refresh(&receipt_base),
                                reason: FailReason::NoActivity.as_str().to_owned(),
                            });
                        } else {
                            // Implicit OK: no marker seen, but the injection
                            // verified; surface a warning and move on.
                            metrics.active.fetch_add(1, Ordering::Relaxed);
                            let _ = events.send(BrokerEvent::DeliveryActive {
                                receipt: refresh(&receipt_base),
                            });
                            let _ = events.send(BrokerEvent::Warning {
                                message: format!(
                                    "no activity marker from {} after delivery {}",
                                    receipt_base.worker_name, receipt_base.delivery_id
                                ),
                            });
                        }
                        return;
                    }
                    event = rx.recv() => match event {
                        Ok(WorkerEvent::Output(chunk)) => {
                            window.push_chunk(&chunk);
                            if port.profile.is_activity(&window.text()) {
                                metrics.active.fetch_add(1, Ordering::Relaxed);
                                metrics.last_activity_ms.store(
                                    crate::event::epoch_ms(),
                                    Ordering::Relaxed,
                                );
                                let _ = events.send(BrokerEvent::DeliveryActive {
                                    receipt: refresh(&receipt_base),
                                });
                                return;
                            }
                        }
                        Ok(WorkerEvent::Exited(_))
                        | Err(broadcast::error::RecvError::Closed) => {
                            metrics.failed.fetch_add(1, Ordering::Relaxed);
                            let _ = events.send(BrokerEvent::DeliveryFailed {
                                receipt: refresh(&receipt_base),
                                reason: FailReason::WorkerExited.as_str().to_owned(),
                            });
                            return;
                        }
                        _ => {}
                    },
                }
            }
        });
    }

    /// Drain all queued deliveries with a terminal failure.
    fn drain(&self, reason: FailReason) {
        let drained: Vec<Delivery> = self.state.pending.lock().drain(..).collect();
        for mut delivery in drained {
            self.fail(&mut delivery, reason);
        }
    }

    fn fail(&self, delivery: &mut Delivery, reason: FailReason) {
        delivery.push_state(DeliveryState::Failed);
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(BrokerEvent::DeliveryFailed {
            receipt: self.receipt(delivery),
            reason: reason.as_str().to_owned(),
        });
    }

    fn receipt(&self, delivery: &Delivery) -> Receipt {
        Receipt::now(&delivery.delivery_id, &delivery.event_id, &self.name)
    }

    fn publish_throttle_gauges(&self, throttle: &Throttle) {
        self.metrics
            .current_delay_ms
            .store(throttle.current_delay().as_millis() as u64, Ordering::Relaxed);
        self.metrics
            .consecutive_successes
            .store(throttle.consecutive_successes() as u64, Ordering::Relaxed);
    }
}

fn refresh(receipt: &Receipt) -> Receipt {
    Receipt::now(&receipt.delivery_id, &receipt.event_id, &receipt.worker_name)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
