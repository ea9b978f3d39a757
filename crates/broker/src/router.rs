// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target resolution and the dual-path send: local PTY injection plus an
//! asynchronous cloud publish of the same logical message.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dedup::DedupCache;
use crate::delivery::{Delivery, DeliveryEngine};
use crate::error::WireError;
use crate::event::{epoch_ms, BrokerEvent};
use crate::registry::WorkerRegistry;
use crate::relaycast::{RelayMessage, RelaycastLink};

/// Reply payload for a `send_message` request: the minted event id plus the
/// targets whose deliveries were queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub event_id: String,
    pub targets: Vec<String>,
}

/// Mint an SDK-origin event id.
pub fn sdk_event_id() -> String {
    format!("sdk_{}", Uuid::new_v4())
}

/// Normalized id for relay frames that arrived without one.
pub fn pty_event_id() -> String {
    format!("pty_{}", epoch_ms())
}

pub struct Router {
    registry: Arc<WorkerRegistry>,
    engine: Arc<DeliveryEngine>,
    dedup: Arc<DedupCache>,
    relay: Option<Arc<RelaycastLink>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Router {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        engine: Arc<DeliveryEngine>,
        dedup: Arc<DedupCache>,
        relay: Option<Arc<RelaycastLink>>,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self { registry, engine, dedup, relay, events })
    }

    /// Dual-path send. Replies once local deliveries are *queued*; the cloud
    /// publish rides along fire-and-forget.
    pub async fn send_message(
        &self,
        to: &str,
        text: &str,
        from: &str,
        thread_id: Option<String>,
        priority: i64,
    ) -> Result<SendOutcome, WireError> {
        let targets = self.registry.resolve_target(to, from).await?;

        let event_id = sdk_event_id();
        // Preseed before the publish so the websocket echo can never race a
        // second injection.
        self.dedup.preseed(&event_id);

        let queued = self
            .queue_local(&event_id, &targets.names, from, text, thread_id.clone(), priority)
            .await?;

        if let Some(relay) = &self.relay {
            let relay = Arc::clone(relay);
            let msg = RelayMessage {
                event_id: event_id.clone(),
                from: from.to_owned(),
                to: to.to_owned(),
                body: text.to_owned(),
                thread_id,
            };
            // publish() only queues; the link's writer task does the I/O and
            // logs failures. Nothing here blocks on the cloud.
            relay.publish(msg);
        }

        Ok(SendOutcome { event_id, targets: queued })
    }

    /// Queue one delivery per resolved target. A full queue drops that
    /// target with a warning, except for single-target sends where the
    /// error is the reply.
    async fn queue_local(
        &self,
        event_id: &str,
        names: &[String],
        from: &str,
        body: &str,
        thread_id: Option<String>,
        priority: i64,
    ) -> Result<Vec<String>, WireError> {
        let single = names.len() == 1;
        let mut queued = Vec::with_capacity(names.len());

        for name in names {
            let Some(worker) = self.registry.get(name).await else {
                debug!(worker = %name, "target vanished before queueing");
                continue;
            };

            let delivery =
                Delivery::new(event_id, name, from, body, thread_id.clone(), priority);
            match self.engine.enqueue(&worker.port(), delivery) {
                Ok(()) => queued.push(name.clone()),
                Err(e) if single => return Err(e),
                Err(e) => {
                    warn!(worker = %name, "delivery not queued: {e}");
                    let _ = self.events.send(BrokerEvent::Warning {
                        message: format!("delivery to {name} not queued: {e}"),
                    });
                }
            }
        }

        Ok(queued)
    }

    /// Inbound path from the relay websocket. Dedup-filtered, surfaced to
    /// SDK hooks, then queued through the same engine as local sends.
    pub async fn handle_inbound(&self, mut msg: RelayMessage) {
        if msg.event_id.is_empty() {
            msg.event_id = pty_event_id();
        }

        if self.dedup.contains(&msg.event_id) {
            debug!(event_id = %msg.event_id, "dropping duplicate relay frame");
            return;
        }
        self.dedup.insert(&msg.event_id);

        let _ = self.events.send(BrokerEvent::Message {
            event_id: msg.event_id.clone(),
            from: msg.from.clone(),
            to: msg.to.clone(),
            body: msg.body.clone(),
            thread_id: msg.thread_id.clone(),
            ts: epoch_ms(),
        });

        let targets = match self.registry.resolve_target(&msg.to, &msg.from).await {
            Ok(targets) => targets,
            Err(e) => {
                debug!(to = %msg.to, "inbound frame has no local targets: {e}");
                return;
            }
        };

        if let Err(e) = self
            .queue_local(
                &msg.event_id,
                &targets.names,
                &msg.from,
                &msg.body,
                msg.thread_id.clone(),
                0,
            )
            .await
        {
            warn!(event_id = %msg.event_id, "inbound delivery not queued: {e}");
        }
    }

    pub fn relay_state(&self) -> crate::relaycast::LinkState {
        match &self.relay {
            Some(relay) => relay.state(),
            None => crate::relaycast::LinkState::Disabled,
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
