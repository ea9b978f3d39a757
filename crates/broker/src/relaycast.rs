// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Websocket link to the remote relay (Relaycast).
//!
//! Outbound publishes are queued, rate-limited, and never block local
//! delivery; the connection reconnects with capped exponential backoff.
//! Inbound frames are dedup-filtered by event id and then routed through the
//! same delivery pipeline as local sends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::BrokerEvent;
use crate::router::Router;

/// Initial backoff for reconnection attempts.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
/// Maximum backoff for reconnection attempts.
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Wire shape shared by outbound publishes and inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(default)]
    pub event_id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Connection state surfaced in `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disabled,
    Connecting,
    Connected,
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;

/// Link tuning resolved from [`Config`](crate::config::Config).
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub url: String,
    pub handshake_timeout: Duration,
    pub publish_min_gap: Duration,
    pub queue_cap: usize,
}

/// Bounded publish queue with drop-oldest overflow.
struct PublishQueue {
    inner: Mutex<VecDeque<RelayMessage>>,
    notify: Notify,
    cap: usize,
}

impl PublishQueue {
    fn new(cap: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), notify: Notify::new(), cap: cap.max(1) }
    }

    /// Push a message; returns the dropped-oldest entry on overflow.
    fn push(&self, msg: RelayMessage) -> Option<RelayMessage> {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped =
                if queue.len() >= self.cap { queue.pop_front() } else { None };
            queue.push_back(msg);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> RelayMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.inner.lock().pop_front() {
                return msg;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Websocket client to the remote relay.
pub struct RelaycastLink {
    settings: LinkSettings,
    queue: PublishQueue,
    state: AtomicU8,
    events: broadcast::Sender<BrokerEvent>,
}

impl RelaycastLink {
    pub fn new(settings: LinkSettings, events: broadcast::Sender<BrokerEvent>) -> Arc<Self> {
        let queue = PublishQueue::new(settings.queue_cap);
        Arc::new(Self { settings, queue, state: AtomicU8::new(STATE_CONNECTING), events })
    }

    /// Queue an outbound publish. Fire-and-forget: overflow drops the oldest
    /// queued message with a warning, and local delivery is never blocked.
    pub fn publish(&self, msg: RelayMessage) {
        if let Some(dropped) = self.queue.push(msg) {
            warn!(event_id = %dropped.event_id, "publish queue overflow, dropped oldest");
            let _ = self.events.send(BrokerEvent::Warning {
                message: format!("publish queue overflow, dropped {}", dropped.event_id),
            });
        }
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Relaxed) {
            STATE_CONNECTED => LinkState::Connected,
            _ => LinkState::Connecting,
        }
    }

    pub fn queued_publishes(&self) -> usize {
        self.queue.len()
    }

    /// Run the connection loop until shutdown. Inbound frames are handed to
    /// `router`; outbound messages drain from the publish queue.
    pub async fn run(self: Arc<Self>, router: Arc<Router>, shutdown: CancellationToken) {
        let mut backoff = RECONNECT_INITIAL;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            self.state.store(STATE_CONNECTING, Ordering::Relaxed);
            debug!(url = %self.settings.url, "connecting to relay");

            let connect = tokio::time::timeout(
                self.settings.handshake_timeout,
                tokio_tungstenite::connect_async(&self.settings.url),
            );

            match connect.await {
                Ok(Ok((ws, _))) => {
                    info!(url = %self.settings.url, "relay connected");
                    self.state.store(STATE_CONNECTED, Ordering::Relaxed);
                    backoff = RECONNECT_INITIAL;

                    if let Err(e) = self.drive(ws, &router, &shutdown).await {
                        warn!("relay connection lost: {e}");
                        let _ = self.events.send(BrokerEvent::Warning {
                            message: format!("relay connection lost: {e}"),
                        });
                    }
                    if shutdown.is_cancelled() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!("relay connect failed: {e}");
                }
                Err(_) => {
                    warn!(
                        "relay handshake timed out after {:?}",
                        self.settings.handshake_timeout
                    );
                }
            }

            self.state.store(STATE_CONNECTING, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Pump one established connection until it drops or shutdown fires.
    async fn drive(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        router: &Arc<Router>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (mut sink, mut stream) = ws.split();
        let mut last_publish: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }

                incoming = stream.next() => {
                    let msg = match incoming {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => anyhow::bail!("read error: {e}"),
                        None => anyhow::bail!("stream ended"),
                    };
                    if let Message::Text(text) = msg {
                        match serde_json::from_str::<RelayMessage>(text.as_str()) {
                            Ok(inbound) => router.handle_inbound(inbound).await,
                            Err(e) => debug!("ignoring malformed relay frame: {e}"),
                        }
                    }
                }

                outgoing = self.queue.pop() => {
                    // Outbound rate limit to protect the remote.
                    if let Some(last) = last_publish {
                        let since = last.elapsed();
                        if since < self.settings.publish_min_gap {
                            tokio::time::sleep(self.settings.publish_min_gap - since).await;
                        }
                    }
                    let json = serde_json::to_string(&outgoing)?;
                    sink.send(Message::Text(json.into()))
                        .await
                        .map_err(|e| anyhow::anyhow!("write error: {e}"))?;
                    last_publish = Some(tokio::time::Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "relaycast_tests.rs"]
mod tests;
