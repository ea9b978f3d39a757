// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-pushed event frames: worker lifecycle, delivery receipts, inbound
//! messages, and warnings. Serialized as `{"kind": …, "payload": {…}}` on the
//! control plane.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Common fields carried by every delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub delivery_id: String,
    pub event_id: String,
    pub worker_name: String,
    pub ts: u64,
}

impl Receipt {
    pub fn now(delivery_id: &str, event_id: &str, worker_name: &str) -> Self {
        Self {
            delivery_id: delivery_id.to_owned(),
            event_id: event_id.to_owned(),
            worker_name: worker_name.to_owned(),
            ts: epoch_ms(),
        }
    }
}

/// Events pushed to every connected SDK client, tagged with the source kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum BrokerEvent {
    HelloAck {
        version: String,
        capabilities: Vec<String>,
    },
    AgentSpawned {
        name: String,
        pid: u32,
        cli: String,
    },
    AgentReady {
        name: String,
    },
    AgentReleased {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AgentExited {
        name: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    DeliveryQueued {
        #[serde(flatten)]
        receipt: Receipt,
    },
    DeliveryInjected {
        #[serde(flatten)]
        receipt: Receipt,
        attempt: u32,
    },
    DeliveryVerified {
        #[serde(flatten)]
        receipt: Receipt,
    },
    DeliveryActive {
        #[serde(flatten)]
        receipt: Receipt,
    },
    DeliveryFailed {
        #[serde(flatten)]
        receipt: Receipt,
        reason: String,
    },
    /// Inbound message surfaced to SDK-side event hooks (cloud echo already
    /// dedup-filtered).
    Message {
        event_id: String,
        from: String,
        to: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        ts: u64,
    },
    /// Background failure that did not terminate the broker.
    Warning {
        message: String,
    },
}

impl BrokerEvent {
    /// Wire name of this event kind (the `kind` discriminator).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HelloAck { .. } => "hello_ack",
            Self::AgentSpawned { .. } => "agent_spawned",
            Self::AgentReady { .. } => "agent_ready",
            Self::AgentReleased { .. } => "agent_released",
            Self::AgentExited { .. } => "agent_exited",
            Self::DeliveryQueued { .. } => "delivery_queued",
            Self::DeliveryInjected { .. } => "delivery_injected",
            Self::DeliveryVerified { .. } => "delivery_verified",
            Self::DeliveryActive { .. } => "delivery_active",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Message { .. } => "message",
            Self::Warning { .. } => "warning",
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
