// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Delivery model: one instance of message injection into one worker.

pub mod engine;

pub use engine::{DeliveryEngine, EngineSettings};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::epoch_ms;

/// Lifecycle states of a delivery. Transitions are forward-only; a retry
/// returns to `Queued` with `attempt` incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Injected,
    Verified,
    Active,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Injected => "injected",
            Self::Verified => "verified",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

/// Terminal failure reasons carried on `delivery_failed` receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    VerificationTimeout,
    NoActivity,
    WorkerExited,
    Cancelled,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerificationTimeout => "verification_timeout",
            Self::NoActivity => "no_activity",
            Self::WorkerExited => "worker_exited",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The exact bytes (minus the submit key) injected for a logical message.
/// This string is also the verification needle, so it must be deterministic.
pub fn format_injection(from: &str, event_id: &str, body: &str) -> String {
    format!("Relay message from {from} [{event_id}]: {body}")
}

/// Mint a delivery id.
pub fn delivery_id() -> String {
    format!("d_{}", Uuid::new_v4())
}

/// One message injection into one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: String,
    pub event_id: String,
    pub worker_name: String,
    pub from: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub priority: i64,
    pub formatted_text: String,
    pub state: DeliveryState,
    pub attempt: u32,
    pub created_at_ms: u64,
    /// Timestamped trail of state transitions, oldest first.
    pub state_history: Vec<(DeliveryState, u64)>,
}

impl Delivery {
    pub fn new(
        event_id: &str,
        worker_name: &str,
        from: &str,
        body: &str,
        thread_id: Option<String>,
        priority: i64,
    ) -> Self {
        let now = epoch_ms();
        Self {
            delivery_id: delivery_id(),
            event_id: event_id.to_owned(),
            worker_name: worker_name.to_owned(),
            from: from.to_owned(),
            body: body.to_owned(),
            thread_id,
            priority,
            formatted_text: format_injection(from, event_id, body),
            state: DeliveryState::Queued,
            attempt: 0,
            created_at_ms: now,
            state_history: vec![(DeliveryState::Queued, now)],
        }
    }

    /// Rebuild a delivery from persisted crash-recovery state. Sender and
    /// body are already baked into `formatted_text`.
    pub fn from_persisted(p: &crate::state::PersistedDelivery) -> Self {
        Self {
            delivery_id: p.delivery_id.clone(),
            event_id: p.event_id.clone(),
            worker_name: p.worker_name.clone(),
            from: String::new(),
            body: String::new(),
            thread_id: None,
            priority: 0,
            formatted_text: p.formatted_text.clone(),
            state: DeliveryState::Queued,
            attempt: p.attempt,
            created_at_ms: p.created_at,
            state_history: vec![(DeliveryState::Queued, epoch_ms())],
        }
    }

    pub(crate) fn push_state(&mut self, state: DeliveryState) {
        self.state = state;
        self.state_history.push((state, epoch_ms()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_is_deterministic() {
        assert_eq!(
            format_injection("Lead", "sdk_abc", "hello"),
            "Relay message from Lead [sdk_abc]: hello"
        );
    }

    #[test]
    fn new_delivery_starts_queued() {
        let d = Delivery::new("sdk_1", "W", "H", "ping", None, 0);
        assert!(d.delivery_id.starts_with("d_"));
        assert_eq!(d.state, DeliveryState::Queued);
        assert_eq!(d.attempt, 0);
        assert_eq!(d.formatted_text, "Relay message from H [sdk_1]: ping");
        assert_eq!(d.state_history.len(), 1);
    }

    #[test]
    fn state_history_records_transitions() {
        let mut d = Delivery::new("sdk_1", "W", "H", "ping", None, 0);
        d.push_state(DeliveryState::Injected);
        d.push_state(DeliveryState::Verified);
        let states: Vec<DeliveryState> = d.state_history.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![DeliveryState::Queued, DeliveryState::Injected, DeliveryState::Verified]
        );
    }

    #[yare::parameterized(
        queued = { DeliveryState::Queued, "queued" },
        injected = { DeliveryState::Injected, "injected" },
        verified = { DeliveryState::Verified, "verified" },
        active = { DeliveryState::Active, "active" },
        failed = { DeliveryState::Failed, "failed" },
    )]
    fn state_wire_names(state: DeliveryState, expected: &str) {
        assert_eq!(state.as_str(), expected);
    }

    #[test]
    fn fail_reasons_match_error_taxonomy() {
        assert_eq!(FailReason::VerificationTimeout.as_str(), "verification_timeout");
        assert_eq!(FailReason::WorkerExited.as_str(), "worker_exited");
        assert_eq!(FailReason::Cancelled.as_str(), "cancelled");
        assert_eq!(FailReason::NoActivity.as_str(), "no_activity");
    }
}
