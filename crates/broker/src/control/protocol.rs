// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame shapes for the stdio protocol: newline-delimited JSON, one object
//! per line. Requests carry an opaque `id`; replies echo it with `ok` or
//! `err`; server-pushed events carry no `id`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ErrorCode, WireError};
use crate::event::BrokerEvent;

/// An inbound request frame, payload left raw until the kind is known.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub to: String,
    pub text: String,
    pub from: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendInputPayload {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetModelPayload {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetMetricsPayload {
    #[serde(default)]
    pub agent: Option<String>,
}

/// Parse one line into a request frame.
pub fn parse_request(line: &str) -> Result<RequestFrame, WireError> {
    serde_json::from_str(line)
        .map_err(|e| WireError::invalid(format!("malformed request frame: {e}")))
}

/// Parse a request's payload into its typed form.
pub fn parse_payload<T: DeserializeOwned>(frame: &RequestFrame) -> Result<T, WireError> {
    serde_json::from_value(frame.payload.clone())
        .map_err(|e| WireError::invalid(format!("invalid {} payload: {e}", frame.kind)))
}

/// Success reply on the request's id.
pub fn ok_frame(id: &str, payload: serde_json::Value) -> String {
    json!({ "id": id, "kind": "ok", "payload": payload }).to_string()
}

/// Error reply on the request's id.
pub fn err_frame(id: &str, error: &WireError) -> String {
    json!({
        "id": id,
        "kind": "err",
        "payload": { "code": error.code.as_str(), "message": error.message },
    })
    .to_string()
}

pub fn err_frame_parts(id: &str, code: ErrorCode, message: &str) -> String {
    err_frame(id, &WireError::new(code, message))
}

/// Server-pushed event frame (no id).
pub fn event_frame(event: &BrokerEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        json!({ "kind": "warning", "payload": { "message": format!("unserializable event: {e}") } })
            .to_string()
    })
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
