//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! A frame is one Engine.IO packet type digit followed by its payload. Type
//! `4` carries a Socket.IO packet, itself a type digit, an optional
//! namespace, an optional ack id and a JSON payload:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                    ping / pong
//! 40{"token":".."}                                         connect
//! 42["receive-message",{..}]                               event
//! 44{"message":"unauthorized"}                             connect error
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::RealtimeError;

pub const PONG: &str = "3";
pub const DISCONNECT: &str = "41";

/// Server parameters from the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl Handshake {
    /// How long to wait for a server ping before calling the link dead.
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged.
    Connected,
    /// Server dropped us from the namespace.
    Disconnected,
    Event { name: String, data: Value },
    ConnectError(String),
}

fn protocol(frame: &str, what: &str) -> RealtimeError {
    let shown: String = frame.chars().take(64).collect();
    RealtimeError::Protocol(format!("{}: {}", what, shown))
}

pub fn decode(frame: &str) -> Result<Packet, RealtimeError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or_else(|| protocol(frame, "empty frame"))?;
    let rest = chars.as_str();
    match kind {
        '0' => {
            let handshake = serde_json::from_str(rest)
                .map_err(|e| protocol(frame, &format!("bad open packet ({})", e)))?;
            Ok(Packet::Open(handshake))
        }
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket(frame, rest),
        _ => Err(protocol(frame, "unknown engine packet")),
    }
}

fn decode_socket(frame: &str, body: &str) -> Result<Packet, RealtimeError> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| protocol(frame, "empty socket packet"))?;
    let mut rest = chars.as_str();

    // Only the default namespace is used; skip any explicit one.
    if rest.starts_with('/') {
        rest = rest.split_once(',').map(|(_, r)| r).unwrap_or("");
    }
    // Ack ids are not used by this client.
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Ok(Packet::Connected),
        '1' => Ok(Packet::Disconnected),
        '2' => {
            let parts: Vec<Value> = serde_json::from_str(rest)
                .map_err(|e| protocol(frame, &format!("bad event ({})", e)))?;
            let mut parts = parts.into_iter();
            let name = match parts.next() {
                Some(Value::String(name)) => name,
                _ => return Err(protocol(frame, "event without name")),
            };
            Ok(Packet::Event {
                name,
                data: parts.next().unwrap_or(Value::Null),
            })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| match v {
                    Value::String(s) => Some(s),
                    other => other.get("message").and_then(Value::as_str).map(str::to_string),
                })
                .unwrap_or_else(|| "connect error".to_string());
            Ok(Packet::ConnectError(message))
        }
        _ => Err(protocol(frame, "unsupported socket packet")),
    }
}

/// Namespace connect carrying the bearer token.
pub fn encode_connect(token: &str) -> String {
    format!("40{}", json!({ "token": token }))
}

pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", json!([name, data]))
}
