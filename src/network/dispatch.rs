//! Relay message dispatch
//!
//! Turns one polled batch into decoded [`Message`]s in processing order.
//! A `start_join` must be handled before candidates for the same client can
//! be applied, so joins are moved to the front; everything else keeps its
//! relative order.

use serde_json::Value;
use tracing::warn;

use super::error::SignalingError;
use crate::protocol::{
    decode_nested, Candidate, Message, WireMessage, TYPE_ANSWER, TYPE_ICE_CANDIDATE,
    TYPE_START_JOIN,
};

/// Decodes and orders relay message batches
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageDispatcher;

impl MessageDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Decode a polled batch and sort it into processing order
    pub fn dispatch(&self, batch: Vec<Value>) -> Vec<Message> {
        let mut messages: Vec<Message> = flatten(batch).into_iter().map(decode_entry).collect();

        // sort_by_key is stable
        messages.sort_by_key(|message| match message {
            Message::StartJoin { .. } => 0u8,
            _ => 1,
        });

        messages
    }
}

/// Relays may nest the per-client arrays one level deep
fn flatten(batch: Vec<Value>) -> Vec<Value> {
    let mut entries = Vec::with_capacity(batch.len());
    for value in batch {
        match value {
            Value::Array(inner) => entries.extend(inner),
            other => entries.push(other),
        }
    }
    entries
}

fn decode_entry(entry: Value) -> Message {
    let value = match entry {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding undecodable relay message: {}", e);
                return Message::Unknown {
                    kind: String::new(),
                };
            }
        },
        other => other,
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if ![TYPE_START_JOIN, TYPE_ICE_CANDIDATE, TYPE_ANSWER].contains(&kind.as_str()) {
        warn!("Unknown message type '{}'", kind);
        return Message::Unknown { kind };
    }

    match decode_message(value) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed '{}' message: {}", kind, e);
            Message::Unknown { kind }
        }
    }
}

fn decode_message(value: Value) -> Result<Message, SignalingError> {
    let message = match serde_json::from_value::<WireMessage>(value)? {
        WireMessage::StartJoin {
            client_name,
            client_offer,
            candidates,
        } => Message::StartJoin {
            client_name,
            offer: decode_nested(client_offer)?,
            candidates: decode_candidates(candidates.unwrap_or_default())?,
        },
        WireMessage::IceCandidate {
            client_name,
            candidates,
            candidate,
        } => {
            // Prefer the plural field when a relay sends both
            let raw = candidates.or(candidate).unwrap_or_default();
            Message::IceCandidate {
                client_name,
                candidates: decode_candidates(raw)?,
            }
        }
        WireMessage::Answer { answer } => Message::Answer {
            answer: decode_nested(answer)?,
        },
    };
    Ok(message)
}

fn decode_candidates(raw: Vec<Value>) -> Result<Vec<Candidate>, SignalingError> {
    raw.into_iter()
        .map(|value| decode_nested::<Candidate>(value).map_err(SignalingError::from))
        .collect()
}
