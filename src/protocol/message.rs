//! Relay message definitions
//!
//! The relay stores and forwards opaque JSON. Everything it hands back from a
//! poll is a JSON-encoded string, and several fields inside those messages
//! (offers, candidates) are JSON-encoded strings again, so decoding is a
//! two-pass affair.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire tag of the client's initial offer
pub const TYPE_START_JOIN: &str = "start_join";

/// Wire tag of a candidate batch
pub const TYPE_ICE_CANDIDATE: &str = "ice_candidate";

/// Wire tag of the host's answer
pub const TYPE_ANSWER: &str = "answer";

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// An offer or answer, in the `{type, sdp}` shape browsers produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One engine-serialized reachability descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A discovery candidate or the end-of-candidates marker.
///
/// On the wire the marker is a candidate whose `candidate` string is empty;
/// in memory it is its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IceCandidate", into = "IceCandidate")]
pub enum Candidate {
    Entry(IceCandidate),
    EndOfCandidates,
}

impl Candidate {
    pub fn is_end(&self) -> bool {
        matches!(self, Candidate::EndOfCandidates)
    }

    /// Encode as the JSON string the relay expects inside candidate arrays
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<IceCandidate> for Candidate {
    fn from(value: IceCandidate) -> Self {
        if value.candidate.is_empty() {
            Candidate::EndOfCandidates
        } else {
            Candidate::Entry(value)
        }
    }
}

impl From<Candidate> for IceCandidate {
    fn from(value: Candidate) -> Self {
        match value {
            Candidate::Entry(candidate) => candidate,
            Candidate::EndOfCandidates => IceCandidate::default(),
        }
    }
}

/// Encode a candidate list as an array of JSON strings
pub fn encode_candidates(candidates: &[Candidate]) -> serde_json::Result<Vec<String>> {
    candidates.iter().map(Candidate::to_wire).collect()
}

/// Decode a field that is either a JSON-encoded string or already an object
pub fn decode_nested<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    match value {
        Value::String(text) => serde_json::from_str(&text),
        other => serde_json::from_value(other),
    }
}

/// A decoded relay message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A client's initial offer (host-received)
    StartJoin {
        client_name: String,
        offer: SessionDescription,
        candidates: Vec<Candidate>,
    },
    /// Candidates for a named client (host-received) or for the single peer
    /// (client-received)
    IceCandidate {
        client_name: Option<String>,
        candidates: Vec<Candidate>,
    },
    /// The host's session description (client-received)
    Answer { answer: SessionDescription },
    /// Anything with a `type` we do not handle, or that failed to decode
    Unknown { kind: String },
}

impl Message {
    pub fn kind(&self) -> &str {
        match self {
            Message::StartJoin { .. } => TYPE_START_JOIN,
            Message::IceCandidate { .. } => TYPE_ICE_CANDIDATE,
            Message::Answer { .. } => TYPE_ANSWER,
            Message::Unknown { kind } => kind,
        }
    }
}

/// Raw message shape after the first decode pass
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    StartJoin {
        client_name: String,
        client_offer: Value,
        #[serde(default)]
        candidates: Option<Vec<Value>>,
    },
    /// Relays have used both `candidate` and `candidates` for the list
    IceCandidate {
        #[serde(default)]
        client_name: Option<String>,
        #[serde(default)]
        candidates: Option<Vec<Value>>,
        #[serde(default)]
        candidate: Option<Vec<Value>>,
    },
    Answer {
        answer: Value,
    },
}

/// Message the host posts back to one client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostReply {
    Answer { answer: SessionDescription },
    IceCandidate { candidate: Vec<String> },
}

/// Body of `POST /host`
#[derive(Debug, Serialize)]
pub struct CreateHostRequest<'a> {
    pub public: bool,
    pub host_name: &'a str,
}

/// Relay-issued host capability
#[derive(Clone, Deserialize)]
pub struct HostSession {
    pub session_name: String,
    pub host_secret: String,
}

impl fmt::Debug for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("session_name", &self.session_name)
            .field("host_secret", &"<redacted>")
            .finish()
    }
}

/// Body of `POST /join/response`
#[derive(Debug, Serialize)]
pub struct HostResponseRequest<'a> {
    pub session_name: &'a str,
    pub client_name: &'a str,
    pub host_secret: &'a str,
    pub messages: &'a HostReply,
}

/// Body of `POST /join`
#[derive(Debug, Serialize)]
pub struct JoinRequest<'a> {
    pub session_name: &'a str,
    pub client_name: &'a str,
    pub rtc_offer: String,
}

/// Response of `POST /join`
#[derive(Deserialize)]
pub struct JoinResponse {
    pub client_secret: String,
}

/// Body of `POST /join/candidates`
#[derive(Debug, Serialize)]
pub struct JoinCandidatesRequest<'a> {
    pub session_name: &'a str,
    pub client_name: &'a str,
    pub client_secret: &'a str,
    pub candidates: Vec<String>,
}
