//! Relay protocol definitions
//!
//! Defines the message model and request bodies exchanged with the signaling relay.

mod message;

pub use message::{
    decode_nested, encode_candidates, Candidate, CreateHostRequest, HostReply,
    HostResponseRequest, HostSession, IceCandidate, JoinCandidatesRequest, JoinRequest,
    JoinResponse, Message, SdpKind, SessionDescription, WireMessage, TYPE_ANSWER,
    TYPE_ICE_CANDIDATE, TYPE_START_JOIN,
};
