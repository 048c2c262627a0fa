//! polljoin - peer-to-peer data channels negotiated through a polling relay
//!
//! A host opens a session on an HTTP signaling relay and polls it for join
//! requests. Clients post an offer plus their candidates, then poll for the
//! host's answer and candidates until a data channel opens.

pub mod network;
pub mod protocol;

pub use network::{HostNegotiator, HttpRelay, JoinNegotiator, SignalingError, WebRtcEngine};
pub use protocol::Message;
