//! Network module for relay-signaled peer connections
//!
//! Handles candidate gathering, relay transport, message dispatch, and the
//! host and join negotiation loops.

mod config;
mod dispatch;
mod engine;
mod error;
mod gatherer;
mod host;
mod join;
mod transport;
mod webrtc;

pub use config::{
    NegotiationConfig, RelayConfig, RetryPolicy, DEFAULT_CHANNEL_LABEL, DEFAULT_GREETING,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER,
};
pub use dispatch::MessageDispatcher;
pub use engine::{
    ChannelEvent, ChannelPair, ConnectionEngine, DataChannel, DiscoveryEvent, GatheringState,
    PeerConnection,
};
pub use error::SignalingError;
pub use gatherer::CandidateGatherer;
pub use host::{ClientState, ClientSummary, EndReason, HostNegotiator, SessionEnded};
pub use join::{generate_client_name, JoinNegotiator, JoinState};
pub use transport::{HttpRelay, SignalingTransport};
pub use self::webrtc::{WebRtcConnection, WebRtcDataChannel, WebRtcEngine};
