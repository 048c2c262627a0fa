//! Connection engine boundary
//!
//! The negotiators never touch a concrete WebRTC stack. They drive a
//! [`ConnectionEngine`] that hands out [`PeerConnection`]s, and every engine
//! callback (discovery, incoming data channels, channel open/message) arrives
//! as an event on a channel owned by exactly one connection or data channel.
//!
//! Event receivers can be taken once. Events emitted before the receiver is
//! taken are buffered.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::SignalingError;
use crate::protocol::{Candidate, IceCandidate, SessionDescription};

/// Local discovery progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringState {
    /// Discovery has not started
    #[default]
    New,
    Gathering,
    Complete,
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatheringState::New => write!(f, "new"),
            GatheringState::Gathering => write!(f, "gathering"),
            GatheringState::Complete => write!(f, "complete"),
        }
    }
}

/// Discovery callbacks, as events
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Candidate(IceCandidate),
    EndOfCandidates,
    /// A single discovery server or interface failed; never fatal
    Error { code: u16, text: String },
    StateChanged(GatheringState),
}

/// Data channel callbacks, as events
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Creates peer connections
#[async_trait]
pub trait ConnectionEngine: Send + Sync {
    /// Create a connection that discovers candidates through `ice_servers`
    async fn create_connection(
        &self,
        ice_servers: &[String],
    ) -> Result<Arc<dyn PeerConnection>, SignalingError>;
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn gathering_state(&self) -> GatheringState;

    /// Discovery events for this connection (first call only)
    fn take_discovery_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>>;

    /// Data channels opened by the remote side (first call only)
    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>;

    async fn create_offer(&self) -> Result<SessionDescription, SignalingError>;

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), SignalingError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), SignalingError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, SignalingError>;

    async fn close(&self) -> Result<(), SignalingError>;
}

/// One data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    /// Open/message/close events for this channel (first call only)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn send_text(&self, text: &str) -> Result<(), SignalingError>;
}

/// A negotiated connection and its established data channel
pub struct ChannelPair {
    pub connection: Arc<dyn PeerConnection>,
    pub channel: Arc<dyn DataChannel>,
    /// Remaining channel events (messages, close)
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPair")
            .field("channel", &self.channel.label())
            .finish_non_exhaustive()
    }
}
