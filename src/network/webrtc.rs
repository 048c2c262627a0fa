//! Connection engine backed by the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::engine::{
    ChannelEvent, ConnectionEngine, DataChannel, DiscoveryEvent, GatheringState, PeerConnection,
};
use super::error::SignalingError;
use crate::protocol::{Candidate, IceCandidate, SdpKind, SessionDescription};

/// Creates data-only peer connections
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        ice_servers: &[String],
    ) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        Ok(Arc::new(WebRtcConnection::attach(pc)))
    }
}

/// A `RTCPeerConnection` with its callbacks turned into event channels
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    gathering: Arc<Mutex<GatheringState>>,
    discovery: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
}

impl WebRtcConnection {
    fn attach(pc: Arc<RTCPeerConnection>) -> Self {
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Arc<dyn DataChannel>>();
        let gathering = Arc::new(Mutex::new(GatheringState::New));

        {
            let tx = discovery_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let event = match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => DiscoveryEvent::Candidate(from_init(init)),
                            Err(err) => DiscoveryEvent::Error {
                                code: 0,
                                text: err.to_string(),
                            },
                        },
                        None => DiscoveryEvent::EndOfCandidates,
                    };
                    let _ = tx.send(event);
                })
            }));
        }

        {
            let tx = discovery_tx;
            let gathering = gathering.clone();
            pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                let tx = tx.clone();
                let gathering = gathering.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCIceGathererState::New => GatheringState::New,
                        RTCIceGathererState::Gathering => GatheringState::Gathering,
                        RTCIceGathererState::Complete | RTCIceGathererState::Closed => {
                            GatheringState::Complete
                        }
                        _ => return,
                    };
                    *gathering.lock() = mapped;
                    let _ = tx.send(DiscoveryEvent::StateChanged(mapped));
                })
            }));
        }

        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = incoming_tx.clone();
            Box::pin(async move {
                debug!("Remote opened data channel '{}'", dc.label());
                let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel::attach(dc));
                let _ = tx.send(channel);
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                debug!(state = ?state, "Peer connection state changed");
            })
        }));

        Self {
            pc,
            gathering,
            discovery: Mutex::new(Some(discovery_rx)),
            incoming: Mutex::new(Some(incoming_rx)),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    fn gathering_state(&self) -> GatheringState {
        *self.gathering.lock()
    }

    fn take_discovery_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.discovery.lock().take()
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.incoming.lock().take()
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalingError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), SignalingError> {
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, SignalingError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(Arc::new(WebRtcDataChannel::attach(dc)))
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// A `RTCDataChannel` with its callbacks turned into an event channel
pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcDataChannel {
    fn attach(dc: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = Arc::new(dc.label().to_string());

        {
            let tx = tx.clone();
            let label = label.clone();
            dc.on_open(Box::new(move || {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    debug!("Data channel '{}' open", label);
                    let _ = tx.send(ChannelEvent::Open);
                })
            }));
        }

        {
            let tx = tx.clone();
            let label = label.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    trace!("Data channel '{}' message: {}", label, text);
                    let _ = tx.send(ChannelEvent::Message(text));
                })
            }));
        }

        {
            let label = label.clone();
            dc.on_error(Box::new(move |err| {
                let label = label.clone();
                Box::pin(async move {
                    warn!("Data channel '{}' error: {}", label, err);
                })
            }));
        }

        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));

        Self {
            dc,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn send_text(&self, text: &str) -> Result<(), SignalingError> {
        self.dc.send_text(text.to_string()).await?;
        Ok(())
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: Candidate) -> RTCIceCandidateInit {
    let candidate = IceCandidate::from(candidate);
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, SignalingError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(SignalingError::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, SignalingError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => {
            return Err(SignalingError::Negotiation(format!(
                "unexpected description type {:?}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}
