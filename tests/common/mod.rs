//! Shared fakes for negotiation tests
//!
//! `ScriptedRelay` hands out pre-recorded poll batches and records every
//! call. `FakeEngine` builds in-memory connections that emit scripted local
//! candidates once a local description is set and open their data channel
//! according to an [`OpenRule`]. Both write to one [`Journal`] so tests can
//! check ordering across the relay and the engine.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use polljoin::network::{
    ChannelEvent, ConnectionEngine, DataChannel, DiscoveryEvent, GatheringState, PeerConnection,
    SignalingError, SignalingTransport,
};
use polljoin::protocol::{Candidate, HostReply, HostSession, IceCandidate, SessionDescription};

pub const SESSION_NAME: &str = "brave-otter";
pub const HOST_SECRET: &str = "host-secret";
pub const CLIENT_SECRET: &str = "client-secret";

/// Ordered record of relay calls and engine operations
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

// ---- wire helpers ----

pub fn candidate(n: u16) -> Candidate {
    Candidate::Entry(IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} {} typ host", n, n, 50000 + n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    })
}

pub fn candidate_text(n: u16) -> String {
    match candidate(n) {
        Candidate::Entry(entry) => entry.candidate,
        Candidate::EndOfCandidates => String::new(),
    }
}

fn wire_candidates(ns: &[u16]) -> Vec<String> {
    ns.iter()
        .map(|&n| candidate(n).to_wire().expect("candidate encodes"))
        .collect()
}

fn encoded(value: Value) -> Value {
    Value::String(value.to_string())
}

pub fn offer_sdp(client_name: &str) -> String {
    format!("v=0 offer from {}", client_name)
}

pub fn start_join(client_name: &str, candidates: &[u16]) -> Value {
    let offer = SessionDescription::offer(offer_sdp(client_name));
    encoded(json!({
        "type": "start_join",
        "client_name": client_name,
        "client_offer": serde_json::to_string(&offer).expect("offer encodes"),
        "candidates": wire_candidates(candidates),
    }))
}

pub fn ice_candidates(client_name: Option<&str>, candidates: &[u16]) -> Value {
    let mut message = json!({
        "type": "ice_candidate",
        "candidates": wire_candidates(candidates),
    });
    if let Some(name) = client_name {
        message["client_name"] = json!(name);
    }
    encoded(message)
}

pub fn answer(sdp: &str) -> Value {
    encoded(json!({
        "type": "answer",
        "answer": {"type": "answer", "sdp": sdp},
    }))
}

pub fn unknown(kind: &str) -> Value {
    encoded(json!({"type": kind}))
}

// ---- relay ----

/// Relay double that replays scripted poll batches
pub struct ScriptedRelay {
    journal: Journal,
    host_batches: Mutex<VecDeque<Vec<Value>>>,
    join_batches: Mutex<VecDeque<Vec<Value>>>,
    replies: Mutex<Vec<(String, HostReply)>>,
    join_offers: Mutex<Vec<(String, SessionDescription)>>,
    posted_candidates: Mutex<Vec<Vec<Candidate>>>,
    host_polls: Mutex<Vec<Instant>>,
    reject_join: AtomicBool,
    fail_polls: AtomicBool,
    fail_replies: AtomicBool,
}

impl ScriptedRelay {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            host_batches: Mutex::new(VecDeque::new()),
            join_batches: Mutex::new(VecDeque::new()),
            replies: Mutex::new(Vec::new()),
            join_offers: Mutex::new(Vec::new()),
            posted_candidates: Mutex::new(Vec::new()),
            host_polls: Mutex::new(Vec::new()),
            reject_join: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            fail_replies: AtomicBool::new(false),
        }
    }

    /// Queue the batch returned by the next host poll
    pub fn push_host_batch(&self, batch: Vec<Value>) {
        self.host_batches.lock().push_back(batch);
    }

    /// Queue the batch returned by the next join poll
    pub fn push_join_batch(&self, batch: Vec<Value>) {
        self.join_batches.lock().push_back(batch);
    }

    pub fn reject_joins(&self) {
        self.reject_join.store(true, Ordering::SeqCst);
    }

    pub fn fail_polls(&self) {
        self.fail_polls.store(true, Ordering::SeqCst);
    }

    pub fn fail_replies(&self) {
        self.fail_replies.store(true, Ordering::SeqCst);
    }

    /// When each host poll reached the relay
    pub fn host_poll_times(&self) -> Vec<Instant> {
        self.host_polls.lock().clone()
    }

    pub fn replies(&self) -> Vec<(String, HostReply)> {
        self.replies.lock().clone()
    }

    pub fn replies_for(&self, client_name: &str) -> Vec<HostReply> {
        self.replies
            .lock()
            .iter()
            .filter(|(name, _)| name == client_name)
            .map(|(_, reply)| reply.clone())
            .collect()
    }

    pub fn join_offers(&self) -> Vec<(String, SessionDescription)> {
        self.join_offers.lock().clone()
    }

    pub fn posted_candidates(&self) -> Vec<Vec<Candidate>> {
        self.posted_candidates.lock().clone()
    }

    fn check_polls(&self) -> Result<(), SignalingError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("relay unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for ScriptedRelay {
    async fn create_host_session(
        &self,
        public: bool,
        host_name: &str,
    ) -> Result<HostSession, SignalingError> {
        self.journal
            .record(format!("relay:create_host:{}:{}", host_name, public));
        Ok(HostSession {
            session_name: SESSION_NAME.to_string(),
            host_secret: HOST_SECRET.to_string(),
        })
    }

    async fn poll_host_messages(
        &self,
        session_name: &str,
        host_secret: &str,
    ) -> Result<Vec<Value>, SignalingError> {
        assert_eq!(session_name, SESSION_NAME);
        assert_eq!(host_secret, HOST_SECRET);
        self.journal.record("relay:poll_host");
        self.host_polls.lock().push(Instant::now());
        self.check_polls()?;
        Ok(self.host_batches.lock().pop_front().unwrap_or_default())
    }

    async fn post_host_response(
        &self,
        _session_name: &str,
        client_name: &str,
        host_secret: &str,
        message: &HostReply,
    ) -> Result<(), SignalingError> {
        assert_eq!(host_secret, HOST_SECRET);
        let kind = match message {
            HostReply::Answer { .. } => "answer",
            HostReply::IceCandidate { .. } => "ice_candidate",
        };
        self.journal
            .record(format!("relay:reply:{}:{}", client_name, kind));
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("reply rejected: 500".to_string()));
        }
        self.replies
            .lock()
            .push((client_name.to_string(), message.clone()));
        Ok(())
    }

    async fn create_join_request(
        &self,
        _session_name: &str,
        client_name: &str,
        offer: &SessionDescription,
    ) -> Result<String, SignalingError> {
        self.journal.record(format!("relay:join:{}", client_name));
        if self.reject_join.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("join rejected: 404".to_string()));
        }
        self.join_offers
            .lock()
            .push((client_name.to_string(), offer.clone()));
        Ok(CLIENT_SECRET.to_string())
    }

    async fn post_join_candidates(
        &self,
        _session_name: &str,
        client_name: &str,
        client_secret: &str,
        candidates: &[Candidate],
    ) -> Result<(), SignalingError> {
        assert_eq!(client_secret, CLIENT_SECRET);
        self.journal
            .record(format!("relay:join_candidates:{}", client_name));
        self.posted_candidates.lock().push(candidates.to_vec());
        Ok(())
    }

    async fn poll_join_messages(
        &self,
        _session_name: &str,
        _client_name: &str,
        client_secret: &str,
    ) -> Result<Vec<Value>, SignalingError> {
        assert_eq!(client_secret, CLIENT_SECRET);
        self.journal.record("relay:poll_join");
        self.check_polls()?;
        Ok(self.join_batches.lock().pop_front().unwrap_or_default())
    }
}

// ---- engine ----

/// When a fake connection opens its data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenRule {
    Never,
    /// Once the remote description is set and this many candidates applied
    AfterRemote { candidates: usize },
    /// As soon as the connection exists, before any description is applied
    OnCreate,
}

pub struct FakeEngine {
    journal: Journal,
    rule: OpenRule,
    local_candidates: Vec<u16>,
    discovery_started: bool,
    stalled_discovery: bool,
    next_id: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeEngine {
    pub fn new(journal: Journal, rule: OpenRule) -> Self {
        Self {
            journal,
            rule,
            local_candidates: vec![100, 101],
            discovery_started: false,
            stalled_discovery: false,
            next_id: AtomicUsize::new(1),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Candidates every connection discovers after its local description
    pub fn with_local_candidates(mut self, candidates: Vec<u16>) -> Self {
        self.local_candidates = candidates;
        self
    }

    /// Hand out connections whose discovery is already running
    pub fn with_discovery_started(mut self) -> Self {
        self.discovery_started = true;
        self
    }

    /// Hand out connections whose discovery never completes
    pub fn with_stalled_discovery(mut self) -> Self {
        self.stalled_discovery = true;
        self
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    /// The connection whose remote offer came from `client_name`
    pub fn connection_for(&self, client_name: &str) -> Option<Arc<FakeConnection>> {
        let sdp = offer_sdp(client_name);
        self.connections
            .lock()
            .iter()
            .find(|c| c.remote().map(|d| d.sdp == sdp).unwrap_or(false))
            .cloned()
    }
}

#[async_trait]
impl ConnectionEngine for FakeEngine {
    async fn create_connection(
        &self,
        ice_servers: &[String],
    ) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.journal
            .record(format!("conn{}:create:{}", id, ice_servers.len()));

        let connection = Arc::new(FakeConnection::new(
            id,
            self.journal.clone(),
            self.rule,
            self.local_candidates.clone(),
        ));
        if self.discovery_started {
            *connection.state.lock() = GatheringState::Gathering;
        }
        connection
            .stalled
            .store(self.stalled_discovery, Ordering::SeqCst);
        if self.rule == OpenRule::OnCreate {
            connection.open_channels();
        }
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

pub struct FakeConnection {
    pub id: usize,
    journal: Journal,
    rule: OpenRule,
    local_candidates: Vec<u16>,
    state: Mutex<GatheringState>,
    discovery_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    discovery_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<Candidate>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    opened: AtomicBool,
    closed: AtomicBool,
    stalled: AtomicBool,
}

impl FakeConnection {
    fn new(id: usize, journal: Journal, rule: OpenRule, local_candidates: Vec<u16>) -> Self {
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            id,
            journal,
            rule,
            local_candidates,
            state: Mutex::new(GatheringState::New),
            discovery_tx,
            discovery_rx: Mutex::new(Some(discovery_rx)),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn applied(&self) -> Vec<Candidate> {
        self.applied.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Channels this side created or received
    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    /// Deliver a message from the remote peer on every channel
    pub fn deliver(&self, text: &str) {
        for channel in self.channels.lock().iter() {
            let _ = channel
                .events_tx
                .send(ChannelEvent::Message(text.to_string()));
        }
    }

    fn maybe_open(&self) {
        let OpenRule::AfterRemote { candidates } = self.rule else {
            return;
        };
        if self.remote.lock().is_none() || self.applied.lock().len() < candidates {
            return;
        }
        self.open_channels();
    }

    fn open_channels(&self) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }

        self.journal.record(format!("conn{}:open", self.id));
        let mut channels = self.channels.lock();
        if channels.is_empty() {
            // Answering side: the channel arrives from the remote peer
            let channel = Arc::new(FakeChannel::new("main", self.journal.clone(), self.id));
            channels.push(channel.clone());
            let _ = self.incoming_tx.send(channel.clone());
        }
        for channel in channels.iter() {
            let _ = channel.events_tx.send(ChannelEvent::Open);
        }
    }

    fn start_discovery(&self) {
        let mut state = self.state.lock();
        if *state != GatheringState::New {
            return;
        }
        let _ = self
            .discovery_tx
            .send(DiscoveryEvent::StateChanged(GatheringState::Gathering));
        for &n in &self.local_candidates {
            if let Candidate::Entry(entry) = candidate(n) {
                let _ = self.discovery_tx.send(DiscoveryEvent::Candidate(entry));
            }
        }
        if self.stalled.load(Ordering::SeqCst) {
            *state = GatheringState::Gathering;
            return;
        }
        *state = GatheringState::Complete;
        let _ = self.discovery_tx.send(DiscoveryEvent::EndOfCandidates);
        let _ = self
            .discovery_tx
            .send(DiscoveryEvent::StateChanged(GatheringState::Complete));
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    fn gathering_state(&self) -> GatheringState {
        *self.state.lock()
    }

    fn take_discovery_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.discovery_rx.lock().take()
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.incoming_rx.lock().take()
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalingError> {
        Ok(SessionDescription::offer(format!("v=0 offer conn{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalingError> {
        if self.remote.lock().is_none() {
            return Err(SignalingError::Negotiation(
                "answer requested without a remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!("v=0 answer conn{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SignalingError> {
        self.journal.record(format!("conn{}:set_local", self.id));
        *self.local.lock() = Some(desc);
        self.start_discovery();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SignalingError> {
        // Give spawned watchers a chance to run first
        tokio::task::yield_now().await;
        if desc.sdp.contains("garbage") {
            return Err(SignalingError::Negotiation("unparseable SDP".to_string()));
        }
        self.journal.record(format!("conn{}:set_remote", self.id));
        *self.remote.lock() = Some(desc);
        self.maybe_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), SignalingError> {
        if self.remote.lock().is_none() {
            return Err(SignalingError::Negotiation(
                "candidate applied before remote description".to_string(),
            ));
        }
        if let Candidate::Entry(entry) = &candidate {
            self.journal
                .record(format!("conn{}:candidate:{}", self.id, entry.candidate));
        }
        self.applied.lock().push(candidate);
        self.maybe_open();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, SignalingError> {
        let channel = Arc::new(FakeChannel::new(label, self.journal.clone(), self.id));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.journal.record(format!("conn{}:close", self.id));
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeChannel {
    label: String,
    journal: Journal,
    connection_id: usize,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    sent: Mutex<Vec<String>>,
}

impl FakeChannel {
    fn new(label: &str, journal: Journal, connection_id: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label: label.to_string(),
            journal,
            connection_id,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn send_text(&self, text: &str) -> Result<(), SignalingError> {
        self.journal
            .record(format!("conn{}:send:{}", self.connection_id, text));
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}
