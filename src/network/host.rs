//! Host-side negotiation
//!
//! The host creates a relay session and then polls it. Every client that
//! posts a `start_join` gets its own negotiation record: a fresh peer
//! connection, an answer, and the host's local candidates once discovery
//! completes.
//!
//! ```text
//! [*] --> New: start_join (unseen client)
//! New --> OfferReceived: offer applied as remote description
//! OfferReceived --> AnswerSent: answer applied and posted
//! AnswerSent --> Connected: data channel arrives
//! ```
//!
//! The client map lives on the polling task's stack. Engine callbacks only
//! reach it as client-name arrivals over a channel, and the
//! caller only ever sees finished [`ChannelPair`]s.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::NegotiationConfig;
use super::dispatch::MessageDispatcher;
use super::engine::{ChannelEvent, ChannelPair, ConnectionEngine, PeerConnection};
use super::error::SignalingError;
use super::gatherer::CandidateGatherer;
use super::transport::SignalingTransport;
use crate::protocol::{
    encode_candidates, Candidate, HostReply, HostSession, Message, SessionDescription,
};

/// Name of a client whose data channel has arrived
type Arrival = String;

/// Per-client negotiation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    OfferReceived,
    AnswerSent,
    Connected,
}

/// Why a hosted session stopped polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// At least one client opened a data channel
    Connected,
    /// The attempt budget ran out with nobody connected
    Exhausted,
    Cancelled,
}

/// Final state of one client when the session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub client_name: String,
    pub state: ClientState,
}

/// Outcome of [`HostNegotiator::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub reason: EndReason,
    /// Number of relay polls performed
    pub attempts: u32,
    /// Clients sorted by name
    pub clients: Vec<ClientSummary>,
}

impl SessionEnded {
    pub fn is_connected(&self) -> bool {
        self.reason == EndReason::Connected
    }
}

/// One remote peer, owned by the host polling task
struct ClientNegotiation {
    client_name: String,
    connection: Arc<dyn PeerConnection>,
    connected: bool,
    state: ClientState,
    gatherer: Option<CandidateGatherer>,
    watcher: Option<JoinHandle<()>>,
}

impl ClientNegotiation {
    fn new(
        client_name: String,
        connection: Arc<dyn PeerConnection>,
        gatherer: CandidateGatherer,
    ) -> Self {
        Self {
            client_name,
            connection,
            connected: false,
            state: ClientState::New,
            gatherer: Some(gatherer),
            watcher: None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// Returns false if the client was already connected
    fn mark_connected(&mut self) -> bool {
        if self.connected {
            return false;
        }
        self.connected = true;
        self.state = ClientState::Connected;
        true
    }

    fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_name: self.client_name.clone(),
            state: self.state,
        }
    }

    async fn apply_candidate(&self, candidate: Candidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!(
                "Failed to apply candidate from {}: {}",
                self.client_name, e
            );
        }
    }

    /// Close the connection unless it has been handed to the caller
    async fn release(mut self) {
        if self.connected {
            return;
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection for {} failed: {}", self.client_name, e);
        }
    }
}

/// Drives the host side of a session
pub struct HostNegotiator {
    transport: Arc<dyn SignalingTransport>,
    engine: Arc<dyn ConnectionEngine>,
    config: NegotiationConfig,
    dispatcher: MessageDispatcher,
}

impl HostNegotiator {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        engine: Arc<dyn ConnectionEngine>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            transport,
            engine,
            config,
            dispatcher: MessageDispatcher::new(),
        }
    }

    /// Ask the relay for a new session
    pub async fn open_session(&self) -> Result<HostSession, SignalingError> {
        info!("Starting up a session");
        let session = self
            .transport
            .create_host_session(self.config.public, &self.config.host_name)
            .await?;
        info!("Session {} created", session.session_name);
        Ok(session)
    }

    /// Poll `session` until a client connects, the budget runs out, or
    /// `cancel` fires.
    ///
    /// Every client whose data channel opens is sent to `on_client`, even
    /// after this returns. Connections that never connected are closed.
    pub async fn run(
        &self,
        session: &HostSession,
        on_client: mpsc::UnboundedSender<ChannelPair>,
        cancel: CancellationToken,
    ) -> Result<SessionEnded, SignalingError> {
        let mut clients: HashMap<String, ClientNegotiation> = HashMap::new();
        let outcome = self.drive(session, &mut clients, on_client, &cancel).await;

        let mut summaries: Vec<ClientSummary> = clients.values().map(|c| c.summary()).collect();
        summaries.sort_by(|a, b| a.client_name.cmp(&b.client_name));

        for (_, client) in clients.drain() {
            client.release().await;
        }

        let (reason, attempts) = outcome?;
        info!(
            "Session {} ended ({:?}) after {} polls",
            session.session_name, reason, attempts
        );

        Ok(SessionEnded {
            reason,
            attempts,
            clients: summaries,
        })
    }

    async fn drive(
        &self,
        session: &HostSession,
        clients: &mut HashMap<String, ClientNegotiation>,
        on_client: mpsc::UnboundedSender<ChannelPair>,
        cancel: &CancellationToken,
    ) -> Result<(EndReason, u32), SignalingError> {
        let (arrivals_tx, mut arrivals_rx) = mpsc::unbounded_channel::<Arrival>();
        let retry = self.config.retry;
        let mut attempts = 0;

        while attempts < retry.max_attempts {
            // Arrivals from dropped clients must not shorten the interval
            let pause = tokio::time::sleep(retry.interval);
            tokio::pin!(pause);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok((EndReason::Cancelled, attempts)),
                    Some(client_name) = arrivals_rx.recv() => {
                        if record_arrival(clients, client_name) {
                            break;
                        }
                    }
                    _ = &mut pause => break,
                }
            }

            drain_arrivals(clients, &mut arrivals_rx);
            if clients.values().any(ClientNegotiation::is_connected) {
                return Ok((EndReason::Connected, attempts));
            }

            attempts += 1;
            let batch = self
                .transport
                .poll_host_messages(&session.session_name, &session.host_secret)
                .await?;
            let messages = self.dispatcher.dispatch(batch);
            debug!("Got {} hosting messages", messages.len());

            for message in messages {
                match self
                    .handle_message(session, clients, message, &arrivals_tx, &on_client, cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(SignalingError::Cancelled) => {
                        return Ok((EndReason::Cancelled, attempts))
                    }
                    Err(e) => return Err(e),
                }
                if cancel.is_cancelled() {
                    return Ok((EndReason::Cancelled, attempts));
                }
            }
        }

        drain_arrivals(clients, &mut arrivals_rx);
        if clients.values().any(ClientNegotiation::is_connected) {
            Ok((EndReason::Connected, attempts))
        } else {
            Ok((EndReason::Exhausted, attempts))
        }
    }

    async fn handle_message(
        &self,
        session: &HostSession,
        clients: &mut HashMap<String, ClientNegotiation>,
        message: Message,
        arrivals: &mpsc::UnboundedSender<Arrival>,
        on_client: &mpsc::UnboundedSender<ChannelPair>,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        match message {
            Message::StartJoin {
                client_name,
                offer,
                candidates,
            } => {
                if clients.contains_key(&client_name) {
                    warn!("Ignoring repeated join request from {}", client_name);
                    return Ok(());
                }

                info!("Got join request from {}", client_name);
                let client = match self.open_client(&client_name, arrivals, on_client).await {
                    Ok(client) => clients.entry(client_name.clone()).or_insert(client),
                    Err(e) if e.ends_session() => return Err(e),
                    Err(e) => {
                        warn!("Could not open a connection for {}: {}", client_name, e);
                        return Ok(());
                    }
                };

                match self
                    .negotiate(session, client, offer, candidates, cancel)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.ends_session() => return Err(e),
                    Err(e) => {
                        warn!("Dropping join request from {}: {}", client_name, e);
                        if let Some(client) = clients.remove(&client_name) {
                            client.release().await;
                        }
                    }
                }
            }
            Message::IceCandidate {
                client_name: Some(client_name),
                candidates,
            } => match clients.get(&client_name) {
                Some(client) => {
                    info!(
                        "Host got {} candidates for {}",
                        candidates.len(),
                        client_name
                    );
                    for candidate in candidates {
                        client.apply_candidate(candidate).await;
                    }
                }
                None => warn!("Candidates for unknown client {}, discarding", client_name),
            },
            Message::IceCandidate {
                client_name: None, ..
            } => {
                warn!("Candidate message without a client name, discarding");
            }
            Message::Answer { .. } => {
                warn!("Host received an answer message, discarding");
            }
            Message::Unknown { kind } => {
                debug!("Skipping unknown message type '{}'", kind);
            }
        }

        Ok(())
    }

    /// Create the connection and attach discovery before anything can start it
    async fn open_client(
        &self,
        client_name: &str,
        arrivals: &mpsc::UnboundedSender<Arrival>,
        on_client: &mpsc::UnboundedSender<ChannelPair>,
    ) -> Result<ClientNegotiation, SignalingError> {
        let connection = self
            .engine
            .create_connection(&self.config.ice_servers)
            .await?;

        let gatherer = match CandidateGatherer::gather(connection.as_ref()) {
            Ok(gatherer) => gatherer,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        let mut client = ClientNegotiation::new(client_name.to_string(), connection, gatherer);
        client.watcher = watch_client(
            client_name.to_string(),
            client.connection.clone(),
            arrivals.clone(),
            on_client.clone(),
            self.config.greeting.clone(),
        );
        Ok(client)
    }

    async fn negotiate(
        &self,
        session: &HostSession,
        client: &mut ClientNegotiation,
        offer: SessionDescription,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Result<(), SignalingError> {
        client.connection.set_remote_description(offer).await?;
        client.state = ClientState::OfferReceived;

        for candidate in candidates {
            client.apply_candidate(candidate).await;
        }

        let answer = client.connection.create_answer().await?;
        client
            .connection
            .set_local_description(answer.clone())
            .await?;

        debug!("Sending answer to {}", client.client_name);
        self.transport
            .post_host_response(
                &session.session_name,
                &client.client_name,
                &session.host_secret,
                &HostReply::Answer { answer },
            )
            .await?;
        client.state = ClientState::AnswerSent;

        if let Some(gatherer) = client.gatherer.take() {
            let local = gatherer
                .collect_until(self.config.gather_timeout, cancel)
                .await?;
            info!(
                "Host is sending {} candidates to {}",
                local.len(),
                client.client_name
            );
            let reply = HostReply::IceCandidate {
                candidate: encode_candidates(&local)?,
            };
            self.transport
                .post_host_response(
                    &session.session_name,
                    &client.client_name,
                    &session.host_secret,
                    &reply,
                )
                .await?;
        }

        Ok(())
    }
}

/// Returns true if a known client has just connected
fn record_arrival(clients: &mut HashMap<String, ClientNegotiation>, client_name: String) -> bool {
    match clients.get_mut(&client_name) {
        Some(client) => {
            let connected = client.mark_connected();
            if connected {
                info!("Client {} connected", client_name);
            }
            connected
        }
        None => {
            debug!("Data channel from dropped client {}", client_name);
            false
        }
    }
}

fn drain_arrivals(
    clients: &mut HashMap<String, ClientNegotiation>,
    arrivals: &mut mpsc::UnboundedReceiver<Arrival>,
) {
    while let Ok(client_name) = arrivals.try_recv() {
        record_arrival(clients, client_name);
    }
}

/// Wait for the client's data channel, report its arrival to the polling
/// loop, greet it once open, and hand it to the caller.
fn watch_client(
    client_name: String,
    connection: Arc<dyn PeerConnection>,
    arrivals: mpsc::UnboundedSender<Arrival>,
    on_client: mpsc::UnboundedSender<ChannelPair>,
    greeting: Option<String>,
) -> Option<JoinHandle<()>> {
    let Some(mut incoming) = connection.take_incoming_channels() else {
        warn!("Incoming channels for {} already taken", client_name);
        return None;
    };

    Some(tokio::spawn(async move {
        let Some(channel) = incoming.recv().await else {
            return;
        };
        debug!("Got data channel from {}", client_name);
        let _ = arrivals.send(client_name.clone());

        let Some(mut events) = channel.take_events() else {
            warn!("Channel events for {} already taken", client_name);
            return;
        };

        loop {
            match events.recv().await {
                Some(ChannelEvent::Open) => break,
                Some(ChannelEvent::Message(text)) => {
                    debug!("Message from {} before open: {}", client_name, text)
                }
                Some(ChannelEvent::Closed) | None => {
                    warn!("Data channel from {} closed before opening", client_name);
                    return;
                }
            }
        }

        if let Some(greeting) = greeting {
            if let Err(e) = channel.send_text(&greeting).await {
                warn!("Failed to greet {}: {}", client_name, e);
            }
        }

        let _ = on_client.send(ChannelPair {
            connection,
            channel,
            events,
        });
    }))
}
