//! Client-side negotiation
//!
//! ```text
//! [*] --> Idle
//! Idle --> OfferCreated: offer applied as local description
//! OfferCreated --> OfferSent: relay accepted the join request
//! OfferSent --> AwaitingAnswer: local candidates posted
//! AwaitingAnswer --> AnswerApplied: answer applied, backlog drained
//! AnswerApplied --> Connected: data channel open
//! AwaitingAnswer --> TimedOut: attempts exhausted
//! AnswerApplied --> TimedOut: attempts exhausted
//! ```
//!
//! Host candidates can show up before the answer does. Those are held back
//! and applied, in arrival order, right after the answer is set.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::NegotiationConfig;
use super::dispatch::MessageDispatcher;
use super::engine::{ChannelEvent, ChannelPair, ConnectionEngine, PeerConnection};
use super::error::SignalingError;
use super::gatherer::CandidateGatherer;
use super::transport::SignalingTransport;
use crate::protocol::{Candidate, Message};

/// Client handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinState {
    #[default]
    Idle,
    OfferCreated,
    OfferSent,
    AwaitingAnswer,
    AnswerApplied,
    Connected,
    TimedOut,
}

/// Generate a short client name
pub fn generate_client_name() -> String {
    let id = Uuid::new_v4();
    format!("client-{}", &id.to_string()[..8])
}

/// Remote candidates that arrived before the remote description
#[derive(Debug, Default)]
struct CandidateBacklog {
    remote_set: bool,
    pending: VecDeque<Candidate>,
}

impl CandidateBacklog {
    /// Hands the candidate back if it can be applied now, otherwise queues it
    fn admit(&mut self, candidate: Candidate) -> Option<Candidate> {
        if self.remote_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Mark the remote description as set and take everything queued so far
    fn release(&mut self) -> Vec<Candidate> {
        self.remote_set = true;
        self.pending.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Drives one client-side handshake
pub struct JoinNegotiator {
    transport: Arc<dyn SignalingTransport>,
    engine: Arc<dyn ConnectionEngine>,
    config: NegotiationConfig,
    dispatcher: MessageDispatcher,
    state: JoinState,
}

impl JoinNegotiator {
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
            state: JoinState::Idle,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Join `session_name` as `client_name`.
    ///
    /// Resolves once the data channel is open. Fails with
    /// [`SignalingError::Timeout`] when the attempt budget runs out first, and
    /// with [`SignalingError::Cancelled`] when `cancel` fires. The connection
    /// is closed on every failure.
    pub async fn join_session(
        &mut self,
        session_name: &str,
        client_name: &str,
        cancel: CancellationToken,
    ) -> Result<ChannelPair, SignalingError> {
        info!("Connecting to {} as {}", session_name, client_name);
        self.state = JoinState::Idle;

        let connection = self
            .engine
            .create_connection(&self.config.ice_servers)
            .await?;

        match self
            .handshake(session_name, client_name, connection.clone(), &cancel)
            .await
        {
            Ok(pair) => {
                info!("Client side is good to go");
                Ok(pair)
            }
            Err(e) => {
                warn!("Giving up on {}: {}", session_name, e);
                if let Err(close_err) = connection.close().await {
                    debug!("Closing connection failed: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        &mut self,
        session_name: &str,
        client_name: &str,
        connection: Arc<dyn PeerConnection>,
        cancel: &CancellationToken,
    ) -> Result<ChannelPair, SignalingError> {
        // Attach before anything below can kick off discovery
        let gatherer = CandidateGatherer::gather(connection.as_ref())?;

        let channel = connection
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        let mut events = channel.take_events().ok_or_else(|| {
            SignalingError::InvalidState("data channel events already taken".to_string())
        })?;

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        self.state = JoinState::OfferCreated;

        let client_secret = self
            .transport
            .create_join_request(session_name, client_name, &offer)
            .await?;
        self.state = JoinState::OfferSent;

        let local = gatherer
            .collect_until(self.config.gather_timeout, cancel)
            .await?;
        info!("Client sending {} candidates", local.len());
        self.transport
            .post_join_candidates(session_name, client_name, &client_secret, &local)
            .await?;
        self.state = JoinState::AwaitingAnswer;

        let retry = self.config.retry;
        let mut backlog = CandidateBacklog::default();
        let mut events_live = true;
        let mut opened = false;
        let mut attempts = 0;

        while attempts < retry.max_attempts {
            if wait_for_open(&mut events, &mut events_live, retry.interval, cancel).await? {
                opened = true;
                break;
            }

            attempts += 1;
            let batch = self
                .transport
                .poll_join_messages(session_name, client_name, &client_secret)
                .await?;

            for message in self.dispatcher.dispatch(batch) {
                self.handle_message(connection.as_ref(), &mut backlog, message)
                    .await?;
            }
        }

        if !opened {
            opened = drain_for_open(&mut events);
        }

        if !opened {
            self.state = JoinState::TimedOut;
            return Err(SignalingError::Timeout { attempts });
        }

        self.state = JoinState::Connected;
        Ok(ChannelPair {
            connection,
            channel,
            events,
        })
    }

    async fn handle_message(
        &mut self,
        connection: &dyn PeerConnection,
        backlog: &mut CandidateBacklog,
        message: Message,
    ) -> Result<(), SignalingError> {
        match message {
            Message::Answer { answer } => {
                if backlog.remote_set {
                    warn!("Ignoring repeated answer");
                    return Ok(());
                }
                info!(
                    "Got host description, {} queued candidates to apply",
                    backlog.len()
                );
                connection.set_remote_description(answer).await?;
                self.state = JoinState::AnswerApplied;

                for candidate in backlog.release() {
                    apply_candidate(connection, candidate).await;
                }
            }
            Message::IceCandidate { candidates, .. } => {
                debug!("Got {} host candidates", candidates.len());
                for candidate in candidates {
                    match backlog.admit(candidate) {
                        Some(candidate) => apply_candidate(connection, candidate).await,
                        None => debug!("Holding candidate until the answer arrives"),
                    }
                }
            }
            Message::StartJoin { client_name, .. } => {
                warn!("Client received a join request from {}, discarding", client_name);
            }
            Message::Unknown { kind } => {
                debug!("Skipping unknown client message '{}'", kind);
            }
        }

        Ok(())
    }
}

async fn apply_candidate(connection: &dyn PeerConnection, candidate: Candidate) {
    if let Err(e) = connection.add_ice_candidate(candidate).await {
        warn!("Failed to apply host candidate: {}", e);
    }
}

/// Sleep for one poll interval, returning early with true if the channel opens
async fn wait_for_open(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    events_live: &mut bool,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool, SignalingError> {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SignalingError::Cancelled),
            event = events.recv(), if *events_live => match event {
                Some(ChannelEvent::Open) => {
                    info!("Connected!");
                    return Ok(true);
                }
                Some(ChannelEvent::Message(text)) => debug!("Message before open: {}", text),
                Some(ChannelEvent::Closed) => warn!("Data channel closed before opening"),
                None => *events_live = false,
            },
            _ = &mut sleep => return Ok(false),
        }
    }
}

fn drain_for_open(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> bool {
    while let Ok(event) = events.try_recv() {
        if event == ChannelEvent::Open {
            return true;
        }
    }
    false
}
