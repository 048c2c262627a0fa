//! Local candidate gathering
//!
//! A gatherer must be attached right after the connection is created. If
//! discovery is already running we may have missed candidates, so attaching
//! late is refused rather than silently producing a partial list.

use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::engine::{DiscoveryEvent, GatheringState, PeerConnection};
use super::error::SignalingError;
use crate::protocol::Candidate;

/// Lazy, terminating sequence of one connection's local candidates
pub struct CandidateGatherer {
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    finished: bool,
}

impl CandidateGatherer {
    /// Attach to a connection whose discovery has not started yet
    pub fn gather(connection: &dyn PeerConnection) -> Result<Self, SignalingError> {
        let state = connection.gathering_state();
        if state != GatheringState::New {
            return Err(SignalingError::InvalidState(format!(
                "candidate discovery already {}",
                state
            )));
        }

        let events = connection.take_discovery_events().ok_or_else(|| {
            SignalingError::InvalidState("discovery events already taken".to_string())
        })?;

        Ok(Self {
            events,
            finished: false,
        })
    }

    /// Next discovered candidate, or None once discovery is complete
    pub async fn next_candidate(&mut self) -> Option<Candidate> {
        if self.finished {
            return None;
        }

        while let Some(event) = self.events.recv().await {
            match event {
                DiscoveryEvent::Candidate(candidate) => {
                    let candidate = Candidate::from(candidate);
                    if candidate.is_end() {
                        debug!("End-of-candidates marker received");
                        break;
                    }
                    trace!("Local candidate discovered");
                    return Some(candidate);
                }
                DiscoveryEvent::EndOfCandidates => {
                    debug!("End-of-candidates marker received");
                    break;
                }
                DiscoveryEvent::Error { code, text } => {
                    warn!("Candidate error (non-fatal) {}: {}", code, text);
                }
                DiscoveryEvent::StateChanged(GatheringState::Complete) => {
                    debug!("Candidate discovery complete");
                    break;
                }
                DiscoveryEvent::StateChanged(state) => {
                    trace!("Discovery state changed to {}", state);
                }
            }
        }

        self.finished = true;
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = Candidate> {
        stream::unfold(self, |mut gatherer| async move {
            gatherer
                .next_candidate()
                .await
                .map(|candidate| (candidate, gatherer))
        })
    }

    /// Collect every candidate until discovery completes
    pub async fn collect(self) -> Vec<Candidate> {
        self.into_stream().collect().await
    }

    /// Collect candidates, settling for what we have once `limit` elapses
    pub async fn collect_within(mut self, limit: Duration) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = self.next_candidate() => match next {
                    Some(candidate) => candidates.push(candidate),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Candidate discovery did not complete within {:?}, using {} candidates",
                        limit,
                        candidates.len()
                    );
                    break;
                }
            }
        }

        candidates
    }

    /// Like `collect_within`, but gives up with `Cancelled` as soon as `cancel` fires
    pub async fn collect_until(
        self,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>, SignalingError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SignalingError::Cancelled),
            candidates = self.collect_within(limit) => Ok(candidates),
        }
    }
}
