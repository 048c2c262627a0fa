//! Signaling relay transport
//!
//! Each operation is a single request/response call. Nothing is retried here;
//! the negotiators own the polling policy.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::error::SignalingError;
use crate::protocol::{
    encode_candidates, Candidate, CreateHostRequest, HostReply, HostResponseRequest, HostSession,
    JoinCandidatesRequest, JoinRequest, JoinResponse, SessionDescription,
};

/// The relay operations both negotiators depend on
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// `POST /host`
    async fn create_host_session(
        &self,
        public: bool,
        host_name: &str,
    ) -> Result<HostSession, SignalingError>;

    /// `GET /host/messages`
    async fn poll_host_messages(
        &self,
        session_name: &str,
        host_secret: &str,
    ) -> Result<Vec<Value>, SignalingError>;

    /// `POST /join/response`
    async fn post_host_response(
        &self,
        session_name: &str,
        client_name: &str,
        host_secret: &str,
        message: &HostReply,
    ) -> Result<(), SignalingError>;

    /// `POST /join`, returning the client secret
    async fn create_join_request(
        &self,
        session_name: &str,
        client_name: &str,
        offer: &SessionDescription,
    ) -> Result<String, SignalingError>;

    /// `POST /join/candidates`
    async fn post_join_candidates(
        &self,
        session_name: &str,
        client_name: &str,
        client_secret: &str,
        candidates: &[Candidate],
    ) -> Result<(), SignalingError>;

    /// `GET /join/messages`
    async fn poll_join_messages(
        &self,
        session_name: &str,
        client_name: &str,
        client_secret: &str,
    ) -> Result<Vec<Value>, SignalingError>;
}

/// HTTP client for the relay
#[derive(Debug, Clone)]
pub struct HttpRelay {
    base: Url,
    http: reqwest::Client,
}

impl HttpRelay {
    pub fn new(base_url: &str) -> Result<Self, SignalingError> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self, SignalingError> {
        // Relative joins drop the last path segment unless the base ends in '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };

        Ok(Self {
            base: Url::parse(&normalized)?,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SignalingError> {
        Ok(self.base.join(path)?)
    }
}

#[async_trait]
impl SignalingTransport for HttpRelay {
    async fn create_host_session(
        &self,
        public: bool,
        host_name: &str,
    ) -> Result<HostSession, SignalingError> {
        let response = self
            .http
            .post(self.endpoint("host")?)
            .json(&CreateHostRequest { public, host_name })
            .send()
            .await?;

        debug!("POST /host -> {}", response.status());

        let session = response.error_for_status()?.json::<HostSession>().await?;
        Ok(session)
    }

    async fn poll_host_messages(
        &self,
        session_name: &str,
        host_secret: &str,
    ) -> Result<Vec<Value>, SignalingError> {
        let messages = self
            .http
            .get(self.endpoint("host/messages")?)
            .query(&[("session_name", session_name), ("host_secret", host_secret)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Value>>()
            .await?;
        Ok(messages)
    }

    async fn post_host_response(
        &self,
        session_name: &str,
        client_name: &str,
        host_secret: &str,
        message: &HostReply,
    ) -> Result<(), SignalingError> {
        self.http
            .post(self.endpoint("join/response")?)
            .json(&HostResponseRequest {
                session_name,
                client_name,
                host_secret,
                messages: message,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn create_join_request(
        &self,
        session_name: &str,
        client_name: &str,
        offer: &SessionDescription,
    ) -> Result<String, SignalingError> {
        let response = self
            .http
            .post(self.endpoint("join")?)
            .json(&JoinRequest {
                session_name,
                client_name,
                rtc_offer: serde_json::to_string(offer)?,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SignalingError::Transport(format!(
                "join request for session {} rejected: {}",
                session_name, status
            )));
        }

        let body = response.json::<JoinResponse>().await?;
        Ok(body.client_secret)
    }

    async fn post_join_candidates(
        &self,
        session_name: &str,
        client_name: &str,
        client_secret: &str,
        candidates: &[Candidate],
    ) -> Result<(), SignalingError> {
        self.http
            .post(self.endpoint("join/candidates")?)
            .json(&JoinCandidatesRequest {
                session_name,
                client_name,
                client_secret,
                candidates: encode_candidates(candidates)?,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn poll_join_messages(
        &self,
        session_name: &str,
        client_name: &str,
        client_secret: &str,
    ) -> Result<Vec<Value>, SignalingError> {
        let messages = self
            .http
            .get(self.endpoint("join/messages")?)
            .query(&[
                ("session_name", session_name),
                ("client_name", client_name),
                ("client_secret", client_secret),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Value>>()
            .await?;
        Ok(messages)
    }
}
