//! Replication peers.
//!
//! A [`Remote`] is anything that serves a change feed and accepts replicated
//! revisions: the HTTP sync server in production, or another
//! [`DocumentStore`] in the same process.

use async_trait::async_trait;
use kenpos_engine::{
    ChangesQuery, ChangesResponse, DocRevision, NodeId, PushRequest, PushResponse, Sequence,
};
use std::time::Duration;
use tracing::debug;

use crate::document_store::DocumentStore;
use crate::error::{Result, StoreError};

/// A replication peer.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Stable name of the peer; replication checkpoints are keyed on it.
    fn endpoint(&self) -> String;

    /// Read the peer's change feed after `since`.
    async fn changes(&self, since: Sequence, limit: usize) -> Result<ChangesResponse>;

    /// Hand revisions to the peer's write path.
    async fn push(&self, revisions: Vec<DocRevision>) -> Result<PushResponse>;
}

#[async_trait]
impl Remote for DocumentStore {
    fn endpoint(&self) -> String {
        format!("local:{}", self.path().display())
    }

    async fn changes(&self, since: Sequence, limit: usize) -> Result<ChangesResponse> {
        self.changes_since(since, Some(limit)).await
    }

    async fn push(&self, revisions: Vec<DocRevision>) -> Result<PushResponse> {
        self.apply_revisions(revisions).await
    }
}

/// HTTP client for a `kenpos-server` replica.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    base_url: String,
    node_id: NodeId,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Create a client for the replica at `base_url`.
    ///
    /// `timeout` bounds every request, connect included.
    pub fn new(
        base_url: impl Into<String>,
        node_id: impl Into<NodeId>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node_id: node_id.into(),
            token,
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Transport(format!(
            "remote returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl Remote for HttpRemote {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn changes(&self, since: Sequence, limit: usize) -> Result<ChangesResponse> {
        let query = ChangesQuery {
            since,
            limit: Some(limit),
        };
        let request = self
            .client
            .get(format!("{}/changes", self.base_url))
            .query(&query);

        let response = Self::check(self.authorize(request).send().await?).await?;
        let changes: ChangesResponse = response.json().await?;

        debug!(
            endpoint = %self.base_url,
            since,
            received = changes.results.len(),
            last_seq = changes.last_seq,
            "Pulled changes"
        );
        Ok(changes)
    }

    async fn push(&self, revisions: Vec<DocRevision>) -> Result<PushResponse> {
        let count = revisions.len();
        let body = PushRequest {
            node_id: self.node_id.clone(),
            revisions,
        };
        let request = self
            .client
            .post(format!("{}/revisions", self.base_url))
            .json(&body);

        let response = Self::check(self.authorize(request).send().await?).await?;
        let pushed: PushResponse = response.json().await?;

        debug!(
            endpoint = %self.base_url,
            sent = count,
            written = pushed.written,
            known = pushed.known,
            "Pushed revisions"
        );
        Ok(pushed)
    }
}
