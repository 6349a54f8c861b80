//! Continuous and one-shot replication between a local store and a remote.
//!
//! ## Session states
//! ```text
//! start()
//!   │
//!   ▼
//! Active ──(caught up)──► Paused ──(local write / poll)──► Active
//!   │                        │
//!   └──(transport error)─────┴──► Error ──(backoff elapsed)──► Active
//!
//! stop() from any state ──► Idle
//! ```
//!
//! A cycle pulls every remote change since the pull checkpoint, then pushes
//! every local change since the push checkpoint. Checkpoints are persisted per
//! remote endpoint, so a restarted session resumes where it left off. Pulled
//! revisions go through the store's merge-and-resolve path. The push half of
//! the same cycle skips revisions it just pulled, and only revisions the
//! remote actually wrote count as pushed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use kenpos_engine::{DocumentId, Revision, Sequence};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::document_store::DocumentStore;
use crate::error::{Result, StoreError};
use crate::remote::Remote;

// =============================================================================
// Status
// =============================================================================

/// Replication session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No session running.
    #[default]
    Idle,
    /// A cycle is moving documents.
    Active,
    /// Both sides are caught up; waiting for changes.
    Paused,
    /// The last cycle failed; retrying after backoff.
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Active => write!(f, "active"),
            SyncState::Paused => write!(f, "paused"),
            SyncState::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of a replication session, as shown to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Session is running and healthy (active or paused).
    pub is_syncing: bool,
    pub paused: bool,
    pub last_error: Option<String>,
    /// A session exists, healthy or not.
    pub enabled: bool,
    /// Revisions pulled since the session started.
    pub docs_read: u64,
    /// Revisions pushed since the session started.
    pub docs_written: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    fn set_state(&mut self, state: SyncState) {
        self.state = state;
        self.is_syncing = matches!(state, SyncState::Active | SyncState::Paused);
        self.paused = state == SyncState::Paused;
        self.enabled = state != SyncState::Idle;
    }
}

/// Outcome of a one-shot replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Revisions received from the remote.
    pub pulled: usize,
    /// Revisions the remote wrote. Revisions it already knew are not counted.
    pub pushed: usize,
    /// Revisions sent but not acknowledged.
    pub failed: usize,
    /// Conflict sets collapsed on either side.
    pub conflicts_resolved: usize,
    /// Set when the run stopped early.
    pub error: Option<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }

    fn moved(&self) -> bool {
        self.pulled > 0 || self.pushed > 0
    }
}

// =============================================================================
// One-shot
// =============================================================================

/// Push every local change since the push checkpoint once.
pub async fn push_once(
    store: &DocumentStore,
    remote: &dyn Remote,
    config: &SyncConfig,
) -> SyncReport {
    let mut report = SyncReport::default();
    if let Err(e) = push(store, remote, config, &Pulled::new(), &mut report).await {
        warn!(endpoint = %remote.endpoint(), error = %e, "One-shot push failed");
        report.error = Some(e.to_string());
    }
    info!(
        endpoint = %remote.endpoint(),
        pushed = report.pushed,
        failed = report.failed,
        "One-shot push finished"
    );
    report
}

/// Pull then push once, without looping.
pub async fn sync_once(
    store: &DocumentStore,
    remote: &dyn Remote,
    config: &SyncConfig,
) -> SyncReport {
    let mut report = SyncReport::default();
    if let Err(e) = cycle(store, remote, config, &mut report).await {
        warn!(endpoint = %remote.endpoint(), error = %e, "One-shot sync failed");
        report.error = Some(e.to_string());
    }
    report
}

async fn cycle(
    store: &DocumentStore,
    remote: &dyn Remote,
    config: &SyncConfig,
    report: &mut SyncReport,
) -> Result<()> {
    let pulled = pull(store, remote, config, report).await?;
    push(store, remote, config, &pulled, report).await
}

/// Revisions received from the remote during the current cycle.
type Pulled = HashSet<(DocumentId, Revision)>;

fn checkpoint_key(direction: &str, endpoint: &str) -> String {
    format!("{}:{}", direction, endpoint)
}

/// Bound one round-trip to the remote.
async fn round_trip<T>(
    endpoint: &str,
    limit: Duration,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    timeout(limit, call).await.map_err(|_| {
        StoreError::Transport(format!("request to {} timed out after {:?}", endpoint, limit))
    })?
}

async fn pull(
    store: &DocumentStore,
    remote: &dyn Remote,
    config: &SyncConfig,
    report: &mut SyncReport,
) -> Result<Pulled> {
    let endpoint = remote.endpoint();
    let key = checkpoint_key("pull", &endpoint);
    let mut since: Sequence = store.checkpoint(&key).await?;
    let mut pulled = Pulled::new();

    loop {
        let page = round_trip(
            &endpoint,
            config.request_timeout(),
            remote.changes(since, config.batch_size),
        )
        .await?;

        if !page.results.is_empty() {
            report.pulled += page.results.len();
            pulled.extend(
                page.results
                    .iter()
                    .map(|r| (r.id.clone(), r.leaf.rev.clone())),
            );
            let applied = store.apply_revisions(page.results).await?;
            report.conflicts_resolved += applied.conflicts_resolved;
            debug!(
                endpoint = %endpoint,
                written = applied.written,
                known = applied.known,
                "Applied pulled revisions"
            );
        }

        let advanced = page.last_seq > since;
        if advanced {
            store.set_checkpoint(&key, page.last_seq).await?;
            since = page.last_seq;
        }
        if !page.has_more || !advanced {
            return Ok(pulled);
        }
    }
}

async fn push(
    store: &DocumentStore,
    remote: &dyn Remote,
    config: &SyncConfig,
    pulled: &Pulled,
    report: &mut SyncReport,
) -> Result<()> {
    let endpoint = remote.endpoint();
    let key = checkpoint_key("push", &endpoint);
    let mut since: Sequence = store.checkpoint(&key).await?;

    loop {
        let page = store.changes_since(since, Some(config.batch_size)).await?;
        if page.results.is_empty() {
            return Ok(());
        }

        let outgoing: Vec<_> = page
            .results
            .into_iter()
            .filter(|r| !pulled.contains(&(r.id.clone(), r.leaf.rev.clone())))
            .collect();

        if !outgoing.is_empty() {
            let sent = outgoing.len();
            let response = round_trip(
                &endpoint,
                config.request_timeout(),
                remote.push(outgoing),
            )
            .await?;

            report.pushed += response.written.min(sent);
            report.failed += sent.saturating_sub(response.acknowledged());
            report.conflicts_resolved += response.conflicts_resolved;
        }

        store.set_checkpoint(&key, page.last_seq).await?;
        since = page.last_seq;

        if !page.has_more {
            return Ok(());
        }
    }
}

// =============================================================================
// Continuous
// =============================================================================

/// Handle to a running continuous replication session.
///
/// Dropping the handle signals the session to stop without waiting for it.
pub struct Replicator {
    endpoint: String,
    status_rx: watch::Receiver<SyncStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("endpoint", &self.endpoint)
            .field("state", &self.status_rx.borrow().state)
            .finish()
    }
}

impl Replicator {
    /// Spawn a session and return once it is running.
    pub fn start(store: DocumentStore, remote: Arc<dyn Remote>, config: SyncConfig) -> Self {
        let endpoint = remote.endpoint();

        let mut initial = SyncStatus::default();
        initial.set_state(SyncState::Active);
        let (status_tx, status_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Session {
            store,
            remote,
            config,
            status_tx,
            shutdown_rx,
        };
        let task = tokio::spawn(session.run());

        info!(endpoint = %endpoint, "Replication started");
        Self {
            endpoint,
            status_rx,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current session status. Never blocks.
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Signal the session to stop and wait for it to exit.
    pub async fn stop(mut self) -> SyncStatus {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(endpoint = %self.endpoint, error = %e, "Replication task failed");
            }
        }
        info!(endpoint = %self.endpoint, "Replication stopped");
        self.status()
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Session {
    store: DocumentStore,
    remote: Arc<dyn Remote>,
    config: SyncConfig,
    status_tx: watch::Sender<SyncStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session {
    async fn run(mut self) {
        let endpoint = self.remote.endpoint();
        let mut backoff = self.create_backoff();
        let mut local = self.store.subscribe();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            // Writes made before this point are covered by the cycle.
            let _ = local.borrow_and_update();
            self.status_tx
                .send_modify(|status| status.set_state(SyncState::Active));

            let mut report = SyncReport::default();
            let result = tokio::select! {
                result = cycle(&self.store, self.remote.as_ref(), &self.config, &mut report) => result,
                _ = self.shutdown_rx.changed() => break,
            };
            self.record(&report);

            match result {
                Ok(()) => {
                    backoff.reset();
                    self.status_tx.send_modify(|status| {
                        status.last_error = None;
                        status.last_sync_at = Some(Utc::now());
                    });

                    if report.moved() {
                        debug!(
                            endpoint = %endpoint,
                            pulled = report.pulled,
                            pushed = report.pushed,
                            "Replication cycle moved documents"
                        );
                        continue;
                    }

                    self.status_tx
                        .send_modify(|status| status.set_state(SyncState::Paused));

                    tokio::select! {
                        changed = local.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Replication cycle failed");
                    let message = e.to_string();
                    self.status_tx.send_modify(|status| {
                        status.set_state(SyncState::Error);
                        status.last_error = Some(message);
                    });

                    let Some(delay) = backoff.next_backoff() else {
                        error!(endpoint = %endpoint, "Replication backoff exhausted");
                        break;
                    };
                    debug!(endpoint = %endpoint, ?delay, "Waiting before retry");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
            }
        }

        self.status_tx
            .send_modify(|status| status.set_state(SyncState::Idle));
        debug!(endpoint = %endpoint, "Replication session exited");
    }

    fn record(&self, report: &SyncReport) {
        if report.pulled == 0 && report.pushed == 0 {
            return;
        }
        self.status_tx.send_modify(|status| {
            status.docs_read += report.pulled as u64;
            status.docs_written += report.pushed as u64;
        });
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
