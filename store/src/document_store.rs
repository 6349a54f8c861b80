//! Durable, revisioned document storage.
//!
//! Every mutation of one id is serialized through a per-id async lock, then
//! committed in a single transaction that also advances the local sequence.
//! Distinct ids proceed in parallel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use kenpos_engine::protocol::clamp_batch_size;
use kenpos_engine::{
    ChangesResponse, ConflictResolver, DocRevision, Document, DocumentId, DocumentTree, Leaf,
    Merge, PushResponse, Revision, Sequence,
};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::db;
use crate::error::{Result, StoreError};

/// Documents fetched per page of a range scan.
const SCAN_PAGE_SIZE: usize = 100;

/// Handle to an open document store. Cheap to clone.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    path: PathBuf,
    locks: DashMap<DocumentId, Arc<Mutex<()>>>,
    resolver: ConflictResolver,
    seq_tx: watch::Sender<Sequence>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DocumentStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_with_resolver(config, ConflictResolver::default()).await
    }

    /// Open the store with a custom conflict resolver.
    pub async fn open_with_resolver(
        config: &StoreConfig,
        resolver: ConflictResolver,
    ) -> Result<Self> {
        let pool = db::connect(config).await?;

        let (last_seq,): (i64,) = sqlx::query_as("SELECT value FROM sequence WHERE id = 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (seq_tx, _) = watch::channel(last_seq as Sequence);

        info!(path = %config.path.display(), last_seq, "Document store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                path: config.path.clone(),
                locks: DashMap::new(),
                resolver,
                seq_tx,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Close the store. Later operations fail with `Unavailable`.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.pool.close().await;
            info!(path = %self.inner.path.display(), "Document store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.inner.path
    }

    /// The latest local sequence number.
    pub fn last_seq(&self) -> Sequence {
        *self.inner.seq_tx.borrow()
    }

    /// Watch the local sequence; changes on every committed write.
    pub fn subscribe(&self) -> watch::Receiver<Sequence> {
        self.inner.seq_tx.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Local reads and writes
    // =========================================================================

    /// Read the current live value of a document.
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.ensure_open()?;

        let row: Option<(String, bool, String)> =
            sqlx::query_as("SELECT rev, deleted, body FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.inner.pool)
                .await?;

        match row {
            Some((rev, false, body)) => Ok(Document {
                id: id.to_string(),
                rev: rev.parse()?,
                body: serde_json::from_str(&body)?,
            }),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Write a document.
    ///
    /// With `expected` set, the write only succeeds if it matches the current
    /// revision. Without it the write lands on top of whatever is current.
    #[instrument(skip(self, body))]
    pub async fn put(
        &self,
        id: &str,
        body: serde_json::Value,
        expected: Option<&Revision>,
    ) -> Result<Revision> {
        self.ensure_open()?;
        let guard = self.lock(id).await;
        let result = self.edit_locked(id, body, false, expected).await;
        self.unlock(id, guard);
        result
    }

    /// Delete a document by writing a tombstone.
    ///
    /// Fails with `NotFound` if the document is absent or already deleted and
    /// with `Conflict` if `rev` is not the current revision.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str, rev: &Revision) -> Result<Revision> {
        self.ensure_open()?;
        let guard = self.lock(id).await;
        let result = self.remove_locked(id, rev).await;
        self.unlock(id, guard);
        result
    }

    async fn remove_locked(&self, id: &str, rev: &Revision) -> Result<Revision> {
        let tree = self.load_tree(id).await?;
        if tree.document().is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let tombstone = json!({ "deletedAt": chrono::Utc::now().to_rfc3339() });
        self.edit_locked(id, tombstone, true, Some(rev)).await
    }

    async fn edit_locked(
        &self,
        id: &str,
        body: serde_json::Value,
        deleted: bool,
        expected: Option<&Revision>,
    ) -> Result<Revision> {
        let mut tree = self.load_tree(id).await?;
        let rev = tree.edit(body, deleted, expected)?.rev.clone();
        self.inner.resolver.resolve(&mut tree);

        let seq = self.store_tree(&tree).await?;
        debug!(id, rev = %rev, seq, deleted, "Document written");
        Ok(rev)
    }

    /// All live documents whose id starts with `prefix`, in id order.
    ///
    /// The stream fetches one page at a time and holds no lock or cursor
    /// between pages, so it can be dropped or re-created at any point.
    pub fn range_scan(&self, prefix: &str) -> BoxStream<'static, Result<Document>> {
        let store = self.clone();
        let prefix = prefix.to_string();

        stream::try_unfold(Some(String::new()), move |cursor| {
            next_page(store.clone(), prefix.clone(), cursor)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Document, StoreError>)))
        .try_flatten()
        .boxed()
    }

    async fn scan_page(&self, prefix: &str, after: &str) -> Result<Vec<Document>> {
        self.ensure_open()?;

        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT id, rev, body FROM documents \
             WHERE deleted = 0 AND substr(id, 1, ?) = ? AND id > ? \
             ORDER BY id LIMIT ?",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(after)
        .bind(SCAN_PAGE_SIZE as i64)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter()
            .map(|(id, rev, body)| -> Result<Document> {
                Ok(Document {
                    id,
                    rev: rev.parse()?,
                    body: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Read the local change feed after `since`.
    ///
    /// Each changed document appears once, carrying its current leaf.
    pub async fn changes_since(
        &self,
        since: Sequence,
        limit: Option<usize>,
    ) -> Result<ChangesResponse> {
        self.ensure_open()?;
        let limit = clamp_batch_size(limit);

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT id, seq, tree FROM documents WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(since as i64)
        .bind(limit as i64 + 1)
        .fetch_all(&self.inner.pool)
        .await?;

        let has_more = rows.len() > limit;
        let mut results = Vec::with_capacity(limit.min(rows.len()));
        let mut last_seq = since;

        for (id, seq, tree) in rows.into_iter().take(limit) {
            let leaves: Vec<Leaf> = serde_json::from_str(&tree)?;
            let tree = DocumentTree::from_leaves(id, leaves);
            if let Some(leaf) = tree.current() {
                results.push(DocRevision::new(tree.id.clone(), leaf.clone()));
            }
            last_seq = seq as Sequence;
        }

        Ok(ChangesResponse {
            results,
            last_seq,
            has_more,
        })
    }

    /// Merge replicated revisions, resolving any conflicts they create.
    ///
    /// Revisions the store already knows are counted but not written, so a
    /// batch can be replayed safely.
    pub async fn apply_revisions(&self, revisions: Vec<DocRevision>) -> Result<PushResponse> {
        self.ensure_open()?;
        let mut response = PushResponse::default();

        for revision in revisions {
            let id = revision.id.clone();
            let guard = self.lock(&id).await;
            let result = self.merge_locked(revision).await;
            self.unlock(&id, guard);

            match result? {
                (Merge::Known, _) => response.known += 1,
                (_, resolved) => {
                    response.written += 1;
                    if resolved {
                        response.conflicts_resolved += 1;
                    }
                }
            }
        }

        response.last_seq = self.last_seq();
        Ok(response)
    }

    async fn merge_locked(&self, revision: DocRevision) -> Result<(Merge, bool)> {
        let mut tree = self.load_tree(&revision.id).await?;
        let rev = revision.leaf.rev.clone();

        let outcome = tree.merge(revision.leaf)?;
        if outcome == Merge::Known {
            return Ok((outcome, false));
        }

        let resolution = self.inner.resolver.resolve(&mut tree);
        if let Some(ref resolution) = resolution {
            info!(
                id = %resolution.id,
                winner = %resolution.winner,
                losers = resolution.losers.len(),
                merged = %resolution.merged,
                "Conflict resolved"
            );
        }

        let seq = self.store_tree(&tree).await?;
        debug!(id = %tree.id, rev = %rev, seq, ?outcome, "Revision merged");
        Ok((outcome, resolution.is_some()))
    }

    /// Read a replication cursor; 0 if never set.
    pub async fn checkpoint(&self, name: &str) -> Result<Sequence> {
        self.ensure_open()?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM checkpoints WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.inner.pool)
            .await?;
        Ok(row.map(|(v,)| v as Sequence).unwrap_or(0))
    }

    /// Persist a replication cursor.
    pub async fn set_checkpoint(&self, name: &str, seq: Sequence) -> Result<()> {
        self.ensure_open()?;
        sqlx::query(
            "INSERT INTO checkpoints (name, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(seq as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    /// Load the full revision tree of a document, including tombstones.
    pub async fn tree(&self, id: &str) -> Result<DocumentTree> {
        self.ensure_open()?;
        self.load_tree(id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = self.inner.locks.entry(id.to_string()).or_default().clone();
        mutex.lock_owned().await
    }

    fn unlock(&self, id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.inner
            .locks
            .remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    async fn load_tree(&self, id: &str) -> Result<DocumentTree> {
        let row: Option<(String,)> = sqlx::query_as("SELECT tree FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.inner.pool)
            .await?;

        match row {
            Some((tree,)) => Ok(DocumentTree::from_leaves(id, serde_json::from_str(&tree)?)),
            None => Ok(DocumentTree::new(id)),
        }
    }

    /// Commit a tree under a fresh sequence number.
    ///
    /// The transaction starts with the sequence update so it takes the write
    /// lock up front; the caller holds the id lock, so the tree it read is
    /// still current.
    async fn store_tree(&self, tree: &DocumentTree) -> Result<Sequence> {
        let Some(current) = tree.current() else {
            warn!(id = %tree.id, "Refusing to store an empty tree");
            return Err(StoreError::NotFound(tree.id.clone()));
        };

        let mut tx = self.inner.pool.begin().await?;

        let (seq,): (i64,) =
            sqlx::query_as("UPDATE sequence SET value = value + 1 WHERE id = 1 RETURNING value")
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO documents (id, seq, rev, deleted, body, tree) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, rev = excluded.rev, \
             deleted = excluded.deleted, body = excluded.body, tree = excluded.tree",
        )
        .bind(&tree.id)
        .bind(seq)
        .bind(current.rev.to_string())
        .bind(current.deleted)
        .bind(serde_json::to_string(&current.body)?)
        .bind(serde_json::to_string(tree.leaves())?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let seq = seq as Sequence;
        self.inner.seq_tx.send_if_modified(|latest| {
            if seq > *latest {
                *latest = seq;
                true
            } else {
                false
            }
        });
        Ok(seq)
    }
}

/// Fetch the page after `cursor`; `None` once the previous page was short.
async fn next_page(
    store: DocumentStore,
    prefix: String,
    cursor: Option<String>,
) -> Result<Option<(Vec<Document>, Option<String>)>> {
    let Some(after) = cursor else {
        return Ok(None);
    };
    let page = store.scan_page(&prefix, &after).await?;
    let next = if page.len() < SCAN_PAGE_SIZE {
        None
    } else {
        page.last().map(|doc| doc.id.clone())
    };
    Ok(Some((page, next)))
}
