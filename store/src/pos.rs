//! The API a till's UI talks to.
//!
//! [`PosStore`] owns the terminal's one shared [`DocumentStore`] handle,
//! opened lazily on first use, and at most one replication session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backup::Backup;
use crate::cart::{Cart, CartItem};
use crate::config::Config;
use crate::document_store::DocumentStore;
use crate::error::{Result, StoreError};
use crate::queue::{Order, OrderQueue};
use crate::remote::{HttpRemote, Remote};
use crate::replication::{self, Replicator, SyncReport, SyncStatus};

/// Local store, replication and domain adapters of one terminal.
pub struct PosStore {
    config: Config,
    store: OnceCell<DocumentStore>,
    sync: Mutex<SyncSlot>,
    closed: AtomicBool,
}

#[derive(Default)]
struct SyncSlot {
    replicator: Option<Replicator>,
    /// Last remote replication ran against; used for one-shot pushes.
    remote: Option<Arc<dyn Remote>>,
}

impl std::fmt::Debug for PosStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosStore")
            .field("path", &self.config.store.path)
            .field("opened", &self.store.initialized())
            .finish()
    }
}

impl PosStore {
    /// Create a handle; the database is opened on first use.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: OnceCell::new(),
            sync: Mutex::new(SyncSlot::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the database now, and start replication if configured to.
    pub async fn open(config: Config) -> Result<Self> {
        let pos = Self::new(config);
        pos.store().await?;

        if pos.config.sync.auto_start {
            match pos.config.sync.remote_url.clone() {
                Some(url) => {
                    pos.start_sync(&url).await?;
                }
                None => warn!("auto_start is set but no remote_url is configured"),
            }
        }
        Ok(pos)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared document store, opened on first call.
    pub async fn store(&self) -> Result<&DocumentStore> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is closed".into()));
        }
        self.store
            .get_or_try_init(|| DocumentStore::open(&self.config.store))
            .await
    }

    fn slot(&self) -> MutexGuard<'_, SyncSlot> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn cart(&self) -> Result<Cart> {
        Ok(Cart::new(self.store().await?.clone()))
    }

    async fn queue(&self) -> Result<OrderQueue> {
        Ok(OrderQueue::new(self.store().await?.clone()))
    }

    // =========================================================================
    // Cart
    // =========================================================================

    pub async fn save_cart(&self, items: &[CartItem]) -> Result<()> {
        self.cart().await?.save(items).await.map(|_| ())
    }

    pub async fn get_cart(&self) -> Result<Vec<CartItem>> {
        self.cart().await?.load().await
    }

    pub async fn clear_cart(&self) -> Result<()> {
        self.cart().await?.clear().await
    }

    pub async fn restore_cart(&self, items: &[CartItem]) -> Result<()> {
        self.cart().await?.restore(items).await.map(|_| ())
    }

    // =========================================================================
    // Order queue
    // =========================================================================

    pub async fn queue_order(&self, order: &Order) -> Result<()> {
        self.queue().await?.enqueue(order).await.map(|_| ())
    }

    pub async fn get_all_queued_orders(&self) -> Result<Vec<Order>> {
        self.queue().await?.list().await
    }

    pub async fn get_queued_order_count(&self) -> Result<usize> {
        self.queue().await?.count().await
    }

    pub async fn remove_queued_order(&self, order_id: &str) -> Result<()> {
        self.queue().await?.remove(order_id).await
    }

    pub async fn restore_queue(&self, orders: &[Order]) -> Result<()> {
        self.queue().await?.restore(orders).await
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Start continuous replication with the sync server at `remote_url`.
    ///
    /// Returns once the session is running; connection problems show up in
    /// [`get_sync_status`](Self::get_sync_status), not here.
    pub async fn start_sync(&self, remote_url: &str) -> Result<SyncStatus> {
        let remote = HttpRemote::new(
            remote_url,
            self.config.node.id.clone(),
            self.config.sync.auth_token.clone(),
            self.config.sync.request_timeout(),
        )?;
        self.start_sync_with(Arc::new(remote)).await
    }

    /// Start continuous replication with any [`Remote`].
    pub async fn start_sync_with(&self, remote: Arc<dyn Remote>) -> Result<SyncStatus> {
        self.config.sync.validate()?;
        let store = self.store().await?.clone();
        self.stop_sync().await;

        let replicator = Replicator::start(store, remote.clone(), self.config.sync.clone());
        let status = replicator.status();

        let previous = {
            let mut slot = self.slot();
            slot.remote = Some(remote);
            slot.replicator.replace(replicator)
        };
        // A concurrent start won the race; its session yields to this one.
        if let Some(previous) = previous {
            previous.stop().await;
        }

        Ok(status)
    }

    /// Stop continuous replication and wait for the session to exit.
    pub async fn stop_sync(&self) -> SyncStatus {
        let replicator = self.slot().replicator.take();
        match replicator {
            Some(replicator) => replicator.stop().await,
            None => SyncStatus::default(),
        }
    }

    /// Current replication status. Never blocks on the session.
    pub fn get_sync_status(&self) -> SyncStatus {
        self.slot()
            .replicator
            .as_ref()
            .map(Replicator::status)
            .unwrap_or_default()
    }

    /// Push pending local changes (queued orders included) once.
    ///
    /// Uses the remote of the last replication session, else the configured
    /// `remote_url`. Without either, nothing is pushed.
    pub async fn sync_pending_orders(&self) -> Result<SyncReport> {
        let store = self.store().await?.clone();

        let remote = self.slot().remote.clone();
        let remote: Arc<dyn Remote> = match (remote, &self.config.sync.remote_url) {
            (Some(remote), _) => remote,
            (None, Some(url)) => Arc::new(HttpRemote::new(
                url.as_str(),
                self.config.node.id.clone(),
                self.config.sync.auth_token.clone(),
                self.config.sync.request_timeout(),
            )?),
            (None, None) => {
                warn!("No remote configured; pending orders stay queued locally");
                return Ok(SyncReport::default());
            }
        };

        let pending = self.get_queued_order_count().await?;
        let report = replication::push_once(&store, remote.as_ref(), &self.config.sync).await;
        info!(
            pending,
            pushed = report.pushed,
            failed = report.failed,
            "Manual sync finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Backup
    // =========================================================================

    pub async fn export_backup(&self) -> Result<Backup> {
        let cart = self.get_cart().await?;
        let orders = self.get_all_queued_orders().await?;
        Ok(Backup::new(cart, orders).with_node(self.config.node.id.clone()))
    }

    /// Replace the cart and queue with the backup's contents.
    ///
    /// An empty backup cart clears the cart.
    pub async fn restore_backup(&self, backup: &Backup) -> Result<()> {
        if backup.cart.is_empty() {
            self.clear_cart().await?;
        } else {
            self.restore_cart(&backup.cart).await?;
        }
        self.restore_queue(&backup.orders).await?;

        info!(
            items = backup.cart.len(),
            orders = backup.order_count(),
            created_at = %backup.created_at,
            "Backup restored"
        );
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop replication and close the database.
    ///
    /// Operations after `close` fail with `Unavailable`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_sync().await;
        self.slot().remote = None;

        if let Some(store) = self.store.get() {
            store.close().await;
        }
    }
}
