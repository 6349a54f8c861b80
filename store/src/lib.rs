//! # KenPOS Store
//!
//! Offline-first persistence for a point-of-sale terminal: a durable,
//! revisioned document store on embedded SQLite, background replication with
//! a remote replica, and the cart and order queue built on top.
//!
//! ## Layers
//!
//! ```text
//! PosStore (UI-facing API)
//!   ├── Cart / OrderQueue     domain adapters, get/put/remove/range_scan only
//!   ├── DocumentStore         per-id serialized writes, change feed
//!   │     └── ConflictResolver (kenpos-engine), run after every write
//!   └── Replicator            pull + push against a Remote, with backoff
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kenpos_store::{CartItem, Config, Order, PosStore};
//!
//! # async fn run() -> kenpos_store::Result<()> {
//! let pos = PosStore::new(Config::load(None)?);
//!
//! pos.save_cart(&[CartItem::new("sku1", 2)]).await?;
//! pos.queue_order(&Order::new("1042").with("total", 1299)).await?;
//!
//! pos.start_sync("https://sync.example.com").await?;
//! println!("{:?}", pos.get_sync_status());
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod cart;
pub mod config;
pub mod db;
pub mod document_store;
pub mod error;
pub mod pos;
pub mod queue;
pub mod remote;
pub mod replication;

pub use backup::{Backup, BACKUP_FORMAT_VERSION};
pub use cart::{Cart, CartItem, CART_ID};
pub use config::{Config, NodeConfig, StoreConfig, SyncConfig};
pub use document_store::DocumentStore;
pub use error::{Result, StoreError};
pub use pos::PosStore;
pub use queue::{order_doc_id, Order, OrderQueue, ORDER_PREFIX};
pub use remote::{HttpRemote, Remote};
pub use replication::{push_once, sync_once, Replicator, SyncReport, SyncState, SyncStatus};
