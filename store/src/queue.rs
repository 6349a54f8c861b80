//! Completed orders waiting to be confirmed by the back office.
//!
//! Each order is one document keyed `order_<id>`, so queueing the same order
//! twice updates it rather than duplicating it.

use chrono::Utc;
use futures::TryStreamExt;
use kenpos_engine::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::document_store::DocumentStore;
use crate::error::{Result, StoreError};

/// Id prefix shared by all queued orders.
pub const ORDER_PREFIX: &str = "order_";

/// Field stamped on each queued order.
const QUEUED_AT: &str = "queuedAt";

const WRITE_ATTEMPTS: usize = 2;

/// A completed sale. Everything besides `id` is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Order {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Document id of a queued order.
pub fn order_doc_id(order_id: &str) -> String {
    format!("{}{}", ORDER_PREFIX, order_id)
}

/// The order queue over a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct OrderQueue {
    store: DocumentStore,
}

impl OrderQueue {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    /// Queue an order, replacing any earlier copy with the same id.
    pub async fn enqueue(&self, order: &Order) -> Result<Revision> {
        let doc_id = order_doc_id(&order.id);
        let mut body = serde_json::to_value(order)?;
        if let Some(fields) = body.as_object_mut() {
            fields.insert(QUEUED_AT.into(), Value::String(Utc::now().to_rfc3339()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.current_rev(&doc_id).await?;
            match self.store.put(&doc_id, body.clone(), current.as_ref()).await {
                Ok(rev) => {
                    debug!(order_id = %order.id, rev = %rev, "Order queued");
                    return Ok(rev);
                }
                Err(e) if e.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(order_id = %order.id, attempt, "Queue write conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All queued orders in id order, without queue metadata.
    pub async fn list(&self) -> Result<Vec<Order>> {
        self.store
            .range_scan(ORDER_PREFIX)
            .and_then(|doc| async move {
                let mut body = doc.body;
                if let Some(fields) = body.as_object_mut() {
                    fields.remove(QUEUED_AT);
                }
                Ok::<Order, StoreError>(serde_json::from_value(body)?)
            })
            .try_collect()
            .await
    }

    /// Number of queued orders.
    pub async fn count(&self) -> Result<usize> {
        self.store
            .range_scan(ORDER_PREFIX)
            .try_fold(0usize, |n, _| async move { Ok::<usize, StoreError>(n + 1) })
            .await
    }

    /// Drop an order from the queue. Removing an absent order is a no-op.
    pub async fn remove(&self, order_id: &str) -> Result<()> {
        let doc_id = order_doc_id(order_id);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(rev) = self.current_rev(&doc_id).await? else {
                debug!(order_id, "Order not queued");
                return Ok(());
            };
            match self.store.remove(&doc_id, &rev).await {
                Ok(_) => {
                    debug!(order_id, "Order removed from queue");
                    return Ok(());
                }
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(order_id, attempt, "Queue remove conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the whole queue with `orders`.
    pub async fn restore(&self, orders: &[Order]) -> Result<()> {
        let existing = self.list().await?;
        for order in &existing {
            self.remove(&order.id).await?;
        }
        for order in orders {
            self.enqueue(order).await?;
        }

        info!(
            removed = existing.len(),
            restored = orders.len(),
            "Order queue restored"
        );
        Ok(())
    }

    async fn current_rev(&self, doc_id: &str) -> Result<Option<Revision>> {
        match self.store.get(doc_id).await {
            Ok(doc) => Ok(Some(doc.rev)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
