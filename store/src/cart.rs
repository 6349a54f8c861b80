//! The in-progress sale of a terminal, kept as one document.

use chrono::Utc;
use kenpos_engine::Revision;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::document_store::DocumentStore;
use crate::error::{Result, StoreError};

/// Document id of the cart.
pub const CART_ID: &str = "cart";

/// Attempts made before a revision conflict is returned to the caller.
const WRITE_ATTEMPTS: usize = 2;

/// One line of the cart. Fields other than `id` and `qty` are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub qty: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CartItem {
    pub fn new(id: impl Into<String>, qty: u32) -> Self {
        Self {
            id: id.into(),
            qty,
            extra: Map::new(),
        }
    }

    /// Attach an extra field (price, name, ...).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartBody {
    #[serde(default)]
    items: Vec<CartItem>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Cart persistence over a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct Cart {
    store: DocumentStore,
}

impl Cart {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    /// Replace the cart contents.
    ///
    /// Writes on top of the revision just read; if another writer slips in
    /// between, the read is repeated once before the conflict is returned.
    pub async fn save(&self, items: &[CartItem]) -> Result<Revision> {
        let body = serde_json::to_value(CartBody {
            items: items.to_vec(),
            updated_at: Some(Utc::now().to_rfc3339()),
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.current_rev().await?;
            match self.store.put(CART_ID, body.clone(), current.as_ref()).await {
                Ok(rev) => {
                    debug!(items = items.len(), rev = %rev, "Cart saved");
                    return Ok(rev);
                }
                Err(e) if e.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(attempt, "Cart write conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current cart contents; empty if there is no cart.
    pub async fn load(&self) -> Result<Vec<CartItem>> {
        match self.store.get(CART_ID).await {
            Ok(doc) => {
                let body: CartBody = serde_json::from_value(doc.body)?;
                Ok(body.items)
            }
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Delete the cart. Clearing an absent cart is a no-op.
    pub async fn clear(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(rev) = self.current_rev().await? else {
                debug!("No cart to clear");
                return Ok(());
            };
            match self.store.remove(CART_ID, &rev).await {
                Ok(_) => {
                    info!("Cart cleared");
                    return Ok(());
                }
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < WRITE_ATTEMPTS => {
                    debug!(attempt, "Cart clear conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Restore cart contents from a backup.
    pub async fn restore(&self, items: &[CartItem]) -> Result<Revision> {
        self.save(items).await
    }

    async fn current_rev(&self) -> Result<Option<Revision>> {
        match self.store.get(CART_ID).await {
            Ok(doc) => Ok(Some(doc.rev)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use serde_json::json;

    async fn cart() -> (tempfile::TempDir, Cart) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&StoreConfig::new(dir.path().join("cart.db")))
            .await
            .unwrap();
        (dir, Cart::new(store))
    }

    #[tokio::test]
    async fn save_load_clear() {
        let (_dir, cart) = cart().await;
        cart.save(&[CartItem::new("sku1", 2)]).await.unwrap();
        assert_eq!(cart.load().await.unwrap(), vec![CartItem::new("sku1", 2)]);

        cart.clear().await.unwrap();
        assert!(cart.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_without_cart_is_empty() {
        let (_dir, cart) = cart().await;
        assert!(cart.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_without_cart_is_noop() {
        let (_dir, cart) = cart().await;
        cart.clear().await.unwrap();
        cart.clear().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_saves_extend_one_document() {
        let (_dir, cart) = cart().await;
        let first = cart.save(&[CartItem::new("sku1", 1)]).await.unwrap();
        let second = cart.save(&[CartItem::new("sku1", 2)]).await.unwrap();
        assert_eq!(second.generation(), first.generation() + 1);

        let tree = cart.store.tree(CART_ID).await.unwrap();
        assert_eq!(tree.leaves().len(), 1);
    }

    #[tokio::test]
    async fn extra_fields_survive() {
        let (_dir, cart) = cart().await;
        let item = CartItem::new("sku9", 1)
            .with("price", 1250)
            .with("name", "Coffee");
        cart.save(std::slice::from_ref(&item)).await.unwrap();

        let doc = cart.store.get(CART_ID).await.unwrap();
        assert_eq!(doc.body["items"][0]["price"], json!(1250));
        assert!(doc.body["updatedAt"].is_string());
        assert_eq!(cart.load().await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn save_after_clear_recreates_cart() {
        let (_dir, cart) = cart().await;
        cart.save(&[CartItem::new("a", 1)]).await.unwrap();
        cart.clear().await.unwrap();
        cart.save(&[CartItem::new("b", 3)]).await.unwrap();
        assert_eq!(cart.load().await.unwrap(), vec![CartItem::new("b", 3)]);
    }

    #[tokio::test]
    async fn concurrent_saves_leave_one_cart() {
        let (_dir, cart) = cart().await;
        let mut handles = Vec::new();
        for i in 0..8 {
            let cart = cart.clone();
            handles.push(tokio::spawn(async move {
                cart.save(&[CartItem::new(format!("sku{}", i), 1)]).await
            }));
        }

        let mut saved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => saved += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert!(saved >= 1);
        assert_eq!(cart.load().await.unwrap().len(), 1);
    }
}
