//! Point-in-time export of a terminal's cart and order queue.
//!
//! A backup is plain JSON so it can be written to removable media or sent to
//! support, then restored on the same or a replacement terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cart::CartItem;
use crate::error::{Result, StoreError};
use crate::queue::Order;

/// Version of the backup format for future compatibility.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Cart and queued orders as of `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Backup format version
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Node that produced the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub cart: Vec<CartItem>,
    #[serde(default)]
    pub orders: Vec<Order>,
}

impl Backup {
    pub fn new(cart: Vec<CartItem>, orders: Vec<Order>) -> Self {
        Self {
            format_version: BACKUP_FORMAT_VERSION,
            created_at: Utc::now(),
            node_id: None,
            cart,
            orders,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cart.is_empty() && self.orders.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a backup, rejecting formats newer than this build understands.
    pub fn from_json(json: &str) -> Result<Self> {
        let backup: Self =
            serde_json::from_str(json).map_err(|e| StoreError::InvalidBackup(e.to_string()))?;

        if backup.format_version > BACKUP_FORMAT_VERSION {
            return Err(StoreError::InvalidBackup(format!(
                "unsupported backup format version: {} (max supported: {})",
                backup.format_version, BACKUP_FORMAT_VERSION
            )));
        }

        Ok(backup)
    }
}
