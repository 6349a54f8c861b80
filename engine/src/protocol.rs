//! Wire types for the replication protocol.
//!
//! A replica exposes its change feed (`GET /changes`) and accepts replicated
//! revisions (`POST /revisions`). Sequence numbers are local to the replica
//! that serves them; clients only store and echo them back.

use crate::{DocRevision, NodeId, Sequence};
use serde::{Deserialize, Serialize};

/// Default number of revisions per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Maximum number of revisions per batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Clamp a requested batch size to the protocol limits.
pub fn clamp_batch_size(limit: Option<usize>) -> usize {
    limit
        .map(|l| l.clamp(1, MAX_BATCH_SIZE))
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

/// Query parameters for reading a change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
    /// Exclusive lower bound (0 reads from the beginning)
    #[serde(default)]
    pub since: Sequence,
    /// Maximum number of revisions to return
    pub limit: Option<usize>,
}

/// A page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    /// Current revision of each changed document, in sequence order
    pub results: Vec<DocRevision>,
    /// Sequence to pass as `since` on the next read
    pub last_seq: Sequence,
    /// Whether more changes are available right away
    pub has_more: bool,
}

/// Request body for pushing revisions to a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Sender's node ID
    pub node_id: NodeId,
    /// Revisions to merge
    pub revisions: Vec<DocRevision>,
}

/// Response for a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Revisions that changed the receiver's state
    pub written: usize,
    /// Revisions the receiver already had
    pub known: usize,
    /// Conflict sets collapsed while applying the batch
    pub conflicts_resolved: usize,
    /// Receiver's sequence after the push
    pub last_seq: Sequence,
}

impl PushResponse {
    /// Revisions acknowledged by the receiver.
    pub fn acknowledged(&self) -> usize {
        self.written + self.known
    }

    /// Fold another batch's response into this one.
    pub fn absorb(&mut self, other: PushResponse) {
        self.written += other.written;
        self.known += other.known;
        self.conflicts_resolved += other.conflicts_resolved;
        self.last_seq = self.last_seq.max(other.last_seq);
    }
}

/// Health check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Leaf;
    use serde_json::json;

    #[test]
    fn clamp_limits() {
        assert_eq!(clamp_batch_size(None), DEFAULT_BATCH_SIZE);
        assert_eq!(clamp_batch_size(Some(0)), 1);
        assert_eq!(clamp_batch_size(Some(50)), 50);
        assert_eq!(clamp_batch_size(Some(5000)), MAX_BATCH_SIZE);
    }

    #[test]
    fn changes_query_defaults() {
        let query: ChangesQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.since, 0);
        assert_eq!(query.limit, None);
    }

    #[test]
    fn push_request_format() {
        let request = PushRequest {
            node_id: "till-1".into(),
            revisions: vec![DocRevision::new(
                "cart",
                Leaf::root(json!({"items": []}), false),
            )],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["nodeId"], "till-1");
        assert_eq!(value["revisions"][0]["id"], "cart");
    }

    #[test]
    fn push_response_absorb() {
        let mut total = PushResponse::default();
        total.absorb(PushResponse {
            written: 2,
            known: 1,
            conflicts_resolved: 1,
            last_seq: 7,
        });
        total.absorb(PushResponse {
            written: 1,
            known: 0,
            conflicts_resolved: 0,
            last_seq: 5,
        });
        assert_eq!(total.acknowledged(), 4);
        assert_eq!(total.conflicts_resolved, 1);
        assert_eq!(total.last_seq, 7);

        let json = serde_json::to_string(&total).unwrap();
        assert!(json.contains("conflictsResolved"));
        assert!(json.contains("lastSeq"));
    }
}
