//! # KenPOS Engine
//!
//! Deterministic revision and conflict-resolution logic for the KenPOS
//! offline-first document store.
//!
//! This crate holds everything about documents that does not touch a disk or
//! a socket: revision tokens, per-document revision trees, last-writer-wins
//! conflict resolution and the replication wire types. The same inputs always
//! produce the same outputs, which is what lets independent replicas converge.
//!
//! ## Design Principles
//!
//! - **No IO**: storage and transport live in `kenpos-store`
//! - **Deterministic**: revision tokens are content-derived
//! - **Convergent**: replicas resolving the same conflict set mint the same
//!   merged revision
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A document is identified by an application-chosen id and holds a JSON
//! body. Every write produces a new [`Revision`]; deletions write a tombstone
//! leaf so they replicate like any other change.
//!
//! ### Revision trees
//!
//! A [`DocumentTree`] holds the leaf revisions of one document. Local edits go
//! through [`DocumentTree::edit`] (optimistic concurrency on the expected
//! revision); replicated revisions go through [`DocumentTree::merge`], which
//! may leave more than one leaf behind.
//!
//! ### Conflict resolution
//!
//! The [`ConflictResolver`] collapses a multi-leaf tree: the leaf with the
//! latest `updatedAt`/`queuedAt`/`deletedAt` stamp wins, ties go to the
//! higher revision.
//!
//! ## Quick Start
//!
//! ```rust
//! use kenpos_engine::{ConflictResolver, DocumentTree, Merge};
//! use serde_json::json;
//!
//! // Two terminals start from the same cart...
//! let mut till_a = DocumentTree::new("cart");
//! till_a
//!     .edit(json!({"items": [], "updatedAt": "2024-06-01T09:00:00Z"}), false, None)
//!     .unwrap();
//! let mut till_b = till_a.clone();
//!
//! // ...and edit it concurrently.
//! let a = till_a
//!     .edit(json!({"items": ["sku1"], "updatedAt": "2024-06-01T09:00:01Z"}), false, None)
//!     .unwrap()
//!     .clone();
//! let b = till_b
//!     .edit(json!({"items": ["sku2"], "updatedAt": "2024-06-01T09:00:02Z"}), false, None)
//!     .unwrap()
//!     .clone();
//!
//! // Exchanging the edits produces the same conflict set on both sides.
//! assert_eq!(till_a.merge(b).unwrap(), Merge::Conflicted);
//! assert_eq!(till_b.merge(a).unwrap(), Merge::Conflicted);
//!
//! let resolver = ConflictResolver::default();
//! resolver.resolve(&mut till_a).unwrap();
//! resolver.resolve(&mut till_b).unwrap();
//!
//! assert_eq!(till_a, till_b);
//! assert_eq!(till_a.document().unwrap().body["items"][0], "sku2");
//! ```

pub mod document;
pub mod error;
pub mod protocol;
pub mod resolve;
pub mod revision;

// Re-export main types at crate root
pub use document::{DocRevision, Document, DocumentTree, Leaf, Merge, MAX_ANCESTORS};
pub use error::Error;
pub use protocol::{
    ChangesQuery, ChangesResponse, HealthResponse, PushRequest, PushResponse, DEFAULT_BATCH_SIZE,
    MAX_BATCH_SIZE,
};
pub use resolve::{ConflictResolver, Resolution, DEFAULT_TIMESTAMP_FIELDS};
pub use revision::Revision;

/// Type aliases for clarity
pub type DocumentId = String;
pub type NodeId = String;
pub type Sequence = u64;
