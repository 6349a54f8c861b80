//! Document types: leaf revisions, the per-id revision tree and the
//! replication unit.

use crate::error::{Error, Result};
use crate::{DocumentId, Revision};
use serde::{Deserialize, Serialize};

/// Maximum number of ancestor revisions remembered per leaf.
///
/// A peer whose copy is older than this horizon is treated as concurrent and
/// goes through conflict resolution instead of a fast-forward.
pub const MAX_ANCESTORS: usize = 100;

/// A leaf revision of a document together with its ancestry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaf {
    /// This revision's token
    pub rev: Revision,
    /// Ancestor revisions, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<Revision>,
    /// The document body at this revision
    pub body: serde_json::Value,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl Leaf {
    /// Create a first-generation leaf with no history.
    pub fn root(body: serde_json::Value, deleted: bool) -> Self {
        Self {
            rev: Revision::derive(1, &[], &body, deleted),
            ancestors: Vec::new(),
            body,
            deleted,
        }
    }

    /// Create a leaf that descends from `parent`.
    pub fn child_of(parent: &Leaf, body: serde_json::Value, deleted: bool) -> Self {
        let rev = Revision::derive(
            parent.rev.generation() + 1,
            std::slice::from_ref(&parent.rev),
            &body,
            deleted,
        );

        let mut ancestors = Vec::with_capacity(parent.ancestors.len() + 1);
        ancestors.push(parent.rev.clone());
        ancestors.extend(parent.ancestors.iter().cloned());
        ancestors.truncate(MAX_ANCESTORS);

        Self {
            rev,
            ancestors,
            body,
            deleted,
        }
    }

    /// Check if this leaf is live (not a tombstone).
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Check if `rev` is this leaf or one of its remembered ancestors.
    pub fn covers(&self, rev: &Revision) -> bool {
        &self.rev == rev || self.ancestors.contains(rev)
    }

    /// Reject leaves whose ancestry cannot precede them.
    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self
            .ancestors
            .iter()
            .find(|a| a.generation() >= self.rev.generation())
        {
            return Err(Error::InvalidDocument(format!(
                "ancestor {} is not older than revision {}",
                bad, self.rev
            )));
        }
        Ok(())
    }
}

/// A single document revision as exchanged by replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRevision {
    /// Document ID
    pub id: DocumentId,
    /// The revision itself
    #[serde(flatten)]
    pub leaf: Leaf,
}

impl DocRevision {
    pub fn new(id: impl Into<DocumentId>, leaf: Leaf) -> Self {
        Self {
            id: id.into(),
            leaf,
        }
    }
}

/// The current, live value of a document as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub rev: Revision,
    pub body: serde_json::Value,
}

/// Outcome of merging a replicated revision into a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// The revision (or a descendant of it) was already present
    Known,
    /// The revision extended or replaced the existing branch
    Updated,
    /// The revision is concurrent with an existing leaf
    Conflicted,
}

/// All leaf revisions of one document.
///
/// Outside of the window between a replicated write and the following
/// resolution pass this holds exactly one leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentTree {
    pub id: DocumentId,
    leaves: Vec<Leaf>,
}

impl DocumentTree {
    /// Create an empty tree for a document that does not exist yet.
    pub fn new(id: impl Into<DocumentId>) -> Self {
        Self {
            id: id.into(),
            leaves: Vec::new(),
        }
    }

    /// Rebuild a tree from stored leaves.
    pub fn from_leaves(id: impl Into<DocumentId>, leaves: Vec<Leaf>) -> Self {
        Self {
            id: id.into(),
            leaves,
        }
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Check if more than one leaf coexists.
    pub fn is_conflicted(&self) -> bool {
        self.leaves.len() > 1
    }

    /// The leaf reads observe: the sole leaf, or the highest revision while a
    /// conflict set is still unresolved.
    pub fn current(&self) -> Option<&Leaf> {
        self.leaves.iter().max_by(|a, b| a.rev.cmp(&b.rev))
    }

    /// The live document, if the current leaf is not a tombstone.
    pub fn document(&self) -> Option<Document> {
        self.current().filter(|l| l.is_live()).map(|l| Document {
            id: self.id.clone(),
            rev: l.rev.clone(),
            body: l.body.clone(),
        })
    }

    /// Check if any leaf is or descends from `rev`.
    pub fn knows(&self, rev: &Revision) -> bool {
        self.leaves.iter().any(|l| l.covers(rev))
    }

    /// Apply a local edit on top of the current leaf.
    ///
    /// When `expected` is given it must equal the current revision.
    pub fn edit(
        &mut self,
        body: serde_json::Value,
        deleted: bool,
        expected: Option<&Revision>,
    ) -> Result<&Leaf> {
        let current = self.current();

        if let Some(expected) = expected {
            if current.map(|l| &l.rev) != Some(expected) {
                return Err(Error::Conflict {
                    id: self.id.clone(),
                    expected: expected.clone(),
                    current: current.map(|l| l.rev.clone()),
                });
            }
        }

        let leaf = match current {
            Some(parent) => Leaf::child_of(parent, body, deleted),
            None => Leaf::root(body, deleted),
        };

        let parent_rev = current.map(|l| l.rev.clone());
        if let Some(parent_rev) = parent_rev {
            self.leaves.retain(|l| l.rev != parent_rev);
        }
        self.leaves.push(leaf);

        let last = self.leaves.len() - 1;
        Ok(&self.leaves[last])
    }

    /// Merge a replicated revision into the tree.
    ///
    /// Replaying a known revision is a no-op, so batches may be re-applied.
    pub fn merge(&mut self, leaf: Leaf) -> Result<Merge> {
        leaf.validate()?;

        if self.knows(&leaf.rev) {
            return Ok(Merge::Known);
        }

        self.leaves.retain(|l| !leaf.ancestors.contains(&l.rev));
        self.leaves.push(leaf);

        if self.is_conflicted() {
            Ok(Merge::Conflicted)
        } else {
            Ok(Merge::Updated)
        }
    }

    pub(crate) fn set_leaves(&mut self, leaves: Vec<Leaf>) {
        self.leaves = leaves;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edit_creates_and_extends() {
        let mut tree = DocumentTree::new("cart");
        let first = tree.edit(json!({"items": []}), false, None).unwrap().clone();
        assert_eq!(first.rev.generation(), 1);
        assert!(first.ancestors.is_empty());

        let second = tree
            .edit(json!({"items": [1]}), false, Some(&first.rev))
            .unwrap()
            .clone();
        assert_eq!(second.rev.generation(), 2);
        assert_eq!(second.ancestors, vec![first.rev.clone()]);
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.document().unwrap().body, json!({"items": [1]}));
    }

    #[test]
    fn edit_with_stale_revision_conflicts() {
        let mut tree = DocumentTree::new("cart");
        let first = tree.edit(json!({"v": 1}), false, None).unwrap().rev.clone();
        tree.edit(json!({"v": 2}), false, Some(&first)).unwrap();

        let result = tree.edit(json!({"v": 3}), false, Some(&first));
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(tree.document().unwrap().body, json!({"v": 2}));
    }

    #[test]
    fn edit_missing_with_expected_conflicts() {
        let mut tree = DocumentTree::new("cart");
        let rev: Revision = "1-aa".parse().unwrap();
        let result = tree.edit(json!({}), false, Some(&rev));
        assert!(matches!(
            result,
            Err(Error::Conflict { current: None, .. })
        ));
        assert!(tree.is_empty());
    }

    #[test]
    fn tombstone_hides_document() {
        let mut tree = DocumentTree::new("order_1");
        let rev = tree.edit(json!({"total": 5}), false, None).unwrap().rev.clone();
        tree.edit(json!({"deletedAt": 1}), true, Some(&rev)).unwrap();
        assert!(tree.document().is_none());
        assert!(!tree.is_empty());
    }

    #[test]
    fn ancestry_is_bounded() {
        let mut tree = DocumentTree::new("cart");
        for i in 0..(MAX_ANCESTORS + 20) {
            tree.edit(json!({ "v": i }), false, None).unwrap();
        }
        assert_eq!(tree.current().unwrap().ancestors.len(), MAX_ANCESTORS);
    }

    #[test]
    fn merge_fast_forwards_descendant() {
        let mut local = DocumentTree::new("cart");
        let base = local.edit(json!({"v": 1}), false, None).unwrap().clone();

        let mut remote = local.clone();
        let next = remote.edit(json!({"v": 2}), false, None).unwrap().clone();

        assert_eq!(local.merge(next.clone()).unwrap(), Merge::Updated);
        assert_eq!(local.leaves().len(), 1);
        assert_eq!(local.current().unwrap().rev, next.rev);
        assert!(local.knows(&base.rev));
    }

    #[test]
    fn merge_known_is_noop() {
        let mut tree = DocumentTree::new("cart");
        let a = tree.edit(json!({"v": 1}), false, None).unwrap().clone();
        tree.edit(json!({"v": 2}), false, None).unwrap();

        assert_eq!(tree.merge(a).unwrap(), Merge::Known);
        assert_eq!(tree.leaves().len(), 1);
    }

    #[test]
    fn merge_concurrent_edit_conflicts() {
        let mut local = DocumentTree::new("cart");
        local.edit(json!({"v": 0}), false, None).unwrap();
        let mut remote = local.clone();

        local.edit(json!({"v": "local"}), false, None).unwrap();
        let theirs = remote
            .edit(json!({"v": "remote"}), false, None)
            .unwrap()
            .clone();

        assert_eq!(local.merge(theirs).unwrap(), Merge::Conflicted);
        assert!(local.is_conflicted());
    }

    #[test]
    fn merge_rejects_invalid_ancestry() {
        let mut tree = DocumentTree::new("cart");
        let leaf = Leaf {
            rev: "1-aa".parse().unwrap(),
            ancestors: vec!["2-bb".parse().unwrap()],
            body: json!({}),
            deleted: false,
        };
        assert!(matches!(tree.merge(leaf), Err(Error::InvalidDocument(_))));
    }

    #[test]
    fn doc_revision_wire_format() {
        let rev = DocRevision::new("order_7", Leaf::root(json!({"id": "7"}), false));
        let value = serde_json::to_value(&rev).unwrap();
        assert_eq!(value["id"], "order_7");
        assert_eq!(value["body"], json!({"id": "7"}));
        assert_eq!(value["deleted"], false);
        assert!(value["rev"].as_str().unwrap().starts_with("1-"));
        assert!(value.get("ancestors").is_none());

        let parsed: DocRevision = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, rev);
    }
}
