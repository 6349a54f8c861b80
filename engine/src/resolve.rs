//! Conflict resolution for documents with concurrent leaf revisions.
//!
//! # Algorithm
//!
//! 1. Collect every leaf of the document (the conflict set)
//! 2. Pick the leaf with the latest embedded timestamp; ties go to the higher
//!    revision so every replica picks the same winner
//! 3. Drop the losing leaves and their bodies
//! 4. Re-write the winner as one merged revision whose ancestry covers the
//!    winner and all losers
//!
//! The merged revision is derived from the conflict set alone. Two replicas
//! resolving the same set therefore produce the same token, and a peer that
//! receives it discards its own copies of the losers as ancestors.

use crate::document::{DocumentTree, Leaf, MAX_ANCESTORS};
use crate::{DocumentId, Revision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Body fields consulted for the last-writer-wins timestamp, in order.
pub const DEFAULT_TIMESTAMP_FIELDS: [&str; 3] = ["updatedAt", "queuedAt", "deletedAt"];

/// How a conflict set was collapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The document that was resolved
    pub id: DocumentId,
    /// The leaf whose body survived
    pub winner: Revision,
    /// Leaves that were discarded
    pub losers: Vec<Revision>,
    /// The revision now holding the winner's body
    pub merged: Revision,
}

/// Last-writer-wins resolver keyed on a timestamp embedded in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolver {
    fields: Vec<String>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_FIELDS)
    }
}

impl ConflictResolver {
    /// Create a resolver that reads the first present field of `fields`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The timestamp fields this resolver consults.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Extract a leaf's timestamp in milliseconds since the epoch.
    ///
    /// Accepts RFC 3339 strings and integer milliseconds. Leaves without a
    /// readable timestamp sort before every timestamped leaf.
    pub fn timestamp(&self, leaf: &Leaf) -> Option<i64> {
        let body = leaf.body.as_object()?;
        self.fields
            .iter()
            .find_map(|field| body.get(field))
            .and_then(parse_timestamp)
    }

    /// Pick the winning leaf of a conflict set.
    pub fn pick_winner<'a>(&self, leaves: &'a [Leaf]) -> Option<&'a Leaf> {
        leaves.iter().max_by(|a, b| {
            self.timestamp(a)
                .cmp(&self.timestamp(b))
                .then_with(|| a.rev.cmp(&b.rev))
        })
    }

    /// Collapse the tree's conflict set into a single leaf.
    ///
    /// Returns `None` when the tree has at most one leaf.
    pub fn resolve(&self, tree: &mut DocumentTree) -> Option<Resolution> {
        if !tree.is_conflicted() {
            return None;
        }

        let winner = self.pick_winner(tree.leaves())?.clone();
        let losers: Vec<Revision> = tree
            .leaves()
            .iter()
            .filter(|l| l.rev != winner.rev)
            .map(|l| l.rev.clone())
            .collect();

        let parents: Vec<Revision> = tree.leaves().iter().map(|l| l.rev.clone()).collect();
        let generation = parents.iter().map(Revision::generation).max().unwrap_or(0) + 1;

        let ancestors = merged_ancestry(tree.leaves());

        let merged = Leaf {
            rev: Revision::derive(generation, &parents, &winner.body, winner.deleted),
            ancestors,
            body: winner.body,
            deleted: winner.deleted,
        };
        let merged_rev = merged.rev.clone();
        tree.set_leaves(vec![merged]);

        Some(Resolution {
            id: tree.id.clone(),
            winner: winner.rev,
            losers,
            merged: merged_rev,
        })
    }
}

/// Ancestry for the merged leaf: the conflict set first, newest first, then
/// older history until the horizon is full. The conflict set must never be
/// truncated away or peers holding a loser would not see it as superseded.
fn merged_ancestry(leaves: &[Leaf]) -> Vec<Revision> {
    let heads: BTreeSet<Revision> = leaves.iter().map(|l| l.rev.clone()).collect();
    let history: BTreeSet<Revision> = leaves
        .iter()
        .flat_map(|l| l.ancestors.iter().cloned())
        .filter(|rev| !heads.contains(rev))
        .collect();

    heads
        .into_iter()
        .rev()
        .chain(history.into_iter().rev())
        .take(MAX_ANCESTORS)
        .collect()
}

fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Merge;
    use serde_json::json;

    /// Build a base document and two concurrent edits of it.
    fn diverged(local: serde_json::Value, remote: serde_json::Value) -> (DocumentTree, Leaf, Leaf) {
        let mut base = DocumentTree::new("cart");
        base.edit(json!({"updatedAt": "2024-01-01T00:00:00Z"}), false, None)
            .unwrap();

        let mut ours = base.clone();
        let mine = ours.edit(local, false, None).unwrap().clone();
        let mut theirs = base.clone();
        let other = theirs.edit(remote, false, None).unwrap().clone();
        (base, mine, other)
    }

    #[test]
    fn no_conflict_is_noop() {
        let mut tree = DocumentTree::new("cart");
        tree.edit(json!({"v": 1}), false, None).unwrap();
        let before = tree.clone();

        assert!(ConflictResolver::default().resolve(&mut tree).is_none());
        assert_eq!(tree, before);
    }

    #[test]
    fn later_timestamp_wins() {
        let (mut tree, older, newer) = diverged(
            json!({"v": "older", "updatedAt": "2024-03-01T10:00:00Z"}),
            json!({"v": "newer", "updatedAt": "2024-03-01T10:00:05Z"}),
        );
        tree.merge(older.clone()).unwrap();
        assert_eq!(tree.merge(newer.clone()).unwrap(), Merge::Conflicted);

        let resolution = ConflictResolver::default().resolve(&mut tree).unwrap();
        assert_eq!(resolution.winner, newer.rev);
        assert_eq!(resolution.losers, vec![older.rev.clone()]);

        assert_eq!(tree.leaves().len(), 1);
        let current = tree.current().unwrap();
        assert_eq!(current.rev, resolution.merged);
        assert_eq!(current.body["v"], "newer");
        assert!(current.covers(&older.rev));
        assert!(current.covers(&newer.rev));
    }

    #[test]
    fn queued_at_and_millis_are_understood() {
        let resolver = ConflictResolver::default();
        let leaf = Leaf::root(json!({"queuedAt": "1970-01-01T00:00:01Z"}), false);
        assert_eq!(resolver.timestamp(&leaf), Some(1000));

        let leaf = Leaf::root(json!({"updatedAt": 1706745600000i64}), false);
        assert_eq!(resolver.timestamp(&leaf), Some(1706745600000));

        let leaf = Leaf::root(json!({"updatedAt": "yesterday"}), false);
        assert_eq!(resolver.timestamp(&leaf), None);

        let leaf = Leaf::root(json!(["not", "an", "object"]), false);
        assert_eq!(resolver.timestamp(&leaf), None);
    }

    #[test]
    fn missing_timestamp_loses() {
        let (mut tree, stamped, bare) = diverged(
            json!({"v": "stamped", "updatedAt": "2020-01-01T00:00:00Z"}),
            json!({"v": "bare"}),
        );
        tree.merge(stamped.clone()).unwrap();
        tree.merge(bare).unwrap();

        let resolution = ConflictResolver::default().resolve(&mut tree).unwrap();
        assert_eq!(resolution.winner, stamped.rev);
    }

    #[test]
    fn tie_breaks_on_revision() {
        let ts = "2024-05-05T05:05:05Z";
        let (mut tree, a, b) = diverged(
            json!({"v": "a", "updatedAt": ts}),
            json!({"v": "b", "updatedAt": ts}),
        );
        tree.merge(a.clone()).unwrap();
        tree.merge(b.clone()).unwrap();

        let expected = std::cmp::max(a.rev.clone(), b.rev.clone());
        let resolution = ConflictResolver::default().resolve(&mut tree).unwrap();
        assert_eq!(resolution.winner, expected);
    }

    #[test]
    fn resolution_is_order_independent() {
        let (base, x, y) = diverged(
            json!({"v": "x", "updatedAt": "2024-02-02T00:00:00Z"}),
            json!({"v": "y", "updatedAt": "2024-02-01T00:00:00Z"}),
        );
        let resolver = ConflictResolver::default();

        let mut first = base.clone();
        first.merge(x.clone()).unwrap();
        first.merge(y.clone()).unwrap();
        resolver.resolve(&mut first).unwrap();

        let mut second = base;
        second.merge(y).unwrap();
        second.merge(x).unwrap();
        resolver.resolve(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn newer_tombstone_beats_edit() {
        let mut base = DocumentTree::new("cart");
        base.edit(json!({"items": [], "updatedAt": "2024-01-01T00:00:00Z"}), false, None)
            .unwrap();

        let mut cleared = base.clone();
        let tomb = cleared
            .edit(json!({"deletedAt": "2024-01-02T00:00:00Z"}), true, None)
            .unwrap()
            .clone();
        let mut edited = base.clone();
        let edit = edited
            .edit(json!({"items": [1], "updatedAt": "2024-01-01T12:00:00Z"}), false, None)
            .unwrap()
            .clone();

        let mut tree = base;
        tree.merge(edit).unwrap();
        tree.merge(tomb.clone()).unwrap();
        let resolution = ConflictResolver::default().resolve(&mut tree).unwrap();

        assert_eq!(resolution.winner, tomb.rev);
        assert!(tree.document().is_none());
    }

    #[test]
    fn short_loser_survives_long_history() {
        let mut long = DocumentTree::new("cart");
        long.edit(json!({"v": 0}), false, None).unwrap();
        let mut short = long.clone();
        let stray = short.edit(json!({"v": "short"}), false, None).unwrap().clone();

        for i in 1..=150 {
            long.edit(json!({ "v": i }), false, None).unwrap();
        }
        long.merge(stray.clone()).unwrap();

        let resolution = ConflictResolver::default().resolve(&mut long).unwrap();
        assert_eq!(resolution.losers, vec![stray.rev.clone()]);

        let merged = long.current().unwrap();
        assert_eq!(merged.ancestors.len(), MAX_ANCESTORS);
        assert_eq!(merged.ancestors[0], resolution.winner);
        assert!(merged.covers(&stray.rev));
    }

    #[test]
    fn custom_fields() {
        let resolver = ConflictResolver::new(["modified"]);
        assert_eq!(resolver.fields(), ["modified".to_string()]);
        let leaf = Leaf::root(json!({"modified": 5, "updatedAt": 10}), false);
        assert_eq!(resolver.timestamp(&leaf), Some(5));
    }
}
