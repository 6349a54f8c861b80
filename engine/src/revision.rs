//! Revision tokens for optimistic concurrency and deterministic ordering.
//!
//! A revision is rendered as `"<generation>-<digest>"`. The generation counts
//! edits along a branch; the digest is derived from the revision's content and
//! parents, so two replicas that make the same edit (or resolve the same
//! conflict) mint the same token.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of digest bytes kept in a token.
const DIGEST_BYTES: usize = 16;

/// An opaque, totally ordered version token.
///
/// Ordering rules:
/// 1. Higher generation wins
/// 2. If generations are equal, the lexicographically higher digest wins
///
/// Revisions do not encode wall-clock order across replicas; the ordering
/// only serves as a deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Derive the revision for a new leaf from its content and parents.
    pub fn derive(
        generation: u64,
        parents: &[Revision],
        body: &serde_json::Value,
        deleted: bool,
    ) -> Self {
        let mut parents: Vec<String> = parents.iter().map(ToString::to_string).collect();
        parents.sort();

        let mut hasher = Sha256::new();
        hasher.update(generation.to_be_bytes());
        for parent in &parents {
            hasher.update(parent.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([deleted as u8]);
        hasher.update(body.to_string().as_bytes());
        let digest = hasher.finalize();

        Self {
            generation,
            digest: hex::encode(&digest[..DIGEST_BYTES]),
        }
    }

    /// The edit count along this revision's branch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The content digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevision(s.to_string()))?;

        let generation: u64 = generation
            .parse()
            .map_err(|_| Error::InvalidRevision(s.to_string()))?;

        if generation == 0
            || digest.is_empty()
            || !digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidRevision(s.to_string()));
        }

        Ok(Self {
            generation,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Revision {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.generation.cmp(&other.generation) {
            Ordering::Equal => self.digest.cmp(&other.digest),
            other => other,
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_is_deterministic() {
        let body = json!({"items": [{"id": "sku1", "qty": 2}]});
        let a = Revision::derive(1, &[], &body, false);
        let b = Revision::derive(1, &[], &body, false);
        assert_eq!(a, b);
        assert_eq!(a.generation(), 1);
        assert_eq!(a.digest().len(), DIGEST_BYTES * 2);
    }

    #[test]
    fn derive_depends_on_content() {
        let body = json!({"qty": 1});
        let live = Revision::derive(1, &[], &body, false);
        let dead = Revision::derive(1, &[], &body, true);
        let other = Revision::derive(1, &[], &json!({"qty": 2}), false);
        assert_ne!(live, dead);
        assert_ne!(live, other);
    }

    #[test]
    fn derive_ignores_parent_order() {
        let p1: Revision = "2-aa".parse().unwrap();
        let p2: Revision = "2-bb".parse().unwrap();
        let body = json!({});
        assert_eq!(
            Revision::derive(3, &[p1.clone(), p2.clone()], &body, false),
            Revision::derive(3, &[p2, p1], &body, false)
        );
    }

    #[test]
    fn parse_and_display() {
        let rev: Revision = "12-0A1b".parse().unwrap();
        assert_eq!(rev.generation(), 12);
        assert_eq!(rev.to_string(), "12-0a1b");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "abc", "0-aa", "x-aa", "3-", "3-zz"] {
            assert!(
                matches!(bad.parse::<Revision>(), Err(Error::InvalidRevision(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn ordering_by_generation_then_digest() {
        let r9: Revision = "9-ff".parse().unwrap();
        let r10: Revision = "10-00".parse().unwrap();
        assert!(r9 < r10);

        let a: Revision = "4-aa".parse().unwrap();
        let b: Revision = "4-bb".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn serializes_as_string() {
        let rev: Revision = "3-abc".parse().unwrap();
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"3-abc\"");
        let parsed: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rev);
        assert!(serde_json::from_str::<Revision>("\"nope\"").is_err());
    }
}
