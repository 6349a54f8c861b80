//! Error types for the KenPOS engine.

use crate::{DocumentId, Revision};
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    // Write errors
    #[error("revision conflict on '{id}': expected {expected}, current {}", display_current(.current))]
    Conflict {
        id: DocumentId,
        expected: Revision,
        current: Option<Revision>,
    },

    // Format errors
    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

fn display_current(current: &Option<Revision>) -> String {
    current
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NotFound("cart".into());
        assert_eq!(err.to_string(), "document not found: cart");

        let expected: Revision = "1-aa".parse().unwrap();
        let current: Revision = "2-bb".parse().unwrap();
        let err = Error::Conflict {
            id: "cart".into(),
            expected: expected.clone(),
            current: Some(current),
        };
        assert_eq!(
            err.to_string(),
            "revision conflict on 'cart': expected 1-aa, current 2-bb"
        );

        let err = Error::Conflict {
            id: "cart".into(),
            expected,
            current: None,
        };
        assert_eq!(
            err.to_string(),
            "revision conflict on 'cart': expected 1-aa, current none"
        );
    }
}
