//! Document identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Principal identifier resolved from an auth token at connection time.
pub type PrincipalId = i64;

/// Identifies one logical document instance: a backing function name plus
/// an instance id.
///
/// `doc_id == 0` conventionally denotes a collection-style document with
/// no single owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    /// Backing function name (e.g. "thing", "posts").
    pub function: String,
    /// Instance id, 0 for collection documents.
    pub doc_id: i64,
}

impl DocumentKey {
    pub fn new(function: impl Into<String>, doc_id: i64) -> Self {
        Self {
            function: function.into(),
            doc_id,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, self.doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(DocumentKey::new("thing", 7).to_string(), "thing:7");
        assert_eq!(DocumentKey::new("posts", 0).to_string(), "posts:0");
    }

    #[test]
    fn test_equality() {
        assert_eq!(DocumentKey::new("thing", 7), DocumentKey::new("thing", 7));
        assert_ne!(DocumentKey::new("thing", 7), DocumentKey::new("thing", 8));
        assert_ne!(DocumentKey::new("thing", 7), DocumentKey::new("other", 7));
    }
}
