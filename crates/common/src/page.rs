//! Cursor pagination types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page size when a client omits `limit`.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// A page request forwarded to the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Opaque cursor from the previous page; `None` means "from the start".
    pub cursor: Option<String>,
    /// Maximum items for this page.
    pub limit: u32,
}

impl PageRequest {
    pub fn new(cursor: Option<String>, limit: Option<u32>) -> Self {
        Self {
            cursor,
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }

    pub fn first(limit: Option<u32>) -> Self {
        Self::new(None, limit)
    }
}

/// One page returned by the backing store.
///
/// `cursor == None` means "start" or "exhausted" depending on context;
/// `has_more` disambiguates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub data: Value,
    pub cursor: Option<String>,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

impl PageResult {
    /// The safe answer to a fetch past the end of the result set.
    pub fn exhausted() -> Self {
        Self {
            data: Value::Array(Vec::new()),
            cursor: None,
            has_more: false,
        }
    }
}
