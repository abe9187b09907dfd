//! Page identifiers and sizing for Quarry storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Page id of the index header page. Reserved; the buffer pool never hands
/// it out from `new_page`.
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Logical identifier for a unit of disk storage.
///
/// A page id is stable for the lifetime of the page, unlike the frame that
/// may host it in the buffer pool. Negative ids are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    /// Sentinel for "no page".
    pub const INVALID: PageId = PageId(-1);

    /// Returns true if this id refers to an actual page.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId(0).is_valid());
        assert!(PageId(12345).is_valid());
        assert!(!PageId::INVALID.is_valid());
        assert!(!PageId(-7).is_valid());
    }

    #[test]
    fn test_header_page_id() {
        assert_eq!(HEADER_PAGE_ID, PageId(0));
        assert!(HEADER_PAGE_ID.is_valid());
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(42).to_string(), "page:42");
        assert_eq!(PageId::INVALID.to_string(), "page:-1");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId(1) < PageId(2));
        assert!(PageId::INVALID < PageId(0));
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId(1));
        set.insert(PageId(2));
        set.insert(PageId(1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
