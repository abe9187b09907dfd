//! Header page: the registry mapping index names to root page ids.
//!
//! The header page lives at page id 0 and is the only persistent metadata
//! the storage core produces. Each record is fixed-width: a zero-padded
//! name followed by the root page id.

use quarry_common::page::{PageId, PAGE_SIZE};
use quarry_common::{QuarryError, Result};

/// Accessors for the header page.
pub struct HeaderPage;

impl HeaderPage {
    /// Maximum index name length in bytes.
    pub const MAX_NAME_LEN: usize = 32;

    const COUNT_OFFSET: usize = 0;
    const RECORDS_OFFSET: usize = 4;
    /// name (32) + root page id (4)
    const RECORD_SIZE: usize = Self::MAX_NAME_LEN + 4;

    /// Maximum number of records the page can hold.
    pub fn max_records() -> usize {
        (PAGE_SIZE - Self::RECORDS_OFFSET) / Self::RECORD_SIZE
    }

    /// Number of registered indexes.
    pub fn record_count(data: &[u8]) -> usize {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
    }

    fn set_record_count(data: &mut [u8], count: usize) {
        data[Self::COUNT_OFFSET..Self::COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        Self::RECORDS_OFFSET + index * Self::RECORD_SIZE
    }

    fn name_matches(data: &[u8], index: usize, name: &str) -> bool {
        let off = Self::record_offset(index);
        let stored = &data[off..off + Self::MAX_NAME_LEN];
        let bytes = name.as_bytes();
        stored[..bytes.len()] == *bytes && stored[bytes.len()..].iter().all(|&b| b == 0)
    }

    fn root_at(data: &[u8], index: usize) -> PageId {
        let off = Self::record_offset(index) + Self::MAX_NAME_LEN;
        PageId(i32::from_le_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
        ]))
    }

    fn write_record(data: &mut [u8], index: usize, name: &str, root: PageId) {
        let off = Self::record_offset(index);
        let bytes = name.as_bytes();
        data[off..off + Self::MAX_NAME_LEN].fill(0);
        data[off..off + bytes.len()].copy_from_slice(bytes);
        data[off + Self::MAX_NAME_LEN..off + Self::RECORD_SIZE]
            .copy_from_slice(&root.0.to_le_bytes());
    }

    /// Looks up the root page id recorded for `name`.
    pub fn find(data: &[u8], name: &str) -> Option<PageId> {
        let count = Self::record_count(data);
        (0..count)
            .find(|&i| Self::name_matches(data, i, name))
            .map(|i| Self::root_at(data, i))
    }

    /// Records `root` for `name`, updating an existing record or appending
    /// a new one.
    pub fn upsert(data: &mut [u8], name: &str, root: PageId) -> Result<()> {
        debug_assert!(name.len() <= Self::MAX_NAME_LEN);

        let count = Self::record_count(data);
        if let Some(i) = (0..count).find(|&i| Self::name_matches(data, i, name)) {
            Self::write_record(data, i, name, root);
            return Ok(());
        }
        if count >= Self::max_records() {
            return Err(QuarryError::HeaderFull(name.to_string()));
        }
        Self::write_record(data, count, name, root);
        Self::set_record_count(data, count + 1);
        Ok(())
    }
}
