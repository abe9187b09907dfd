//! B+ tree index backed by the buffer pool.
//!
//! Layout of the module mirrors the moving parts:
//!
//! - [`codec`]: fixed-width key encoding
//! - [`page`]: leaf and internal node layouts over raw page buffers
//! - [`header`]: the page-0 registry of index roots
//! - [`tree`]: the concurrent tree itself (latch-crabbed descent,
//!   split/borrow/merge protocols)
//! - [`iterator`]: forward scans over the linked leaves

pub mod codec;
pub mod header;
pub mod iterator;
pub mod page;
pub mod tree;

pub use codec::IndexKey;
pub use header::HeaderPage;
pub use iterator::IndexIterator;
pub use page::{BTreePage, BTreePageType, InternalPage, LeafPage};
pub use tree::BPlusTree;
