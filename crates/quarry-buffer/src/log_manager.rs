//! Log collaborator interface for the buffer pool.

use quarry_common::page::PageId;

/// Recovery hook the pool notifies before dirty evictions.
///
/// A real write-ahead log would flush every record up to the page's LSN
/// here so the on-disk page never runs ahead of the log. This core treats
/// recovery as out of scope, so the default implementation does nothing.
pub trait LogManager: Send + Sync {
    /// Called before the dirty page `page_id` is written back during
    /// eviction.
    fn before_evict(&self, page_id: PageId);
}

/// Log manager that ignores every notification.
pub struct NoopLogManager;

impl LogManager for NoopLogManager {
    fn before_evict(&self, _page_id: PageId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_log_manager() {
        let log = NoopLogManager;
        log.before_evict(PageId(1));
        log.before_evict(PageId::INVALID);
    }
}
