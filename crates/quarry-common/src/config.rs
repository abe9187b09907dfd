//! Configuration for the storage and indexing core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration. All values are fixed for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the data file.
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool.
    pub pool_size: usize,
    /// Bucket capacity of the page table's extendible hash table.
    pub bucket_size: usize,
    /// K for the LRU-K replacer.
    pub replacer_k: usize,
    /// Maximum number of entries in a B+ tree leaf page.
    pub leaf_max_size: u16,
    /// Maximum number of children in a B+ tree internal page.
    pub internal_max_size: u16,
    /// Enable fsync after disk writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pool_size: 1024,
            bucket_size: 4,
            replacer_k: 2,
            leaf_max_size: 128,
            internal_max_size: 128,
            fsync_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.pool_size, 1024);
        assert_eq!(config.bucket_size, 4);
        assert_eq!(config.replacer_k, 2);
        assert_eq!(config.leaf_max_size, 128);
        assert_eq!(config.internal_max_size, 128);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/quarry"),
            pool_size: 16,
            replacer_k: 3,
            leaf_max_size: 4,
            internal_max_size: 4,
            fsync_enabled: false,
            ..Default::default()
        };

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/quarry"));
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.replacer_k, 3);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_clone() {
        let config1 = StorageConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.pool_size, config2.pool_size);
        assert_eq!(config1.data_dir, config2.data_dir);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.pool_size, deserialized.pool_size);
        assert_eq!(original.bucket_size, deserialized.bucket_size);
        assert_eq!(original.replacer_k, deserialized.replacer_k);
        assert_eq!(original.leaf_max_size, deserialized.leaf_max_size);
        assert_eq!(original.data_dir, deserialized.data_dir);
    }
}
