//! Configuration structures for OpalDB.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data files.
    pub data_dir: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: PAGE_SIZE,
            buffer_pool_frames: 1024, // 4 MB with 4 KB pages
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_frames * self.page_size
    }
}

/// Configuration for a disk-backed extendible hash index.
///
/// Depth limits are fixed at index creation; the index grows directories
/// and buckets within them but never past them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashIndexConfig {
    /// Maximum depth of the header page (number of hash bits used to pick
    /// a directory). Zero means a single directory.
    pub header_max_depth: u32,
    /// Maximum depth of each directory page (upper bound on global depth).
    pub directory_max_depth: u32,
    /// Maximum entries per bucket page. `None` derives the largest count
    /// that fits a page from the key and value widths.
    pub bucket_max_size: Option<u32>,
    /// Key width in bytes.
    pub key_size: usize,
    /// Value width in bytes.
    pub value_size: usize,
}

impl Default for HashIndexConfig {
    fn default() -> Self {
        Self {
            header_max_depth: 9,
            directory_max_depth: 9,
            bucket_max_size: None,
            key_size: 8,
            value_size: 8,
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
        assert_eq!(config.page_size, PAGE_SIZE);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.buffer_pool_frames, 1024);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/opaldb"),
            page_size: 8192,
            buffer_pool_frames: 16384,
            fsync_enabled: false,
        };

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/opaldb"));
        assert_eq!(config.page_size, 8192);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_buffer_pool_size_bytes() {
        let config = StorageConfig::default();
        assert_eq!(
            config.buffer_pool_size_bytes(),
            config.buffer_pool_frames * config.page_size
        );

        // 1024 frames * 4096 bytes = 4 MB
        assert_eq!(config.buffer_pool_size_bytes(), 4_194_304);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.page_size, deserialized.page_size);
        assert_eq!(original.buffer_pool_frames, deserialized.buffer_pool_frames);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }

    #[test]
    fn test_hash_index_config_defaults() {
        let config = HashIndexConfig::default();
        assert_eq!(config.header_max_depth, 9);
        assert_eq!(config.directory_max_depth, 9);
        assert_eq!(config.bucket_max_size, None);
        assert_eq!(config.key_size, 8);
        assert_eq!(config.value_size, 8);
    }

    #[test]
    fn test_hash_index_config_custom() {
        let config = HashIndexConfig {
            header_max_depth: 0,
            directory_max_depth: 2,
            bucket_max_size: Some(2),
            key_size: 4,
            value_size: 4,
        };

        assert_eq!(config.header_max_depth, 0);
        assert_eq!(config.directory_max_depth, 2);
        assert_eq!(config.bucket_max_size, Some(2));
    }

    #[test]
    fn test_hash_index_config_serde_roundtrip() {
        let original = HashIndexConfig {
            bucket_max_size: Some(64),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: HashIndexConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.header_max_depth, deserialized.header_max_depth);
        assert_eq!(original.directory_max_depth, deserialized.directory_max_depth);
        assert_eq!(original.bucket_max_size, deserialized.bucket_max_size);
        assert_eq!(original.key_size, deserialized.key_size);
        assert_eq!(original.value_size, deserialized.value_size);
    }

    #[test]
    fn test_config_clone() {
        let config1 = StorageConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.page_size, config2.page_size);

        let index1 = HashIndexConfig::default();
        let index2 = index1.clone();
        assert_eq!(index1.key_size, index2.key_size);
    }
}
