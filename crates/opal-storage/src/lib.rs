//! Storage engine for OpalDB.
//!
//! This crate provides:
//! - Extendible hash index pages (header, directory, bucket)
//! - Disk-backed extendible hash table over the buffer pool

mod hash;

pub use hash::{
    bucket_capacity_for, ByteKeyComparator, DiskExtendibleHashTable, EntryLayout,
    HashBucketPage, HashDirectoryPage, HashHeaderPage, KeyComparator, KeyHasher, Xxh3KeyHasher,
    DIRECTORY_ARRAY_SIZE, DIRECTORY_MAX_DEPTH, HEADER_ARRAY_SIZE, HEADER_MAX_DEPTH,
};
