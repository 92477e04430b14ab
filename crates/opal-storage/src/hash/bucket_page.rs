//! Extendible hash bucket page.
//!
//! A bucket stores up to `max_size` fixed-width key/value entries, packed
//! back to back. Keys are unique; order is insertion order except that
//! removal swaps the last entry into the vacated slot.
//!
//! Page layout (little-endian):
//! ```text
//! +------------------------+ 0
//! | size: u32              |
//! +------------------------+ 4
//! | max_size: u32          |
//! +------------------------+ 8
//! | entry 0: key ++ value  |
//! | entry 1: key ++ value  |
//! | ...                    |
//! +------------------------+ 8 + max_size * (key_size + value_size)
//! ```
//!
//! All mutating functions assume the caller holds the page's write latch;
//! the page carries no concurrency state of its own.

use super::constants::{BUCKET_ENTRIES_OFFSET, BUCKET_MAX_SIZE_OFFSET, BUCKET_SIZE_OFFSET};
use super::types::{EntryLayout, KeyComparator};

/// Accessors over the raw bytes of a bucket page.
pub struct HashBucketPage;

impl HashBucketPage {
    /// Initializes an empty bucket with the given capacity.
    pub fn init(data: &mut [u8], max_size: u32) {
        data[BUCKET_SIZE_OFFSET..BUCKET_SIZE_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        data[BUCKET_MAX_SIZE_OFFSET..BUCKET_MAX_SIZE_OFFSET + 4]
            .copy_from_slice(&max_size.to_le_bytes());
    }

    /// Returns the number of live entries.
    pub fn size(data: &[u8]) -> u32 {
        u32::from_le_bytes([
            data[BUCKET_SIZE_OFFSET],
            data[BUCKET_SIZE_OFFSET + 1],
            data[BUCKET_SIZE_OFFSET + 2],
            data[BUCKET_SIZE_OFFSET + 3],
        ])
    }

    fn set_size(data: &mut [u8], size: u32) {
        data[BUCKET_SIZE_OFFSET..BUCKET_SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Returns the bucket's capacity.
    pub fn max_size(data: &[u8]) -> u32 {
        u32::from_le_bytes([
            data[BUCKET_MAX_SIZE_OFFSET],
            data[BUCKET_MAX_SIZE_OFFSET + 1],
            data[BUCKET_MAX_SIZE_OFFSET + 2],
            data[BUCKET_MAX_SIZE_OFFSET + 3],
        ])
    }

    /// Returns true if no entries remain.
    pub fn is_empty(data: &[u8]) -> bool {
        Self::size(data) == 0
    }

    /// Returns true if the bucket is at capacity.
    pub fn is_full(data: &[u8]) -> bool {
        Self::size(data) >= Self::max_size(data)
    }

    #[inline(always)]
    fn entry_offset(idx: u32, layout: EntryLayout) -> usize {
        BUCKET_ENTRIES_OFFSET + idx as usize * layout.entry_size()
    }

    /// Returns the key bytes of entry `idx`.
    pub fn key_at(data: &[u8], idx: u32, layout: EntryLayout) -> &[u8] {
        debug_assert!(idx < Self::size(data));
        let offset = Self::entry_offset(idx, layout);
        &data[offset..offset + layout.key_size]
    }

    /// Returns the value bytes of entry `idx`.
    pub fn value_at(data: &[u8], idx: u32, layout: EntryLayout) -> &[u8] {
        debug_assert!(idx < Self::size(data));
        let offset = Self::entry_offset(idx, layout) + layout.key_size;
        &data[offset..offset + layout.value_size]
    }

    /// Returns the key and value bytes of entry `idx`.
    pub fn entry_at(data: &[u8], idx: u32, layout: EntryLayout) -> (&[u8], &[u8]) {
        (
            Self::key_at(data, idx, layout),
            Self::value_at(data, idx, layout),
        )
    }

    /// Linear scan for a key. Returns its value bytes if present.
    pub fn lookup<'d, C: KeyComparator>(
        data: &'d [u8],
        key: &[u8],
        layout: EntryLayout,
        cmp: &C,
    ) -> Option<&'d [u8]> {
        for idx in 0..Self::size(data) {
            if cmp.eq(Self::key_at(data, idx, layout), key) {
                return Some(Self::value_at(data, idx, layout));
            }
        }
        None
    }

    /// Appends a key/value pair.
    ///
    /// Returns false when the key is already present or the bucket is full.
    pub fn insert<C: KeyComparator>(
        data: &mut [u8],
        key: &[u8],
        value: &[u8],
        layout: EntryLayout,
        cmp: &C,
    ) -> bool {
        debug_assert_eq!(key.len(), layout.key_size);
        debug_assert_eq!(value.len(), layout.value_size);

        if Self::lookup(data, key, layout, cmp).is_some() {
            return false;
        }
        let size = Self::size(data);
        if size >= Self::max_size(data) {
            return false;
        }

        let offset = Self::entry_offset(size, layout);
        data[offset..offset + layout.key_size].copy_from_slice(key);
        data[offset + layout.key_size..offset + layout.entry_size()].copy_from_slice(value);
        Self::set_size(data, size + 1);
        true
    }

    /// Removes a key by overwriting its slot with the last entry.
    ///
    /// Returns false when the key is absent.
    pub fn remove<C: KeyComparator>(
        data: &mut [u8],
        key: &[u8],
        layout: EntryLayout,
        cmp: &C,
    ) -> bool {
        let size = Self::size(data);
        for idx in 0..size {
            if cmp.eq(Self::key_at(data, idx, layout), key) {
                let last = size - 1;
                if idx != last {
                    let src = Self::entry_offset(last, layout);
                    let dst = Self::entry_offset(idx, layout);
                    data.copy_within(src..src + layout.entry_size(), dst);
                }
                Self::set_size(data, last);
                return true;
            }
        }
        false
    }

    /// Drops all entries.
    pub fn clear(data: &mut [u8]) {
        Self::set_size(data, 0);
    }
}
