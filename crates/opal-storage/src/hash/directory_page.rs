//! Extendible hash directory page.
//!
//! A directory fans a key digest's low `global_depth` bits out to bucket
//! pages. Several slots may share one bucket: a bucket at local depth `d`
//! is pointed to by every slot whose low `d` bits match. Splits deepen a
//! bucket by one bit; merges undo them; the live prefix doubles and halves
//! with the global depth.
//!
//! Page layout (little-endian):
//! ```text
//! +------------------------+ 0
//! | max_depth: u32         |
//! +------------------------+ 4
//! | global_depth: u32      |
//! +------------------------+ 8
//! | local_depths           |
//! | [u8; 1 << DIRECTORY_MAX_DEPTH]
//! +------------------------+ 8 + 512
//! | bucket_page_ids        |
//! | [u32; 1 << DIRECTORY_MAX_DEPTH]
//! +------------------------+ 8 + 512 + 4 * 512
//! ```
//!
//! Only the first `2^global_depth` slots are live.

use super::constants::{
    DIR_BUCKET_IDS_OFFSET, DIR_GLOBAL_DEPTH_OFFSET, DIR_LOCAL_DEPTHS_OFFSET, DIR_MAX_DEPTH_OFFSET,
    DIRECTORY_ARRAY_SIZE, DIRECTORY_MAX_DEPTH,
};
use opal_common::page::PageId;
use std::collections::HashMap;

/// Accessors over the raw bytes of a directory page.
pub struct HashDirectoryPage;

impl HashDirectoryPage {
    /// Initializes a directory page at global depth zero.
    ///
    /// Slot 0's bucket id is left invalid; the caller sets it right after
    /// allocating the first bucket.
    pub fn init(data: &mut [u8], max_depth: u32) {
        debug_assert!(max_depth <= DIRECTORY_MAX_DEPTH);
        data[DIR_MAX_DEPTH_OFFSET..DIR_MAX_DEPTH_OFFSET + 4]
            .copy_from_slice(&max_depth.to_le_bytes());
        data[DIR_GLOBAL_DEPTH_OFFSET..DIR_GLOBAL_DEPTH_OFFSET + 4]
            .copy_from_slice(&0u32.to_le_bytes());

        for slot in
            data[DIR_LOCAL_DEPTHS_OFFSET..DIR_LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE].iter_mut()
        {
            *slot = 0;
        }
        for idx in 0..DIRECTORY_ARRAY_SIZE as u32 {
            Self::write_bucket_page_id(data, idx, PageId::INVALID);
        }
    }

    /// Returns the directory's fixed depth limit.
    pub fn max_depth(data: &[u8]) -> u32 {
        u32::from_le_bytes([
            data[DIR_MAX_DEPTH_OFFSET],
            data[DIR_MAX_DEPTH_OFFSET + 1],
            data[DIR_MAX_DEPTH_OFFSET + 2],
            data[DIR_MAX_DEPTH_OFFSET + 3],
        ])
    }

    /// Returns the current global depth.
    pub fn global_depth(data: &[u8]) -> u32 {
        u32::from_le_bytes([
            data[DIR_GLOBAL_DEPTH_OFFSET],
            data[DIR_GLOBAL_DEPTH_OFFSET + 1],
            data[DIR_GLOBAL_DEPTH_OFFSET + 2],
            data[DIR_GLOBAL_DEPTH_OFFSET + 3],
        ])
    }

    fn set_global_depth(data: &mut [u8], depth: u32) {
        data[DIR_GLOBAL_DEPTH_OFFSET..DIR_GLOBAL_DEPTH_OFFSET + 4]
            .copy_from_slice(&depth.to_le_bytes());
    }

    /// Number of live slots, `2^global_depth`.
    pub fn size(data: &[u8]) -> u32 {
        1 << Self::global_depth(data)
    }

    /// Largest slot count this directory can reach, `2^max_depth`.
    pub fn max_size(data: &[u8]) -> u32 {
        1 << Self::max_depth(data)
    }

    /// Mask selecting the low `global_depth` bits of a digest.
    pub fn global_depth_mask(data: &[u8]) -> u32 {
        (1u32 << Self::global_depth(data)) - 1
    }

    /// Mask selecting the low `local_depth` bits for a slot's bucket.
    pub fn local_depth_mask(data: &[u8], bucket_idx: u32) -> u32 {
        (1u32 << Self::local_depth(data, bucket_idx)) - 1
    }

    /// Routes a digest to a live slot.
    pub fn hash_to_bucket_index(data: &[u8], hash: u32) -> u32 {
        hash & Self::global_depth_mask(data)
    }

    /// Reads the bucket page id at a slot.
    pub fn bucket_page_id(data: &[u8], bucket_idx: u32) -> PageId {
        debug_assert!(bucket_idx < Self::size(data));
        let offset = DIR_BUCKET_IDS_OFFSET + bucket_idx as usize * 4;
        PageId::from_u32(u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    }

    /// Writes the bucket page id at a slot.
    pub fn set_bucket_page_id(data: &mut [u8], bucket_idx: u32, page_id: PageId) {
        debug_assert!(bucket_idx < Self::size(data));
        Self::write_bucket_page_id(data, bucket_idx, page_id);
    }

    // Raw write without the liveness check; init fills unused slots too.
    fn write_bucket_page_id(data: &mut [u8], bucket_idx: u32, page_id: PageId) {
        let offset = DIR_BUCKET_IDS_OFFSET + bucket_idx as usize * 4;
        data[offset..offset + 4].copy_from_slice(&page_id.as_u32().to_le_bytes());
    }

    /// Reads the local depth of a slot's bucket.
    pub fn local_depth(data: &[u8], bucket_idx: u32) -> u32 {
        debug_assert!(bucket_idx < Self::size(data));
        data[DIR_LOCAL_DEPTHS_OFFSET + bucket_idx as usize] as u32
    }

    /// Writes the local depth of a slot's bucket.
    pub fn set_local_depth(data: &mut [u8], bucket_idx: u32, depth: u32) {
        debug_assert!(bucket_idx < Self::size(data));
        debug_assert!(depth <= Self::global_depth(data));
        data[DIR_LOCAL_DEPTHS_OFFSET + bucket_idx as usize] = depth as u8;
    }

    /// Increments a slot's local depth, clamped at the directory limit.
    pub fn incr_local_depth(data: &mut [u8], bucket_idx: u32) {
        let depth = Self::local_depth(data, bucket_idx);
        if depth < Self::max_depth(data) {
            data[DIR_LOCAL_DEPTHS_OFFSET + bucket_idx as usize] = (depth + 1) as u8;
        }
    }

    /// Decrements a slot's local depth, clamped at zero.
    pub fn decr_local_depth(data: &mut [u8], bucket_idx: u32) {
        let depth = Self::local_depth(data, bucket_idx);
        if depth > 0 {
            data[DIR_LOCAL_DEPTHS_OFFSET + bucket_idx as usize] = (depth - 1) as u8;
        }
    }

    /// The sibling slot this bucket splits with or merges into:
    /// `bucket_idx` with its highest distinguishing bit flipped.
    pub fn split_image_index(data: &[u8], bucket_idx: u32) -> u32 {
        let local_depth = Self::local_depth(data, bucket_idx);
        debug_assert!(local_depth >= 1);
        bucket_idx ^ (1 << (local_depth - 1))
    }

    /// Doubles the live prefix, copying bucket ids and local depths into
    /// the new upper half. Returns false at the depth limit.
    pub fn incr_global_depth(data: &mut [u8]) -> bool {
        let global_depth = Self::global_depth(data);
        if global_depth >= Self::max_depth(data) {
            return false;
        }

        let size = 1u32 << global_depth;
        for idx in 0..size {
            let page_id = Self::bucket_page_id(data, idx);
            let depth = Self::local_depth(data, idx);
            Self::write_bucket_page_id(data, size + idx, page_id);
            data[DIR_LOCAL_DEPTHS_OFFSET + (size + idx) as usize] = depth as u8;
        }

        Self::set_global_depth(data, global_depth + 1);
        true
    }

    /// Halves the live prefix. Caller must have checked `can_shrink`.
    pub fn decr_global_depth(data: &mut [u8]) {
        let global_depth = Self::global_depth(data);
        debug_assert!(global_depth > 0);
        debug_assert!(Self::can_shrink(data));
        if global_depth > 0 {
            Self::set_global_depth(data, global_depth - 1);
        }
    }

    /// True iff every live slot sits strictly below the global depth, so
    /// the upper half of the prefix is redundant.
    pub fn can_shrink(data: &[u8]) -> bool {
        let global_depth = Self::global_depth(data);
        if global_depth == 0 {
            return false;
        }
        (0..Self::size(data)).all(|idx| Self::local_depth(data, idx) < global_depth)
    }

    /// Asserts the directory invariants. Panics on violation.
    ///
    /// Checks, for every live slot: local depth bounded by global depth,
    /// a valid bucket id, agreement of local depth and low index bits
    /// across slots sharing a bucket, and exactly `2^(gd - ld)` pointers
    /// per bucket. Also checks that the global depth is exactly the
    /// deepest live bucket.
    pub fn verify_integrity(data: &[u8]) {
        let global_depth = Self::global_depth(data);
        assert!(
            global_depth <= Self::max_depth(data),
            "global depth {} exceeds max depth {}",
            global_depth,
            Self::max_depth(data)
        );

        // page id -> (local depth, low bits, pointer count)
        let mut buckets: HashMap<u32, (u32, u32, u32)> = HashMap::new();
        let mut deepest = 0u32;

        for idx in 0..Self::size(data) {
            let local_depth = Self::local_depth(data, idx);
            assert!(
                local_depth <= global_depth,
                "slot {} local depth {} exceeds global depth {}",
                idx,
                local_depth,
                global_depth
            );
            deepest = deepest.max(local_depth);

            let page_id = Self::bucket_page_id(data, idx);
            assert!(page_id.is_valid(), "live slot {} has no bucket", idx);

            let low_bits = idx & ((1u32 << local_depth) - 1);
            let entry = buckets
                .entry(page_id.as_u32())
                .or_insert((local_depth, low_bits, 0));
            assert_eq!(
                entry.0, local_depth,
                "bucket {} seen at local depths {} and {}",
                page_id, entry.0, local_depth
            );
            assert_eq!(
                entry.1, low_bits,
                "bucket {} pointed to by slots with differing low bits",
                page_id
            );
            entry.2 += 1;
        }

        for (page_id, (local_depth, _, count)) in &buckets {
            assert_eq!(
                *count,
                1u32 << (global_depth - local_depth),
                "bucket {} has {} pointers, expected {}",
                page_id,
                count,
                1u32 << (global_depth - local_depth)
            );
        }

        assert_eq!(
            deepest, global_depth,
            "global depth {} but deepest bucket is {}",
            global_depth, deepest
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_common::page::PAGE_SIZE;

    fn init_dir(max_depth: u32) -> [u8; PAGE_SIZE] {
        let mut data = [0u8; PAGE_SIZE];
        HashDirectoryPage::init(&mut data, max_depth);
        data
    }

    #[test]
    fn test_directory_init() {
        let data = init_dir(3);

        assert_eq!(HashDirectoryPage::max_depth(&data), 3);
        assert_eq!(HashDirectoryPage::global_depth(&data), 0);
        assert_eq!(HashDirectoryPage::size(&data), 1);
        assert_eq!(HashDirectoryPage::max_size(&data), 8);
        assert_eq!(HashDirectoryPage::local_depth(&data, 0), 0);
        assert!(!HashDirectoryPage::bucket_page_id(&data, 0).is_valid());
    }

    #[test]
    fn test_directory_hash_routing() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));

        // Depth 0: everything routes to slot 0
        assert_eq!(HashDirectoryPage::hash_to_bucket_index(&data, 0b1011), 0);

        assert!(HashDirectoryPage::incr_global_depth(&mut data));
        assert!(HashDirectoryPage::incr_global_depth(&mut data));
        // Depth 2: low two bits route
        assert_eq!(HashDirectoryPage::hash_to_bucket_index(&data, 0b1011), 0b11);
        assert_eq!(HashDirectoryPage::global_depth_mask(&data), 0b11);
    }

    #[test]
    fn test_directory_incr_global_depth_copies_prefix() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(7));

        assert!(HashDirectoryPage::incr_global_depth(&mut data));

        assert_eq!(HashDirectoryPage::global_depth(&data), 1);
        assert_eq!(HashDirectoryPage::size(&data), 2);
        // New upper half mirrors the old prefix
        assert_eq!(HashDirectoryPage::bucket_page_id(&data, 1), PageId::new(7));
        assert_eq!(HashDirectoryPage::local_depth(&data, 1), 0);
    }

    #[test]
    fn test_directory_incr_global_depth_at_limit() {
        let mut data = init_dir(1);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));

        assert!(HashDirectoryPage::incr_global_depth(&mut data));
        assert!(!HashDirectoryPage::incr_global_depth(&mut data));
        assert_eq!(HashDirectoryPage::global_depth(&data), 1);
    }

    #[test]
    fn test_directory_can_shrink_and_decr() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));

        // Depth 0 directories never shrink
        assert!(!HashDirectoryPage::can_shrink(&data));

        HashDirectoryPage::incr_global_depth(&mut data);
        // Both slots still at local depth 0 < 1
        assert!(HashDirectoryPage::can_shrink(&data));

        HashDirectoryPage::decr_global_depth(&mut data);
        assert_eq!(HashDirectoryPage::global_depth(&data), 0);
        assert_eq!(HashDirectoryPage::size(&data), 1);
    }

    #[test]
    fn test_directory_can_shrink_blocked_by_deep_bucket() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));
        HashDirectoryPage::incr_global_depth(&mut data);
        HashDirectoryPage::set_bucket_page_id(&mut data, 1, PageId::new(2));
        HashDirectoryPage::set_local_depth(&mut data, 0, 1);
        HashDirectoryPage::set_local_depth(&mut data, 1, 1);

        assert!(!HashDirectoryPage::can_shrink(&data));
    }

    #[test]
    fn test_directory_local_depth_ops() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));
        HashDirectoryPage::incr_global_depth(&mut data);

        HashDirectoryPage::incr_local_depth(&mut data, 0);
        assert_eq!(HashDirectoryPage::local_depth(&data, 0), 1);
        assert_eq!(HashDirectoryPage::local_depth_mask(&data, 0), 0b1);

        HashDirectoryPage::decr_local_depth(&mut data, 0);
        assert_eq!(HashDirectoryPage::local_depth(&data, 0), 0);

        // Clamped at zero
        HashDirectoryPage::decr_local_depth(&mut data, 0);
        assert_eq!(HashDirectoryPage::local_depth(&data, 0), 0);
    }

    #[test]
    fn test_directory_split_image_index() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));
        HashDirectoryPage::incr_global_depth(&mut data);
        HashDirectoryPage::incr_global_depth(&mut data);
        for idx in 0..4 {
            HashDirectoryPage::set_bucket_page_id(&mut data, idx, PageId::new(idx + 1));
            HashDirectoryPage::set_local_depth(&mut data, idx, 2);
        }

        // At local depth 2 the distinguishing bit is bit 1
        assert_eq!(HashDirectoryPage::split_image_index(&data, 0b00), 0b10);
        assert_eq!(HashDirectoryPage::split_image_index(&data, 0b10), 0b00);
        assert_eq!(HashDirectoryPage::split_image_index(&data, 0b01), 0b11);
        assert_eq!(HashDirectoryPage::split_image_index(&data, 0b11), 0b01);
    }

    #[test]
    fn test_directory_verify_integrity_accepts_valid() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));
        // Single bucket at depth 0
        HashDirectoryPage::verify_integrity(&data);

        // Two buckets at depth 1
        HashDirectoryPage::incr_global_depth(&mut data);
        HashDirectoryPage::set_bucket_page_id(&mut data, 1, PageId::new(2));
        HashDirectoryPage::set_local_depth(&mut data, 0, 1);
        HashDirectoryPage::set_local_depth(&mut data, 1, 1);
        HashDirectoryPage::verify_integrity(&data);

        // Depth 2 with one shared bucket: slots 01 and 11 share at depth 1
        HashDirectoryPage::incr_global_depth(&mut data);
        HashDirectoryPage::set_local_depth(&mut data, 0, 2);
        HashDirectoryPage::set_local_depth(&mut data, 2, 2);
        HashDirectoryPage::set_bucket_page_id(&mut data, 2, PageId::new(3));
        HashDirectoryPage::verify_integrity(&data);
    }

    #[test]
    #[should_panic(expected = "has no bucket")]
    fn test_directory_verify_integrity_rejects_missing_bucket() {
        let data = init_dir(3);
        // Slot 0 was never pointed at a bucket
        HashDirectoryPage::verify_integrity(&data);
    }

    #[test]
    #[should_panic(expected = "differing low bits")]
    fn test_directory_verify_integrity_rejects_shared_bucket_depth_lie() {
        let mut data = init_dir(3);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(1));
        HashDirectoryPage::incr_global_depth(&mut data);
        // Claim depth 1 buckets but point both slots at bucket 1
        HashDirectoryPage::set_local_depth(&mut data, 0, 1);
        HashDirectoryPage::set_local_depth(&mut data, 1, 1);
        HashDirectoryPage::verify_integrity(&data);
    }

    #[test]
    fn test_directory_on_page_encoding() {
        let mut data = init_dir(2);
        HashDirectoryPage::set_bucket_page_id(&mut data, 0, PageId::new(9));

        // max_depth then global_depth, little-endian
        assert_eq!(&data[0..4], &2u32.to_le_bytes());
        assert_eq!(&data[4..8], &0u32.to_le_bytes());
        // local depth bytes start at 8
        assert_eq!(data[8], 0);
        // bucket id array starts after the 512 local depth bytes
        assert_eq!(&data[8 + 512..8 + 512 + 4], &9u32.to_le_bytes());
    }
}
