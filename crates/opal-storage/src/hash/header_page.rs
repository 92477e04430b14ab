//! Extendible hash header page.
//!
//! One per index, created at construction and never split or grown. The
//! header routes the top `max_depth` bits of a key digest to a directory
//! page, populating directory slots lazily on first insert.
//!
//! Page layout (little-endian):
//! ```text
//! +------------------------+ 0
//! | max_depth: u32         |
//! +------------------------+ 4
//! | directory_page_ids     |
//! | [u32; 1 << HEADER_MAX_DEPTH]
//! +------------------------+ 4 + 4 * 512
//! |      zeroed tail       |
//! +------------------------+ PAGE_SIZE
//! ```
//!
//! The all-ones value marks a slot with no directory allocated yet.

use super::constants::{
    HEADER_ARRAY_SIZE, HEADER_IDS_OFFSET, HEADER_MAX_DEPTH, HEADER_MAX_DEPTH_OFFSET,
};
use opal_common::page::PageId;

/// Accessors over the raw bytes of a header page.
///
/// Callers hold the page via a buffer pool guard; all functions take the
/// guard's data slice directly.
pub struct HashHeaderPage;

impl HashHeaderPage {
    /// Initializes a header page: records the depth and marks every
    /// directory slot empty. The whole physical array is written, not
    /// just the live prefix.
    pub fn init(data: &mut [u8], max_depth: u32) {
        debug_assert!(max_depth <= HEADER_MAX_DEPTH);
        data[HEADER_MAX_DEPTH_OFFSET..HEADER_MAX_DEPTH_OFFSET + 4]
            .copy_from_slice(&max_depth.to_le_bytes());
        for idx in 0..HEADER_ARRAY_SIZE {
            let offset = HEADER_IDS_OFFSET + idx * 4;
            data[offset..offset + 4].copy_from_slice(&PageId::INVALID.as_u32().to_le_bytes());
        }
    }

    /// Returns the header's fixed depth.
    pub fn max_depth(data: &[u8]) -> u32 {
        u32::from_le_bytes([
            data[HEADER_MAX_DEPTH_OFFSET],
            data[HEADER_MAX_DEPTH_OFFSET + 1],
            data[HEADER_MAX_DEPTH_OFFSET + 2],
            data[HEADER_MAX_DEPTH_OFFSET + 3],
        ])
    }

    /// Number of live directory slots.
    pub fn max_size(data: &[u8]) -> u32 {
        1 << Self::max_depth(data)
    }

    /// Routes a digest to a directory slot via its top `max_depth` bits.
    pub fn hash_to_directory_index(data: &[u8], hash: u32) -> u32 {
        let max_depth = Self::max_depth(data);
        if max_depth == 0 {
            0
        } else {
            hash >> (32 - max_depth)
        }
    }

    /// Reads the directory page id at a slot.
    pub fn directory_page_id(data: &[u8], directory_idx: u32) -> PageId {
        debug_assert!(directory_idx < Self::max_size(data));
        let offset = HEADER_IDS_OFFSET + directory_idx as usize * 4;
        PageId::from_u32(u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    }

    /// Writes the directory page id at a slot.
    pub fn set_directory_page_id(data: &mut [u8], directory_idx: u32, page_id: PageId) {
        debug_assert!(directory_idx < Self::max_size(data));
        let offset = HEADER_IDS_OFFSET + directory_idx as usize * 4;
        data[offset..offset + 4].copy_from_slice(&page_id.as_u32().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_common::page::PAGE_SIZE;

    fn blank_page() -> [u8; PAGE_SIZE] {
        [0u8; PAGE_SIZE]
    }

    #[test]
    fn test_header_init() {
        let mut data = blank_page();
        HashHeaderPage::init(&mut data, 3);

        assert_eq!(HashHeaderPage::max_depth(&data), 3);
        assert_eq!(HashHeaderPage::max_size(&data), 8);
        for idx in 0..8 {
            assert!(!HashHeaderPage::directory_page_id(&data, idx).is_valid());
        }
    }

    #[test]
    fn test_header_set_get_directory_id() {
        let mut data = blank_page();
        HashHeaderPage::init(&mut data, 2);

        HashHeaderPage::set_directory_page_id(&mut data, 1, PageId::new(42));
        assert_eq!(
            HashHeaderPage::directory_page_id(&data, 1),
            PageId::new(42)
        );
        // Neighbors untouched
        assert!(!HashHeaderPage::directory_page_id(&data, 0).is_valid());
        assert!(!HashHeaderPage::directory_page_id(&data, 2).is_valid());
    }

    #[test]
    fn test_header_hash_routing_uses_top_bits() {
        let mut data = blank_page();
        HashHeaderPage::init(&mut data, 2);

        // Top two bits select the slot
        assert_eq!(HashHeaderPage::hash_to_directory_index(&data, 0x0000_0000), 0);
        assert_eq!(HashHeaderPage::hash_to_directory_index(&data, 0x4000_0000), 1);
        assert_eq!(HashHeaderPage::hash_to_directory_index(&data, 0x8000_0000), 2);
        assert_eq!(HashHeaderPage::hash_to_directory_index(&data, 0xFFFF_FFFF), 3);
    }

    #[test]
    fn test_header_zero_depth_routes_everything_to_slot_zero() {
        let mut data = blank_page();
        HashHeaderPage::init(&mut data, 0);

        assert_eq!(HashHeaderPage::max_size(&data), 1);
        assert_eq!(HashHeaderPage::hash_to_directory_index(&data, 0), 0);
        assert_eq!(
            HashHeaderPage::hash_to_directory_index(&data, u32::MAX),
            0
        );
    }

    #[test]
    fn test_header_on_page_encoding() {
        let mut data = blank_page();
        HashHeaderPage::init(&mut data, 1);
        HashHeaderPage::set_directory_page_id(&mut data, 0, PageId::new(0x01020304));

        // max_depth at offset 0, little-endian
        assert_eq!(&data[0..4], &1u32.to_le_bytes());
        // slot 0 at offset 4
        assert_eq!(&data[4..8], &[0x04, 0x03, 0x02, 0x01]);
        // slot 1 still the all-ones sentinel
        assert_eq!(&data[8..12], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
