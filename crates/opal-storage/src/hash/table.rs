//! Disk-backed extendible hash table.

use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

use opal_buffer::{BufferPool, PageWriteGuard};
use opal_common::{HashIndexConfig, OpalError, PageId, Result, Transaction};

use super::bucket_page::HashBucketPage;
use super::constants::{bucket_capacity_for, DIRECTORY_MAX_DEPTH, HEADER_MAX_DEPTH};
use super::directory_page::HashDirectoryPage;
use super::header_page::HashHeaderPage;
use super::types::{ByteKeyComparator, EntryLayout, KeyComparator, KeyHasher, Xxh3KeyHasher};

/// Extendible hash table backed by the buffer pool, mapping fixed-width
/// keys to fixed-width values. Keys are unique. The table grows and
/// shrinks dynamically as buckets fill and empty.
///
/// Every operation hashes the key, resolves header -> directory -> bucket
/// with crab latching (child latched before parent released), and runs
/// under the bucket's latch. Structural changes (split, merge, directory
/// resize) run entirely under the directory's write latch.
pub struct DiskExtendibleHashTable<C = ByteKeyComparator, H = Xxh3KeyHasher> {
    /// Index name, for diagnostics.
    name: String,
    /// Buffer pool owning every page of the index.
    bpm: Arc<BufferPool>,
    /// Key comparator.
    cmp: C,
    /// Key hash function.
    hash_fn: H,
    /// Fixed key/value widths.
    layout: EntryLayout,
    /// Depth limit of the header page.
    header_max_depth: u32,
    /// Depth limit of every directory page.
    directory_max_depth: u32,
    /// Capacity of every bucket page.
    bucket_max_size: u32,
    /// Durable root of the index.
    header_page_id: PageId,
}

impl<C: KeyComparator, H: KeyHasher> DiskExtendibleHashTable<C, H> {
    /// Creates a new hash table, allocating its header page.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPool>,
        cmp: C,
        hash_fn: H,
        config: HashIndexConfig,
    ) -> Result<Self> {
        let bucket_max_size = Self::validate_config(&config)?;

        let mut header = bpm.new_page()?;
        HashHeaderPage::init(header.data_mut(), config.header_max_depth);
        let header_page_id = header.page_id();
        drop(header);

        let name = name.into();
        debug!(
            "created hash table '{}': header page {}, bucket capacity {}",
            name, header_page_id, bucket_max_size
        );

        Ok(Self {
            name,
            bpm,
            cmp,
            hash_fn,
            layout: EntryLayout::new(config.key_size, config.value_size),
            header_max_depth: config.header_max_depth,
            directory_max_depth: config.directory_max_depth,
            bucket_max_size,
            header_page_id,
        })
    }

    /// Reattaches to an existing hash table rooted at `header_page_id`.
    ///
    /// The configuration must match the one the table was created with.
    pub fn open(
        name: impl Into<String>,
        bpm: Arc<BufferPool>,
        cmp: C,
        hash_fn: H,
        config: HashIndexConfig,
        header_page_id: PageId,
    ) -> Result<Self> {
        let bucket_max_size = Self::validate_config(&config)?;

        let header = bpm.fetch_page_read(header_page_id)?;
        let on_page_depth = HashHeaderPage::max_depth(header.data());
        if on_page_depth != config.header_max_depth {
            return Err(OpalError::PageCorrupted {
                page_id: header_page_id.as_u32(),
                reason: format!(
                    "header depth {} does not match configured {}",
                    on_page_depth, config.header_max_depth
                ),
            });
        }
        drop(header);

        Ok(Self {
            name: name.into(),
            bpm,
            cmp,
            hash_fn,
            layout: EntryLayout::new(config.key_size, config.value_size),
            header_max_depth: config.header_max_depth,
            directory_max_depth: config.directory_max_depth,
            bucket_max_size,
            header_page_id,
        })
    }

    fn validate_config(config: &HashIndexConfig) -> Result<u32> {
        if config.header_max_depth > HEADER_MAX_DEPTH {
            return Err(OpalError::InvalidParameter {
                name: "header_max_depth".to_string(),
                value: config.header_max_depth.to_string(),
            });
        }
        if config.directory_max_depth > DIRECTORY_MAX_DEPTH {
            return Err(OpalError::InvalidParameter {
                name: "directory_max_depth".to_string(),
                value: config.directory_max_depth.to_string(),
            });
        }
        if config.key_size == 0 {
            return Err(OpalError::InvalidParameter {
                name: "key_size".to_string(),
                value: "0".to_string(),
            });
        }
        if config.value_size == 0 {
            return Err(OpalError::InvalidParameter {
                name: "value_size".to_string(),
                value: "0".to_string(),
            });
        }

        let capacity = bucket_capacity_for(config.key_size, config.value_size);
        let bucket_max_size = config.bucket_max_size.unwrap_or(capacity);
        if bucket_max_size == 0 || bucket_max_size > capacity {
            return Err(OpalError::InvalidParameter {
                name: "bucket_max_size".to_string(),
                value: bucket_max_size.to_string(),
            });
        }
        Ok(bucket_max_size)
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the id of the header page, the index's durable root.
    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// Downcasts the 64-bit key digest to the 32 bits used for routing.
    #[inline]
    fn hash(&self, key: &[u8]) -> u32 {
        self.hash_fn.hash_key(key) as u32
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_size {
            return Err(OpalError::KeySizeMismatch {
                expected: self.layout.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Looks up the value for a key.
    ///
    /// Latch order: header shared, directory shared, release header,
    /// bucket shared, release directory.
    pub fn get_value(&self, key: &[u8], _txn: Option<&Transaction>) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let hash = self.hash(key);

        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        let directory_idx = HashHeaderPage::hash_to_directory_index(header.data(), hash);
        let directory_page_id = HashHeaderPage::directory_page_id(header.data(), directory_idx);
        if !directory_page_id.is_valid() {
            return Ok(None);
        }

        let directory = self.bpm.fetch_page_read(directory_page_id)?;
        drop(header);

        let bucket_idx = HashDirectoryPage::hash_to_bucket_index(directory.data(), hash);
        let bucket_page_id = HashDirectoryPage::bucket_page_id(directory.data(), bucket_idx);
        if !bucket_page_id.is_valid() {
            return Ok(None);
        }

        let bucket = self.bpm.fetch_page_read(bucket_page_id)?;
        drop(directory);

        Ok(HashBucketPage::lookup(bucket.data(), key, self.layout, &self.cmp).map(<[u8]>::to_vec))
    }

    /// Inserts a key/value pair.
    ///
    /// Returns `Ok(false)` when the key already exists, or when the table
    /// cannot grow any further (directory at max depth with a full bucket,
    /// or no page allocatable). Splits and retries as long as the routed
    /// bucket stays full.
    pub fn insert(&self, key: &[u8], value: &[u8], _txn: Option<&Transaction>) -> Result<bool> {
        self.check_key(key)?;
        if value.len() != self.layout.value_size {
            return Err(OpalError::ValueSizeMismatch {
                expected: self.layout.value_size,
                actual: value.len(),
            });
        }
        let hash = self.hash(key);

        let mut header = self.bpm.fetch_page_write(self.header_page_id)?;
        let directory_idx = HashHeaderPage::hash_to_directory_index(header.data(), hash);
        let directory_page_id = HashHeaderPage::directory_page_id(header.data(), directory_idx);

        if !directory_page_id.is_valid() {
            return self.insert_to_new_directory(&mut header, directory_idx, key, value);
        }

        let mut directory = self.bpm.fetch_page_write(directory_page_id)?;
        drop(header);

        // A split can leave the routed bucket full when every migrated
        // entry lands on one side, so splitting may repeat. Local depth
        // rises by one per round, which bounds the loop.
        for _ in 0..=self.directory_max_depth {
            let bucket_idx = HashDirectoryPage::hash_to_bucket_index(directory.data(), hash);
            let bucket_page_id = HashDirectoryPage::bucket_page_id(directory.data(), bucket_idx);
            if !bucket_page_id.is_valid() {
                return self.insert_to_new_bucket(&mut directory, bucket_idx, key, value);
            }

            let mut bucket = self.bpm.fetch_page_write(bucket_page_id)?;
            if HashBucketPage::lookup(bucket.data(), key, self.layout, &self.cmp).is_some() {
                return Ok(false);
            }
            if !HashBucketPage::is_full(bucket.data()) {
                let inserted =
                    HashBucketPage::insert(bucket.data_mut(), key, value, self.layout, &self.cmp);
                debug_assert!(inserted);
                return Ok(true);
            }

            if !self.split_bucket(&mut directory, &mut bucket, bucket_idx)? {
                return Ok(false);
            }
            // Re-resolve against the rewired directory and retry.
        }

        Err(OpalError::HashTableCorrupted(
            "bucket split retries exhausted".to_string(),
        ))
    }

    /// Removes a key.
    ///
    /// Returns `Ok(false)` when the key is absent. Emptying a bucket
    /// triggers merging, then the directory shrinks while it can.
    pub fn remove(&self, key: &[u8], _txn: Option<&Transaction>) -> Result<bool> {
        self.check_key(key)?;
        let hash = self.hash(key);

        let header = self.bpm.fetch_page_write(self.header_page_id)?;
        let directory_idx = HashHeaderPage::hash_to_directory_index(header.data(), hash);
        let directory_page_id = HashHeaderPage::directory_page_id(header.data(), directory_idx);
        if !directory_page_id.is_valid() {
            return Ok(false);
        }

        let mut directory = self.bpm.fetch_page_write(directory_page_id)?;
        drop(header);

        let bucket_idx = HashDirectoryPage::hash_to_bucket_index(directory.data(), hash);
        let bucket_page_id = HashDirectoryPage::bucket_page_id(directory.data(), bucket_idx);
        if !bucket_page_id.is_valid() {
            return Ok(false);
        }

        let mut bucket = self.bpm.fetch_page_write(bucket_page_id)?;
        if !HashBucketPage::remove(bucket.data_mut(), key, self.layout, &self.cmp) {
            return Ok(false);
        }

        if HashBucketPage::is_empty(bucket.data()) {
            self.merge_bucket(&mut directory, &mut bucket, bucket_idx)?;
        }
        drop(bucket);

        while HashDirectoryPage::can_shrink(directory.data()) {
            HashDirectoryPage::decr_global_depth(directory.data_mut());
            debug!(
                "hash table '{}': directory {} shrank to global depth {}",
                self.name,
                directory.page_id(),
                HashDirectoryPage::global_depth(directory.data())
            );
        }

        Ok(true)
    }

    /// First insert routed to an unoccupied header slot: allocates the
    /// directory and its first bucket, then installs the directory.
    fn insert_to_new_directory(
        &self,
        header: &mut PageWriteGuard<'_>,
        directory_idx: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut directory = match self.bpm.new_page() {
            Ok(guard) => guard,
            Err(OpalError::BufferPoolFull) => return Ok(false),
            Err(e) => return Err(e),
        };
        HashDirectoryPage::init(directory.data_mut(), self.directory_max_depth);

        let mut bucket = match self.bpm.new_page() {
            Ok(guard) => guard,
            Err(OpalError::BufferPoolFull) => {
                // Give the half-built directory back before bailing out.
                let directory_page_id = directory.page_id();
                drop(directory);
                self.bpm.delete_page(directory_page_id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        HashBucketPage::init(bucket.data_mut(), self.bucket_max_size);

        let bucket_page_id = bucket.page_id();
        HashDirectoryPage::set_bucket_page_id(directory.data_mut(), 0, bucket_page_id);
        HashHeaderPage::set_directory_page_id(header.data_mut(), directory_idx, directory.page_id());

        debug!(
            "hash table '{}': new directory {} (header slot {}), first bucket {}",
            self.name,
            directory.page_id(),
            directory_idx,
            bucket_page_id
        );

        let inserted = HashBucketPage::insert(bucket.data_mut(), key, value, self.layout, &self.cmp);
        debug_assert!(inserted);
        Ok(true)
    }

    /// Insert routed to a directory slot with no bucket: allocates one.
    fn insert_to_new_bucket(
        &self,
        directory: &mut PageWriteGuard<'_>,
        bucket_idx: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut bucket = match self.bpm.new_page() {
            Ok(guard) => guard,
            Err(OpalError::BufferPoolFull) => return Ok(false),
            Err(e) => return Err(e),
        };
        HashBucketPage::init(bucket.data_mut(), self.bucket_max_size);
        HashDirectoryPage::set_bucket_page_id(directory.data_mut(), bucket_idx, bucket.page_id());

        let inserted = HashBucketPage::insert(bucket.data_mut(), key, value, self.layout, &self.cmp);
        debug_assert!(inserted);
        Ok(true)
    }

    /// Splits the full bucket at `bucket_idx`, deepening it by one bit.
    ///
    /// Returns `Ok(false)` when the directory cannot grow (depth limit)
    /// or no page is allocatable; the directory is untouched in that case.
    fn split_bucket(
        &self,
        directory: &mut PageWriteGuard<'_>,
        bucket: &mut PageWriteGuard<'_>,
        bucket_idx: u32,
    ) -> Result<bool> {
        let old_local_depth = HashDirectoryPage::local_depth(directory.data(), bucket_idx);

        let mut grew_directory = false;
        if old_local_depth == HashDirectoryPage::global_depth(directory.data()) {
            if !HashDirectoryPage::incr_global_depth(directory.data_mut()) {
                debug!(
                    "hash table '{}': directory {} at max depth, bucket {} cannot split",
                    self.name,
                    directory.page_id(),
                    bucket.page_id()
                );
                return Ok(false);
            }
            grew_directory = true;
        }

        let mut new_bucket = match self.bpm.new_page() {
            Ok(guard) => guard,
            Err(OpalError::BufferPoolFull) => {
                // Undo the doubling so no depth invariant is left dangling.
                if grew_directory {
                    HashDirectoryPage::decr_global_depth(directory.data_mut());
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        HashBucketPage::init(new_bucket.data_mut(), self.bucket_max_size);

        let new_local_depth = old_local_depth + 1;
        self.update_directory_mapping(directory, bucket_idx, new_bucket.page_id(), new_local_depth);
        self.migrate_entries(directory, bucket, &mut new_bucket);

        debug!(
            "hash table '{}': split bucket {} -> {} at local depth {}",
            self.name,
            bucket.page_id(),
            new_bucket.page_id(),
            new_local_depth
        );
        Ok(true)
    }

    /// Rewrites directory slots for a split: every slot sharing the old
    /// bucket's low `new_local_depth - 1` bits moves to the new depth, and
    /// the half whose next bit matches the split image is repointed at the
    /// new bucket.
    fn update_directory_mapping(
        &self,
        directory: &mut PageWriteGuard<'_>,
        old_bucket_idx: u32,
        new_bucket_page_id: PageId,
        new_local_depth: u32,
    ) {
        let old_local_depth = new_local_depth - 1;
        let step = 1u32 << old_local_depth;
        let split_bit = step;
        let new_side = (old_bucket_idx ^ split_bit) & split_bit;

        let size = HashDirectoryPage::size(directory.data());
        let mut idx = old_bucket_idx & (step - 1);
        while idx < size {
            HashDirectoryPage::set_local_depth(directory.data_mut(), idx, new_local_depth);
            if idx & split_bit == new_side {
                HashDirectoryPage::set_bucket_page_id(directory.data_mut(), idx, new_bucket_page_id);
            }
            idx += step;
        }
    }

    /// Drains the old bucket and re-inserts every entry into whichever of
    /// the two buckets the rewired directory routes it to.
    fn migrate_entries(
        &self,
        directory: &PageWriteGuard<'_>,
        bucket: &mut PageWriteGuard<'_>,
        new_bucket: &mut PageWriteGuard<'_>,
    ) {
        let old_page_id = bucket.page_id();
        let new_page_id = new_bucket.page_id();

        let count = HashBucketPage::size(bucket.data());
        let mut entries = Vec::with_capacity(count as usize);
        for idx in 0..count {
            let (key, value) = HashBucketPage::entry_at(bucket.data(), idx, self.layout);
            entries.push((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)));
        }
        HashBucketPage::clear(bucket.data_mut());

        for (key, value) in &entries {
            let hash = self.hash(key);
            let target_idx = HashDirectoryPage::hash_to_bucket_index(directory.data(), hash);
            let target_page_id = HashDirectoryPage::bucket_page_id(directory.data(), target_idx);
            debug_assert!(
                target_page_id == old_page_id || target_page_id == new_page_id,
                "migrated entry routes to neither side of the split"
            );

            let target = if target_page_id == new_page_id {
                new_bucket.data_mut()
            } else {
                bucket.data_mut()
            };
            let inserted = HashBucketPage::insert(target, key, value, self.layout, &self.cmp);
            debug_assert!(inserted);
        }
    }

    /// Merge loop for a bucket that just became empty.
    ///
    /// While the bucket and its split image sit at the same local depth
    /// and at least one of them is empty, the split image is absorbed
    /// into the surviving bucket, its page freed, and every slot of the
    /// coarser group repointed. The surviving bucket may then merge again
    /// at the next depth up.
    fn merge_bucket(
        &self,
        directory: &mut PageWriteGuard<'_>,
        bucket: &mut PageWriteGuard<'_>,
        bucket_idx: u32,
    ) -> Result<()> {
        loop {
            let local_depth = HashDirectoryPage::local_depth(directory.data(), bucket_idx);
            if local_depth == 0 {
                return Ok(());
            }

            let split_idx = HashDirectoryPage::split_image_index(directory.data(), bucket_idx);
            if HashDirectoryPage::local_depth(directory.data(), split_idx) != local_depth {
                return Ok(());
            }

            let bucket_page_id = bucket.page_id();
            let split_page_id = HashDirectoryPage::bucket_page_id(directory.data(), split_idx);
            if split_page_id == bucket_page_id || !split_page_id.is_valid() {
                // Latching the same page twice would self-deadlock.
                return Err(OpalError::HashTableCorrupted(format!(
                    "bucket {} and its split image share slot state",
                    bucket_page_id
                )));
            }

            let mut split_bucket = self.bpm.fetch_page_write(split_page_id)?;
            if !HashBucketPage::is_empty(bucket.data())
                && !HashBucketPage::is_empty(split_bucket.data())
            {
                return Ok(());
            }

            // Absorb the split image into the surviving bucket.
            let count = HashBucketPage::size(split_bucket.data());
            for idx in 0..count {
                let (key, value) = HashBucketPage::entry_at(split_bucket.data(), idx, self.layout);
                let inserted =
                    HashBucketPage::insert(bucket.data_mut(), key, value, self.layout, &self.cmp);
                debug_assert!(inserted);
            }
            HashBucketPage::clear(split_bucket.data_mut());
            drop(split_bucket);

            if !self.bpm.delete_page(split_page_id) {
                warn!(
                    "hash table '{}': merged bucket {} still pinned, not freed",
                    self.name, split_page_id
                );
            }

            HashDirectoryPage::decr_local_depth(directory.data_mut(), bucket_idx);
            let new_local_depth = HashDirectoryPage::local_depth(directory.data(), bucket_idx);

            // Repoint every slot of the merged group at the survivor.
            let step = 1u32 << new_local_depth;
            let size = HashDirectoryPage::size(directory.data());
            let mut idx = bucket_idx & (step - 1);
            while idx < size {
                HashDirectoryPage::set_bucket_page_id(directory.data_mut(), idx, bucket_page_id);
                HashDirectoryPage::set_local_depth(directory.data_mut(), idx, new_local_depth);
                idx += step;
            }

            debug!(
                "hash table '{}': merged bucket {} into {} at local depth {}",
                self.name, split_page_id, bucket_page_id, new_local_depth
            );
        }
    }

    /// Walks the whole index and asserts every structural invariant.
    ///
    /// Panics on violation; returns an error only for page access faults.
    pub fn verify_integrity(&self) -> Result<()> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        assert_eq!(
            HashHeaderPage::max_depth(header.data()),
            self.header_max_depth,
            "header depth drifted"
        );

        for directory_idx in 0..HashHeaderPage::max_size(header.data()) {
            let directory_page_id = HashHeaderPage::directory_page_id(header.data(), directory_idx);
            if !directory_page_id.is_valid() {
                continue;
            }

            let directory = self.bpm.fetch_page_read(directory_page_id)?;
            HashDirectoryPage::verify_integrity(directory.data());

            let mut seen = HashSet::new();
            for bucket_idx in 0..HashDirectoryPage::size(directory.data()) {
                let bucket_page_id = HashDirectoryPage::bucket_page_id(directory.data(), bucket_idx);
                if !seen.insert(bucket_page_id) {
                    continue;
                }

                let bucket = self.bpm.fetch_page_read(bucket_page_id)?;
                let size = HashBucketPage::size(bucket.data());
                assert!(
                    size <= HashBucketPage::max_size(bucket.data()),
                    "bucket {} overfull",
                    bucket_page_id
                );
                assert_eq!(
                    HashBucketPage::max_size(bucket.data()),
                    self.bucket_max_size,
                    "bucket {} capacity drifted",
                    bucket_page_id
                );

                for i in 0..size {
                    let key = HashBucketPage::key_at(bucket.data(), i, self.layout);
                    for j in (i + 1)..size {
                        assert!(
                            !self
                                .cmp
                                .eq(key, HashBucketPage::key_at(bucket.data(), j, self.layout)),
                            "bucket {} holds a duplicate key",
                            bucket_page_id
                        );
                    }

                    let hash = self.hash(key);
                    assert_eq!(
                        HashHeaderPage::hash_to_directory_index(header.data(), hash),
                        directory_idx,
                        "entry routes to a different directory"
                    );
                    let routed_idx =
                        HashDirectoryPage::hash_to_bucket_index(directory.data(), hash);
                    assert_eq!(
                        HashDirectoryPage::bucket_page_id(directory.data(), routed_idx),
                        bucket_page_id,
                        "entry in bucket {} routes to another bucket",
                        bucket_page_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Logs the full header/directory/bucket structure at debug level.
    pub fn print_ht(&self) -> Result<()> {
        let header = self.bpm.fetch_page_read(self.header_page_id)?;
        debug!(
            "==== hash table '{}' (header page {}, depth {}) ====",
            self.name,
            self.header_page_id,
            HashHeaderPage::max_depth(header.data())
        );

        for directory_idx in 0..HashHeaderPage::max_size(header.data()) {
            let directory_page_id = HashHeaderPage::directory_page_id(header.data(), directory_idx);
            if !directory_page_id.is_valid() {
                continue;
            }

            let directory = self.bpm.fetch_page_read(directory_page_id)?;
            let global_depth = HashDirectoryPage::global_depth(directory.data());
            debug!(
                "directory[{}] page {} global depth {}",
                directory_idx, directory_page_id, global_depth
            );

            for bucket_idx in 0..HashDirectoryPage::size(directory.data()) {
                let bucket_page_id = HashDirectoryPage::bucket_page_id(directory.data(), bucket_idx);
                let local_depth = HashDirectoryPage::local_depth(directory.data(), bucket_idx);
                let entries = if bucket_page_id.is_valid() {
                    let bucket = self.bpm.fetch_page_read(bucket_page_id)?;
                    HashBucketPage::size(bucket.data())
                } else {
                    0
                };
                debug!(
                    "  slot[{:0width$b}] -> bucket {} (local depth {}, {} entries)",
                    bucket_idx,
                    bucket_page_id,
                    local_depth,
                    entries,
                    width = global_depth.max(1) as usize
                );
            }
        }
        debug!("==== end of '{}' ====", self.name);
        Ok(())
    }
}
