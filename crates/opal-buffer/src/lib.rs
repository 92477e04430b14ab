//! Buffer pool management for OpalDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - Clock eviction policy for cache management
//! - Pin counting for concurrent access
//! - Dirty page tracking with write-back through the disk manager
//! - RAII page guards that hold both the pin and the page latch

mod disk;
mod frame;
mod page_table;
mod pool;
mod replacer;

pub use disk::{DiskManager, DiskManagerConfig};
pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageReadGuard, PageWriteGuard};
pub use replacer::{ClockReplacer, Replacer};
