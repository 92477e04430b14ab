//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Trait for page replacement algorithms.
///
/// Candidates are filtered through a caller-supplied predicate so the
/// pool can reject pinned frames without the replacer tracking pins.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Selects a victim frame for eviction among frames the predicate accepts.
    ///
    /// Returns None if no acceptable frame exists.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from consideration and clears its access history.
    fn remove(&self, frame_id: FrameId);
}

/// Clock replacement algorithm implementation.
///
/// Uses atomic reference bits for lock-free access recording; only the
/// clock hand itself sits behind a mutex.
pub struct ClockReplacer {
    /// Number of frames.
    num_frames: usize,
    /// Reference bits for each frame (atomic for lock-free access).
    reference_bits: Vec<AtomicBool>,
    /// Current clock hand position.
    clock_hand: Mutex<usize>,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        let reference_bits: Vec<AtomicBool> =
            (0..num_frames).map(|_| AtomicBool::new(false)).collect();

        Self {
            num_frames,
            reference_bits,
            clock_hand: Mutex::new(0),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }
}

impl Replacer for ClockReplacer {
    #[inline]
    fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(true, Ordering::Relaxed);
        }
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut hand = self.clock_hand.lock();
        let num_frames = self.num_frames;

        // Two full rotations: the first may only clear reference bits.
        for _ in 0..(2 * num_frames) {
            let idx = *hand;
            let frame_id = FrameId(idx as u32);
            *hand = (idx + 1) % num_frames;

            if !can_evict(frame_id) {
                continue;
            }

            if self.reference_bits[idx].load(Ordering::Relaxed) {
                // Second chance: clear the bit and move on
                self.reference_bits[idx].store(false, Ordering::Relaxed);
            } else {
                return Some(frame_id);
            }
        }

        None
    }

    fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
    }

    #[test]
    fn test_clock_replacer_evict_none_acceptable() {
        let replacer = ClockReplacer::new(10);
        assert!(replacer.evict(&|_| false).is_none());
    }

    #[test]
    fn test_clock_replacer_evict_any() {
        let replacer = ClockReplacer::new(10);
        let victim = replacer.evict(&|_| true);
        assert!(victim.is_some());
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let replacer = ClockReplacer::new(3);

        // All frames referenced: first rotation clears bits, second evicts.
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(2));

        let victim = replacer.evict(&|_| true);
        assert_eq!(victim, Some(FrameId(0)));
    }

    #[test]
    fn test_clock_replacer_prefers_unreferenced() {
        let replacer = ClockReplacer::new(3);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        // Frame 2 unreferenced

        let victim = replacer.evict(&|_| true);
        assert_eq!(victim, Some(FrameId(2)));
    }

    #[test]
    fn test_clock_replacer_respects_predicate() {
        let replacer = ClockReplacer::new(3);

        // Only frame 1 is evictable
        let victim = replacer.evict(&|fid| fid.0 == 1);
        assert_eq!(victim, Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_remove_clears_bit() {
        let replacer = ClockReplacer::new(3);

        replacer.record_access(FrameId(0));
        replacer.remove(FrameId(0));

        // Frame 0 now has a clear bit and is evicted immediately
        let victim = replacer.evict(&|_| true);
        assert_eq!(victim, Some(FrameId(0)));
    }
}
