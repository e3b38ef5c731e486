//! Drop-oldest frame ring shared between the producer and preview consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use super::error::{PipelineError, Result};
use super::lock;
use crate::capture::Frame;

pub const DEFAULT_CAPACITY: usize = 30;

/// Bounded FIFO of annotated frames.
///
/// When full, a push evicts the single oldest frame: a stale preview frame is
/// worth less than never stalling the producer. Every operation holds the
/// lock only for a ring operation, so neither side blocks for long.
pub struct FrameBuffer {
    ring: Mutex<HeapRb<Frame>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Counters since the buffer was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity(capacity));
        }
        Ok(Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Producer: push a frame, evicting the oldest one if full. Never blocks
    /// beyond the ring lock.
    pub fn push(&self, frame: Frame) {
        let evicted = lock(&self.ring).push_overwrite(frame);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camview_frames_dropped").increment(1);
        }
    }

    /// Consumer: oldest buffered frame, or `None` right away when empty.
    pub fn pop_latest(&self) -> Option<Frame> {
        let frame = lock(&self.ring).try_pop();
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Consumer: newest buffered frame, discarding everything older.
    pub fn take_newest(&self) -> Option<Frame> {
        let mut ring = lock(&self.ring);
        let mut newest = None;
        let mut skipped = 0u64;
        while let Some(frame) = ring.try_pop() {
            if newest.replace(frame).is_some() {
                skipped += 1;
            }
        }
        drop(ring);
        if newest.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            self.stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
        }
        newest
    }

    /// Copies of the buffered frames, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        lock(&self.ring).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.ring).capacity().get()
    }

    /// Replace the ring with one of a new capacity, keeping the newest frames
    /// that fit. Callers must ensure no producer is running.
    pub(crate) fn resize(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity(capacity));
        }
        let mut ring = lock(&self.ring);
        let mut resized = HeapRb::new(capacity);
        while let Some(frame) = ring.try_pop() {
            if resized.push_overwrite(frame).is_some() {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        *ring = resized;
        Ok(())
    }

    pub fn clear(&self) {
        let mut ring = lock(&self.ring);
        Consumer::clear(&mut *ring);
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(DEFAULT_CAPACITY)),
            stats: CachePadded::new(Stats::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb24, "CAM".into()).with_sequence(seq)
    }

    fn sequences(frames: &[Frame]) -> Vec<u64> {
        frames.iter().map(Frame::sequence).collect()
    }

    #[test]
    fn keeps_most_recent_frames_when_overfilled() {
        let buffer = FrameBuffer::new(3).unwrap();
        for seq in 1..=8 {
            buffer.push(frame(seq));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(sequences(&buffer.snapshot()), [6, 7, 8]);
        assert_eq!(
            buffer.stats(),
            BufferStats {
                written: 8,
                read: 0,
                dropped: 5
            }
        );
    }

    #[test]
    fn pops_in_fifo_order_then_empty() {
        let buffer = FrameBuffer::new(4).unwrap();
        assert!(buffer.pop_latest().is_none());
        buffer.push(frame(1));
        buffer.push(frame(2));
        assert_eq!(buffer.pop_latest().map(|f| f.sequence()), Some(1));
        assert_eq!(buffer.pop_latest().map(|f| f.sequence()), Some(2));
        assert!(buffer.pop_latest().is_none());
        assert_eq!(buffer.stats().read, 2);
    }

    #[test]
    fn take_newest_drains_the_ring() {
        let buffer = FrameBuffer::new(5).unwrap();
        for seq in 1..=4 {
            buffer.push(frame(seq));
        }
        assert_eq!(buffer.take_newest().map(|f| f.sequence()), Some(4));
        assert!(buffer.is_empty());
        assert!(buffer.take_newest().is_none());
    }

    #[test]
    fn clear_empties_without_counting_drops() {
        let buffer = FrameBuffer::new(2).unwrap();
        buffer.push(frame(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().dropped, 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            FrameBuffer::new(0),
            Err(PipelineError::InvalidCapacity(0))
        ));
        let buffer = FrameBuffer::default();
        assert!(buffer.resize(0).is_err());
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn shrinking_keeps_the_newest() {
        let buffer = FrameBuffer::new(5).unwrap();
        for seq in 1..=5 {
            buffer.push(frame(seq));
        }
        buffer.resize(2).unwrap();
        assert_eq!(buffer.capacity(), 2);
        assert_eq!(sequences(&buffer.snapshot()), [4, 5]);

        buffer.resize(4).unwrap();
        buffer.push(frame(6));
        assert_eq!(sequences(&buffer.snapshot()), [4, 5, 6]);
    }

    #[test]
    fn concurrent_consumers_never_block_the_producer() {
        use std::sync::Arc;
        use std::thread;

        let buffer = Arc::new(FrameBuffer::new(8).unwrap());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..2_000 {
                        if let Some(f) = buffer.pop_latest() {
                            // FIFO per consumer: never goes backwards
                            assert!(f.sequence() > last);
                            last = f.sequence();
                        }
                    }
                })
            })
            .collect();
        for seq in 1..=5_000 {
            buffer.push(frame(seq));
        }
        for c in consumers {
            c.join().unwrap();
        }
        let stats = buffer.stats();
        assert_eq!(stats.written, 5_000);
        assert_eq!(stats.written, stats.read + stats.dropped + buffer.len() as u64);
    }
}
