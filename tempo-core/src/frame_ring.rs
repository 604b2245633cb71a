//! # Frame Ring - Decoded Frame Buffer
//!
//! Fixed-capacity circular buffer between a decoder thread and its consumer
//! (refresh loop or audio callback).
//!
//! ```text
//!            read index        write index
//!                │                  │
//!   ┌──────┬─────▼┬──────┬──────┬───▼──┬──────┐
//!   │ free │ last │ next │ next │ free │ free │
//!   └──────┴──────┴──────┴──────┴──────┴──────┘
//!             ▲
//!     kept while `shown` is set (keep_last mode)
//! ```
//!
//! With `keep_last` the frame just consumed stays addressable through
//! [`FrameRing::peek_last`] so the display can be redrawn and the distance
//! to the next frame measured. Every index update happens under the ring
//! lock; payloads are dropped after it is released.

use crate::frame::DecodedFrame;
use crate::unit_queue::UnitQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

pub const VIDEO_RING_CAPACITY: usize = 3;
pub const SUBTITLE_RING_CAPACITY: usize = 16;
pub const AUDIO_RING_CAPACITY: usize = 9;
pub const MAX_RING_CAPACITY: usize = 16;

struct RingState {
    slots: Vec<Option<Arc<DecodedFrame>>>,
    read: usize,
    write: usize,
    size: usize,
    shown: usize,
}

impl RingState {
    /// Slot `offset` places after the read index.
    fn slot(&self, offset: usize) -> usize {
        let capacity = self.slots.len();
        match self.read.checked_add(offset) {
            Some(index) => index % capacity,
            None => (self.read % capacity + offset % capacity) % capacity,
        }
    }

    fn advance(index: usize, capacity: usize) -> usize {
        if index + 1 == capacity {
            0
        } else {
            index + 1
        }
    }

    fn remaining(&self) -> usize {
        self.size - self.shown
    }
}

pub struct FrameRing {
    state: Mutex<RingState>,
    cond: Condvar,
    keep_last: bool,
    /// Aborting this queue also aborts the ring
    queue: Arc<UnitQueue>,
}

impl FrameRing {
    pub fn new(capacity: usize, keep_last: bool, queue: Arc<UnitQueue>) -> Self {
        let capacity = capacity.clamp(1, MAX_RING_CAPACITY);
        Self {
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                read: 0,
                write: 0,
                size: 0,
                shown: 0,
            }),
            cond: Condvar::new(),
            keep_last,
            queue,
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn keep_last(&self) -> bool {
        self.keep_last
    }

    pub fn queue(&self) -> &Arc<UnitQueue> {
        &self.queue
    }

    /// Wake every waiter so it re-checks the abort flag.
    pub fn signal(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Hold the ring lock while touching state that must stay consistent
    /// with the ring contents, such as the video clock.
    pub fn lock(&self) -> RingGuard<'_> {
        RingGuard { _state: self.state.lock() }
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    /// Block until a slot is free. None once the queue is aborted.
    pub fn peek_writable(&self) -> Option<WriteSlot<'_>> {
        let mut state = self.state.lock();
        while state.size >= state.slots.len() && !self.queue.is_aborted() {
            self.cond.wait(&mut state);
        }
        if self.queue.is_aborted() {
            return None;
        }
        Some(WriteSlot { ring: self })
    }

    fn push(&self, frame: DecodedFrame) {
        let mut state = self.state.lock();
        let write = state.write;
        debug_assert!(state.slots[write].is_none());
        state.slots[write] = Some(Arc::new(frame));
        state.write = RingState::advance(write, state.slots.len());
        state.size += 1;
        self.cond.notify_all();
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Block until an unshown frame exists. None once the queue is aborted.
    pub fn peek_readable(&self) -> Option<Arc<DecodedFrame>> {
        let mut state = self.state.lock();
        while state.remaining() == 0 && !self.queue.is_aborted() {
            self.cond.wait(&mut state);
        }
        if self.queue.is_aborted() {
            return None;
        }
        let index = state.slot(state.shown);
        state.slots[index].clone()
    }

    /// First unshown frame.
    pub fn peek(&self) -> Option<Arc<DecodedFrame>> {
        let state = self.state.lock();
        if state.remaining() == 0 {
            return None;
        }
        state.slots[state.slot(state.shown)].clone()
    }

    /// Frame after [`FrameRing::peek`].
    pub fn peek_next(&self) -> Option<Arc<DecodedFrame>> {
        let state = self.state.lock();
        if state.remaining() < 2 {
            return None;
        }
        state.slots[state.slot(state.shown + 1)].clone()
    }

    /// Frame at the read index: the one last shown in keep_last mode.
    pub fn peek_last(&self) -> Option<Arc<DecodedFrame>> {
        let state = self.state.lock();
        if state.size == 0 {
            return None;
        }
        state.slots[state.read].clone()
    }

    /// Consume the current frame.
    pub fn next(&self) {
        let released = {
            let mut state = self.state.lock();
            if state.size == 0 {
                return;
            }
            if self.keep_last && state.shown == 0 {
                state.shown = 1;
                return;
            }
            let read = state.read;
            let frame = state.slots[read].take();
            state.read = RingState::advance(read, state.slots.len());
            state.size -= 1;
            self.cond.notify_all();
            frame
        };
        drop(released);
    }

    /// Frames not yet shown.
    pub fn remaining(&self) -> usize {
        self.state.lock().remaining()
    }

    /// Whether the frame at the read index has been shown.
    pub fn is_last_shown(&self) -> bool {
        self.state.lock().shown > 0
    }

    /// Source byte position of the shown frame, if it belongs to the current
    /// generation.
    pub fn last_shown_position(&self) -> Option<i64> {
        let state = self.state.lock();
        if state.shown == 0 {
            return None;
        }
        let frame = state.slots[state.read].as_ref()?;
        if frame.generation == self.queue.generation() && frame.pos >= 0 {
            Some(frame.pos)
        } else {
            None
        }
    }
}

/// Proof that the ring lock is held
pub struct RingGuard<'a> {
    _state: MutexGuard<'a, RingState>,
}

/// Reserved write position returned by [`FrameRing::peek_writable`]
pub struct WriteSlot<'a> {
    ring: &'a FrameRing,
}

impl WriteSlot<'_> {
    pub fn push(self, frame: DecodedFrame) {
        self.ring.push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioSamples, DecodedPayload};
    use std::thread;
    use std::time::Duration;

    fn started_queue() -> Arc<UnitQueue> {
        let queue = Arc::new(UnitQueue::new("test"));
        queue.start();
        queue
    }

    fn audio_frame(pts: f64, generation: i32) -> DecodedFrame {
        let payload = DecodedPayload::Samples(AudioSamples {
            data: vec![0.0; 64],
            channels: 1,
            sample_rate: 1600,
            pts: None,
            pos: None,
        });
        DecodedFrame::new(payload, generation, pts, 0.04, (pts * 1000.0) as i64)
    }

    fn push(ring: &FrameRing, pts: f64) {
        ring.peek_writable().expect("ring aborted").push(audio_frame(pts, 1));
    }

    #[test]
    fn test_push_and_consume_audio_frames() {
        let ring = FrameRing::new(AUDIO_RING_CAPACITY, true, started_queue());
        for pts in [0.0, 0.04, 0.08, 0.12, 0.16] {
            push(&ring, pts);
        }
        assert_eq!(ring.remaining(), 5);

        // First next() only marks the head as shown
        for _ in 0..5 {
            ring.next();
        }
        assert_eq!(ring.remaining(), 0);
    }

    #[test]
    fn test_keep_last_peek_last() {
        let ring = FrameRing::new(VIDEO_RING_CAPACITY, true, started_queue());
        push(&ring, 1.0);
        ring.next();
        assert_eq!(ring.remaining(), 0);
        assert_eq!(ring.peek_last().unwrap().pts, 1.0);
        assert!(ring.peek().is_none());

        push(&ring, 2.0);
        assert_eq!(ring.peek_last().unwrap().pts, 1.0);
        assert_eq!(ring.peek().unwrap().pts, 2.0);

        ring.next();
        assert_eq!(ring.peek_last().unwrap().pts, 2.0);
    }

    #[test]
    fn test_without_keep_last() {
        let ring = FrameRing::new(SUBTITLE_RING_CAPACITY, false, started_queue());
        push(&ring, 1.0);
        push(&ring, 2.0);
        assert_eq!(ring.peek().unwrap().pts, 1.0);
        assert_eq!(ring.peek_next().unwrap().pts, 2.0);
        ring.next();
        assert_eq!(ring.remaining(), 1);
        assert_eq!(ring.peek().unwrap().pts, 2.0);
        assert!(ring.peek_next().is_none());
    }

    #[test]
    fn test_wraparound() {
        let ring = FrameRing::new(3, false, started_queue());
        for i in 0..20 {
            push(&ring, i as f64);
            if i >= 1 {
                assert_eq!(ring.peek().unwrap().pts, (i - 1) as f64);
                ring.next();
            }
        }
        assert_eq!(ring.remaining(), 1);
        assert_eq!(ring.peek().unwrap().pts, 19.0);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let ring = FrameRing::new(64, false, started_queue());
        assert_eq!(ring.capacity(), MAX_RING_CAPACITY);
    }

    #[test]
    fn test_writer_blocks_until_space() {
        let ring = Arc::new(FrameRing::new(2, false, started_queue()));
        push(&ring, 0.0);
        push(&ring, 1.0);

        let producer = ring.clone();
        let handle = thread::spawn(move || {
            producer.peek_writable().map(|slot| slot.push(audio_frame(2.0, 1))).is_some()
        });
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ring.remaining(), 2);
        ring.next();
        assert!(handle.join().unwrap());
        assert_eq!(ring.remaining(), 2);
    }

    #[test]
    fn test_abort_wakes_writer() {
        let queue = started_queue();
        let ring = Arc::new(FrameRing::new(1, false, queue.clone()));
        push(&ring, 0.0);

        let producer = ring.clone();
        let handle = thread::spawn(move || producer.peek_writable().is_none());
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        ring.signal();
        assert!(handle.join().unwrap());
        assert!(ring.peek_writable().is_none());
    }

    #[test]
    fn test_abort_wakes_reader() {
        let queue = started_queue();
        let ring = Arc::new(FrameRing::new(3, true, queue.clone()));

        let consumer = ring.clone();
        let handle = thread::spawn(move || consumer.peek_readable().is_none());
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        ring.signal();
        assert!(handle.join().unwrap());
        assert!(ring.peek_readable().is_none());
    }

    #[test]
    fn test_last_shown_position() {
        let queue = started_queue();
        let ring = FrameRing::new(3, true, queue.clone());
        push(&ring, 0.5);
        assert_eq!(ring.last_shown_position(), None);
        ring.next();
        assert_eq!(ring.last_shown_position(), Some(500));

        queue.put(crate::unit_queue::CompressedUnit::Flush).unwrap();
        assert_eq!(ring.last_shown_position(), None);
    }
}
