//! # Unit Queue - Compressed Packet FIFO
//!
//! Unbounded FIFO between the read thread and one stream decoder.
//!
//! ```text
//! ┌──────────┐ put  ┌───────────────────────────────┐ get  ┌─────────┐
//! │  Reader  │─────►│ Flush │ Data │ Data │ EOS │ … │─────►│ Decoder │
//! └──────────┘      └───────────────────────────────┘      └─────────┘
//!                     generation: bumped by each Flush
//! ```
//!
//! Every entry is tagged with the generation current when it was queued.
//! Queuing a [`CompressedUnit::Flush`] bumps the generation first, so the
//! marker itself carries the new generation and everything older is stale.

use crate::clock::GenerationRef;
use crate::frame::TimeBase;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Per-entry bookkeeping cost added to the payload size.
pub const UNIT_OVERHEAD_BYTES: usize = 64;

/// Total buffered bytes across all queues above which the reader pauses.
pub const MAX_QUEUE_BYTES: usize = 15 * 1024 * 1024;

/// Units a stream must hold before it counts as sufficiently buffered.
pub const MIN_UNITS: usize = 25;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue aborted")]
    Aborted,
}

// ============================================================================
// Units
// ============================================================================

/// Compressed packet as produced by a demuxer.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Bytes,
    /// Presentation timestamp in the stream time base
    pub pts: Option<i64>,
    /// Decode timestamp in the stream time base
    pub dts: Option<i64>,
    /// Duration in the stream time base, 0 when unknown
    pub duration: i64,
    /// Byte offset in the source
    pub pos: Option<i64>,
    pub keyframe: bool,
}

impl Packet {
    pub fn new(stream_index: usize, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            data: data.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompressedUnit {
    /// Everything buffered before this point is obsolete
    Flush,
    Data(Packet),
    /// No more data follows for the stream; drain the decoder
    EndOfStream { stream_index: usize },
}

impl CompressedUnit {
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    fn accounted_bytes(&self) -> usize {
        let payload = match self {
            Self::Data(packet) => packet.data.len(),
            _ => 0,
        };
        payload + UNIT_OVERHEAD_BYTES
    }

    fn duration(&self) -> i64 {
        match self {
            Self::Data(packet) => packet.duration,
            _ => 0,
        }
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub units: usize,
    pub bytes: usize,
    pub duration: i64,
    pub generation: i32,
    pub aborted: bool,
}

// ============================================================================
// Queue
// ============================================================================

struct QueuedUnit {
    unit: CompressedUnit,
    generation: i32,
}

#[derive(Default)]
struct QueueState {
    units: VecDeque<QueuedUnit>,
    bytes: usize,
    duration: i64,
}

pub struct UnitQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    cond: Condvar,
    aborted: AtomicBool,
    generation: GenerationRef,
}

impl UnitQueue {
    /// New queues start aborted; call [`UnitQueue::start`] before use.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            aborted: AtomicBool::new(true),
            generation: GenerationRef::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Clear the abort flag and seed the queue with a flush marker.
    pub fn start(&self) {
        let mut state = self.state.lock();
        self.aborted.store(false, Ordering::SeqCst);
        self.push_locked(&mut state, CompressedUnit::Flush);
        tracing::debug!(queue = self.name, generation = self.generation.get(), "queue started");
    }

    pub fn put(&self, unit: CompressedUnit) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if self.aborted.load(Ordering::SeqCst) {
            return Err(QueueError::Aborted);
        }
        self.push_locked(&mut state, unit);
        Ok(())
    }

    pub fn put_end_of_stream(&self, stream_index: usize) -> Result<(), QueueError> {
        self.put(CompressedUnit::EndOfStream { stream_index })
    }

    fn push_locked(&self, state: &mut QueueState, unit: CompressedUnit) {
        let generation = if unit.is_flush() {
            self.generation.bump()
        } else {
            self.generation.get()
        };
        state.bytes += unit.accounted_bytes();
        state.duration += unit.duration();
        state.units.push_back(QueuedUnit { unit, generation });
        self.cond.notify_one();
    }

    /// Take the head unit with the generation it was queued under.
    ///
    /// Non-blocking calls return `Ok(None)` when the queue is empty; blocking
    /// calls only return once a unit arrives or the queue is aborted.
    pub fn get(&self, block: bool) -> Result<Option<(CompressedUnit, i32)>, QueueError> {
        let mut state = self.state.lock();
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(QueueError::Aborted);
            }
            if let Some(entry) = state.units.pop_front() {
                state.bytes -= entry.unit.accounted_bytes();
                state.duration -= entry.unit.duration();
                return Ok(Some((entry.unit, entry.generation)));
            }
            if !block {
                return Ok(None);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Drop every queued unit. The generation is left untouched.
    pub fn flush(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.bytes = 0;
            state.duration = 0;
            std::mem::take(&mut state.units)
        };
        drop(dropped);
    }

    pub fn abort(&self) {
        let _state = self.state.lock();
        self.aborted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> i32 {
        self.generation.get()
    }

    /// Handle for clocks that must go stale when this queue is flushed.
    pub fn generation_ref(&self) -> GenerationRef {
        self.generation.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    pub fn duration(&self) -> i64 {
        self.state.lock().duration
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            units: state.units.len(),
            bytes: state.bytes,
            duration: state.duration,
            generation: self.generation.get(),
            aborted: self.aborted.load(Ordering::SeqCst),
        }
    }

    /// Whether the reader can stop feeding this queue for now.
    pub fn has_enough_units(&self, time_base: TimeBase) -> bool {
        let stats = self.stats();
        stats.aborted
            || (stats.units > MIN_UNITS
                && (stats.duration == 0 || time_base.seconds(stats.duration) > 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn data(len: usize, duration: i64) -> CompressedUnit {
        let mut packet = Packet::new(0, vec![0u8; len]);
        packet.duration = duration;
        CompressedUnit::Data(packet)
    }

    fn started() -> UnitQueue {
        let queue = UnitQueue::new("test");
        queue.start();
        // Drain the seeding flush marker
        let (unit, generation) = queue.get(false).unwrap().unwrap();
        assert!(unit.is_flush());
        assert_eq!(generation, 1);
        queue
    }

    #[test]
    fn test_new_queue_is_aborted() {
        let queue = UnitQueue::new("test");
        assert!(queue.is_aborted());
        assert_eq!(queue.put(data(10, 1)), Err(QueueError::Aborted));
        assert_eq!(queue.get(false).unwrap_err(), QueueError::Aborted);
    }

    #[test]
    fn test_fifo_and_accounting() {
        let queue = started();
        let sizes = [100usize, 7, 250, 0, 31];
        let mut put_bytes = 0;
        for (i, &len) in sizes.iter().enumerate() {
            queue.put(data(len, i as i64 + 1)).unwrap();
            put_bytes += len + UNIT_OVERHEAD_BYTES;
        }
        assert_eq!(queue.len(), sizes.len());
        assert_eq!(queue.size_bytes(), put_bytes);
        assert_eq!(queue.duration(), 15);

        let mut got_bytes = 0;
        for &len in &sizes[..3] {
            let (unit, _) = queue.get(false).unwrap().unwrap();
            match unit {
                CompressedUnit::Data(packet) => assert_eq!(packet.data.len(), len),
                other => panic!("unexpected unit {:?}", other),
            }
            got_bytes += len + UNIT_OVERHEAD_BYTES;
            assert_eq!(queue.size_bytes(), put_bytes - got_bytes);
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.duration(), 4 + 5);
    }

    #[test]
    fn test_flush_marker_bumps_generation() {
        let queue = started();
        queue.put(data(1, 0)).unwrap();
        queue.put(CompressedUnit::Flush).unwrap();
        queue.put(data(1, 0)).unwrap();

        assert_eq!(queue.get(false).unwrap().unwrap().1, 1);
        let (marker, generation) = queue.get(false).unwrap().unwrap();
        assert!(marker.is_flush());
        assert_eq!(generation, 2);
        assert_eq!(queue.get(false).unwrap().unwrap().1, 2);
        assert_eq!(queue.generation(), 2);
    }

    #[test]
    fn test_flush_keeps_generation() {
        let queue = started();
        queue.put(data(10, 3)).unwrap();
        queue.put(data(10, 3)).unwrap();
        queue.flush();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.size_bytes(), 0);
        assert_eq!(queue.duration(), 0);
        assert_eq!(queue.generation(), 1);
        assert!(queue.get(false).unwrap().is_none());
    }

    #[test]
    fn test_end_of_stream_is_not_abort() {
        let queue = started();
        queue.put_end_of_stream(4).unwrap();
        match queue.get(false).unwrap() {
            Some((CompressedUnit::EndOfStream { stream_index }, _)) => assert_eq!(stream_index, 4),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!queue.is_aborted());
    }

    #[test]
    fn test_abort_wakes_blocked_get() {
        let queue = Arc::new(started());
        let waiter = queue.clone();
        let handle = thread::spawn(move || waiter.get(true));
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        assert_eq!(handle.join().unwrap().unwrap_err(), QueueError::Aborted);

        // Sticky until restarted
        assert_eq!(queue.get(true).unwrap_err(), QueueError::Aborted);
        assert_eq!(queue.put(data(1, 0)), Err(QueueError::Aborted));

        queue.start();
        assert!(queue.get(true).unwrap().unwrap().0.is_flush());
    }

    #[test]
    fn test_blocking_get_receives_later_put() {
        let queue = Arc::new(started());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.put(data(5, 1)).unwrap();
        });
        let (unit, _) = queue.get(true).unwrap().unwrap();
        assert!(matches!(unit, CompressedUnit::Data(_)));
        handle.join().unwrap();
    }

    #[test]
    fn test_has_enough_units() {
        let queue = started();
        let tb = TimeBase::new(1, 1000);
        for _ in 0..=MIN_UNITS {
            queue.put(data(1, 10)).unwrap();
        }
        // 26 units but only 0.26 s buffered
        assert!(!queue.has_enough_units(tb));
        for _ in 0..100 {
            queue.put(data(1, 10)).unwrap();
        }
        assert!(queue.has_enough_units(tb));

        let unknown = started();
        for _ in 0..=MIN_UNITS {
            unknown.put(data(1, 0)).unwrap();
        }
        assert!(unknown.has_enough_units(tb));
    }
}
