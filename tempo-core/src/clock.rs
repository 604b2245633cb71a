//! # Playback Clocks
//!
//! A clock is a timestamp anchored to a point on the monotonic wall clock and
//! extrapolated linearly (scaled by speed) until it is re-anchored. Three of
//! them exist per session: audio, video and a free-running external one.
//!
//! A clock bound to a unit queue remembers the queue generation it was last
//! set under. Once the queue is flushed its generation moves on and the clock
//! reads NaN until it is set again, so a seek invalidates stale readings
//! without any explicit reset.
//!
//! Clocks carry no lock; the owner serializes access.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Differences larger than this (seconds) are treated as discontinuities,
/// never as drift.
pub const NO_SYNC_THRESHOLD: f64 = 10.0;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed on the process monotonic clock.
pub fn now_seconds() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

// ============================================================================
// Generation Counter
// ============================================================================

/// Shared handle to a queue's generation counter.
///
/// The owning queue bumps it under its own lock; readers only load it.
#[derive(Debug, Clone, Default)]
pub struct GenerationRef(Arc<AtomicI32>);

impl GenerationRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn bump(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug, Clone)]
pub struct Clock {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    generation: i32,
    paused: bool,
    /// None for a free-running clock, which is never stale
    source: Option<GenerationRef>,
}

impl Clock {
    /// Clock whose readings are valid only while `source` is unchanged.
    pub fn new(source: GenerationRef) -> Self {
        Self::with_source(Some(source))
    }

    /// Clock that is never invalidated by a queue flush.
    pub fn free_running() -> Self {
        Self::with_source(None)
    }

    fn with_source(source: Option<GenerationRef>) -> Self {
        let mut clock = Self {
            pts: f64::NAN,
            pts_drift: f64::NAN,
            last_updated: 0.0,
            speed: 1.0,
            generation: -1,
            paused: false,
            source,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    fn is_stale(&self) -> bool {
        match &self.source {
            Some(source) => source.get() != self.generation,
            None => false,
        }
    }

    /// Current reading, NaN when stale or never set.
    pub fn get(&self) -> f64 {
        self.get_at(now_seconds())
    }

    pub fn get_at(&self, now: f64) -> f64 {
        if self.is_stale() {
            return f64::NAN;
        }
        if self.paused {
            self.pts
        } else {
            self.pts_drift + now - (now - self.last_updated) * (1.0 - self.speed)
        }
    }

    pub fn set(&mut self, pts: f64, generation: i32) {
        self.set_at(pts, generation, now_seconds());
    }

    /// Re-anchor at an explicit wall time. The audio callback uses this to
    /// account for samples still sitting in the device buffer.
    pub fn set_at(&mut self, pts: f64, generation: i32, time: f64) {
        self.pts = pts;
        self.last_updated = time;
        self.pts_drift = pts - time;
        self.generation = generation;
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.set_speed_at(speed, now_seconds());
    }

    pub fn set_speed_at(&mut self, speed: f64, now: f64) {
        let current = self.get_at(now);
        self.set_at(current, self.generation, now);
        self.speed = speed;
    }

    /// Adopt `slave`'s reading when ours is unknown or has wandered off by
    /// more than [`NO_SYNC_THRESHOLD`].
    pub fn sync_to_slave(&mut self, slave: &Clock) {
        self.sync_to_slave_at(slave, now_seconds());
    }

    pub fn sync_to_slave_at(&mut self, slave: &Clock, now: f64) {
        let own = self.get_at(now);
        let other = slave.get_at(now);
        if !other.is_nan() && (own.is_nan() || (own - other).abs() > NO_SYNC_THRESHOLD) {
            self.set_at(other, slave.generation, now);
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Last anchored timestamp, ignoring extrapolation.
    pub fn pts(&self) -> f64 {
        self.pts
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn last_updated(&self) -> f64 {
        self.last_updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_reads_nan() {
        let clock = Clock::free_running();
        assert!(clock.get().is_nan());
        assert_eq!(clock.generation(), -1);
        assert_eq!(clock.speed(), 1.0);
    }

    #[test]
    fn test_linear_extrapolation() {
        let mut clock = Clock::free_running();
        clock.set_at(5.0, 0, 100.0);
        assert!((clock.get_at(100.0) - 5.0).abs() < 1e-9);
        assert!((clock.get_at(101.5) - 6.5).abs() < 1e-9);
    }

    #[test]
    fn test_paused_clock_holds_value() {
        let mut clock = Clock::free_running();
        clock.set_at(2.0, 0, 10.0);
        clock.set_paused(true);
        assert_eq!(clock.get_at(50.0), 2.0);
    }

    #[test]
    fn test_stale_generation_reads_nan() {
        let source = GenerationRef::new();
        let mut clock = Clock::new(source.clone());
        clock.set_at(1.0, source.get(), 0.0);
        assert!(!clock.get_at(0.5).is_nan());

        source.bump();
        assert!(clock.get_at(0.5).is_nan());

        // Paused clocks are stale too
        clock.set_paused(true);
        assert!(clock.get_at(0.5).is_nan());

        clock.set_at(3.0, source.get(), 1.0);
        assert_eq!(clock.get_at(1.0), 3.0);
    }

    #[test]
    fn test_set_speed_is_continuous() {
        let mut clock = Clock::free_running();
        clock.set_at(10.0, 0, 0.0);
        let before = clock.get_at(4.0);
        clock.set_speed_at(0.9, 4.0);
        let after = clock.get_at(4.0);
        assert!((before - after).abs() < 1e-9);
        // New slope applies from the anchor onward
        assert!((clock.get_at(14.0) - (after + 9.0)).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to_slave_adopts_when_unknown() {
        let mut external = Clock::free_running();
        let mut audio = Clock::free_running();
        audio.set_at(7.0, 3, 1.0);
        external.sync_to_slave_at(&audio, 1.0);
        assert_eq!(external.get_at(1.0), 7.0);
        assert_eq!(external.generation(), 3);
    }

    #[test]
    fn test_sync_to_slave_ignores_small_drift() {
        let mut external = Clock::free_running();
        let mut audio = Clock::free_running();
        external.set_at(7.5, 0, 1.0);
        audio.set_at(7.0, 0, 1.0);
        external.sync_to_slave_at(&audio, 1.0);
        assert_eq!(external.get_at(1.0), 7.5);

        audio.set_at(30.0, 0, 1.0);
        external.sync_to_slave_at(&audio, 1.0);
        assert_eq!(external.get_at(1.0), 30.0);
    }

    #[test]
    fn test_sync_to_unknown_slave_is_noop() {
        let mut external = Clock::free_running();
        external.set_at(4.0, 0, 0.0);
        let audio = Clock::free_running();
        external.sync_to_slave_at(&audio, 0.0);
        assert_eq!(external.get_at(0.0), 4.0);
    }
}
