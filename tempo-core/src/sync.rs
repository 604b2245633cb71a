//! # Audio/Video Synchronization
//!
//! Picks the master clock, corrects audio sample counts against it, and
//! paces video frames. The refresh loop runs cooperatively on the caller's
//! thread: it never blocks, it only shortens the sleep hint it is given.
//!
//! ```text
//!            ┌───────────────┐ peek/next ┌────────────┐
//!  refresh ─►│ SyncController │──────────►│ video ring │
//!            └──────┬────────┘           └────────────┘
//!                   │ lock
//!            ┌──────▼──────┐   set_at   ┌────────────────┐
//!            │  ClockSet   │◄───────────│ audio callback │
//!            └─────────────┘            └────────────────┘
//! ```

use crate::audio::{SampleHistory, VISUALIZATION_WINDOW};
use crate::clock::{Clock, GenerationRef, NO_SYNC_THRESHOLD};
use crate::config::PlayerConfig;
use crate::frame::DecodedFrame;
use crate::frame_ring::FrameRing;
use crate::present::{PresentationSink, ShowMode};
use crate::unit_queue::UnitQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

/// No A-V correction below this delay threshold (seconds)
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// A-V correction always applies above this threshold (seconds)
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are not duplicated to catch up (seconds)
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Window of the audio difference average
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// Maximum audio speed change, in percent, to get correct sync
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// Default refresh period handed to the refresh loop (seconds)
pub const REFRESH_RATE: f64 = 0.01;

/// Status lines are emitted at most this often (seconds)
const STATUS_INTERVAL: f64 = 0.03;

/// Longest plausible frame for formats whose timestamps may jump
pub const MAX_FRAME_DURATION_DISCONTINUOUS: f64 = 10.0;
pub const MAX_FRAME_DURATION: f64 = 3600.0;

// ============================================================================
// Clock Selection
// ============================================================================

/// Clock the other streams are paced against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMaster {
    Audio,
    Video,
    External,
}

impl Default for SyncMaster {
    fn default() -> Self {
        Self::Video
    }
}

/// When the video path may skip frames to catch up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDropPolicy {
    /// Drop only while video is not the master clock
    Auto,
    Always,
    Never,
}

impl Default for FrameDropPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

impl FrameDropPolicy {
    pub fn allows(&self, master: SyncMaster) -> bool {
        match self {
            Self::Auto => master != SyncMaster::Video,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// The three session clocks. Guarded as a unit by [`PlaybackShared::clocks`].
#[derive(Debug, Clone)]
pub struct ClockSet {
    pub audio: Clock,
    pub video: Clock,
    pub external: Clock,
    preference: SyncMaster,
    has_audio: bool,
    has_video: bool,
}

impl ClockSet {
    pub fn new(
        preference: SyncMaster,
        audio_source: GenerationRef,
        video_source: GenerationRef,
        has_audio: bool,
        has_video: bool,
    ) -> Self {
        Self {
            audio: Clock::new(audio_source),
            video: Clock::new(video_source),
            external: Clock::free_running(),
            preference,
            has_audio,
            has_video,
        }
    }

    pub fn preference(&self) -> SyncMaster {
        self.preference
    }

    /// Preferred clock, falling back to whichever stream exists.
    pub fn master(&self) -> SyncMaster {
        match self.preference {
            SyncMaster::Video if self.has_video => SyncMaster::Video,
            SyncMaster::Video if self.has_audio => SyncMaster::Audio,
            SyncMaster::Audio if self.has_audio => SyncMaster::Audio,
            SyncMaster::Audio if self.has_video => SyncMaster::Video,
            _ => SyncMaster::External,
        }
    }

    pub fn clock(&self, kind: SyncMaster) -> &Clock {
        match kind {
            SyncMaster::Audio => &self.audio,
            SyncMaster::Video => &self.video,
            SyncMaster::External => &self.external,
        }
    }

    pub fn master_clock_at(&self, now: f64) -> f64 {
        self.clock(self.master()).get_at(now)
    }

    /// The audio stream never started: pick masters as if it did not exist.
    pub fn disable_audio(&mut self) {
        self.has_audio = false;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
    }
}

// ============================================================================
// Shared Playback State
// ============================================================================

/// Highest volume level
pub const MAX_VOLUME: i32 = 128;

/// State touched from more than one thread
pub struct PlaybackShared {
    pub clocks: Mutex<ClockSet>,
    paused: AtomicBool,
    step_requested: AtomicBool,
    read_pause_unsupported: AtomicBool,
    volume: AtomicI32,
    muted: AtomicBool,
    show_mode: AtomicU8,
    frame_drops_early: AtomicU64,
    frame_drops_late: AtomicU64,
    frames_presented: AtomicU64,
    frame_steps: AtomicU64,
}

impl PlaybackShared {
    pub fn new(clocks: ClockSet, volume_percent: u8) -> Self {
        let volume = (MAX_VOLUME * volume_percent.min(100) as i32) / 100;
        Self {
            clocks: Mutex::new(clocks),
            paused: AtomicBool::new(false),
            step_requested: AtomicBool::new(false),
            read_pause_unsupported: AtomicBool::new(false),
            volume: AtomicI32::new(volume),
            muted: AtomicBool::new(false),
            show_mode: AtomicU8::new(ShowMode::Video as u8),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            frames_presented: AtomicU64::new(0),
            frame_steps: AtomicU64::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Ask the refresh loop to show one frame; used after a seek while paused.
    pub fn request_step(&self) {
        self.step_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_step_request(&self) -> bool {
        self.step_requested.swap(false, Ordering::SeqCst)
    }

    pub fn has_step_request(&self) -> bool {
        self.step_requested.load(Ordering::SeqCst)
    }

    pub fn set_read_pause_unsupported(&self, unsupported: bool) {
        self.read_pause_unsupported.store(unsupported, Ordering::SeqCst);
    }

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: i32) {
        self.volume.store(volume.clamp(0, MAX_VOLUME), Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn show_mode(&self) -> ShowMode {
        ShowMode::from_u8(self.show_mode.load(Ordering::SeqCst))
    }

    pub(crate) fn set_show_mode(&self, mode: ShowMode) {
        self.show_mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn count_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_drops_early(&self) -> u64 {
        self.frame_drops_early.load(Ordering::Relaxed)
    }

    pub fn frame_drops_late(&self) -> u64 {
        self.frame_drops_late.load(Ordering::Relaxed)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }

    pub fn frame_steps(&self) -> u64 {
        self.frame_steps.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Audio Drift Correction
// ============================================================================

/// Running average of the audio-master difference, turned into a sample
/// count correction for the resampler.
#[derive(Debug, Clone)]
pub struct AudioDriftCorrector {
    cumulative: f64,
    coefficient: f64,
    threshold: f64,
    count: u32,
}

impl AudioDriftCorrector {
    /// `threshold` is the duration of one hardware buffer in seconds.
    pub fn new(threshold: f64) -> Self {
        Self {
            cumulative: 0.0,
            coefficient: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            threshold,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cumulative = 0.0;
        self.count = 0;
    }

    /// Samples to request for a frame of `nb_samples`, given
    /// `diff = audio clock - master clock`. A non-finite diff restarts the
    /// average and leaves the count unchanged.
    pub fn wanted_samples(&mut self, diff: f64, nb_samples: usize, sample_rate: u32) -> usize {
        if !diff.is_finite() {
            // Clock discontinuity: earlier measurements no longer apply
            self.reset();
            return nb_samples;
        }
        if diff.abs() >= NO_SYNC_THRESHOLD {
            // Too big to be drift: probably an initial pts error
            self.reset();
            return nb_samples;
        }

        self.cumulative = diff + self.coefficient * self.cumulative;
        if self.count < AUDIO_DIFF_AVG_NB {
            self.count += 1;
        }
        if self.count < AUDIO_DIFF_AVG_NB {
            return nb_samples;
        }

        let avg_diff = self.cumulative * (1.0 - self.coefficient);
        if avg_diff.abs() < self.threshold {
            return nb_samples;
        }

        let wanted = nb_samples as i64 + (diff * sample_rate as f64) as i64;
        let min = (nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let max = (nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let wanted = wanted.clamp(min, max) as usize;
        tracing::trace!(diff, avg_diff, wanted, nb_samples, "audio drift correction");
        wanted
    }
}

// ============================================================================
// Frame Pacing
// ============================================================================

/// Delay before showing the next frame, given its nominal `delay` and
/// `diff = video clock - master clock`.
pub fn compute_target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let sync_threshold = delay.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Display time between two consecutive frames.
pub fn frame_duration(current: &DecodedFrame, next: &DecodedFrame, max_frame_duration: f64) -> f64 {
    if current.generation != next.generation {
        return 0.0;
    }
    let duration = next.pts - current.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        current.duration
    } else {
        duration
    }
}

/// Next external clock speed for a realtime source, from the number of
/// units buffered for each driving stream (None when the stream is absent).
pub fn external_clock_speed(speed: f64, video_units: Option<usize>, audio_units: Option<usize>) -> f64 {
    let starving = |units: Option<usize>| units.map_or(false, |n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let plenty = |units: Option<usize>| units.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

    if starving(video_units) || starving(audio_units) {
        EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP)
    } else if plenty(video_units) && plenty(audio_units) {
        EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP)
    } else if speed != 1.0 {
        let toward_one = (1.0 - speed) / (1.0 - speed).abs();
        speed + EXTERNAL_CLOCK_SPEED_STEP * toward_one
    } else {
        speed
    }
}

// ============================================================================
// Sync Controller
// ============================================================================

/// Streams the refresh loop reads from
#[derive(Default, Clone)]
pub struct RefreshStreams {
    pub video: Option<Arc<FrameRing>>,
    pub subtitle: Option<Arc<FrameRing>>,
    pub audio_queue: Option<Arc<UnitQueue>>,
    pub history: Option<Arc<SampleHistory>>,
}

/// Snapshot for status display
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStats {
    pub master_clock: f64,
    pub av_diff: f64,
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub frames_presented: u64,
    pub frame_steps: u64,
    pub audio_queue_bytes: usize,
    pub video_queue_bytes: usize,
    pub subtitle_queue_bytes: usize,
}

enum RefreshState {
    /// Looking for the next frame to schedule
    Idle,
    /// A current frame exists and is compared against the frame timer
    HaveFrame {
        last: Arc<DecodedFrame>,
        current: Arc<DecodedFrame>,
    },
    /// The current frame is due
    Advance { current: Arc<DecodedFrame> },
    /// Present whatever is shown, then return to the caller
    Display,
}

pub struct SyncController {
    shared: Arc<PlaybackShared>,
    config: Arc<PlayerConfig>,
    streams: RefreshStreams,
    frame_timer: f64,
    max_frame_duration: f64,
    realtime: bool,
    force_refresh: bool,
    step: bool,
    show_mode: ShowMode,
    last_display_time: f64,
    last_status_time: f64,
}

impl SyncController {
    pub fn new(
        shared: Arc<PlaybackShared>,
        config: Arc<PlayerConfig>,
        streams: RefreshStreams,
        max_frame_duration: f64,
        realtime: bool,
    ) -> Self {
        let has_video = streams.video.is_some();
        let has_audio = streams.history.is_some();
        let show_mode = match config.show_mode {
            Some(mode) if mode.is_visualization() && has_audio => mode,
            _ if has_video => ShowMode::Video,
            _ if has_audio => ShowMode::Waves,
            _ => ShowMode::None,
        };
        shared.set_show_mode(show_mode);
        Self {
            shared,
            config,
            streams,
            frame_timer: 0.0,
            max_frame_duration,
            realtime,
            force_refresh: false,
            step: false,
            show_mode,
            last_display_time: 0.0,
            last_status_time: 0.0,
        }
    }

    pub fn shared(&self) -> &Arc<PlaybackShared> {
        &self.shared
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn show_mode(&self) -> ShowMode {
        self.show_mode
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh
    }

    pub fn frame_timer(&self) -> f64 {
        self.frame_timer
    }

    /// Whether the caller should run a refresh this cycle.
    pub fn needs_refresh(&self) -> bool {
        self.show_mode != ShowMode::None
            && (!self.is_paused() || self.force_refresh || self.shared.has_step_request())
    }

    // ========================================================================
    // Pause and step
    // ========================================================================

    fn toggle_stream_pause(&mut self, now: f64) {
        let paused = self.is_paused();
        let mut clocks = self.shared.clocks.lock();
        if paused {
            self.frame_timer += now - clocks.video.last_updated();
            if !self.shared.read_pause_unsupported.load(Ordering::SeqCst) {
                clocks.video.set_paused(false);
            }
            let (pts, generation) = (clocks.video.get_at(now), clocks.video.generation());
            clocks.video.set_at(pts, generation, now);
        }
        let (pts, generation) = (clocks.external.get_at(now), clocks.external.generation());
        clocks.external.set_at(pts, generation, now);

        self.shared.set_paused(!paused);
        clocks.set_paused(!paused);
    }

    pub fn toggle_pause(&mut self) {
        self.toggle_pause_at(crate::clock::now_seconds());
    }

    pub fn toggle_pause_at(&mut self, now: f64) {
        self.toggle_stream_pause(now);
        self.step = false;
        tracing::info!(paused = self.is_paused(), "playback pause toggled");
    }

    /// Unpause just long enough to show the next frame.
    pub fn step_to_next_frame(&mut self) {
        self.step_to_next_frame_at(crate::clock::now_seconds());
    }

    pub fn step_to_next_frame_at(&mut self, now: f64) {
        if self.is_paused() {
            self.toggle_stream_pause(now);
        }
        self.step = true;
        self.shared.frame_steps.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Alternate display
    // ========================================================================

    /// Cycle through the display modes that have something to draw.
    pub fn toggle_alternate_display(&mut self) -> ShowMode {
        let has_video = self.streams.video.is_some();
        let has_audio = self.streams.history.is_some();
        let mut mode = self.show_mode;
        for _ in 0..3 {
            mode = mode.next();
            let available = match mode {
                ShowMode::Video => has_video,
                ShowMode::Waves | ShowMode::Rdft => has_audio,
                ShowMode::None => false,
            };
            if available {
                break;
            }
        }
        if mode != self.show_mode && mode != ShowMode::None {
            tracing::debug!(from = ?self.show_mode, to = ?mode, "display mode changed");
            self.show_mode = mode;
            self.shared.set_show_mode(mode);
            self.force_refresh = true;
        }
        self.show_mode
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// `diff = video clock - master clock`, or NaN while video is master.
    fn target_delay(&self, delay: f64, now: f64) -> f64 {
        let clocks = self.shared.clocks.lock();
        let diff = if clocks.master() == SyncMaster::Video {
            f64::NAN
        } else {
            clocks.video.get_at(now) - clocks.master_clock_at(now)
        };
        let target = compute_target_delay(delay, diff, self.max_frame_duration);
        tracing::trace!(delay, target, diff, "video target delay");
        target
    }

    pub fn refresh<S: PresentationSink + ?Sized>(&mut self, sink: &mut S, remaining: &mut f64) {
        self.refresh_at(crate::clock::now_seconds(), sink, remaining);
    }

    /// One pass of the display loop at wall time `now`. `remaining` is the
    /// caller's sleep hint and is only ever shortened.
    pub fn refresh_at<S: PresentationSink + ?Sized>(&mut self, now: f64, sink: &mut S, remaining: &mut f64) {
        if self.shared.take_step_request() {
            self.step_to_next_frame_at(now);
        }

        if !self.is_paused() && self.realtime {
            self.govern_external_clock(now);
        }

        if self.show_mode.is_visualization() {
            if let Some(history) = self.streams.history.clone() {
                let interval = self.config.visualization_interval;
                if self.force_refresh || self.last_display_time + interval < now {
                    let samples = history.snapshot(VISUALIZATION_WINDOW);
                    if let Err(e) = sink.present_visualization(self.show_mode, &samples) {
                        tracing::warn!("Visualization present failed: {}", e);
                    }
                    self.last_display_time = now;
                }
                *remaining = remaining.min(self.last_display_time + interval - now);
            }
        }

        if let Some(video) = self.streams.video.clone() {
            let mut state = RefreshState::Idle;
            loop {
                state = match state {
                    RefreshState::Idle => self.select_frame(&video, now),
                    RefreshState::HaveFrame { last, current } => {
                        self.schedule_frame(&video, last, current, now, remaining)
                    }
                    RefreshState::Advance { current } => self.advance_frame(&video, current, now),
                    RefreshState::Display => break,
                };
            }
            self.display(&video, sink);
        }
        self.force_refresh = false;

        if self.config.show_status && now - self.last_status_time >= STATUS_INTERVAL {
            self.log_status(now);
            self.last_status_time = now;
        }
    }

    fn select_frame(&mut self, video: &FrameRing, now: f64) -> RefreshState {
        if video.remaining() == 0 {
            return RefreshState::Display;
        }
        let (Some(last), Some(current)) = (video.peek_last(), video.peek()) else {
            return RefreshState::Display;
        };

        if current.generation != video.queue().generation() {
            video.next();
            return RefreshState::Idle;
        }
        if last.generation != current.generation {
            self.frame_timer = now;
        }
        if self.is_paused() {
            return RefreshState::Display;
        }
        RefreshState::HaveFrame { last, current }
    }

    fn schedule_frame(
        &mut self,
        video: &FrameRing,
        last: Arc<DecodedFrame>,
        current: Arc<DecodedFrame>,
        now: f64,
        remaining: &mut f64,
    ) -> RefreshState {
        let duration = frame_duration(&last, &current, self.max_frame_duration);
        let delay = self.target_delay(duration, now);

        if now < self.frame_timer + delay {
            *remaining = remaining.min(self.frame_timer + delay - now);
            return RefreshState::Display;
        }

        self.frame_timer += delay;
        if delay > 0.0 && now - self.frame_timer > SYNC_THRESHOLD_MAX {
            self.frame_timer = now;
        }

        {
            let _ring = video.lock();
            if !current.pts.is_nan() {
                let mut clocks = self.shared.clocks.lock();
                clocks.video.set_at(current.pts, current.generation, now);
                let video_clock = clocks.video.clone();
                clocks.external.sync_to_slave_at(&video_clock, now);
            }
        }
        RefreshState::Advance { current }
    }

    fn advance_frame(&mut self, video: &FrameRing, current: Arc<DecodedFrame>, now: f64) -> RefreshState {
        if video.remaining() > 1 {
            if let Some(next) = video.peek_next() {
                let duration = frame_duration(&current, &next, self.max_frame_duration);
                let master = self.shared.clocks.lock().master();
                if !self.step && self.config.frame_drop.allows(master) && now > self.frame_timer + duration {
                    self.shared.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pts = current.pts, "dropping late frame");
                    video.next();
                    return RefreshState::Idle;
                }
            }
        }

        self.retire_subtitles();

        video.next();
        self.force_refresh = true;

        if self.step && !self.is_paused() {
            self.toggle_stream_pause(now);
        }
        RefreshState::Display
    }

    fn retire_subtitles(&self) {
        let Some(subtitles) = &self.streams.subtitle else {
            return;
        };
        let video_pts = self.shared.clocks.lock().video.pts();
        while subtitles.remaining() > 0 {
            let Some(current) = subtitles.peek() else {
                break;
            };
            let next = subtitles.peek_next();
            let end = current
                .subtitle()
                .map_or(current.pts, |s| current.pts + s.end_display_ms as f64 / 1000.0);
            let next_started = next.as_ref().map_or(false, |n| {
                let start = n.subtitle().map_or(0.0, |s| s.start_display_ms as f64 / 1000.0);
                video_pts > n.pts + start
            });

            if current.generation != subtitles.queue().generation() || video_pts > end || next_started {
                subtitles.next();
            } else {
                break;
            }
        }
    }

    fn display<S: PresentationSink + ?Sized>(&mut self, video: &FrameRing, sink: &mut S) {
        if !self.force_refresh || self.show_mode != ShowMode::Video || !video.is_last_shown() {
            return;
        }
        let Some(frame) = video.peek_last() else {
            return;
        };

        let subtitle = self.streams.subtitle.as_ref().and_then(|ring| ring.peek()).filter(|sp| {
            let start = sp.subtitle().map_or(0.0, |s| s.start_display_ms as f64 / 1000.0);
            frame.pts >= sp.pts + start
        });

        match sink.present_picture(&frame, subtitle.as_deref()) {
            Ok(()) => {
                frame.mark_uploaded();
                if let Some(sp) = &subtitle {
                    sp.mark_uploaded();
                }
                self.shared.frames_presented.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!("Present failed: {}", e),
        }
    }

    fn govern_external_clock(&mut self, now: f64) {
        let mut clocks = self.shared.clocks.lock();
        if clocks.master() != SyncMaster::External {
            return;
        }
        let video_units = self.streams.video.as_ref().map(|ring| ring.queue().len());
        let audio_units = self.streams.audio_queue.as_ref().map(|queue| queue.len());
        let speed = external_clock_speed(clocks.external.speed(), video_units, audio_units);
        if speed != clocks.external.speed() {
            clocks.external.set_speed_at(speed, now);
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> PlaybackStats {
        self.stats_at(crate::clock::now_seconds())
    }

    pub fn stats_at(&self, now: f64) -> PlaybackStats {
        let (master_clock, av_diff) = {
            let clocks = self.shared.clocks.lock();
            let diff = match (self.streams.history.is_some(), self.streams.video.is_some()) {
                (true, true) => clocks.audio.get_at(now) - clocks.video.get_at(now),
                (false, true) => clocks.master_clock_at(now) - clocks.video.get_at(now),
                (true, false) => clocks.master_clock_at(now) - clocks.audio.get_at(now),
                (false, false) => 0.0,
            };
            (clocks.master_clock_at(now), diff)
        };
        let bytes = |queue: Option<&Arc<UnitQueue>>| queue.map_or(0, |q| q.size_bytes());
        PlaybackStats {
            master_clock,
            av_diff,
            frame_drops_early: self.shared.frame_drops_early(),
            frame_drops_late: self.shared.frame_drops_late(),
            frames_presented: self.shared.frames_presented(),
            frame_steps: self.shared.frame_steps(),
            audio_queue_bytes: bytes(self.streams.audio_queue.as_ref()),
            video_queue_bytes: bytes(self.streams.video.as_ref().map(|r| r.queue())),
            subtitle_queue_bytes: bytes(self.streams.subtitle.as_ref().map(|r| r.queue())),
        }
    }

    fn log_status(&self, now: f64) {
        let stats = self.stats_at(now);
        tracing::info!(
            target: "tempo::status",
            "{:7.2} A-V:{:7.3} fd={:4}/{:4} aq={:5}KB vq={:5}KB sq={:5}B",
            stats.master_clock,
            stats.av_diff,
            stats.frame_drops_early,
            stats.frame_drops_late,
            stats.audio_queue_bytes / 1024,
            stats.video_queue_bytes / 1024,
            stats.subtitle_queue_bytes,
        );
    }
}
