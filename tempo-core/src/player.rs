//! # Player - Playback Session
//!
//! Owns every thread of one playback session and exposes the control
//! surface. Control calls only post requests or flip shared flags; the
//! reader, decoders and the refresh loop act on them.
//!
//! ```text
//!              ┌──────────┐    ┌──────────────┐    ┌────────────┐
//!  demuxer ───►│  reader  │───►│ unit queues  │───►│  decoders  │
//!              └──────────┘    └──────────────┘    └─────┬──────┘
//!                   ▲                                    │ frame rings
//!                   │ seek / pause            ┌──────────┴─────────┐
//!              ┌────┴─────┐                   ▼                    ▼
//!  caller ────►│  Player  │──── refresh ──► video/subtitle    audio callback
//!              └──────────┘                   sink               device
//! ```

use crate::audio::{sample_history, AudioBackend, AudioOutput, AudioParams, AudioRenderer, SAMPLE_HISTORY_SIZE};
use crate::config::PlayerConfig;
use crate::decode::{run_audio, run_subtitle, run_video, DecodeError, Decoder, DecoderHandle, StreamDecoder, WorkerContext};
use crate::demux::{DemuxError, Demuxer, SeekRequest, StreamInfo};
use crate::frame::{MediaKind, MICROSECONDS};
use crate::frame_ring::{FrameRing, AUDIO_RING_CAPACITY, SUBTITLE_RING_CAPACITY, VIDEO_RING_CAPACITY};
use crate::present::{PresentationSink, ShowMode};
use crate::scheduler::{ReadControl, ReadScheduler, ReaderStream};
use crate::signal::CancelToken;
use crate::sync::{
    ClockSet, PlaybackShared, PlaybackStats, RefreshStreams, SyncController, MAX_FRAME_DURATION,
    MAX_FRAME_DURATION_DISCONTINUOUS, MAX_VOLUME,
};
use crate::unit_queue::UnitQueue;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Byte rate assumed for byte seeks when the source reports no bit rate
const FALLBACK_BYTE_RATE: f64 = 180_000.0;

/// Opens demuxers and decoders for a source
pub trait MediaBackend {
    fn open_demuxer(&self, source: &str, cancel: &CancelToken) -> Result<Box<dyn Demuxer>, DemuxError>;

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    EndOfFile,
    Error(String),
}

/// Notifications from the session threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The session is over; close the player
    Terminated { reason: TerminationReason },
    /// A decoder failed; other streams keep playing
    StreamClosed { kind: MediaKind, reason: String },
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Demuxer error: {0}")]
    Demux(#[from] DemuxError),
    #[error("Decoder error: {0}")]
    Decode(#[from] DecodeError),
    #[error("No playable audio or video stream in {0}")]
    NoStreams(String),
    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// One opened stream. Dropping it stops its decoder thread.
struct StreamComponent {
    info: StreamInfo,
    queue: Arc<UnitQueue>,
    ring: Arc<FrameRing>,
    decoder: DecoderHandle,
}

impl Drop for StreamComponent {
    fn drop(&mut self) {
        self.decoder.abort(&self.ring);
    }
}

pub struct Player {
    source: String,
    config: Arc<PlayerConfig>,
    shared: Arc<PlaybackShared>,
    controller: SyncController,
    control: Arc<ReadControl>,
    video: Option<StreamComponent>,
    audio: Option<StreamComponent>,
    subtitle: Option<StreamComponent>,
    audio_output: Option<Box<dyn AudioOutput>>,
    reader: Option<JoinHandle<()>>,
    events: Receiver<PlayerEvent>,
    start_time: Option<i64>,
    /// Microseconds
    duration: Option<i64>,
    bit_rate: Option<u64>,
    seek_by_bytes: bool,
    /// Target of the last seek: microseconds, or bytes for byte seeks
    last_seek_target: Option<i64>,
    closed: bool,
}

/// First stream of `kind`, or the configured one.
fn select_stream(streams: &[StreamInfo], config: &PlayerConfig, kind: MediaKind) -> Option<StreamInfo> {
    if config.is_disabled(kind) {
        return None;
    }
    let candidates = || streams.iter().filter(move |s| s.kind == kind);
    let chosen = match config.wanted_stream(kind) {
        Some(index) => candidates().find(|s| s.index == index).or_else(|| {
            tracing::warn!("Stream {} is not a {:?} stream, using the first one", index, kind);
            candidates().next()
        }),
        None => candidates().next(),
    };
    chosen.cloned()
}

impl Player {
    pub fn open(
        source: &str,
        config: PlayerConfig,
        backend: &dyn MediaBackend,
        audio_backend: &dyn AudioBackend,
    ) -> Result<Self, PlayerError> {
        let config = Arc::new(config);
        let control = Arc::new(ReadControl::new());
        let demuxer = backend.open_demuxer(source, control.cancel_token())?;

        let streams = demuxer.streams();
        let mut video_info = select_stream(streams, &config, MediaKind::Video);
        let mut audio_info = select_stream(streams, &config, MediaKind::Audio);
        let subtitle_info = select_stream(streams, &config, MediaKind::Subtitle);

        let mut video_decoder = match &video_info {
            Some(info) => match backend.open_decoder(info) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    tracing::warn!("Could not open video stream {}: {}", info.index, e);
                    video_info = None;
                    None
                }
            },
            None => None,
        };
        let mut audio_decoder = match &audio_info {
            Some(info) => match backend.open_decoder(info) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    tracing::warn!("Could not open audio stream {}: {}", info.index, e);
                    audio_info = None;
                    None
                }
            },
            None => None,
        };
        let audio_params = match &audio_info {
            Some(info) => match audio_backend.negotiate(AudioParams::new(info.sample_rate, info.channels)) {
                Ok(params) => Some(params),
                Err(e) => {
                    tracing::warn!("No audio output, playing without sound: {}", e);
                    audio_info = None;
                    audio_decoder = None;
                    None
                }
            },
            None => None,
        };
        if video_info.is_none() && audio_info.is_none() {
            return Err(PlayerError::NoStreams(source.to_string()));
        }

        let video_queue = Arc::new(UnitQueue::new("video"));
        let audio_queue = Arc::new(UnitQueue::new("audio"));
        let subtitle_queue = Arc::new(UnitQueue::new("subtitle"));

        let clocks = ClockSet::new(
            config.sync,
            audio_queue.generation_ref(),
            video_queue.generation_ref(),
            audio_info.is_some(),
            video_info.is_some(),
        );
        let shared = Arc::new(PlaybackShared::new(clocks, config.volume));
        let (event_tx, events) = crossbeam_channel::unbounded();

        let realtime = demuxer.is_realtime();
        let discontinuous = demuxer.has_timestamp_discontinuities();
        let max_frame_duration = if discontinuous {
            MAX_FRAME_DURATION_DISCONTINUOUS
        } else {
            MAX_FRAME_DURATION
        };
        let seek_by_bytes = config.seek_by_bytes.unwrap_or(discontinuous);
        let start_time = demuxer.start_time();
        let duration = demuxer.duration().filter(|&d| d > 0);
        let bit_rate = demuxer.bit_rate();

        let spawn = Spawner {
            config: &config,
            shared: &shared,
            events: &event_tx,
            control: control.clone(),
        };

        let video = match (video_info, video_decoder.take()) {
            (Some(info), Some(decoder)) => {
                let ring = Arc::new(FrameRing::new(VIDEO_RING_CAPACITY, true, video_queue.clone()));
                Some(spawn.component(info, decoder, video_queue, ring, None, run_video)?)
            }
            _ => None,
        };

        let (history_writer, history) = sample_history(SAMPLE_HISTORY_SIZE);
        let mut audio_output = None;
        let audio = match (audio_info, audio_decoder.take(), audio_params) {
            (Some(info), Some(decoder), Some(params)) => {
                let ring = Arc::new(FrameRing::new(AUDIO_RING_CAPACITY, true, audio_queue.clone()));
                let renderer = AudioRenderer::new(
                    ring.clone(),
                    shared.clone(),
                    history_writer,
                    params,
                    audio_backend.converter(),
                );
                match audio_backend.start(renderer) {
                    Ok(output) => {
                        audio_output = Some(output);
                        let start_pts = realtime.then_some(info.start_time).flatten();
                        let seed = Some((start_pts, info.time_base));
                        Some(spawn.component(info, decoder, audio_queue.clone(), ring, seed, run_audio)?)
                    }
                    Err(e) => {
                        tracing::warn!("Audio output failed to start, playing without sound: {}", e);
                        shared.clocks.lock().disable_audio();
                        None
                    }
                }
            }
            _ => None,
        };
        if video.is_none() && audio.is_none() {
            return Err(PlayerError::NoStreams(source.to_string()));
        }

        let subtitle = match subtitle_info {
            Some(info) => match backend.open_decoder(&info) {
                Ok(decoder) => {
                    let ring = Arc::new(FrameRing::new(SUBTITLE_RING_CAPACITY, false, subtitle_queue.clone()));
                    Some(spawn.component(info, decoder, subtitle_queue, ring, None, run_subtitle)?)
                }
                Err(e) => {
                    tracing::warn!("Could not open subtitle stream {}: {}", info.index, e);
                    None
                }
            },
            None => None,
        };

        let refresh_streams = RefreshStreams {
            video: video.as_ref().map(|c| c.ring.clone()),
            subtitle: subtitle.as_ref().map(|c| c.ring.clone()),
            audio_queue: audio.as_ref().map(|c| c.queue.clone()),
            history: audio.as_ref().map(|_| Arc::new(history)),
        };
        let controller = SyncController::new(
            shared.clone(),
            config.clone(),
            refresh_streams,
            max_frame_duration,
            realtime,
        );

        let reader_streams = [&video, &audio, &subtitle]
            .into_iter()
            .flatten()
            .map(|c| ReaderStream {
                info: c.info.clone(),
                queue: c.queue.clone(),
                ring: c.ring.clone(),
                finished: c.decoder.finished_handle(),
            })
            .collect();
        let reader = ReadScheduler::new(
            demuxer,
            reader_streams,
            shared.clone(),
            config.clone(),
            control.clone(),
            event_tx,
        )
        .spawn()?;

        tracing::info!(
            source,
            video = video.is_some(),
            audio = audio.is_some(),
            subtitles = subtitle.is_some(),
            realtime,
            master = ?shared.clocks.lock().master(),
            "playback session opened"
        );

        Ok(Self {
            source: source.to_string(),
            config,
            shared,
            controller,
            control,
            video,
            audio,
            subtitle,
            audio_output,
            reader: Some(reader),
            events,
            start_time,
            duration,
            bit_rate,
            seek_by_bytes,
            last_seek_target: None,
            closed: false,
        })
    }

    /// Stop every thread. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.control.abort();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!("read thread panicked");
            }
        }
        for component in [&mut self.video, &mut self.audio, &mut self.subtitle].into_iter().flatten() {
            component.decoder.abort(&component.ring);
        }
        if let Some(mut output) = self.audio_output.take() {
            output.stop();
        }
        tracing::info!(source = %self.source, "playback session closed");
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    pub fn toggle_pause(&mut self) {
        self.controller.toggle_pause();
    }

    /// Show exactly one more frame, then pause.
    pub fn step_one_frame(&mut self) {
        self.controller.step_to_next_frame();
    }

    /// Seek by `delta` seconds from the current position. Ignored while
    /// another seek is pending; returns whether the request was posted.
    pub fn seek(&mut self, delta: f64) -> bool {
        let request = if self.seek_by_bytes {
            let shown = |c: &Option<StreamComponent>| c.as_ref().and_then(|c| c.ring.last_shown_position());
            let pos = shown(&self.video)
                .or_else(|| shown(&self.audio))
                .or_else(|| self.control.last_position())
                .unwrap_or(0);
            let byte_rate = self
                .bit_rate
                .filter(|&rate| rate > 0)
                .map_or(FALLBACK_BYTE_RATE, |rate| rate as f64 / 8.0);
            let increment = (delta * byte_rate) as i64;
            SeekRequest::new(pos + increment, increment, true)
        } else {
            let mut pos = self.shared.clocks.lock().master_clock_at(crate::clock::now_seconds());
            if pos.is_nan() {
                pos = self.last_seek_target.map_or(0.0, |t| MICROSECONDS.seconds(t));
            }
            pos += delta;
            if let Some(start) = self.start_time {
                pos = pos.max(MICROSECONDS.seconds(start));
            }
            SeekRequest::new((pos * 1_000_000.0) as i64, (delta * 1_000_000.0) as i64, false)
        };
        self.post_seek(request)
    }

    /// Seek by the configured interval, forward or back.
    pub fn seek_step(&mut self, forward: bool) -> bool {
        let interval = self.config.seek_interval;
        self.seek(if forward { interval } else { -interval })
    }

    /// Seek to `fraction` of the source duration, the way a click on a
    /// progress bar does. Always seeks by time.
    pub fn seek_to_fraction(&mut self, fraction: f64) -> bool {
        let Some(duration) = self.duration else {
            tracing::warn!("Source duration unknown, cannot seek to {:.0}%", fraction * 100.0);
            return false;
        };
        let target = (fraction.clamp(0.0, 1.0) * duration as f64) as i64 + self.start_time.unwrap_or(0);
        let current = self.position();
        let rel = if current.is_nan() {
            0
        } else {
            target - (current * 1_000_000.0) as i64
        };
        self.post_seek(SeekRequest::new(target, rel, false))
    }

    fn post_seek(&mut self, request: SeekRequest) -> bool {
        let posted = self.control.request_seek(request);
        if posted {
            self.last_seek_target = Some(request.target);
            tracing::info!(target = request.target, by_bytes = request.by_bytes, "seek requested");
        }
        posted
    }

    /// Step the volume by `step_db` decibels up (`sign > 0`) or down.
    pub fn update_volume(&mut self, sign: i32, step_db: f64) {
        let volume = self.shared.volume();
        let level = if volume > 0 {
            20.0 * (volume as f64 / MAX_VOLUME as f64).log10()
        } else {
            -1000.0
        };
        let stepped = (MAX_VOLUME as f64 * 10f64.powf((level + sign as f64 * step_db) / 20.0)).round() as i32;
        let next = if stepped == volume { volume + sign } else { stepped };
        self.shared.set_volume(next);
        tracing::debug!(volume = self.shared.volume(), "volume changed");
    }

    pub fn volume_up(&mut self) {
        self.update_volume(1, self.config.volume_step_db);
    }

    pub fn volume_down(&mut self) {
        self.update_volume(-1, self.config.volume_step_db);
    }

    /// Set the volume in percent of the maximum.
    pub fn set_volume(&mut self, percent: u8) {
        self.shared
            .set_volume(MAX_VOLUME * percent.min(100) as i32 / 100);
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.shared.toggle_mute()
    }

    pub fn toggle_alternate_display(&mut self) -> ShowMode {
        self.controller.toggle_alternate_display()
    }

    // ========================================================================
    // Refresh loop
    // ========================================================================

    /// One pass of the display loop. Returns how long the caller may sleep
    /// before the next pass, in seconds.
    pub fn refresh<S: PresentationSink + ?Sized>(&mut self, sink: &mut S) -> f64 {
        let mut remaining = self.config.refresh_rate;
        if self.controller.needs_refresh() {
            self.controller.refresh(sink, &mut remaining);
        }
        remaining.max(0.0)
    }

    /// Next pending session event, if any.
    pub fn poll_event(&self) -> Option<PlayerEvent> {
        self.events.try_recv().ok()
    }

    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.is_muted()
    }

    /// Current volume on the 0..=128 scale
    pub fn volume(&self) -> i32 {
        self.shared.volume()
    }

    pub fn show_mode(&self) -> ShowMode {
        self.controller.show_mode()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn has_subtitles(&self) -> bool {
        self.subtitle.is_some()
    }

    /// Source duration in seconds, when the container knows it
    pub fn duration(&self) -> Option<f64> {
        self.duration.map(|d| MICROSECONDS.seconds(d))
    }

    /// Master clock in seconds, NaN before anything played
    pub fn position(&self) -> f64 {
        self.shared.clocks.lock().master_clock_at(crate::clock::now_seconds())
    }

    pub fn stats(&self) -> PlaybackStats {
        self.controller.stats()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

/// Starts decoder threads with the session's shared state
struct Spawner<'a> {
    config: &'a Arc<PlayerConfig>,
    shared: &'a Arc<PlaybackShared>,
    events: &'a Sender<PlayerEvent>,
    control: Arc<ReadControl>,
}

impl Spawner<'_> {
    fn component(
        &self,
        info: StreamInfo,
        decoder: Box<dyn Decoder>,
        queue: Arc<UnitQueue>,
        ring: Arc<FrameRing>,
        start_pts: Option<(Option<i64>, crate::frame::TimeBase)>,
        worker: fn(StreamDecoder, WorkerContext) -> Result<(), DecodeError>,
    ) -> Result<StreamComponent, PlayerError> {
        let mut stream_decoder = StreamDecoder::new(
            decoder,
            queue.clone(),
            self.control.wakeup(),
            info.time_base,
            self.config.pts_policy,
        );
        if let Some((pts, time_base)) = start_pts {
            stream_decoder = stream_decoder.with_start_pts(pts, time_base);
        }
        let ctx = WorkerContext {
            ring: ring.clone(),
            shared: self.shared.clone(),
            stream: info.clone(),
            frame_drop: self.config.frame_drop,
        };
        tracing::debug!(stream = info.index, kind = ?info.kind, codec = %info.codec, "opening stream");
        let handle = DecoderHandle::start(
            info.kind,
            queue.clone(),
            stream_decoder.finished_handle(),
            self.events.clone(),
            move || worker(stream_decoder, ctx),
        )?;
        Ok(StreamComponent {
            info,
            queue,
            ring,
            decoder: handle,
        })
    }
}
