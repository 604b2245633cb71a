//! # Audio Output
//!
//! The output device pulls samples on its own thread through
//! [`AudioRenderer::fill`]. The renderer never blocks: when nothing is ready
//! it writes silence. Each callback re-anchors the audio clock, accounting
//! for what is still buffered in the device.
//!
//! ```text
//!  audio ring ──► drift correction ──► SampleConverter ──► volume ──► device
//!                      ▲                                       │
//!                      └──────────── audio clock ◄─────────────┘
//! ```

use crate::clock::now_seconds;
use crate::frame::AudioSamples;
use crate::frame_ring::FrameRing;
use crate::present::ShowMode;
use crate::signal::CancelToken;
use crate::sync::{AudioDriftCorrector, PlaybackShared, SyncMaster, MAX_VOLUME, SAMPLE_CORRECTION_PERCENT_MAX};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Smallest device buffer, in frames
pub const AUDIO_MIN_BUFFER_SIZE: usize = 512;
/// Device callbacks per second the buffer size aims for
pub const AUDIO_MAX_CALLBACKS_PER_SEC: u32 = 30;
/// Samples kept for waveform and spectrum display
pub const SAMPLE_HISTORY_SIZE: usize = 8 * 65536;
/// Newest samples handed to the visualizer on each display refresh
pub const VISUALIZATION_WINDOW: usize = 8192;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoDevice,
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Sample conversion failed: {0}")]
    Conversion(String),
    #[error("Failed to spawn audio thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Device buffer size for `sample_rate`: a power of two close to one
/// callback's worth of audio, at least [`AUDIO_MIN_BUFFER_SIZE`].
pub fn hw_buffer_frames(sample_rate: u32) -> usize {
    let per_callback = sample_rate / AUDIO_MAX_CALLBACKS_PER_SEC;
    let log2 = if per_callback == 0 { 0 } else { 31 - per_callback.leading_zeros() };
    AUDIO_MIN_BUFFER_SIZE.max(2usize << log2)
}

/// Negotiated output format. Samples are always interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Device buffer in frames
    pub buffer_frames: usize,
}

impl AudioParams {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            buffer_frames: hw_buffer_frames(sample_rate),
        }
    }

    /// Duration of one device buffer in seconds
    pub fn buffer_duration(&self) -> f64 {
        self.buffer_frames as f64 / self.sample_rate.max(1) as f64
    }
}

// ============================================================================
// Sample History
// ============================================================================

/// Create the history ring: the writer goes to the output callback, the
/// reader to the display loop.
pub fn sample_history(capacity: usize) -> (HistoryWriter, SampleHistory) {
    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
    let reader = HistoryReader {
        consumer,
        recent: VecDeque::new(),
    };
    (HistoryWriter { producer }, SampleHistory { reader: Mutex::new(reader) })
}

/// Output-callback end of the history ring. Never blocks: when the display
/// falls behind, new samples are dropped until it catches up.
pub struct HistoryWriter {
    producer: HeapProd<f32>,
}

impl HistoryWriter {
    pub fn push(&mut self, samples: &[f32]) {
        self.producer.push_slice(samples);
    }
}

/// Display end of the history ring. The lock is only ever taken by readers.
pub struct SampleHistory {
    reader: Mutex<HistoryReader>,
}

struct HistoryReader {
    consumer: HeapCons<f32>,
    recent: VecDeque<f32>,
}

impl SampleHistory {
    /// The newest `window` samples, oldest first. Older samples still in
    /// the ring are skipped without being copied.
    pub fn snapshot(&self, window: usize) -> Vec<f32> {
        let mut reader = self.reader.lock();
        let HistoryReader { consumer, recent } = &mut *reader;

        let fresh = consumer.occupied_len();
        if fresh >= window {
            consumer.skip(fresh - window);
            recent.clear();
        }
        recent.extend(consumer.pop_iter());
        let excess = recent.len().saturating_sub(window);
        recent.drain(..excess);
        recent.iter().copied().collect()
    }

    /// Samples written but not yet read
    pub fn pending(&self) -> usize {
        self.reader.lock().consumer.occupied_len()
    }
}

// ============================================================================
// Sample Conversion
// ============================================================================

pub trait SampleConverter: Send {
    /// Convert a decoded block to the output format. `wanted_frames` is the
    /// drift-corrected length in source frames; the block is stretched or
    /// shrunk to match. May return fewer samples than asked for, or none,
    /// while the converter fills its own buffers.
    fn convert(&mut self, samples: &AudioSamples, wanted_frames: usize, target: &AudioParams)
        -> Result<Vec<f32>, AudioError>;

    /// Seconds of input held inside the converter
    fn delay(&self) -> f64 {
        0.0
    }

    /// Drop buffered input after a discontinuity.
    fn reset(&mut self) {}
}

/// Frames per resampler call
const RESAMPLER_CHUNK_FRAMES: usize = 256;
const RESAMPLER_SINC_LEN: usize = 64;
/// Headroom for drift correction around the nominal ratio
const RESAMPLER_MAX_RELATIVE_RATIO: f64 = 1.2;

/// Band-limited sample rate conversion with channel remapping.
///
/// Blocks that already match the output format pass straight through.
/// The sinc resampler is engaged the first time the rate differs or a
/// drift correction asks for a different length, and then stays engaged so
/// that its filter state carries across blocks. Corrections nudge the
/// resampling ratio instead of dropping or repeating samples.
#[derive(Default)]
pub struct SincConverter {
    /// (source rate, source channels, output rate, output channels)
    layout: Option<(u32, u16, u32, u16)>,
    engaged: bool,
    resampler: Option<SincFixedIn<f32>>,
    /// Remapped input waiting for a full chunk, one vector per output channel
    pending: Vec<Vec<f32>>,
}

impl SincConverter {
    fn build(source_rate: u32, target: &AudioParams) -> Result<SincFixedIn<f32>, AudioError> {
        let params = SincInterpolationParameters {
            sinc_len: RESAMPLER_SINC_LEN,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = target.sample_rate as f64 / source_rate as f64;
        tracing::debug!(source_rate, target_rate = target.sample_rate, "resampler engaged");
        SincFixedIn::<f32>::new(
            ratio,
            RESAMPLER_MAX_RELATIVE_RATIO,
            params,
            RESAMPLER_CHUNK_FRAMES,
            target.channels as usize,
        )
        .map_err(|e| AudioError::Conversion(format!("Resampler init failed: {}", e)))
    }

    /// Interleaved copy with output channel `c` taken from source channel
    /// `c % source channels`.
    fn remap(samples: &AudioSamples, dst_channels: usize) -> Vec<f32> {
        let src_channels = samples.channels as usize;
        if src_channels == dst_channels {
            return samples.data.clone();
        }
        let mut out = Vec::with_capacity(samples.frames() * dst_channels);
        for frame in samples.data.chunks_exact(src_channels) {
            out.extend((0..dst_channels).map(|c| frame[c % src_channels]));
        }
        out
    }
}

impl SampleConverter for SincConverter {
    fn convert(
        &mut self,
        samples: &AudioSamples,
        wanted_frames: usize,
        target: &AudioParams,
    ) -> Result<Vec<f32>, AudioError> {
        let src_channels = samples.channels as usize;
        let dst_channels = target.channels as usize;
        if src_channels == 0 || dst_channels == 0 || samples.sample_rate == 0 || target.sample_rate == 0 {
            return Err(AudioError::Conversion(format!(
                "{} channels at {} Hz to {} channels at {} Hz",
                src_channels, samples.sample_rate, dst_channels, target.sample_rate
            )));
        }
        let src_frames = samples.frames();
        if src_frames == 0 || wanted_frames == 0 {
            return Ok(Vec::new());
        }

        let layout = (samples.sample_rate, samples.channels, target.sample_rate, target.channels);
        if self.layout != Some(layout) {
            self.layout = Some(layout);
            self.engaged = false;
            self.resampler = None;
            self.pending.clear();
        }
        if !self.engaged && samples.sample_rate == target.sample_rate && wanted_frames == src_frames {
            return Ok(Self::remap(samples, dst_channels));
        }
        self.engaged = true;

        if self.resampler.is_none() {
            self.resampler = Some(Self::build(samples.sample_rate, target)?);
            self.pending = vec![Vec::new(); dst_channels];
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        let max_adjust = SAMPLE_CORRECTION_PERCENT_MAX as f64 / 100.0;
        let relative = (wanted_frames as f64 / src_frames as f64).clamp(1.0 - max_adjust, 1.0 + max_adjust);
        resampler
            .set_resample_ratio_relative(relative, true)
            .map_err(|e| AudioError::Conversion(format!("Drift correction rejected: {}", e)))?;

        for frame in samples.data.chunks_exact(src_channels) {
            for (c, channel) in self.pending.iter_mut().enumerate() {
                channel.push(frame[c % src_channels]);
            }
        }

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.first().map_or(0, Vec::len) < needed {
                break;
            }
            let chunk: Vec<&[f32]> = self.pending.iter().map(|c| &c[..needed]).collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|e| AudioError::Conversion(format!("Resampling failed: {}", e)))?;
            let frames = resampled.first().map_or(0, Vec::len);
            out.reserve(frames * dst_channels);
            for i in 0..frames {
                out.extend(resampled.iter().map(|channel| channel[i]));
            }
            for channel in &mut self.pending {
                channel.drain(..needed);
            }
        }
        Ok(out)
    }

    fn delay(&self) -> f64 {
        match (self.layout, self.resampler.is_some()) {
            (Some((source_rate, ..)), true) => {
                let buffered = self.pending.first().map_or(0, Vec::len) + RESAMPLER_SINC_LEN / 2;
                buffered as f64 / source_rate.max(1) as f64
            }
            _ => 0.0,
        }
    }

    fn reset(&mut self) {
        // Rebuilt on the next block with fresh filter state
        self.resampler = None;
        self.pending.clear();
    }
}

// ============================================================================
// Renderer
// ============================================================================

pub struct AudioRenderer {
    ring: Arc<FrameRing>,
    shared: Arc<PlaybackShared>,
    history: HistoryWriter,
    params: AudioParams,
    converter: Box<dyn SampleConverter>,
    drift: AudioDriftCorrector,
    buffer: Vec<f32>,
    buffer_index: usize,
    /// Time at the end of the last decoded block
    audio_clock: f64,
    audio_clock_generation: i32,
}

impl AudioRenderer {
    pub fn new(
        ring: Arc<FrameRing>,
        shared: Arc<PlaybackShared>,
        history: HistoryWriter,
        params: AudioParams,
        converter: Box<dyn SampleConverter>,
    ) -> Self {
        Self {
            ring,
            shared,
            history,
            params,
            converter,
            drift: AudioDriftCorrector::new(params.buffer_duration()),
            buffer: Vec::new(),
            buffer_index: 0,
            audio_clock: f64::NAN,
            audio_clock_generation: -1,
        }
    }

    pub fn params(&self) -> &AudioParams {
        &self.params
    }

    /// Device callback: fill `out` with interleaved samples.
    pub fn fill(&mut self, out: &mut [f32]) {
        self.fill_at(now_seconds(), out);
    }

    pub fn fill_at(&mut self, callback_time: f64, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.buffer_index >= self.buffer.len() && !self.decode_next(callback_time) {
                out[written..].fill(0.0);
                break;
            }
            let available = &self.buffer[self.buffer_index..];
            let count = available.len().min(out.len() - written);
            self.mix(&mut out[written..written + count], self.buffer_index);
            written += count;
            self.buffer_index += count;
        }

        if self.audio_clock.is_nan() {
            return;
        }
        let channels = self.params.channels.max(1) as usize;
        let pending = (self.buffer.len() - self.buffer_index) / channels;
        let latency = (2 * self.params.buffer_frames + pending) as f64 / self.params.sample_rate.max(1) as f64
            + self.converter.delay();

        let mut clocks = self.shared.clocks.lock();
        clocks
            .audio
            .set_at(self.audio_clock - latency, self.audio_clock_generation, callback_time);
        let audio = clocks.audio.clone();
        clocks.external.sync_to_slave_at(&audio, callback_time);
    }

    fn mix(&self, out: &mut [f32], from: usize) {
        let source = &self.buffer[from..from + out.len()];
        let volume = self.shared.volume();
        if self.shared.is_muted() || volume == 0 {
            out.fill(0.0);
        } else if volume == MAX_VOLUME {
            out.copy_from_slice(source);
        } else {
            let gain = volume as f32 / MAX_VOLUME as f32;
            for (o, s) in out.iter_mut().zip(source) {
                *o = s * gain;
            }
        }
    }

    /// Take current-generation blocks from the ring until one converts to
    /// something playable. False when paused or nothing is ready.
    fn decode_next(&mut self, now: f64) -> bool {
        if self.shared.is_paused() {
            return false;
        }

        loop {
            let Some(frame) = self.ring.peek() else {
                return false;
            };
            self.ring.next();
            if frame.generation != self.ring.queue().generation() {
                continue;
            }
            let Some(samples) = frame.samples() else {
                tracing::warn!("audio ring holds a non-audio frame");
                continue;
            };
            if frame.generation != self.audio_clock_generation {
                self.converter.reset();
            }

            let nb_samples = samples.frames();
            let wanted = self.synchronize(nb_samples, samples.sample_rate, now);
            match self.converter.convert(samples, wanted, &self.params) {
                Ok(converted) => self.buffer = converted,
                Err(e) => {
                    tracing::warn!("Audio conversion failed: {}", e);
                    self.buffer.clear();
                }
            }
            self.buffer_index = 0;

            self.audio_clock = if frame.pts.is_nan() {
                f64::NAN
            } else {
                frame.pts + nb_samples as f64 / samples.sample_rate.max(1) as f64
            };
            self.audio_clock_generation = frame.generation;

            if !self.buffer.is_empty() {
                if self.shared.show_mode() != ShowMode::Video {
                    self.history.push(&self.buffer);
                }
                return true;
            }
        }
    }

    fn synchronize(&mut self, nb_samples: usize, sample_rate: u32, now: f64) -> usize {
        let diff = {
            let clocks = self.shared.clocks.lock();
            if clocks.master() == SyncMaster::Audio {
                return nb_samples;
            }
            clocks.audio.get_at(now) - clocks.master_clock_at(now)
        };
        self.drift.wanted_samples(diff, nb_samples, sample_rate)
    }
}

// ============================================================================
// Output Backends
// ============================================================================

/// A running output. Dropping it stops playback.
pub trait AudioOutput {
    fn params(&self) -> AudioParams;

    fn stop(&mut self);
}

pub trait AudioBackend {
    /// Closest format the device supports to `wanted`.
    fn negotiate(&self, wanted: AudioParams) -> Result<AudioParams, AudioError>;

    fn start(&self, renderer: AudioRenderer) -> Result<Box<dyn AudioOutput>, AudioError>;

    /// Converter feeding this backend's negotiated format
    fn converter(&self) -> Box<dyn SampleConverter> {
        Box::new(SincConverter::default())
    }
}

/// Headless output: a thread that pulls one device buffer per buffer period
#[derive(Debug, Default)]
pub struct SimulatedBackend;

impl AudioBackend for SimulatedBackend {
    fn negotiate(&self, wanted: AudioParams) -> Result<AudioParams, AudioError> {
        Ok(AudioParams::new(wanted.sample_rate.max(1), wanted.channels.max(1)))
    }

    fn start(&self, renderer: AudioRenderer) -> Result<Box<dyn AudioOutput>, AudioError> {
        Ok(Box::new(SimulatedOutput::start(renderer)?))
    }
}

pub struct SimulatedOutput {
    params: AudioParams,
    cancel: CancelToken,
    callbacks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedOutput {
    pub fn start(mut renderer: AudioRenderer) -> Result<Self, AudioError> {
        let params = *renderer.params();
        let cancel = CancelToken::new();
        let callbacks = Arc::new(AtomicU64::new(0));

        let thread_cancel = cancel.clone();
        let thread_callbacks = callbacks.clone();
        let period = Duration::from_secs_f64(params.buffer_duration());
        let thread = thread::Builder::new().name("audio-output".into()).spawn(move || {
            let mut buffer = vec![0.0f32; params.buffer_frames * params.channels as usize];
            while !thread_cancel.is_cancelled() {
                renderer.fill(&mut buffer);
                thread_callbacks.fetch_add(1, Ordering::Relaxed);
                thread::sleep(period);
            }
        })?;

        tracing::info!(
            sample_rate = params.sample_rate,
            channels = params.channels,
            buffer_frames = params.buffer_frames,
            "simulated audio output started"
        );
        Ok(Self {
            params,
            cancel,
            callbacks,
            thread: Some(thread),
        })
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }
}

impl AudioOutput for SimulatedOutput {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audio output thread panicked");
            }
        }
    }
}

impl Drop for SimulatedOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "audio")]
pub use device::CpalBackend;

#[cfg(feature = "audio")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig};

    /// Default output device through cpal
    #[derive(Debug, Default)]
    pub struct CpalBackend;

    fn default_device() -> Result<cpal::Device, AudioError> {
        cpal::default_host().default_output_device().ok_or(AudioError::NoDevice)
    }

    impl AudioBackend for CpalBackend {
        fn negotiate(&self, wanted: AudioParams) -> Result<AudioParams, AudioError> {
            let device = default_device()?;
            let config = device
                .default_output_config()
                .map_err(|e| AudioError::Device(format!("Failed to get output config: {}", e)))?;
            let params = AudioParams::new(config.sample_rate().0, config.channels());
            if params.sample_rate != wanted.sample_rate || params.channels != wanted.channels {
                tracing::info!(
                    "Audio device uses {} Hz / {} channels, source is {} Hz / {} channels",
                    params.sample_rate,
                    params.channels,
                    wanted.sample_rate,
                    wanted.channels
                );
            }
            Ok(params)
        }

        fn start(&self, mut renderer: AudioRenderer) -> Result<Box<dyn AudioOutput>, AudioError> {
            let params = *renderer.params();
            let device = default_device()?;
            let supported = device
                .default_output_config()
                .map_err(|e| AudioError::Device(format!("Failed to get output config: {}", e)))?;
            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.into();

            let err_fn = |err| tracing::error!("Audio stream error: {}", err);
            let mut scratch: Vec<f32> = Vec::new();

            let stream = match sample_format {
                SampleFormat::F32 => device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.fill(data),
                    err_fn,
                    None,
                ),
                SampleFormat::I16 => device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        renderer.fill(&mut scratch);
                        for (d, s) in data.iter_mut().zip(&scratch) {
                            *d = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        }
                    },
                    err_fn,
                    None,
                ),
                SampleFormat::U16 => device.build_output_stream(
                    &config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        renderer.fill(&mut scratch);
                        for (d, s) in data.iter_mut().zip(&scratch) {
                            *d = ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16;
                        }
                    },
                    err_fn,
                    None,
                ),
                other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
            }
            .map_err(|e| AudioError::Stream(format!("Failed to build stream: {}", e)))?;

            stream
                .play()
                .map_err(|e| AudioError::Stream(format!("Failed to start stream: {}", e)))?;
            tracing::info!(sample_rate = params.sample_rate, channels = params.channels, "audio device started");
            Ok(Box::new(CpalOutput {
                params,
                stream: Some(stream),
            }))
        }
    }

    struct CpalOutput {
        params: AudioParams,
        stream: Option<Stream>,
    }

    impl AudioOutput for CpalOutput {
        fn params(&self) -> AudioParams {
            self.params
        }

        fn stop(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
            }
        }
    }
}
