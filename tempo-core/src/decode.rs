//! # Stream Decoding
//!
//! Codec work happens behind the [`Decoder`] trait. This module drives it:
//! [`StreamDecoder`] pulls units from a [`UnitQueue`], skips anything from
//! an older generation, feeds the codec, and stamps timestamps on what comes
//! out. The worker loops turn those payloads into timed frames for a
//! [`FrameRing`].
//!
//! ## Generations
//!
//! A seek flushes the unit queue and queues a flush marker, which bumps the
//! queue generation. Units tagged with an older generation are discarded
//! without reaching the codec; the marker itself resets codec state and the
//! timestamp predictor.

use crate::clock::NO_SYNC_THRESHOLD;
use crate::demux::StreamInfo;
use crate::frame::{DecodedFrame, DecodedPayload, MediaKind, TimeBase, MICROSECONDS};
use crate::frame_ring::FrameRing;
use crate::player::PlayerEvent;
use crate::signal::Wakeup;
use crate::sync::{FrameDropPolicy, PlaybackShared};
use crate::unit_queue::{CompressedUnit, Packet, QueueError, UnitQueue};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("No decoder available for {codec}")]
    NoDecoder { codec: String },
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Decoder queue aborted")]
    Aborted,
    #[error("Failed to spawn decoder thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl From<QueueError> for DecodeError {
    fn from(_: QueueError) -> Self {
        Self::Aborted
    }
}

/// Answer to [`Decoder::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Output must be drained before more input is taken
    Full,
}

/// Answer to [`Decoder::receive`]
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedPayload),
    /// Needs more input
    Again,
    /// Fully drained after a `send(None)`
    EndOfStream,
}

/// Which timestamp of a decoded picture becomes its presentation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtsPolicy {
    /// Decoder's reordered best guess
    BestEffort,
    /// Decode timestamp of the source packet
    DecodeOrder,
    /// Timestamp the decoder put on the frame
    Decoder,
}

impl Default for PtsPolicy {
    fn default() -> Self {
        Self::BestEffort
    }
}

/// Decoder trait - implemented by codec backends
pub trait Decoder: Send {
    fn kind(&self) -> MediaKind;

    /// Feed one packet, or `None` to start draining.
    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, DecodeError>;

    fn receive(&mut self) -> Result<ReceiveStatus, DecodeError>;

    /// Drop buffered state so decoding can restart at a new position
    fn flush(&mut self);

    /// Get decoder name for debugging
    fn name(&self) -> &str;
}

// ============================================================================
// Stream Decoder
// ============================================================================

pub struct StreamDecoder {
    decoder: Box<dyn Decoder>,
    queue: Arc<UnitQueue>,
    /// Poked whenever the queue runs dry so the reader refills it
    empty_queue: Arc<Wakeup>,
    time_base: TimeBase,
    pts_policy: PtsPolicy,
    generation: i32,
    finished: Arc<AtomicI32>,
    pending: Option<CompressedUnit>,
    start_pts: Option<i64>,
    start_pts_tb: TimeBase,
    next_pts: Option<i64>,
    next_pts_tb: TimeBase,
}

impl StreamDecoder {
    pub fn new(
        decoder: Box<dyn Decoder>,
        queue: Arc<UnitQueue>,
        empty_queue: Arc<Wakeup>,
        time_base: TimeBase,
        pts_policy: PtsPolicy,
    ) -> Self {
        Self {
            decoder,
            queue,
            empty_queue,
            time_base,
            pts_policy,
            generation: -1,
            finished: Arc::new(AtomicI32::new(0)),
            pending: None,
            start_pts: None,
            start_pts_tb: TimeBase::default(),
            next_pts: None,
            next_pts_tb: TimeBase::default(),
        }
    }

    /// Seed the audio timestamp predictor used after each flush.
    pub fn with_start_pts(mut self, start_pts: Option<i64>, time_base: TimeBase) -> Self {
        self.start_pts = start_pts;
        self.start_pts_tb = time_base;
        self
    }

    pub fn name(&self) -> &str {
        self.decoder.name()
    }

    pub fn kind(&self) -> MediaKind {
        self.decoder.kind()
    }

    /// Generation of the unit most recently taken from the queue.
    pub fn generation(&self) -> i32 {
        self.generation
    }

    /// Generation at which the decoder was fully drained, 0 while running.
    pub fn finished_handle(&self) -> Arc<AtomicI32> {
        self.finished.clone()
    }

    pub fn queue(&self) -> &Arc<UnitQueue> {
        &self.queue
    }

    /// Decode the next frame.
    ///
    /// `Ok(None)` means the decoder drained at end of stream and is idle
    /// until new units arrive. Errors are fatal for the stream.
    pub fn decode_frame(&mut self) -> Result<Option<DecodedPayload>, DecodeError> {
        loop {
            if self.queue.generation() == self.generation {
                loop {
                    if self.queue.is_aborted() {
                        return Err(DecodeError::Aborted);
                    }
                    match self.decoder.receive()? {
                        ReceiveStatus::Frame(mut payload) => {
                            self.stamp(&mut payload);
                            return Ok(Some(payload));
                        }
                        ReceiveStatus::EndOfStream => {
                            self.finished.store(self.generation, Ordering::SeqCst);
                            self.decoder.flush();
                            tracing::debug!(decoder = self.decoder.name(), generation = self.generation, "decoder drained");
                            return Ok(None);
                        }
                        ReceiveStatus::Again => break,
                    }
                }
            }

            let unit = self.next_unit()?;
            match unit {
                CompressedUnit::Flush => {
                    self.decoder.flush();
                    self.finished.store(0, Ordering::SeqCst);
                    self.next_pts = self.start_pts;
                    self.next_pts_tb = self.start_pts_tb;
                }
                CompressedUnit::Data(ref packet) => {
                    if self.decoder.send(Some(packet))? == SendStatus::Full {
                        tracing::error!(
                            decoder = self.decoder.name(),
                            "Receive and send both reported busy, retrying packet"
                        );
                        self.pending = Some(unit);
                    }
                }
                CompressedUnit::EndOfStream { .. } => {
                    if self.decoder.send(None)? == SendStatus::Full {
                        self.pending = Some(unit);
                    }
                }
            }
        }
    }

    /// Next unit of the current generation, reusing a pending one first.
    fn next_unit(&mut self) -> Result<CompressedUnit, DecodeError> {
        loop {
            if self.queue.is_empty() {
                self.empty_queue.notify();
            }
            let unit = match self.pending.take() {
                Some(unit) => unit,
                None => match self.queue.get(true)? {
                    Some((unit, generation)) => {
                        self.generation = generation;
                        unit
                    }
                    None => continue,
                },
            };
            if self.queue.generation() == self.generation {
                return Ok(unit);
            }
            tracing::trace!(decoder = self.decoder.name(), generation = self.generation, "discarding stale unit");
        }
    }

    fn stamp(&mut self, payload: &mut DecodedPayload) {
        match payload {
            DecodedPayload::Picture(picture) => match self.pts_policy {
                PtsPolicy::BestEffort => picture.pts = picture.best_effort_timestamp,
                PtsPolicy::DecodeOrder => picture.pts = picture.pkt_dts,
                PtsPolicy::Decoder => {}
            },
            DecodedPayload::Samples(samples) => {
                let tb = TimeBase::new(1, samples.sample_rate as i32);
                if let Some(pts) = samples.pts {
                    samples.pts = Some(self.time_base.rescale(pts, tb));
                } else if let Some(next) = self.next_pts {
                    samples.pts = Some(self.next_pts_tb.rescale(next, tb));
                }
                if let Some(pts) = samples.pts {
                    self.next_pts = Some(pts + samples.frames() as i64);
                    self.next_pts_tb = tb;
                }
            }
            DecodedPayload::Subtitle(_) => {}
        }
    }
}

// ============================================================================
// Worker Loops
// ============================================================================

/// Everything a decoder thread needs besides its [`StreamDecoder`]
pub struct WorkerContext {
    pub ring: Arc<FrameRing>,
    pub shared: Arc<PlaybackShared>,
    pub stream: StreamInfo,
    pub frame_drop: FrameDropPolicy,
}

/// Decode pictures into the video ring until aborted.
pub fn run_video(mut decoder: StreamDecoder, ctx: WorkerContext) -> Result<(), DecodeError> {
    let tb = ctx.stream.time_base;
    let frame_duration = match ctx.stream.frame_rate {
        Some(rate) if rate.is_valid() => rate.invert().to_f64(),
        _ => 0.0,
    };

    loop {
        let Some(payload) = decoder.decode_frame()? else {
            continue;
        };
        let DecodedPayload::Picture(picture) = &payload else {
            tracing::warn!(decoder = decoder.name(), "video decoder returned a non-picture payload");
            continue;
        };
        if !picture.is_complete() {
            tracing::warn!(
                decoder = decoder.name(),
                width = picture.width,
                height = picture.height,
                bytes = picture.data.len(),
                "dropping picture with a short buffer"
            );
            continue;
        }
        let pts = picture.pts.map_or(f64::NAN, |p| tb.seconds(p));
        let pos = picture.pos.unwrap_or(-1);

        if !pts.is_nan() && drop_early(&decoder, &ctx, pts) {
            ctx.shared.count_early_drop();
            tracing::debug!(pts, "dropping frame before queueing");
            continue;
        }

        let frame = DecodedFrame::new(payload, decoder.generation(), pts, frame_duration, pos);
        let Some(slot) = ctx.ring.peek_writable() else {
            return Ok(());
        };
        slot.push(frame);
    }
}

/// A decoded picture already behind the master clock is not worth queueing.
fn drop_early(decoder: &StreamDecoder, ctx: &WorkerContext, pts: f64) -> bool {
    let clocks = ctx.shared.clocks.lock();
    if !ctx.frame_drop.allows(clocks.master()) {
        return false;
    }
    let diff = pts - clocks.master_clock_at(crate::clock::now_seconds());
    !diff.is_nan()
        && diff.abs() < NO_SYNC_THRESHOLD
        && diff < 0.0
        && decoder.generation() == clocks.video.generation()
        && !decoder.queue().is_empty()
}

/// Decode sample blocks into the audio ring until aborted.
pub fn run_audio(mut decoder: StreamDecoder, ctx: WorkerContext) -> Result<(), DecodeError> {
    loop {
        let Some(payload) = decoder.decode_frame()? else {
            continue;
        };
        let DecodedPayload::Samples(samples) = &payload else {
            tracing::warn!(decoder = decoder.name(), "audio decoder returned a non-audio payload");
            continue;
        };
        let tb = TimeBase::new(1, samples.sample_rate as i32);
        let pts = samples.pts.map_or(f64::NAN, |p| tb.seconds(p));
        let duration = samples.frames() as f64 / samples.sample_rate.max(1) as f64;
        let pos = samples.pos.unwrap_or(-1);

        let frame = DecodedFrame::new(payload, decoder.generation(), pts, duration, pos);
        let Some(slot) = ctx.ring.peek_writable() else {
            return Ok(());
        };
        slot.push(frame);
    }
}

/// Decode subtitle events into the subtitle ring until aborted.
pub fn run_subtitle(mut decoder: StreamDecoder, ctx: WorkerContext) -> Result<(), DecodeError> {
    loop {
        let Some(slot) = ctx.ring.peek_writable() else {
            return Ok(());
        };
        let Some(payload) = decoder.decode_frame()? else {
            continue;
        };
        let DecodedPayload::Subtitle(subtitle) = &payload else {
            tracing::warn!(decoder = decoder.name(), "subtitle decoder returned a non-subtitle payload");
            continue;
        };
        let pts = subtitle.pts.map_or(0.0, |p| MICROSECONDS.seconds(p));
        let frame = DecodedFrame::new(payload, decoder.generation(), pts, 0.0, -1)
            .with_size(ctx.stream.width, ctx.stream.height);
        slot.push(frame);
    }
}

// ============================================================================
// Decoder Thread Handle
// ============================================================================

/// Owns a running decoder thread
pub struct DecoderHandle {
    kind: MediaKind,
    queue: Arc<UnitQueue>,
    finished: Arc<AtomicI32>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// Start the queue and run `body` on a dedicated thread. A failing body
    /// aborts its queue and reports the stream as closed.
    pub fn start<F>(
        kind: MediaKind,
        queue: Arc<UnitQueue>,
        finished: Arc<AtomicI32>,
        events: Sender<PlayerEvent>,
        body: F,
    ) -> Result<Self, DecodeError>
    where
        F: FnOnce() -> Result<(), DecodeError> + Send + 'static,
    {
        queue.start();
        let thread_queue = queue.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-decoder", queue.name()))
            .spawn(move || match body() {
                Ok(()) | Err(DecodeError::Aborted) => {
                    tracing::debug!(stream = ?kind, "decoder thread finished");
                }
                Err(e) => {
                    tracing::error!(stream = ?kind, "Decoder failed: {}", e);
                    thread_queue.abort();
                    let _ = events.send(PlayerEvent::StreamClosed {
                        kind,
                        reason: e.to_string(),
                    });
                }
            })?;
        Ok(Self {
            kind,
            queue,
            finished,
            thread: Some(thread),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn finished_handle(&self) -> Arc<AtomicI32> {
        self.finished.clone()
    }

    /// Whether the decoder drained everything of the current generation.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst) == self.queue.generation()
    }

    /// Stop the thread: abort the queue, wake a writer blocked on `ring`,
    /// join, and drop whatever is still queued.
    pub fn abort(&mut self, ring: &FrameRing) {
        self.queue.abort();
        ring.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(stream = ?self.kind, "decoder thread panicked");
            }
        }
        self.queue.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioSamples, Picture, PixelFormat, Rational};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Emits one payload per packet and records what it was fed
    struct ScriptedDecoder {
        kind: MediaKind,
        fed: Arc<Mutex<Vec<i64>>>,
        flushes: Arc<Mutex<usize>>,
        output: VecDeque<DecodedPayload>,
        draining: bool,
        refuse_next: bool,
        /// Emit an empty picture for this pts
        truncate_pts: Option<i64>,
    }

    impl ScriptedDecoder {
        fn new(kind: MediaKind) -> Self {
            Self {
                kind,
                fed: Arc::default(),
                flushes: Arc::default(),
                output: VecDeque::new(),
                draining: false,
                refuse_next: false,
                truncate_pts: None,
            }
        }

        fn payload(&self, packet: &Packet) -> DecodedPayload {
            match self.kind {
                MediaKind::Audio => DecodedPayload::Samples(AudioSamples {
                    data: vec![0.0; 800],
                    channels: 1,
                    sample_rate: 8000,
                    pts: packet.pts,
                    pos: packet.pos,
                }),
                _ => DecodedPayload::Picture(Picture {
                    data: if packet.pts == self.truncate_pts && packet.pts.is_some() {
                        Vec::new()
                    } else {
                        vec![0; PixelFormat::Rgba32.frame_len(2, 2)]
                    },
                    width: 2,
                    height: 2,
                    format: PixelFormat::Rgba32,
                    sample_aspect_ratio: Rational::new(1, 1),
                    pts: None,
                    pkt_dts: packet.dts,
                    best_effort_timestamp: packet.pts,
                    pos: packet.pos,
                }),
            }
        }
    }

    impl Decoder for ScriptedDecoder {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, DecodeError> {
            if self.refuse_next {
                self.refuse_next = false;
                return Ok(SendStatus::Full);
            }
            match packet {
                Some(packet) => {
                    self.fed.lock().push(packet.pts.unwrap_or(-1));
                    let payload = self.payload(packet);
                    self.output.push_back(payload);
                }
                None => self.draining = true,
            }
            Ok(SendStatus::Accepted)
        }

        fn receive(&mut self) -> Result<ReceiveStatus, DecodeError> {
            if let Some(payload) = self.output.pop_front() {
                return Ok(ReceiveStatus::Frame(payload));
            }
            if self.draining {
                return Ok(ReceiveStatus::EndOfStream);
            }
            Ok(ReceiveStatus::Again)
        }

        fn flush(&mut self) {
            self.output.clear();
            self.draining = false;
            *self.flushes.lock() += 1;
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn packet(pts: Option<i64>) -> CompressedUnit {
        let mut packet = Packet::new(0, vec![1u8; 8]);
        packet.pts = pts;
        packet.dts = pts.map(|p| p - 1);
        CompressedUnit::Data(packet)
    }

    fn stream_decoder(decoder: ScriptedDecoder, queue: &Arc<UnitQueue>, policy: PtsPolicy) -> StreamDecoder {
        StreamDecoder::new(
            Box::new(decoder),
            queue.clone(),
            Arc::new(Wakeup::new()),
            TimeBase::new(1, 1000),
            policy,
        )
    }

    fn picture_pts(payload: DecodedPayload) -> Option<i64> {
        match payload {
            DecodedPayload::Picture(p) => p.pts,
            other => panic!("unexpected payload {:?}", other.kind()),
        }
    }

    #[test]
    fn test_stale_unit_never_reaches_decoder() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        queue.put(packet(Some(10))).unwrap();
        queue.put(CompressedUnit::Flush).unwrap();
        queue.put(packet(Some(20))).unwrap();

        let scripted = ScriptedDecoder::new(MediaKind::Video);
        let fed = scripted.fed.clone();
        let flushes = scripted.flushes.clone();
        let mut decoder = stream_decoder(scripted, &queue, PtsPolicy::BestEffort);

        let payload = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(picture_pts(payload), Some(20));
        assert_eq!(*fed.lock(), vec![20]);
        assert_eq!(*flushes.lock(), 1);
        assert_eq!(decoder.generation(), 2);
    }

    #[test]
    fn test_refused_packet_is_retried() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        queue.put(packet(Some(5))).unwrap();

        let mut scripted = ScriptedDecoder::new(MediaKind::Video);
        scripted.refuse_next = true;
        let fed = scripted.fed.clone();
        let mut decoder = stream_decoder(scripted, &queue, PtsPolicy::BestEffort);

        let payload = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(picture_pts(payload), Some(5));
        assert_eq!(*fed.lock(), vec![5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_decode_order_pts_policy() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        queue.put(packet(Some(40))).unwrap();
        let mut decoder = stream_decoder(ScriptedDecoder::new(MediaKind::Video), &queue, PtsPolicy::DecodeOrder);
        let payload = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(picture_pts(payload), Some(39));
    }

    #[test]
    fn test_audio_pts_prediction() {
        let queue = Arc::new(UnitQueue::new("audio"));
        queue.start();
        queue.put(packet(Some(1000))).unwrap();
        queue.put(packet(None)).unwrap();

        let mut decoder = stream_decoder(ScriptedDecoder::new(MediaKind::Audio), &queue, PtsPolicy::BestEffort);
        let samples_pts = |payload: DecodedPayload| match payload {
            DecodedPayload::Samples(s) => s.pts,
            other => panic!("unexpected payload {:?}", other.kind()),
        };

        // 1 s in a 1/1000 time base becomes 8000 in 1/8000
        assert_eq!(samples_pts(decoder.decode_frame().unwrap().unwrap()), Some(8000));
        // Predicted from the previous block of 800 samples
        assert_eq!(samples_pts(decoder.decode_frame().unwrap().unwrap()), Some(8800));
    }

    #[test]
    fn test_end_of_stream_marks_finished() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        queue.put(packet(Some(1))).unwrap();
        queue.put_end_of_stream(0).unwrap();

        let mut decoder = stream_decoder(ScriptedDecoder::new(MediaKind::Video), &queue, PtsPolicy::BestEffort);
        let finished = decoder.finished_handle();

        assert!(decoder.decode_frame().unwrap().is_some());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(decoder.decode_frame().unwrap().is_none());
        assert_eq!(finished.load(Ordering::SeqCst), queue.generation());

        // A new flush clears the marker
        queue.put(CompressedUnit::Flush).unwrap();
        queue.put(packet(Some(2))).unwrap();
        assert!(decoder.decode_frame().unwrap().is_some());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_interrupts_blocked_decoder() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        let mut decoder = stream_decoder(ScriptedDecoder::new(MediaKind::Video), &queue, PtsPolicy::BestEffort);

        let handle = thread::spawn(move || decoder.decode_frame().map(|p| p.is_some()));
        thread::sleep(Duration::from_millis(30));
        queue.abort();
        assert!(matches!(handle.join().unwrap(), Err(DecodeError::Aborted)));
    }

    #[test]
    fn test_empty_queue_wakes_reader() {
        let queue = Arc::new(UnitQueue::new("video"));
        queue.start();
        let wakeup = Arc::new(Wakeup::new());
        let mut decoder = StreamDecoder::new(
            Box::new(ScriptedDecoder::new(MediaKind::Video)),
            queue.clone(),
            wakeup.clone(),
            TimeBase::new(1, 1000),
            PtsPolicy::BestEffort,
        );
        queue.put(packet(Some(1))).unwrap();
        decoder.decode_frame().unwrap();
        assert!(wakeup.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_handle_runs_worker_and_aborts() {
        use crate::frame_ring::FrameRing;
        use crate::sync::{ClockSet, SyncMaster};

        let queue = Arc::new(UnitQueue::new("video"));
        let ring = Arc::new(FrameRing::new(3, true, queue.clone()));
        let shared = Arc::new(PlaybackShared::new(
            ClockSet::new(
                SyncMaster::Video,
                crate::clock::GenerationRef::new(),
                queue.generation_ref(),
                false,
                true,
            ),
            100,
        ));
        let mut stream = StreamInfo::new(0, MediaKind::Video, TimeBase::new(1, 1000));
        stream.frame_rate = Some(Rational::new(25, 1));

        let decoder = stream_decoder(ScriptedDecoder::new(MediaKind::Video), &queue, PtsPolicy::BestEffort);
        let finished = decoder.finished_handle();
        let ctx = WorkerContext {
            ring: ring.clone(),
            shared,
            stream,
            frame_drop: FrameDropPolicy::Auto,
        };
        let (events, _rx) = crossbeam_channel::unbounded();
        let mut handle =
            DecoderHandle::start(MediaKind::Video, queue.clone(), finished, events, move || run_video(decoder, ctx))
                .unwrap();

        for pts in [0, 40, 80, 120] {
            queue.put(packet(Some(pts))).unwrap();
        }
        let frame = ring.peek_readable().unwrap();
        assert_eq!(frame.pts, 0.0);
        assert!((frame.duration - 0.04).abs() < 1e-12);

        // Ring holds 3, the fourth frame blocks the writer until abort
        handle.abort(&ring);
        assert!(queue.is_aborted());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_short_pictures_are_dropped() {
        use crate::frame_ring::FrameRing;
        use crate::sync::{ClockSet, SyncMaster};

        let queue = Arc::new(UnitQueue::new("video"));
        let ring = Arc::new(FrameRing::new(3, false, queue.clone()));
        let clocks = ClockSet::new(
            SyncMaster::Video,
            crate::clock::GenerationRef::new(),
            queue.generation_ref(),
            false,
            true,
        );
        let ctx = WorkerContext {
            ring: ring.clone(),
            shared: Arc::new(PlaybackShared::new(clocks, 100)),
            stream: StreamInfo::new(0, MediaKind::Video, TimeBase::new(1, 1000)),
            frame_drop: FrameDropPolicy::Never,
        };
        let mut scripted = ScriptedDecoder::new(MediaKind::Video);
        scripted.truncate_pts = Some(40);
        let decoder = stream_decoder(scripted, &queue, PtsPolicy::BestEffort);
        let finished = decoder.finished_handle();
        let (events, _rx) = crossbeam_channel::unbounded();
        let mut handle =
            DecoderHandle::start(MediaKind::Video, queue.clone(), finished, events, move || run_video(decoder, ctx))
                .unwrap();

        for pts in [0, 40, 80] {
            queue.put(packet(Some(pts))).unwrap();
        }
        assert_eq!(ring.peek_readable().unwrap().pts, 0.0);
        ring.next();
        let pts = ring.peek_readable().unwrap().pts;
        assert!((pts - 0.08).abs() < 1e-9, "pts {}", pts);
        handle.abort(&ring);
    }
}
