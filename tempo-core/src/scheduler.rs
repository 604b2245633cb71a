//! # Read Scheduler
//!
//! The single reader thread. It pulls packets from the demuxer, routes them
//! to the per-stream unit queues, and sleeps while the queues hold enough.
//! Seeks, attachment requests and pause changes are posted by the control
//! surface through [`ReadControl`] and picked up between reads.

use crate::config::PlayerConfig;
use crate::demux::{DemuxError, Demuxer, SeekRequest, StreamInfo};
use crate::frame::{MediaKind, MICROSECONDS};
use crate::frame_ring::FrameRing;
use crate::player::{PlayerEvent, TerminationReason};
use crate::signal::{CancelToken, Wakeup};
use crate::sync::PlaybackShared;
use crate::unit_queue::{CompressedUnit, Packet, UnitQueue, MAX_QUEUE_BYTES};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest sleep while queues are full or the source has nothing
const READ_WAIT: Duration = Duration::from_millis(10);

// ============================================================================
// Control Channel
// ============================================================================

/// Requests from the control surface to the reader
#[derive(Debug)]
pub struct ReadControl {
    cancel: CancelToken,
    wakeup: Arc<Wakeup>,
    seek: Mutex<Option<SeekRequest>>,
    attachments: AtomicBool,
    /// Byte offset of the last packet read, -1 when unknown
    position: AtomicI64,
}

impl Default for ReadControl {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            wakeup: Arc::new(Wakeup::new()),
            seek: Mutex::new(None),
            attachments: AtomicBool::new(false),
            position: AtomicI64::new(-1),
        }
    }
}

impl ReadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to every blocking demuxer call
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Notified whenever a decoder runs dry, so the reader refills early
    pub fn wakeup(&self) -> Arc<Wakeup> {
        self.wakeup.clone()
    }

    /// Post a seek unless one is already pending.
    pub fn request_seek(&self, request: SeekRequest) -> bool {
        let mut pending = self.seek.lock();
        if pending.is_some() {
            return false;
        }
        *pending = Some(request);
        drop(pending);
        self.wakeup.notify();
        true
    }

    pub fn is_seek_pending(&self) -> bool {
        self.seek.lock().is_some()
    }

    fn pending_seek(&self) -> Option<SeekRequest> {
        *self.seek.lock()
    }

    fn complete_seek(&self) {
        *self.seek.lock() = None;
    }

    /// Queue cover pictures again on the next pass.
    pub fn request_attachments(&self) {
        self.attachments.store(true, Ordering::SeqCst);
    }

    fn take_attachments_request(&self) -> bool {
        self.attachments.swap(false, Ordering::SeqCst)
    }

    /// Byte offset the reader has reached in the source
    pub fn last_position(&self) -> Option<i64> {
        Some(self.position.load(Ordering::Relaxed)).filter(|&pos| pos >= 0)
    }

    pub fn abort(&self) {
        self.cancel.cancel();
        self.wakeup.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// One opened stream as seen by the reader
#[derive(Clone)]
pub struct ReaderStream {
    pub info: StreamInfo,
    pub queue: Arc<UnitQueue>,
    pub ring: Arc<FrameRing>,
    /// Generation at which the stream's decoder drained, see
    /// [`crate::decode::StreamDecoder::finished_handle`]
    pub finished: Arc<AtomicI32>,
}

impl ReaderStream {
    fn has_enough(&self) -> bool {
        self.info.attached_picture.is_some() || self.queue.has_enough_units(self.info.time_base)
    }

    /// Decoder drained and every frame consumed
    fn is_done(&self) -> bool {
        self.queue.is_aborted()
            || (self.finished.load(Ordering::SeqCst) == self.queue.generation() && self.ring.remaining() == 0)
    }
}

enum Flow {
    Continue,
    Wait,
    Stop,
}

pub struct ReadScheduler {
    demuxer: Box<dyn Demuxer>,
    streams: Vec<ReaderStream>,
    shared: Arc<PlaybackShared>,
    config: Arc<PlayerConfig>,
    control: Arc<ReadControl>,
    events: Sender<PlayerEvent>,
    infinite_buffer: bool,
    eof: bool,
    last_paused: bool,
    passes: u32,
}

impl ReadScheduler {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        streams: Vec<ReaderStream>,
        shared: Arc<PlaybackShared>,
        config: Arc<PlayerConfig>,
        control: Arc<ReadControl>,
        events: Sender<PlayerEvent>,
    ) -> Self {
        let infinite_buffer = config.infinite_buffer.unwrap_or_else(|| demuxer.is_realtime());
        Self {
            demuxer,
            streams,
            shared,
            config,
            control,
            events,
            infinite_buffer,
            eof: false,
            last_paused: false,
            passes: 0,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new().name("read".into()).spawn(move || self.run())
    }

    pub fn run(mut self) {
        self.control.request_attachments();
        self.seek_to_start();

        while !self.control.is_aborted() {
            match self.step() {
                Flow::Continue => {}
                Flow::Wait => {
                    self.control.wakeup.wait_timeout(READ_WAIT);
                }
                Flow::Stop => break,
            }
        }
        tracing::debug!("read thread finished");
    }

    fn step(&mut self) -> Flow {
        self.sync_read_pause();
        let paused = self.shared.is_paused();
        if paused && self.demuxer.is_realtime() {
            return Flow::Wait;
        }

        if let Some(request) = self.control.pending_seek() {
            self.seek(request);
        }
        if self.control.take_attachments_request() {
            self.queue_attachments();
        }

        if !self.infinite_buffer && self.queues_full() {
            return Flow::Wait;
        }

        if !paused && self.playback_finished() {
            if let Some(flow) = self.end_of_playback() {
                return flow;
            }
        }

        match self.demuxer.read_packet(&self.control.cancel) {
            Ok(packet) => {
                self.eof = false;
                if let Some(pos) = self.demuxer.position().or(packet.pos) {
                    self.control.position.store(pos, Ordering::Relaxed);
                }
                self.route(packet);
                Flow::Continue
            }
            Err(DemuxError::EndOfFile) => {
                if !self.eof {
                    for stream in &self.streams {
                        let _ = stream.queue.put_end_of_stream(stream.info.index);
                    }
                    self.eof = true;
                    tracing::info!("end of file reached");
                }
                Flow::Wait
            }
            Err(DemuxError::WouldBlock) => Flow::Wait,
            Err(DemuxError::Interrupted) if self.control.is_aborted() => Flow::Stop,
            Err(e) if e.is_fatal() => {
                tracing::error!("Read failed: {}", e);
                let _ = self.events.send(PlayerEvent::Terminated {
                    reason: TerminationReason::Error(e.to_string()),
                });
                Flow::Stop
            }
            Err(e) => {
                tracing::warn!("Read error: {}", e);
                Flow::Wait
            }
        }
    }

    fn sync_read_pause(&mut self) {
        let paused = self.shared.is_paused();
        if paused == self.last_paused {
            return;
        }
        self.last_paused = paused;
        let result = if paused { self.demuxer.pause() } else { self.demuxer.play() };
        match result {
            Ok(()) => {
                if paused {
                    self.shared.set_read_pause_unsupported(false);
                }
            }
            Err(DemuxError::Unsupported(_)) => self.shared.set_read_pause_unsupported(true),
            Err(e) => tracing::warn!("Failed to propagate pause to source: {}", e),
        }
    }

    fn seek_to_start(&mut self) {
        let Some(start) = self.config.start_time else {
            return;
        };
        let mut target = (start * 1_000_000.0) as i64;
        if let Some(origin) = self.demuxer.start_time() {
            target += origin;
        }
        match self.demuxer.seek(&SeekRequest::absolute(target), &self.control.cancel) {
            Ok(()) => tracing::info!("started at {:.3}s", start),
            Err(e) => tracing::warn!("Could not seek to start position {:.3}: {}", start, e),
        }
    }

    fn seek(&mut self, request: SeekRequest) {
        match self.demuxer.seek(&request, &self.control.cancel) {
            Ok(()) => {
                for stream in &self.streams {
                    stream.queue.flush();
                    let _ = stream.queue.put(CompressedUnit::Flush);
                }
                let target = if request.by_bytes {
                    f64::NAN
                } else {
                    MICROSECONDS.seconds(request.target)
                };
                self.shared.clocks.lock().external.set(target, 0);
                tracing::debug!(target = request.target, by_bytes = request.by_bytes, "seek complete");
            }
            Err(e) => tracing::error!("Error while seeking to {}: {}", request.target, e),
        }

        self.control.request_attachments();
        self.eof = false;
        if self.shared.is_paused() {
            self.shared.request_step();
        }
        self.control.complete_seek();
    }

    fn queue_attachments(&self) {
        for stream in &self.streams {
            if let Some(picture) = &stream.info.attached_picture {
                let _ = stream.queue.put(CompressedUnit::Data(picture.clone()));
                let _ = stream.queue.put_end_of_stream(stream.info.index);
            }
        }
    }

    fn queues_full(&self) -> bool {
        let total: usize = self.streams.iter().map(|s| s.queue.size_bytes()).sum();
        total > MAX_QUEUE_BYTES || (!self.streams.is_empty() && self.streams.iter().all(ReaderStream::has_enough))
    }

    fn playback_finished(&self) -> bool {
        let mut timed = self
            .streams
            .iter()
            .filter(|s| matches!(s.info.kind, MediaKind::Audio | MediaKind::Video))
            .peekable();
        timed.peek().is_some() && timed.all(ReaderStream::is_done)
    }

    /// Loop back to the start or end the session. None leaves the reader
    /// idle at the end.
    fn end_of_playback(&mut self) -> Option<Flow> {
        let completed = self.passes + 1;
        match self.config.loops_after(completed) {
            Some(0) if self.config.autoexit => {
                tracing::info!("playback finished, exiting");
                let _ = self.events.send(PlayerEvent::Terminated {
                    reason: TerminationReason::EndOfFile,
                });
                Some(Flow::Stop)
            }
            Some(0) => None,
            _ => {
                self.passes = completed;
                let start = (self.config.start_time.unwrap_or(0.0) * 1_000_000.0) as i64;
                self.control.request_seek(SeekRequest::absolute(start));
                tracing::info!(pass = completed + 1, "looping playback");
                Some(Flow::Continue)
            }
        }
    }

    fn route(&self, packet: Packet) {
        let Some(stream) = self.streams.iter().find(|s| s.info.index == packet.stream_index) else {
            return;
        };
        if stream.info.attached_picture.is_some() || !self.in_play_range(&stream.info, &packet) {
            return;
        }
        if stream.queue.put(CompressedUnit::Data(packet)).is_err() {
            tracing::trace!(stream = stream.info.index, "dropping packet for closed stream");
        }
    }

    fn in_play_range(&self, info: &StreamInfo, packet: &Packet) -> bool {
        let Some(duration) = self.config.duration else {
            return true;
        };
        let ts = packet.pts.or(packet.dts).unwrap_or(0);
        let stream_start = info.start_time.unwrap_or(0);
        let offset = self.config.start_time.unwrap_or(0.0);
        info.time_base.seconds(ts - stream_start) - offset <= duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::GenerationRef;
    use crate::sync::{ClockSet, SyncMaster};
    use crate::synthetic::{SyntheticDemuxer, SyntheticSpec};
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    struct Session {
        streams: Vec<ReaderStream>,
        shared: Arc<PlaybackShared>,
        control: Arc<ReadControl>,
        events: Receiver<PlayerEvent>,
        handle: Option<JoinHandle<()>>,
    }

    impl Session {
        fn start(spec: SyntheticSpec, config: PlayerConfig) -> Self {
            let demuxer = SyntheticDemuxer::new(spec);
            let streams: Vec<ReaderStream> = demuxer
                .streams()
                .iter()
                .map(|info| {
                    let queue = Arc::new(UnitQueue::new("test"));
                    queue.start();
                    ReaderStream {
                        info: info.clone(),
                        ring: Arc::new(FrameRing::new(3, true, queue.clone())),
                        queue,
                        finished: Arc::new(AtomicI32::new(0)),
                    }
                })
                .collect();
            let clocks = ClockSet::new(SyncMaster::Video, GenerationRef::new(), GenerationRef::new(), true, true);
            let shared = Arc::new(PlaybackShared::new(clocks, 100));
            let control = Arc::new(ReadControl::new());
            let (tx, rx) = crossbeam_channel::unbounded();
            let scheduler = ReadScheduler::new(
                Box::new(demuxer),
                streams.clone(),
                shared.clone(),
                Arc::new(config),
                control.clone(),
                tx,
            );
            let handle = scheduler.spawn().unwrap();
            Self {
                streams,
                shared,
                control,
                events: rx,
                handle: Some(handle),
            }
        }

        fn queue(&self, kind: MediaKind) -> &Arc<UnitQueue> {
            &self.streams.iter().find(|s| s.info.kind == kind).unwrap().queue
        }

        fn wait_until(&self, mut condition: impl FnMut() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !condition() {
                assert!(Instant::now() < deadline, "condition not reached");
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn stop(&mut self) {
            self.control.abort();
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn drain(queue: &UnitQueue) -> Vec<CompressedUnit> {
        let mut units = Vec::new();
        while let Ok(Some((unit, _))) = queue.get(false) {
            units.push(unit);
        }
        units
    }

    fn count_eos(units: &[CompressedUnit]) -> usize {
        units
            .iter()
            .filter(|u| matches!(u, CompressedUnit::EndOfStream { .. }))
            .count()
    }

    #[test]
    fn test_single_pending_seek() {
        let control = ReadControl::new();
        assert!(control.request_seek(SeekRequest::absolute(0)));
        assert!(!control.request_seek(SeekRequest::absolute(100)));
        assert_eq!(control.pending_seek().map(|r| r.target), Some(0));
        control.complete_seek();
        assert!(!control.is_seek_pending());
        assert!(control.request_seek(SeekRequest::absolute(100)));
    }

    #[test]
    fn test_routes_packets_and_applies_backpressure() {
        let mut session = Session::start(
            SyntheticSpec {
                duration: 60.0,
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let video = session.queue(MediaKind::Video).clone();
        let audio = session.queue(MediaKind::Audio).clone();
        session.wait_until(|| video.len() > 25 && audio.len() > 25);
        thread::sleep(Duration::from_millis(50));
        let settled = (video.len(), audio.len());
        thread::sleep(Duration::from_millis(50));
        assert_eq!((video.len(), audio.len()), settled);
        session.stop();

        for unit in drain(&video) {
            if let CompressedUnit::Data(packet) = unit {
                assert_eq!(packet.stream_index, 0);
            }
        }
    }

    #[test]
    fn test_reader_tracks_source_position() {
        let mut session = Session::start(
            SyntheticSpec {
                duration: 60.0,
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let video = session.queue(MediaKind::Video).clone();
        session.wait_until(|| video.len() > 25);
        session.stop();

        let position = session.control.last_position().unwrap();
        let newest = drain(&video)
            .into_iter()
            .filter_map(|unit| match unit {
                CompressedUnit::Data(packet) => packet.pos,
                _ => None,
            })
            .max()
            .unwrap();
        assert!(position >= newest, "reader at {} behind packet at {}", position, newest);
    }

    #[test]
    fn test_end_of_file_injected_once() {
        let mut session = Session::start(
            SyntheticSpec {
                duration: 0.2,
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let video = session.queue(MediaKind::Video).clone();
        session.wait_until(|| video.len() >= 7);
        thread::sleep(Duration::from_millis(60));
        session.stop();

        let units = drain(&video);
        assert_eq!(count_eos(&units), 1);
        assert!(matches!(units.last(), Some(CompressedUnit::EndOfStream { stream_index: 0 })));
    }

    #[test]
    fn test_seek_flushes_and_resets_external_clock() {
        let session = Session::start(
            SyntheticSpec {
                duration: 0.5,
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let video = session.queue(MediaKind::Video).clone();
        session.wait_until(|| video.stats().units >= 14);

        session.shared.clocks.lock().set_paused(true);
        session.shared.set_paused(true);
        assert!(session.control.request_seek(SeekRequest::absolute(0)));

        session.wait_until(|| video.generation() == 2);
        session.wait_until(|| !session.control.is_seek_pending());
        assert!(session.shared.has_step_request());
        assert_eq!(session.shared.clocks.lock().external.pts(), 0.0);

        let units = drain(&video);
        assert!(units[0].is_flush());
    }

    #[test]
    fn test_play_range_drops_late_packets() {
        let mut session = Session::start(
            SyntheticSpec {
                duration: 2.0,
                audio: false,
                ..Default::default()
            },
            PlayerConfig {
                duration: Some(0.5),
                ..Default::default()
            },
        );
        let video = session.queue(MediaKind::Video).clone();
        session.wait_until(|| video.len() >= 15);
        thread::sleep(Duration::from_millis(30));
        session.stop();

        let units = drain(&video);
        let data = units.iter().filter(|u| matches!(u, CompressedUnit::Data(_))).count();
        assert_eq!(data, 13);
    }

    #[test]
    fn test_fatal_read_error_terminates() {
        let session = Session::start(
            SyntheticSpec {
                fail_after: Some(5),
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let event = session.events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            event,
            PlayerEvent::Terminated {
                reason: TerminationReason::Error(_)
            }
        ));
    }

    #[test]
    fn test_autoexit_after_last_loop() {
        let session = Session::start(
            SyntheticSpec {
                duration: 0.2,
                ..Default::default()
            },
            PlayerConfig {
                autoexit: true,
                loop_count: 2,
                ..Default::default()
            },
        );
        let mark_done = |generation: i32| {
            for stream in &session.streams {
                stream.finished.store(generation, Ordering::SeqCst);
            }
        };

        // First pass ends: loop back to the start
        mark_done(1);
        let video = session.queue(MediaKind::Video).clone();
        session.wait_until(|| video.generation() == 2);
        assert!(session.events.try_recv().is_err());

        // Second pass ends: autoexit
        mark_done(2);
        let event = session.events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            event,
            PlayerEvent::Terminated {
                reason: TerminationReason::EndOfFile
            }
        ));
    }

    #[test]
    fn test_attached_picture_queued() {
        let mut session = Session::start(
            SyntheticSpec {
                video: false,
                cover_art: true,
                audio: false,
                ..Default::default()
            },
            PlayerConfig::default(),
        );
        let cover = session.queue(MediaKind::Video).clone();
        session.wait_until(|| cover.len() >= 3);
        session.stop();

        let units = drain(&cover);
        assert!(units[0].is_flush());
        assert!(matches!(&units[1], CompressedUnit::Data(p) if p.keyframe));
        assert!(matches!(units[2], CompressedUnit::EndOfStream { .. }));
    }

    #[test]
    fn test_abort_stops_reader() {
        let mut session = Session::start(SyntheticSpec::default(), PlayerConfig::default());
        thread::sleep(Duration::from_millis(20));
        session.stop();
        assert!(session.handle.is_none());
    }
}
