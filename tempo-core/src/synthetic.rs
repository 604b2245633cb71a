//! # Synthetic Source
//!
//! Test-pattern demuxer and decoders: a colour-cycling picture stream, a
//! sine tone and one text subtitle per second. Packets carry their index so
//! the decoders can rebuild the content without any codec.
//!
//! Used by the headless player and by session tests.

use crate::decode::{DecodeError, Decoder, ReceiveStatus, SendStatus};
use crate::demux::{DemuxError, Demuxer, SeekRequest, StreamInfo};
use crate::frame::{
    AudioSamples, DecodedPayload, MediaKind, Picture, PixelFormat, Rational, Subtitle, SubtitleContent, TimeBase,
    MICROSECONDS,
};
use crate::player::MediaBackend;
use crate::signal::CancelToken;
use crate::unit_queue::Packet;
use std::collections::VecDeque;
use std::time::Instant;

const VIDEO_TIME_BASE: TimeBase = TimeBase::new(1, 90_000);
const SUBTITLE_TIME_BASE: TimeBase = TimeBase::new(1, 1000);
/// Pictures between keyframes
const GOP_SIZE: u64 = 12;
const VIDEO_PACKET_BYTES: usize = 1024;
const AUDIO_PACKET_BYTES: usize = 256;
const SUBTITLE_PACKET_BYTES: usize = 32;
const TONE_HZ: f32 = 440.0;

/// Shape of the generated source
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    /// Seconds
    pub duration: f64,
    pub video: bool,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub audio: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub subtitles: bool,
    /// A still cover picture instead of moving video
    pub cover_art: bool,
    /// Packets become available at their timestamp, like a live feed
    pub realtime: bool,
    /// Report a broken source after this many packets
    pub fail_after: Option<u64>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            duration: 5.0,
            video: true,
            frame_rate: 25,
            width: 64,
            height: 36,
            audio: true,
            sample_rate: 8000,
            channels: 2,
            subtitles: false,
            cover_art: false,
            realtime: false,
            fail_after: None,
        }
    }
}

impl SyntheticSpec {
    fn audio_block(&self) -> u64 {
        (self.sample_rate / 25).max(1) as u64
    }

    /// Bytes per second of the generated stream, for byte positions
    fn byte_rate(&self) -> f64 {
        let mut rate = 0.0;
        if self.video {
            rate += (VIDEO_PACKET_BYTES as u64 * self.frame_rate as u64) as f64;
        }
        if self.audio {
            rate += AUDIO_PACKET_BYTES as f64 * self.sample_rate as f64 / self.audio_block() as f64;
        }
        if self.subtitles {
            rate += SUBTITLE_PACKET_BYTES as f64;
        }
        rate.max(1.0)
    }
}

// ============================================================================
// Demuxer
// ============================================================================

struct Track {
    index: usize,
    kind: MediaKind,
    time_base: TimeBase,
    /// Timestamp step per packet, in `time_base`
    step: i64,
    count: u64,
    next: u64,
    bytes: usize,
}

impl Track {
    fn seconds(&self, packet: u64) -> f64 {
        self.time_base.seconds(packet as i64 * self.step)
    }

    fn done(&self) -> bool {
        self.next >= self.count
    }
}

pub struct SyntheticDemuxer {
    spec: SyntheticSpec,
    streams: Vec<StreamInfo>,
    tracks: Vec<Track>,
    opened: Instant,
    /// Wall-clock offset of a realtime source after a pause
    paused_at: Option<Instant>,
    delivered: u64,
}

impl SyntheticDemuxer {
    pub fn new(spec: SyntheticSpec) -> Self {
        let mut streams = Vec::new();
        let mut tracks = Vec::new();

        if spec.video && spec.frame_rate > 0 {
            let index = streams.len();
            let mut info = StreamInfo::new(index, MediaKind::Video, VIDEO_TIME_BASE);
            info.codec = "synthetic-video".into();
            info.start_time = Some(0);
            info.frame_rate = Some(Rational::new(spec.frame_rate as i32, 1));
            info.sample_aspect_ratio = Rational::new(1, 1);
            info.width = spec.width;
            info.height = spec.height;
            streams.push(info);
            tracks.push(Track {
                index,
                kind: MediaKind::Video,
                time_base: VIDEO_TIME_BASE,
                step: (VIDEO_TIME_BASE.den / spec.frame_rate as i32) as i64,
                count: (spec.duration * spec.frame_rate as f64).ceil() as u64,
                next: 0,
                bytes: VIDEO_PACKET_BYTES,
            });
        } else if spec.cover_art {
            let index = streams.len();
            let mut info = StreamInfo::new(index, MediaKind::Video, VIDEO_TIME_BASE);
            info.codec = "synthetic-cover".into();
            info.width = spec.width;
            info.height = spec.height;
            let mut picture = Packet::new(index, 0u64.to_le_bytes().to_vec());
            picture.pts = Some(0);
            picture.dts = Some(0);
            picture.keyframe = true;
            info.attached_picture = Some(picture);
            streams.push(info);
        }

        if spec.audio && spec.sample_rate > 0 && spec.channels > 0 {
            let index = streams.len();
            let time_base = TimeBase::new(1, spec.sample_rate as i32);
            let mut info = StreamInfo::new(index, MediaKind::Audio, time_base);
            info.codec = "synthetic-tone".into();
            info.start_time = Some(0);
            info.sample_rate = spec.sample_rate;
            info.channels = spec.channels;
            streams.push(info);
            let block = spec.audio_block();
            tracks.push(Track {
                index,
                kind: MediaKind::Audio,
                time_base,
                step: block as i64,
                count: (spec.duration * spec.sample_rate as f64 / block as f64).ceil() as u64,
                next: 0,
                bytes: AUDIO_PACKET_BYTES,
            });
        }

        if spec.subtitles {
            let index = streams.len();
            let mut info = StreamInfo::new(index, MediaKind::Subtitle, SUBTITLE_TIME_BASE);
            info.codec = "synthetic-text".into();
            info.width = spec.width;
            info.height = spec.height;
            streams.push(info);
            tracks.push(Track {
                index,
                kind: MediaKind::Subtitle,
                time_base: SUBTITLE_TIME_BASE,
                step: 1000,
                count: spec.duration.floor() as u64,
                next: 0,
                bytes: SUBTITLE_PACKET_BYTES,
            });
        }

        Self {
            spec,
            streams,
            tracks,
            opened: Instant::now(),
            paused_at: None,
            delivered: 0,
        }
    }

    fn elapsed(&self) -> f64 {
        let now = self.paused_at.unwrap_or_else(Instant::now);
        now.duration_since(self.opened).as_secs_f64()
    }

    fn packet(&self, track: &Track, number: u64) -> Packet {
        let mut data = vec![0u8; track.bytes];
        data[..8].copy_from_slice(&number.to_le_bytes());
        let ts = number as i64 * track.step;
        let mut packet = Packet::new(track.index, data);
        packet.pts = Some(ts);
        packet.dts = Some(ts);
        packet.duration = track.step;
        packet.pos = Some((track.seconds(number) * self.spec.byte_rate()) as i64);
        packet.keyframe = track.kind != MediaKind::Video || number % GOP_SIZE == 0;
        packet
    }
}

impl Demuxer for SyntheticDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self, cancel: &CancelToken) -> Result<Packet, DemuxError> {
        if cancel.is_cancelled() {
            return Err(DemuxError::Interrupted);
        }
        if let Some(limit) = self.spec.fail_after {
            if self.delivered >= limit {
                return Err(DemuxError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "synthetic source broke off",
                )));
            }
        }
        if self.spec.realtime && self.paused_at.is_some() {
            return Err(DemuxError::WouldBlock);
        }

        let next = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.done())
            .min_by(|(_, a), (_, b)| a.seconds(a.next).total_cmp(&b.seconds(b.next)))
            .map(|(i, t)| (i, t.seconds(t.next)));
        let Some((slot, at)) = next else {
            return Err(DemuxError::EndOfFile);
        };
        if self.spec.realtime && at > self.elapsed() {
            return Err(DemuxError::WouldBlock);
        }

        let track = &self.tracks[slot];
        let packet = self.packet(track, track.next);
        self.tracks[slot].next += 1;
        self.delivered += 1;
        Ok(packet)
    }

    fn seek(&mut self, request: &SeekRequest, cancel: &CancelToken) -> Result<(), DemuxError> {
        if cancel.is_cancelled() {
            return Err(DemuxError::Interrupted);
        }
        if self.spec.realtime {
            return Err(DemuxError::Unsupported("seek on a live source"));
        }
        let to_seconds = |value: i64| {
            if request.by_bytes {
                value as f64 / self.spec.byte_rate()
            } else {
                MICROSECONDS.seconds(value)
            }
        };
        let target = to_seconds(request.target).clamp(0.0, self.spec.duration);
        let (min, max) = (to_seconds(request.min), to_seconds(request.max));

        // Land on the keyframe at or before the target, or the next one if
        // that falls short of the window.
        let mut landing = target;
        if let Some(video) = self.tracks.iter().find(|t| t.kind == MediaKind::Video) {
            let frame = (target / video.time_base.seconds(video.step)).floor() as u64;
            let mut key = frame - frame % GOP_SIZE;
            if video.seconds(key) < min {
                key += GOP_SIZE;
            }
            landing = video.seconds(key);
            if landing > max || key > video.count {
                return Err(DemuxError::SeekFailed(format!("no keyframe near {:.3}s", target)));
            }
        }

        for track in &mut self.tracks {
            let step = track.time_base.seconds(track.step);
            let first = ((landing / step) - 1e-9).ceil().max(0.0) as u64;
            track.next = first.min(track.count);
        }
        tracing::debug!(target = target, landing = landing, "synthetic seek");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DemuxError> {
        if !self.spec.realtime {
            return Err(DemuxError::Unsupported("read pause"));
        }
        self.paused_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn play(&mut self) -> Result<(), DemuxError> {
        if let Some(paused_at) = self.paused_at.take() {
            self.opened += paused_at.elapsed();
        }
        Ok(())
    }

    fn is_realtime(&self) -> bool {
        self.spec.realtime
    }

    fn start_time(&self) -> Option<i64> {
        Some(0)
    }

    fn duration(&self) -> Option<i64> {
        Some((self.spec.duration * 1_000_000.0) as i64)
    }

    fn position(&self) -> Option<i64> {
        let seconds = self
            .tracks
            .iter()
            .filter(|t| !t.done())
            .map(|t| t.seconds(t.next))
            .fold(f64::INFINITY, f64::min);
        let seconds = if seconds.is_finite() { seconds } else { self.spec.duration };
        Some((seconds * self.spec.byte_rate()) as i64)
    }

    fn bit_rate(&self) -> Option<u64> {
        Some((self.spec.byte_rate() * 8.0) as u64)
    }
}

// ============================================================================
// Decoder
// ============================================================================

pub struct SyntheticDecoder {
    stream: StreamInfo,
    output: VecDeque<DecodedPayload>,
    draining: bool,
}

impl SyntheticDecoder {
    pub fn new(stream: StreamInfo) -> Self {
        Self {
            stream,
            output: VecDeque::new(),
            draining: false,
        }
    }

    fn decode(&self, packet: &Packet) -> Result<DecodedPayload, DecodeError> {
        let number = packet
            .data
            .get(..8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| DecodeError::DecodeFailed("truncated synthetic packet".into()))?;

        Ok(match self.stream.kind {
            MediaKind::Video => {
                let (w, h) = (self.stream.width.max(1), self.stream.height.max(1));
                let shade = (number * 8 % 256) as u8;
                let data = [shade, 255 - shade, 128, 255].repeat((w * h) as usize);
                DecodedPayload::Picture(Picture {
                    data,
                    width: w,
                    height: h,
                    format: PixelFormat::Rgba32,
                    sample_aspect_ratio: self.stream.sample_aspect_ratio,
                    pts: packet.pts,
                    pkt_dts: packet.dts,
                    best_effort_timestamp: packet.pts,
                    pos: packet.pos,
                })
            }
            MediaKind::Audio => {
                let channels = self.stream.channels.max(1) as usize;
                let frames = packet.duration.max(1) as u64;
                let rate = self.stream.sample_rate.max(1) as f32;
                let start = packet.pts.unwrap_or(0) as u64;
                let mut data = Vec::with_capacity(frames as usize * channels);
                for i in 0..frames {
                    let t = (start + i) as f32 / rate;
                    let value = (t * TONE_HZ * std::f32::consts::TAU).sin() * 0.25;
                    data.extend(std::iter::repeat(value).take(channels));
                }
                DecodedPayload::Samples(AudioSamples {
                    data,
                    channels: channels as u16,
                    sample_rate: self.stream.sample_rate,
                    pts: packet.pts,
                    pos: packet.pos,
                })
            }
            MediaKind::Subtitle => DecodedPayload::Subtitle(Subtitle {
                pts: packet.pts.map(|ts| self.stream.time_base.rescale(ts, MICROSECONDS)),
                start_display_ms: 0,
                end_display_ms: 500,
                content: SubtitleContent::Text(format!("Subtitle {}", number + 1)),
            }),
        })
    }
}

impl Decoder for SyntheticDecoder {
    fn kind(&self) -> MediaKind {
        self.stream.kind
    }

    fn send(&mut self, packet: Option<&Packet>) -> Result<SendStatus, DecodeError> {
        match packet {
            Some(packet) => {
                let payload = self.decode(packet)?;
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
    }

    fn name(&self) -> &str {
        &self.stream.codec
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Opens every source as a synthetic stream of the given shape
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    pub spec: SyntheticSpec,
}

impl SyntheticBackend {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self { spec }
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_demuxer(&self, source: &str, cancel: &CancelToken) -> Result<Box<dyn Demuxer>, DemuxError> {
        if cancel.is_cancelled() {
            return Err(DemuxError::Interrupted);
        }
        tracing::debug!(source, duration = self.spec.duration, "opening synthetic source");
        Ok(Box::new(SyntheticDemuxer::new(self.spec.clone())))
    }

    fn open_decoder(&self, stream: &StreamInfo) -> Result<Box<dyn Decoder>, DecodeError> {
        if !stream.codec.starts_with("synthetic") {
            return Err(DecodeError::NoDecoder {
                codec: stream.codec.clone(),
            });
        }
        Ok(Box::new(SyntheticDecoder::new(stream.clone())))
    }
}
