//! Decoded frame types shared by decoders, rings and sinks.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// Time Bases
// ============================================================================

/// Rational number used for time bases, frame rates and aspect ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

/// Alias used where the value is a ratio rather than a time base
pub type Rational = TimeBase;

/// Microsecond time base used for seek targets and subtitle timestamps
pub const MICROSECONDS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn to_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Inverse ratio, e.g. a frame rate turned into a frame duration.
    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }

    pub fn seconds(&self, ts: i64) -> f64 {
        ts as f64 * self.to_f64()
    }

    /// Convert `ts` from this time base into `to`, rounding to nearest.
    pub fn rescale(&self, ts: i64, to: TimeBase) -> i64 {
        if !to.is_valid() {
            return ts;
        }
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return ts;
        }
        // Round half away from zero
        let mut quotient = num / den;
        let remainder = num % den;
        if remainder.abs() * 2 >= den.abs() {
            quotient += if (num < 0) == (den < 0) { 1 } else { -1 };
        }
        quotient.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

/// Layout of decoded picture data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 4:2:0, chroma planes rounded up for odd sizes
    Yuv420p,
    Rgba32,
}

impl PixelFormat {
    /// Bytes in one tightly packed picture
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            Self::Yuv420p => w * h + 2 * w.div_ceil(2) * h.div_ceil(2),
            Self::Rgba32 => w * h * 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Picture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sample_aspect_ratio: Rational,
    /// Timestamp the decoder attached to the frame
    pub pts: Option<i64>,
    /// Decode timestamp of the packet that produced the frame
    pub pkt_dts: Option<i64>,
    /// Decoder's reordered guess at the presentation timestamp
    pub best_effort_timestamp: Option<i64>,
    pub pos: Option<i64>,
}

impl Picture {
    /// Whether `data` holds a full picture of the advertised size
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.format.frame_len(self.width, self.height)
    }
}

/// Interleaved f32 audio
#[derive(Debug, Clone)]
pub struct AudioSamples {
    pub data: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub pts: Option<i64>,
    pub pos: Option<i64>,
}

impl AudioSamples {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / self.channels as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Palettized bitmap, one byte per pixel
    pub pixels: Vec<u8>,
    pub palette: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubtitleContent {
    Bitmap(Vec<SubtitleRect>),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Subtitle {
    /// Presentation timestamp in microseconds
    pub pts: Option<i64>,
    pub start_display_ms: u32,
    pub end_display_ms: u32,
    pub content: SubtitleContent,
}

/// What a decoder hands back
#[derive(Debug, Clone)]
pub enum DecodedPayload {
    Picture(Picture),
    Samples(AudioSamples),
    Subtitle(Subtitle),
}

impl DecodedPayload {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Picture(_) => MediaKind::Video,
            Self::Samples(_) => MediaKind::Audio,
            Self::Subtitle(_) => MediaKind::Subtitle,
        }
    }
}

// ============================================================================
// Decoded Frame
// ============================================================================

/// A timestamped frame waiting in a ring.
///
/// `pts` is in seconds; NaN means the timestamp is unknown and only the
/// duration can be trusted.
#[derive(Debug)]
pub struct DecodedFrame {
    pub payload: DecodedPayload,
    pub generation: i32,
    pub pts: f64,
    pub duration: f64,
    /// Byte position in the source, -1 when unknown
    pub pos: i64,
    pub width: u32,
    pub height: u32,
    pub format: Option<PixelFormat>,
    pub sample_aspect_ratio: Rational,
    uploaded: AtomicBool,
}

impl DecodedFrame {
    pub fn new(payload: DecodedPayload, generation: i32, pts: f64, duration: f64, pos: i64) -> Self {
        let (width, height, format, sample_aspect_ratio) = match &payload {
            DecodedPayload::Picture(p) => (p.width, p.height, Some(p.format), p.sample_aspect_ratio),
            _ => (0, 0, None, Rational::new(0, 1)),
        };
        Self {
            payload,
            generation,
            pts,
            duration,
            pos,
            width,
            height,
            format,
            sample_aspect_ratio,
            uploaded: AtomicBool::new(false),
        }
    }

    /// Override the dimensions, used for subtitles sized to the video.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn picture(&self) -> Option<&Picture> {
        match &self.payload {
            DecodedPayload::Picture(p) => Some(p),
            _ => None,
        }
    }

    pub fn samples(&self) -> Option<&AudioSamples> {
        match &self.payload {
            DecodedPayload::Samples(s) => Some(s),
            _ => None,
        }
    }

    pub fn subtitle(&self) -> Option<&Subtitle> {
        match &self.payload {
            DecodedPayload::Subtitle(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the presentation sink already holds this frame.
    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn mark_uploaded(&self) {
        self.uploaded.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale() {
        let tb = TimeBase::new(1, 90_000);
        assert_eq!(tb.rescale(90_000, TimeBase::new(1, 48_000)), 48_000);
        assert_eq!(tb.rescale(3_003, TimeBase::new(1, 1000)), 33);
        assert_eq!(tb.rescale(-3_003, TimeBase::new(1, 1000)), -33);
        assert_eq!(TimeBase::new(1, 3).rescale(1, TimeBase::new(1, 2)), 1);
    }

    #[test]
    fn test_seconds() {
        let tb = TimeBase::new(1, 25);
        assert!((tb.seconds(50) - 2.0).abs() < 1e-12);
        assert_eq!(TimeBase::new(25, 1).invert(), TimeBase::new(1, 25));
    }

    #[test]
    fn test_picture_frame_len() {
        assert_eq!(PixelFormat::Rgba32.frame_len(64, 36), 64 * 36 * 4);
        assert_eq!(PixelFormat::Yuv420p.frame_len(4, 2), 8 + 2 * 2);
        // Odd sizes round the chroma planes up
        assert_eq!(PixelFormat::Yuv420p.frame_len(3, 3), 9 + 2 * 4);

        let mut picture = Picture {
            data: vec![0; 12],
            width: 4,
            height: 2,
            format: PixelFormat::Yuv420p,
            sample_aspect_ratio: Rational::new(1, 1),
            pts: None,
            pkt_dts: None,
            best_effort_timestamp: None,
            pos: None,
        };
        assert!(picture.is_complete());
        picture.data.truncate(11);
        assert!(!picture.is_complete());
    }

    #[test]
    fn test_audio_frames() {
        let samples = AudioSamples {
            data: vec![0.0; 960],
            channels: 2,
            sample_rate: 48_000,
            pts: None,
            pos: None,
        };
        assert_eq!(samples.frames(), 480);
    }

    #[test]
    fn test_uploaded_flag() {
        let payload = DecodedPayload::Subtitle(Subtitle {
            pts: Some(0),
            start_display_ms: 0,
            end_display_ms: 1000,
            content: SubtitleContent::Text("hi".into()),
        });
        let frame = DecodedFrame::new(payload, 1, 0.0, 0.0, -1).with_size(640, 360);
        assert_eq!(frame.width, 640);
        assert!(!frame.is_uploaded());
        frame.mark_uploaded();
        assert!(frame.is_uploaded());
    }
}
