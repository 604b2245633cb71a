//! Presentation sink interface
//!
//! Texture upload, pixel format conversion and subtitle compositing belong
//! to the sink. Frames arrive fully timed; the sink only has to draw them,
//! synchronously and in bounded time.

use crate::frame::DecodedFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("Upload failed: {0}")]
    UploadFailed(String),
    #[error("Display lost")]
    DisplayLost,
}

/// What the refresh loop shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowMode {
    None = 0,
    Video = 1,
    /// Audio waveform
    Waves = 2,
    /// Audio spectrum
    Rdft = 3,
}

impl ShowMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Video,
            2 => Self::Waves,
            3 => Self::Rdft,
            _ => Self::None,
        }
    }

    pub fn is_visualization(&self) -> bool {
        matches!(self, Self::Waves | Self::Rdft)
    }

    /// Following mode in display cycling order.
    pub fn next(&self) -> Self {
        match self {
            Self::None | Self::Rdft => Self::Video,
            Self::Video => Self::Waves,
            Self::Waves => Self::Rdft,
        }
    }
}

pub trait PresentationSink {
    /// Draw a picture, with the subtitle that is due at its timestamp.
    ///
    /// Frames already marked uploaded only need to be redrawn.
    fn present_picture(&mut self, frame: &DecodedFrame, subtitle: Option<&DecodedFrame>) -> Result<(), PresentError>;

    /// Draw an audio visualization from the most recent output samples.
    fn present_visualization(&mut self, mode: ShowMode, samples: &[f32]) -> Result<(), PresentError> {
        let _ = (mode, samples);
        Ok(())
    }
}

/// Sink that draws nothing and logs what it would show
#[derive(Debug, Default)]
pub struct NullSink {
    pub pictures: u64,
    pub last_pts: Option<f64>,
}

impl PresentationSink for NullSink {
    fn present_picture(&mut self, frame: &DecodedFrame, subtitle: Option<&DecodedFrame>) -> Result<(), PresentError> {
        self.pictures += 1;
        self.last_pts = Some(frame.pts);
        tracing::trace!(
            pts = frame.pts,
            width = frame.width,
            height = frame.height,
            subtitle = subtitle.is_some(),
            "present picture"
        );
        Ok(())
    }
}
