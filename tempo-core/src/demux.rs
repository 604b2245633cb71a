//! # Demuxer Interface
//!
//! The container parser lives outside this crate. The read thread only needs
//! packets tagged with a stream index and timestamps, bounded seeking, and a
//! clear distinction between end of file and a broken source.

use crate::frame::{MediaKind, Rational, TimeBase};
use crate::signal::CancelToken;
use crate::unit_queue::Packet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("End of file")]
    EndOfFile,
    #[error("No packet available yet")]
    WouldBlock,
    #[error("Interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to open {source_ref}: {reason}")]
    Open { source_ref: String, reason: String },
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl DemuxError {
    /// Errors after which reading cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Open { .. })
    }
}

/// Description of one elementary stream in the container
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec: String,
    pub time_base: TimeBase,
    /// First timestamp in `time_base`
    pub start_time: Option<i64>,
    pub frame_rate: Option<Rational>,
    pub sample_aspect_ratio: Rational,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Cover art carried by an otherwise empty video stream
    pub attached_picture: Option<Packet>,
}

impl StreamInfo {
    pub fn new(index: usize, kind: MediaKind, time_base: TimeBase) -> Self {
        Self {
            index,
            kind,
            codec: String::new(),
            time_base,
            start_time: None,
            frame_rate: None,
            sample_aspect_ratio: Rational::new(0, 1),
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            attached_picture: None,
        }
    }
}

/// Seek window in microseconds, or bytes for byte seeks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub min: i64,
    pub target: i64,
    pub max: i64,
    pub by_bytes: bool,
}

impl SeekRequest {
    /// Window that keeps the landing point on the requested side of the
    /// current position.
    pub fn new(target: i64, relative: i64, by_bytes: bool) -> Self {
        let min = if relative > 0 {
            target.saturating_sub(relative).saturating_add(2)
        } else {
            i64::MIN
        };
        let max = if relative < 0 {
            target.saturating_sub(relative).saturating_sub(2)
        } else {
            i64::MAX
        };
        Self { min, target, max, by_bytes }
    }

    /// Unbounded seek to an absolute position.
    pub fn absolute(target: i64) -> Self {
        Self::new(target, 0, false)
    }
}

pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Next packet in file order.
    fn read_packet(&mut self, cancel: &CancelToken) -> Result<Packet, DemuxError>;

    fn seek(&mut self, request: &SeekRequest, cancel: &CancelToken) -> Result<(), DemuxError>;

    /// Pause a network source. Local files report `Unsupported`.
    fn pause(&mut self) -> Result<(), DemuxError> {
        Err(DemuxError::Unsupported("read pause"))
    }

    fn play(&mut self) -> Result<(), DemuxError> {
        Ok(())
    }

    /// Live sources are paced by the sender, not by us.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Container start time in microseconds
    fn start_time(&self) -> Option<i64> {
        None
    }

    /// Container duration in microseconds
    fn duration(&self) -> Option<i64> {
        None
    }

    /// Formats such as MPEG-TS whose timestamps may jump
    fn has_timestamp_discontinuities(&self) -> bool {
        false
    }

    /// Current byte offset in the source
    fn position(&self) -> Option<i64> {
        None
    }

    /// Overall bit rate in bits per second
    fn bit_rate(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_seek_window() {
        let request = SeekRequest::new(10_000_000, 5_000_000, false);
        assert_eq!(request.min, 5_000_002);
        assert_eq!(request.max, i64::MAX);
    }

    #[test]
    fn test_backward_seek_window() {
        let request = SeekRequest::new(10_000_000, -5_000_000, false);
        assert_eq!(request.min, i64::MIN);
        assert_eq!(request.max, 14_999_998);
    }

    #[test]
    fn test_absolute_seek_window() {
        let request = SeekRequest::absolute(42);
        assert_eq!((request.min, request.target, request.max), (i64::MIN, 42, i64::MAX));
        assert!(!request.by_bytes);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!DemuxError::EndOfFile.is_fatal());
        assert!(!DemuxError::WouldBlock.is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(DemuxError::from(io).is_fatal());
    }
}
