//! # Tempo Core
//!
//! Real-time audio/video playback engine: demux, decode, buffer, and keep
//! the streams locked to a master clock.

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod signal;
pub mod sync;

// ============================================================================
// Buffering
// ============================================================================
pub mod frame;
pub mod unit_queue;
pub mod frame_ring;

// ============================================================================
// Pipeline Stages
// ============================================================================
pub mod demux;
pub mod decode;
pub mod scheduler;
pub mod audio;
pub mod present;

// ============================================================================
// Session
// ============================================================================
pub mod config;
pub mod player;
pub mod synthetic;

pub use config::PlayerConfig;
pub use player::{MediaBackend, Player, PlayerError, PlayerEvent, TerminationReason};
pub use sync::{FrameDropPolicy, SyncMaster};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
