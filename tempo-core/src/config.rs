//! Session configuration
//!
//! One `PlayerConfig` per session, shared by `Arc` with every component.
//! Stored as JSON under the user config directory.

use crate::decode::PtsPolicy;
use crate::frame::MediaKind;
use crate::present::ShowMode;
use crate::sync::{FrameDropPolicy, SyncMaster, REFRESH_RATE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sync: SyncMaster,
    pub frame_drop: FrameDropPolicy,
    pub pts_policy: PtsPolicy,
    /// None: unlimited buffering for realtime sources only
    pub infinite_buffer: Option<bool>,
    /// Passes through the source; 0 loops forever
    pub loop_count: u32,
    pub autoexit: bool,
    /// Seconds
    pub start_time: Option<f64>,
    /// Seconds of playback after `start_time`
    pub duration: Option<f64>,
    /// None: by bytes for formats with timestamp discontinuities
    pub seek_by_bytes: Option<bool>,
    /// Step used by the seek keys, in seconds
    pub seek_interval: f64,
    /// Initial volume in percent
    pub volume: u8,
    pub volume_step_db: f64,
    pub show_mode: Option<ShowMode>,
    /// Seconds between visualization redraws
    pub visualization_interval: f64,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub disable_subtitles: bool,
    pub video_stream: Option<usize>,
    pub audio_stream: Option<usize>,
    pub subtitle_stream: Option<usize>,
    pub show_status: bool,
    /// Upper bound on the refresh loop sleep, in seconds
    pub refresh_rate: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync: SyncMaster::default(),
            frame_drop: FrameDropPolicy::default(),
            pts_policy: PtsPolicy::default(),
            infinite_buffer: None,
            loop_count: 1,
            autoexit: false,
            start_time: None,
            duration: None,
            seek_by_bytes: None,
            seek_interval: 10.0,
            volume: 50,
            volume_step_db: 0.75,
            show_mode: None,
            visualization_interval: 0.02,
            disable_audio: false,
            disable_video: false,
            disable_subtitles: false,
            video_stream: None,
            audio_stream: None,
            subtitle_stream: None,
            show_status: true,
            refresh_rate: REFRESH_RATE,
        }
    }
}

impl PlayerConfig {
    /// `dirs::config_dir()/tempo/config.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("tempo");
        path.push("config.json");
        path
    }

    /// Load from `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    pub fn is_disabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.disable_video,
            MediaKind::Audio => self.disable_audio,
            MediaKind::Subtitle => self.disable_subtitles,
        }
    }

    /// Stream index explicitly requested for `kind`
    pub fn wanted_stream(&self, kind: MediaKind) -> Option<usize> {
        match kind {
            MediaKind::Video => self.video_stream,
            MediaKind::Audio => self.audio_stream,
            MediaKind::Subtitle => self.subtitle_stream,
        }
    }

    /// Passes through the source remaining after the current one, None when
    /// looping forever.
    pub fn loops_after(&self, completed: u32) -> Option<u32> {
        match self.loop_count {
            0 => None,
            n => Some(n.saturating_sub(completed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.sync, SyncMaster::Video);
        assert_eq!(config.frame_drop, FrameDropPolicy::Auto);
        assert_eq!(config.volume, 50);
        assert_eq!(config.loop_count, 1);
        assert_eq!(config.refresh_rate, 0.01);
        assert!(!config.is_disabled(MediaKind::Audio));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlayerConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.seek_interval, 10.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = PlayerConfig {
            sync: SyncMaster::External,
            autoexit: true,
            loop_count: 3,
            show_mode: Some(ShowMode::Waves),
            disable_subtitles: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PlayerConfig::load(&path).unwrap();
        assert_eq!(loaded.sync, SyncMaster::External);
        assert!(loaded.autoexit);
        assert_eq!(loaded.loop_count, 3);
        assert_eq!(loaded.show_mode, Some(ShowMode::Waves));
        assert!(loaded.is_disabled(MediaKind::Subtitle));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "sync": "audio", "frame_drop": "never" }"#).unwrap();

        let config = PlayerConfig::load(&path).unwrap();
        assert_eq!(config.sync, SyncMaster::Audio);
        assert_eq!(config.frame_drop, FrameDropPolicy::Never);
        assert_eq!(config.volume, 50);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PlayerConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_loops_after() {
        let mut config = PlayerConfig::default();
        assert_eq!(config.loops_after(1), Some(0));
        config.loop_count = 3;
        assert_eq!(config.loops_after(1), Some(2));
        config.loop_count = 0;
        assert_eq!(config.loops_after(100), None);
    }
}
