//! # Tempo Player
//!
//! Headless driver for the playback engine. Plays a generated source,
//! runs the display loop against a logging sink, and replays a timeline
//! of control commands.
//!
//! ```text
//! tempo --length 6 --autoexit --script "1.5:pause,2:seek+2,2.5:step,3:pause"
//! ```
//!
//! `seek+` and `seek-` without an offset step by the configured seek
//! interval; `seek40%` jumps to a fraction of the source duration.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use tempo_core::audio::AudioBackend;
use tempo_core::frame::DecodedFrame;
use tempo_core::present::{PresentError, PresentationSink, ShowMode};
use tempo_core::synthetic::{SyntheticBackend, SyntheticSpec};
use tempo_core::{FrameDropPolicy, Player, PlayerConfig, PlayerEvent, SyncMaster, TerminationReason};

#[derive(Parser, Debug)]
#[command(name = "tempo", version, about = "Real-time A/V playback sync engine")]
struct Args {
    /// Source name shown in logs
    #[arg(default_value = "synthetic://clip")]
    source: String,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective config back to the config file
    #[arg(long)]
    save_config: bool,

    /// Length of the generated source, in seconds
    #[arg(long, default_value_t = 10.0)]
    length: f64,

    /// Deliver packets at their timestamps, like a live feed
    #[arg(long)]
    realtime: bool,

    /// Add a subtitle track
    #[arg(long)]
    subtitles: bool,

    /// Generate a cover picture instead of moving video
    #[arg(long)]
    cover_art: bool,

    /// Master clock: audio, video or external
    #[arg(long, value_parser = parse_enum::<SyncMaster>)]
    sync: Option<SyncMaster>,

    /// Late frame dropping: auto, always or never
    #[arg(long, value_parser = parse_enum::<FrameDropPolicy>)]
    framedrop: Option<FrameDropPolicy>,

    #[arg(long)]
    no_audio: bool,

    #[arg(long)]
    no_video: bool,

    /// Start position in seconds
    #[arg(long)]
    ss: Option<f64>,

    /// Play only this many seconds
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Passes through the source, 0 loops forever
    #[arg(long = "loop")]
    loop_count: Option<u32>,

    /// Exit at the end of playback
    #[arg(long)]
    autoexit: bool,

    /// Seek by byte position
    #[arg(long)]
    bytes: bool,

    /// Initial volume, 0-100
    #[arg(long)]
    volume: Option<u8>,

    /// Initial display mode: video, waves or rdft
    #[arg(long, value_parser = parse_enum::<ShowMode>)]
    showmode: Option<ShowMode>,

    /// Control timeline: comma separated `SECONDS:COMMAND`
    #[arg(long, default_value = "")]
    script: String,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<f64>,
}

/// Parse a lowercase config enum through its serde names.
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase())).map_err(|e| e.to_string())
}

// ============================================================================
// Control Script
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Pause,
    Step,
    Seek(f64),
    SeekStep { forward: bool },
    SeekTo(f64),
    VolumeUp,
    VolumeDown,
    Mute,
    Display,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pause" => Self::Pause,
            "step" => Self::Step,
            "volume+" => Self::VolumeUp,
            "volume-" => Self::VolumeDown,
            "mute" => Self::Mute,
            "display" => Self::Display,
            "quit" => Self::Quit,
            "seek+" => Self::SeekStep { forward: true },
            "seek-" => Self::SeekStep { forward: false },
            other => {
                let arg = other
                    .strip_prefix("seek")
                    .ok_or_else(|| anyhow!("unknown command '{}'", other))?;
                match arg.strip_suffix('%') {
                    Some(percent) => {
                        let percent: f64 = percent.parse().with_context(|| format!("bad seek percentage '{}'", arg))?;
                        Self::SeekTo(percent / 100.0)
                    }
                    None => Self::Seek(arg.parse().with_context(|| format!("bad seek offset '{}'", arg))?),
                }
            }
        })
    }
}

fn parse_script(script: &str) -> Result<Vec<(f64, Command)>> {
    let mut timeline = Vec::new();
    for entry in script.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (at, command) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("expected SECONDS:COMMAND, got '{}'", entry))?;
        let at: f64 = at.parse().with_context(|| format!("bad time in '{}'", entry))?;
        timeline.push((at, command.parse()?));
    }
    timeline.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(timeline)
}

fn seek_posted(posted: bool) {
    if !posted {
        tracing::warn!("Seek ignored");
    }
}

fn apply(player: &mut Player, command: Command) -> bool {
    tracing::info!(?command, "control");
    match command {
        Command::Pause => player.toggle_pause(),
        Command::Step => player.step_one_frame(),
        Command::Seek(delta) => seek_posted(player.seek(delta)),
        Command::SeekStep { forward } => seek_posted(player.seek_step(forward)),
        Command::SeekTo(fraction) => seek_posted(player.seek_to_fraction(fraction)),
        Command::VolumeUp => player.volume_up(),
        Command::VolumeDown => player.volume_down(),
        Command::Mute => {
            player.toggle_mute();
        }
        Command::Display => {
            player.toggle_alternate_display();
        }
        Command::Quit => return false,
    }
    true
}

// ============================================================================
// Logging Sink
// ============================================================================

/// Logs presented frames instead of drawing them
#[derive(Default)]
struct LogSink {
    pictures: u64,
    visualizations: u64,
}

impl PresentationSink for LogSink {
    fn present_picture(&mut self, frame: &DecodedFrame, subtitle: Option<&DecodedFrame>) -> Result<(), PresentError> {
        self.pictures += 1;
        if let Some(sp) = subtitle.filter(|sp| !sp.is_uploaded()) {
            if let Some(sub) = sp.subtitle() {
                tracing::info!(pts = frame.pts, content = ?sub.content, "subtitle");
            }
        }
        tracing::debug!(pts = frame.pts, width = frame.width, height = frame.height, "picture");
        Ok(())
    }

    fn present_visualization(&mut self, mode: ShowMode, samples: &[f32]) -> Result<(), PresentError> {
        self.visualizations += 1;
        let peak = samples.iter().rev().take(1024).fold(0.0f32, |peak, s| peak.max(s.abs()));
        tracing::trace!(?mode, peak, "visualization");
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

fn build_config(args: &Args) -> Result<PlayerConfig> {
    let path = args.config.clone().unwrap_or_else(PlayerConfig::default_path);
    let mut config = PlayerConfig::load(&path)?;

    if let Some(sync) = args.sync {
        config.sync = sync;
    }
    if let Some(framedrop) = args.framedrop {
        config.frame_drop = framedrop;
    }
    if let Some(count) = args.loop_count {
        config.loop_count = count;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if args.showmode.is_some() {
        config.show_mode = args.showmode;
    }
    if args.ss.is_some() {
        config.start_time = args.ss;
    }
    if args.duration.is_some() {
        config.duration = args.duration;
    }
    if args.bytes {
        config.seek_by_bytes = Some(true);
    }
    config.autoexit |= args.autoexit;
    config.disable_audio |= args.no_audio;
    config.disable_video |= args.no_video;

    if args.save_config {
        config.save(&path)?;
        tracing::info!("Saved config to {}", path.display());
    }
    Ok(config)
}

#[cfg(feature = "audio")]
fn audio_backend() -> Box<dyn AudioBackend> {
    Box::new(tempo_core::audio::CpalBackend)
}

#[cfg(not(feature = "audio"))]
fn audio_backend() -> Box<dyn AudioBackend> {
    Box::new(tempo_core::audio::SimulatedBackend)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tempo=info,tempo_core=info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Tempo v{}", tempo_core::VERSION);

    let config = build_config(&args)?;
    let mut timeline = parse_script(&args.script)?.into_iter().peekable();

    let backend = SyntheticBackend::new(SyntheticSpec {
        duration: args.length,
        video: !args.cover_art,
        subtitles: args.subtitles,
        cover_art: args.cover_art,
        realtime: args.realtime,
        ..Default::default()
    });
    let audio = audio_backend();
    let mut player = Player::open(&args.source, config, &backend, audio.as_ref())
        .with_context(|| format!("failed to open {}", args.source))?;

    let mut sink = LogSink::default();
    let started = Instant::now();
    let mut outcome = Ok(());

    'session: loop {
        while let Some(event) = player.poll_event() {
            match event {
                PlayerEvent::Terminated { reason: TerminationReason::EndOfFile } => break 'session,
                PlayerEvent::Terminated { reason: TerminationReason::Error(e) } => {
                    outcome = Err(anyhow!("playback failed: {}", e));
                    break 'session;
                }
                PlayerEvent::StreamClosed { kind, reason } => {
                    tracing::warn!(?kind, "Stream closed: {}", reason);
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        while let Some((_, command)) = timeline.next_if(|(at, _)| *at <= elapsed) {
            if !apply(&mut player, command) {
                break 'session;
            }
        }
        if args.timeout.is_some_and(|limit| elapsed >= limit) {
            tracing::info!("Timeout reached");
            break;
        }

        let remaining = player.refresh(&mut sink);
        thread::sleep(Duration::from_secs_f64(remaining));
    }

    let stats = player.stats();
    player.close();
    tracing::info!(
        pictures = sink.pictures,
        visualizations = sink.visualizations,
        dropped_early = stats.frame_drops_early,
        dropped_late = stats.frame_drops_late,
        "session finished"
    );
    outcome
}
