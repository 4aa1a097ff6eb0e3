use crate::time::progress_percent;
use crate::track::TrackMetadata;
use chrono::{DateTime, Utc};
use std::fmt;

/// Lifecycle of the audio transport.
///
/// Describes the network connection, not what the user asked for: intent
/// lives separately in [`PlaybackSnapshot::is_user_requested_playing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionPhase {
    /// No source attached
    #[default]
    Offline,
    /// Source attached, waiting for audio (initial connect or stall)
    Connecting,
    /// Audio is flowing
    Connected,
    /// The transport gave up; the user has to retry
    Error,
}

impl ConnectionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the surrounding UI renders about the listening session.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub connection_phase: ConnectionPhase,
    pub is_user_requested_playing: bool,
    pub current_track: Option<TrackMetadata>,
    pub next_track: Option<TrackMetadata>,
    /// Locally simulated playhead. Only good for animating a progress bar.
    pub elapsed_seconds: u32,
    pub listener_count: u32,
    /// Stored volume level in `0.0..=1.0`, independent of mute
    pub volume: f32,
    pub muted: bool,
    /// When metadata was last refreshed successfully
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            connection_phase: ConnectionPhase::Offline,
            is_user_requested_playing: false,
            current_track: None,
            next_track: None,
            elapsed_seconds: 0,
            listener_count: 0,
            volume: 1.0,
            muted: false,
            last_updated: None,
        }
    }
}

impl PlaybackSnapshot {
    /// Volume actually applied to the transport
    #[must_use]
    pub const fn effective_volume(&self) -> f32 {
        if self.muted { 0.0 } else { self.volume }
    }

    /// Duration of the current track in seconds, 0 when unknown
    #[must_use]
    pub fn duration_seconds(&self) -> u32 {
        self.current_track.as_ref().map_or(0, |track| track.duration)
    }

    /// Progress indicator values for the current track
    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress::new(self.elapsed_seconds, self.duration_seconds())
    }
}

/// Values for a progress indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Elapsed seconds, clamped to the duration when the duration is known
    pub elapsed: u32,
    /// Track length in seconds, 0 when unknown
    pub duration: u32,
    /// Always finite, in `0.0..=100.0`
    pub percent: f64,
}

impl Progress {
    #[must_use]
    pub fn new(elapsed: u32, duration: u32) -> Self {
        let elapsed = if duration > 0 { elapsed.min(duration) } else { elapsed };
        Self {
            elapsed,
            duration,
            percent: progress_percent(elapsed, duration),
        }
    }
}
