use crate::time::whole_seconds;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Metadata for one item in the broadcast.
///
/// Replaced wholesale on every refresh; never patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    /// Backend identifier (numeric ids are kept as their decimal string)
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Track title
    pub title: String,
    /// Artist name(s)
    pub artist: String,
    /// Album name
    #[serde(default)]
    pub album: Option<String>,
    /// Length in whole seconds, 0 when unknown
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub duration: u32,
    /// Cover art reference (URL or storage key)
    #[serde(default, alias = "coverUrl", alias = "cover_url")]
    pub cover_art: Option<String>,
    /// Set for jingles, idents and other non-music interstitials
    #[serde(default, alias = "isJingle", alias = "is_jingle")]
    pub is_interstitial: Option<bool>,
}

impl TrackMetadata {
    /// Create metadata with the required fields
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        duration: u32,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration,
            cover_art: None,
            is_interstitial: None,
        }
    }

    /// Set album name
    #[must_use]
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    /// Set cover art reference
    #[must_use]
    pub fn with_cover_art(mut self, cover_art: impl Into<String>) -> Self {
        self.cover_art = Some(cover_art.into());
        self
    }

    /// Flag this item as an interstitial
    #[must_use]
    pub const fn as_interstitial(mut self) -> Self {
        self.is_interstitial = Some(true);
        self
    }

    /// Whether the UI should label this item as a jingle rather than a track
    #[must_use]
    pub fn is_interstitial(&self) -> bool {
        self.is_interstitial.unwrap_or(false)
    }
}

impl fmt::Display for TrackMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)
    }
}

/// Response of `GET current-stream-state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamState {
    /// Whether the station is currently broadcasting
    #[serde(default)]
    pub playing: bool,
    #[serde(default)]
    pub track: Option<TrackMetadata>,
    #[serde(default)]
    pub next_track: Option<TrackMetadata>,
    /// Current listener count
    #[serde(default)]
    pub listeners: u32,
    /// Server-authoritative seconds into the current track
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub seek_position: u32,
}

/// Broadcast availability as reported by `GET now-playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Online,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

impl StreamStatus {
    /// Get the stable string identifier
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response of `GET now-playing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    #[serde(default)]
    pub now_playing: Option<TrackMetadata>,
    #[serde(default)]
    pub stream_status: StreamStatus,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    Ok(secs.map_or(0, whole_seconds))
}
