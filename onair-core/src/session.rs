//! Typed storage for listening-session flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "onair::session";

/// Flags shared across components for one listening session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFlags {
    /// Whether the listening experience has been started in this process.
    /// Never persisted: each process starts a new session.
    #[serde(skip)]
    pub experience_started: bool,
    /// Last stored volume level in `0.0..=1.0`
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
}

const fn default_volume() -> f32 {
    1.0
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            experience_started: false,
            volume: default_volume(),
            muted: false,
        }
    }
}

/// Storage for [`SessionFlags`].
///
/// Storage failures are never fatal; implementations log them and fall back
/// to defaults.
pub trait SessionStore: Send + Sync {
    /// Read the current flags
    fn load(&self) -> SessionFlags;

    /// Replace the stored flags
    fn save(&self, flags: &SessionFlags);

    /// Read-modify-write helper
    fn update(&self, apply: &mut dyn FnMut(&mut SessionFlags)) {
        let mut flags = self.load();
        apply(&mut flags);
        self.save(&flags);
    }
}

/// In-process session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    flags: Mutex<SessionFlags>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> SessionFlags {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, flags: &SessionFlags) {
        *self.flags.lock().unwrap_or_else(PoisonError::into_inner) = flags.clone();
    }
}

/// Session store persisting preferences to a JSON file.
///
/// `experience_started` is kept in memory only.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    cached: Mutex<Option<SessionFlags>>,
}

impl FileSessionStore {
    /// Store at the default location (`~/.config/onair/.session.json`)
    #[must_use]
    pub fn new() -> Self {
        Self::at(crate::paths::session_path())
    }

    /// Store at a specific path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> SessionFlags {
        if !self.path.exists() {
            return SessionFlags::default();
        }

        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(flags) => {
                    info!(target: LOG_TARGET, "Loaded session preferences from {:?}", self.path);
                    flags
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Failed to parse session preferences: {}", e);
                    SessionFlags::default()
                }
            },
            Err(e) => {
                warn!(target: LOG_TARGET, "Failed to read session preferences: {}", e);
                SessionFlags::default()
            }
        }
    }

    fn write_file(&self, flags: &SessionFlags) {
        if let Some(parent) = self.path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!(target: LOG_TARGET, "Failed to create session directory: {}", e);
            return;
        }

        match serde_json::to_string_pretty(flags) {
            Ok(content) => {
                if let Err(e) = fs::write(&self.path, content) {
                    warn!(target: LOG_TARGET, "Failed to write session preferences: {}", e);
                } else {
                    debug!(target: LOG_TARGET, "Saved session preferences to {:?}", self.path);
                }
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Failed to serialize session preferences: {}", e);
            }
        }
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> SessionFlags {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        cached.get_or_insert_with(|| self.read_file()).clone()
    }

    fn save(&self, flags: &SessionFlags) {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = cached.replace(flags.clone());
        // Only preferences hit the disk
        let prefs_changed = previous.is_none_or(|prev| {
            prev.muted != flags.muted || (prev.volume - flags.volume).abs() > f32::EPSILON
        });
        if prefs_changed {
            self.write_file(flags);
        }
    }
}
