//! Path constants for configuration, session and log files.

use std::path::PathBuf;

/// The name of the configuration directory under ~/.config/
pub const CONFIG_DIR_NAME: &str = "onair";

/// The name of the main configuration file
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// The name of the session preferences file (prefixed with . for hidden)
pub const SESSION_FILE_NAME: &str = ".session.json";

/// The name of the log file written when file logging is enabled
pub const LOG_FILE_NAME: &str = "onair.log";

/// Get the configuration directory path (~/.config/onair/)
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(CONFIG_DIR_NAME)
}

/// Get the config file path (~/.config/onair/config.toml)
#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Get the session preferences path (`~/.config/onair/.session.json`)
#[must_use]
pub fn session_path() -> PathBuf {
    config_dir().join(SESSION_FILE_NAME)
}

/// Get the log file path, preferring the platform cache dir (`~/.cache/onair/onair.log`)
#[must_use]
pub fn log_file_path() -> PathBuf {
    dirs::cache_dir()
        .map_or_else(config_dir, |dir| dir.join(CONFIG_DIR_NAME))
        .join(LOG_FILE_NAME)
}
