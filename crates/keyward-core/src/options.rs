//! Session options, stored as plain JSON and never containing secrets.
//!
//! The front end owns where the file lives; the core only needs the
//! values. Every field has a default so a missing or partial file still
//! yields a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeywardError, ValidationError};

/// Highest accepted `debug_level`.
pub const MAX_DEBUG_LEVEL: u8 = 4;

/// Options accepted by [`crate::SessionManager`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    /// Pause after every exchange with the token, in milliseconds.
    #[serde(default)]
    pub command_delay_ms: u64,

    /// Log verbosity, 0 (errors only) to 4 (trace).
    #[serde(default = "default_debug_level")]
    pub debug_level: u8,

    /// Write logs to this file instead of stderr.
    #[serde(default)]
    pub debug_file: Option<PathBuf>,

    /// Allowed difference between token and host clocks.
    #[serde(default = "default_time_skew_tolerance")]
    pub time_skew_tolerance_secs: u64,

    /// Polling interval while a long operation runs.
    #[serde(default = "default_progress_poll")]
    pub progress_poll_ms: u64,

    /// Lock the password safe after this many minutes; `None` keeps it
    /// unlocked until an explicit lock or the end of the session.
    #[serde(default)]
    pub safe_auto_lock_minutes: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            command_delay_ms: 0,
            debug_level: default_debug_level(),
            debug_file: None,
            time_skew_tolerance_secs: default_time_skew_tolerance(),
            progress_poll_ms: default_progress_poll(),
            safe_auto_lock_minutes: None,
        }
    }
}

const fn default_debug_level() -> u8 {
    1
}
const fn default_time_skew_tolerance() -> u64 {
    30
}
const fn default_progress_poll() -> u64 {
    500
}

const OPTIONS_FILE: &str = "options.json";

impl Options {
    /// Load options from `{dir}/options.json`.
    ///
    /// Returns [`Default::default()`] when the file is missing or
    /// contains invalid JSON.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(OPTIONS_FILE);
        fs::read_to_string(&path).map_or_else(
            |_| Self::default(),
            |contents| serde_json::from_str(&contents).unwrap_or_default(),
        )
    }

    /// Persist options to `{dir}/options.json` via write-then-rename.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::Io`] if the directory cannot be written.
    pub fn save(&self, dir: &Path) -> Result<(), KeywardError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| KeywardError::Io(std::io::Error::other(e)))?;
        let path = dir.join(OPTIONS_FILE);
        let tmp = dir.join(format!("{OPTIONS_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::OutOfRange`] for a debug level above 4.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.debug_level > MAX_DEBUG_LEVEL {
            return Err(ValidationError::OutOfRange(format!(
                "debug level {} (expected 0-{MAX_DEBUG_LEVEL})",
                self.debug_level
            )));
        }
        Ok(())
    }

    /// Pause applied after each command.
    #[must_use]
    pub const fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    /// Interval between progress polls.
    #[must_use]
    pub const fn progress_poll(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    /// Password-safe auto-lock timeout.
    #[must_use]
    pub fn safe_auto_lock(&self) -> Option<Duration> {
        self.safe_auto_lock_minutes
            .map(|m| Duration::from_secs(u64::from(m).saturating_mul(60)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = Options::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.time_skew_tolerance_secs, 30);
        assert!(opts.safe_auto_lock().is_none());
    }

    #[test]
    fn debug_level_above_four_rejected() {
        let opts = Options {
            debug_level: 5,
            ..Options::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ValidationError::OutOfRange(_))
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(Options::load(dir.path()), Options::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(OPTIONS_FILE), "{not json").expect("write");
        assert_eq!(Options::load(dir.path()), Options::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(OPTIONS_FILE),
            r#"{"commandDelayMs": 25, "debugLevel": 3}"#,
        )
        .expect("write");
        let opts = Options::load(dir.path());
        assert_eq!(opts.command_delay_ms, 25);
        assert_eq!(opts.debug_level, 3);
        assert_eq!(opts.progress_poll_ms, 500);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = Options {
            command_delay_ms: 10,
            safe_auto_lock_minutes: Some(10),
            ..Options::default()
        };
        opts.save(dir.path()).expect("save");
        assert!(!dir.path().join("options.json.tmp").exists());
        assert_eq!(Options::load(dir.path()), opts);
    }
}
