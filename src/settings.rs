//! Application Settings
//!
//! Non-sensitive preferences stored as plain JSON, loaded independently of
//! the vault. A missing file yields defaults; an unparsable file logs a
//! warning and falls back to defaults rather than blocking startup. The
//! backup coordinator takes its retention policy from here, so settings
//! must be loaded before backups can be configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::{RetentionPolicy, SnapshotTrigger};
use crate::vault::store::write_atomic;

/// Settings file name inside the vault directory
pub const SETTINGS_FILE: &str = "settings.json";

fn default_backup_max_snapshots() -> usize {
    5
}

fn default_session_close_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_theme() -> String {
    "dark".to_string()
}

/// Application-wide preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Snapshots kept before the oldest is evicted (0 = unlimited)
    #[serde(default = "default_backup_max_snapshots")]
    pub backup_max_snapshots: usize,

    /// Scheduled snapshot interval in seconds (0 = on-demand only)
    #[serde(default)]
    pub backup_interval_secs: u64,

    /// Bound on waiting for sessions to terminate at shutdown
    #[serde(default = "default_session_close_timeout_secs")]
    pub session_close_timeout_secs: u64,

    /// Bound on establishing a remote connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_theme")]
    pub theme: String,

    /// Ask before closing a live session from the UI
    #[serde(default)]
    pub confirm_disconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_max_snapshots: default_backup_max_snapshots(),
            backup_interval_secs: 0,
            session_close_timeout_secs: default_session_close_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            theme: default_theme(),
            confirm_disconnect: false,
        }
    }
}

impl Settings {
    /// Retention policy for the backup coordinator.
    pub fn retention_policy(&self) -> RetentionPolicy {
        let trigger = if self.backup_interval_secs == 0 {
            SnapshotTrigger::OnDemand
        } else {
            SnapshotTrigger::Interval(Duration::from_secs(self.backup_interval_secs))
        };
        RetentionPolicy {
            max_snapshots: self.backup_max_snapshots,
            trigger,
        }
    }

    pub fn session_close_timeout(&self) -> Duration {
        Duration::from_secs(self.session_close_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Plain (unencrypted) load/save of application preferences
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(vault_dir: &Path) -> Self {
        Self {
            path: vault_dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings, falling back to defaults. Never fails hard: a
    /// missing file is a fresh install, an unparsable one is surfaced as a
    /// warning and replaced by defaults.
    pub fn load(&self) -> Settings {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no settings file, using defaults");
                return Settings::default();
            }
            Err(e) => {
                warn!("failed to read settings file: {}, using defaults", e);
                return Settings::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    "settings file unparsable ({}), using defaults", e
                );
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        write_atomic(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.load(), Settings::default());
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());

        let mut settings = Settings::default();
        settings.backup_max_snapshots = 3;
        settings.backup_interval_secs = 3600;
        settings.theme = "light".into();

        store.save(&settings).unwrap();
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert_eq!(store.load(), Settings::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path());
        std::fs::write(store.path(), br#"{"backup_max_snapshots": 9}"#).unwrap();

        let settings = store.load();
        assert_eq!(settings.backup_max_snapshots, 9);
        assert_eq!(settings.theme, default_theme());
    }

    #[test]
    fn retention_policy_mapping() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.retention_policy().trigger,
            SnapshotTrigger::OnDemand
        );

        settings.backup_interval_secs = 60;
        assert_eq!(
            settings.retention_policy().trigger,
            SnapshotTrigger::Interval(Duration::from_secs(60))
        );
    }
}
