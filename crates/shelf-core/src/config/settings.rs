//! The settings document.
//!
//! Numeric fields deserialize as `i64` so out-of-range values survive
//! parsing and reach the validator, which reports them field by field
//! instead of failing the whole document.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::eventlog::LogLevel;

/// Watcher startup strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStartupMode {
    Full,
    Progressive,
}

/// How `details.json` descriptions are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailsDescriptionMode {
    Text,
    Br,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PathsSection {
    pub sources_root: PathBuf,
    pub overrides_root: PathBuf,
    pub merged_root: PathBuf,
    pub state_root: PathBuf,
    pub log_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSection {
    pub watch_poll_timeout_seconds: i64,
    pub session_restart_delay_seconds: i64,
    pub max_deep_sessions_per_poll: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_startup_mode: Option<WatchStartupMode>,
    pub excluded_sources: Vec<String>,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            watch_poll_timeout_seconds: 30,
            session_restart_delay_seconds: 15,
            max_deep_sessions_per_poll: 8,
            watch_startup_mode: None,
            excluded_sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameSection {
    pub delay_seconds: i64,
    pub quiet_seconds: i64,
    pub rescan_grace_seconds: i64,
}

impl Default for RenameSection {
    fn default() -> Self {
        Self {
            delay_seconds: 300,
            quiet_seconds: 120,
            rescan_grace_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub command_timeout_seconds: i64,
    pub command_poll_interval_millis: i64,
    pub max_command_output_chars: i64,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 120,
            command_poll_interval_millis: 200,
            max_command_output_chars: 262_144,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub stop_timeout_seconds: i64,
    pub cleanup_apply_high_priority: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_priority_ionice_class: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_priority_nice_value: Option<i64>,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            stop_timeout_seconds: 30,
            cleanup_apply_high_priority: false,
            cleanup_priority_ionice_class: Some(2),
            cleanup_priority_nice_value: Some(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsSection {
    pub uid: i64,
    pub gid: i64,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self { uid: 1000, gid: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_consecutive_mount_failures: i64,
    pub mount_command_timeout_seconds: i64,
    pub readiness_probe_timeout_seconds: i64,
    pub request_timeout_seconds: i64,
    pub mergerfs_options_base: String,
    pub details_description_mode: DetailsDescriptionMode,
    pub metadata_cooldown_hours: i64,
    pub direct_retry_interval_minutes: i64,
    pub api_base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_proxy_url: Option<String>,
    pub preferred_language: String,
    pub enable_health_checks: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_consecutive_mount_failures: 3,
            mount_command_timeout_seconds: 60,
            readiness_probe_timeout_seconds: 10,
            request_timeout_seconds: 30,
            mergerfs_options_base: "allow_other,use_ino,cache.files=off,category.create=ff"
                .to_string(),
            details_description_mode: DetailsDescriptionMode::Text,
            metadata_cooldown_hours: 168,
            direct_retry_interval_minutes: 30,
            api_base_url: "https://api.comick.fun".to_string(),
            challenge_proxy_url: None,
            preferred_language: "en".to_string(),
            enable_health_checks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub file_name: String,
    pub max_bytes: i64,
    pub retained_files: i64,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            file_name: "shelfd.log".to_string(),
            max_bytes: 5 * 1024 * 1024,
            retained_files: 3,
        }
    }
}

/// The whole settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsSection,
    pub scan: ScanSection,
    pub rename: RenameSection,
    pub diagnostics: DiagnosticsSection,
    pub shutdown: ShutdownSection,
    pub permissions: PermissionsSection,
    pub runtime: RuntimeSection,
    pub logging: LoggingSection,
}

impl Settings {
    /// The document written on first run, with state and log roots placed
    /// under the config root. Library roots have no sensible default and
    /// stay subject to validation until the operator fills them in.
    pub fn default_for_root(config_root: &std::path::Path) -> Self {
        Self {
            paths: PathsSection {
                sources_root: PathBuf::from("/shelf/sources"),
                overrides_root: PathBuf::from("/shelf/overrides"),
                merged_root: PathBuf::from("/shelf/merged"),
                state_root: config_root.join("state"),
                log_root: config_root.join("logs"),
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_document_round_trips() {
        let settings = Settings::default_for_root(std::path::Path::new("/config"));
        let yaml = serde_yaml::to_string(&settings).unwrap();
        let parsed: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: Settings = serde_yaml::from_str("paths:\n  sources_root: /a\n").unwrap();
        assert_eq!(parsed.paths.sources_root, PathBuf::from("/a"));
        assert_eq!(parsed.rename.delay_seconds, 300);
        assert_eq!(parsed.logging.level, LogLevel::Debug);
    }

    #[test]
    fn negative_numbers_survive_parsing_for_the_validator() {
        let parsed: Settings =
            serde_yaml::from_str("rename:\n  delay_seconds: -5\n").unwrap();
        assert_eq!(parsed.rename.delay_seconds, -5);
    }

    #[test]
    fn startup_mode_parses_lowercase() {
        let parsed: Settings =
            serde_yaml::from_str("scan:\n  watch_startup_mode: progressive\n").unwrap();
        assert_eq!(parsed.scan.watch_startup_mode, Some(WatchStartupMode::Progressive));
    }
}
