//! Configuration documents, validation, migration, and bootstrap.
//!
//! Four canonical YAML documents live at the config root:
//! `settings.yml`, `manga_equivalents.yml`, `scene_tags.yml`,
//! `source_priority.yml`. Two legacy text siblings
//! (`manga_equivalents.txt`, `source_priority.txt`) migrate forward on
//! first run. All rewrites go through the atomic tmp+rename writer.

mod bootstrap;
mod catalogs;
mod migrate;
mod settings;
mod validate;
mod writer;

pub use bootstrap::{bootstrap, BootstrapError, ConfigBundle};
pub use catalogs::{EquivalenceGroup, EquivalentsDoc, SceneTagsDoc, SourcePriorityDoc};
pub use migrate::{migrate_equivalents_text, migrate_source_priority_text};
pub use settings::{
    DetailsDescriptionMode, DiagnosticsSection, LoggingSection, PathsSection, PermissionsSection,
    RenameSection, RuntimeSection, ScanSection, Settings, ShutdownSection, WatchStartupMode,
};
pub use validate::{
    validate_equivalents, validate_scene_tags, validate_settings, validate_source_priority,
    ValidationError, ValidationProfile,
};
pub use writer::{atomic_write_bytes, atomic_write_yaml};

use std::path::{Path, PathBuf};

/// Resolved locations of every configuration artifact under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config_root: PathBuf,
    pub settings: PathBuf,
    pub equivalents: PathBuf,
    pub scene_tags: PathBuf,
    pub source_priority: PathBuf,
    pub legacy_equivalents: PathBuf,
    pub legacy_source_priority: PathBuf,
}

impl ConfigPaths {
    pub fn new(config_root: &Path) -> Self {
        Self {
            config_root: config_root.to_path_buf(),
            settings: config_root.join("settings.yml"),
            equivalents: config_root.join("manga_equivalents.yml"),
            scene_tags: config_root.join("scene_tags.yml"),
            source_priority: config_root.join("source_priority.yml"),
            legacy_equivalents: config_root.join("manga_equivalents.txt"),
            legacy_source_priority: config_root.join("source_priority.txt"),
        }
    }
}
