//! First-run layout, migration, self-heal, and cross-document validation.
//!
//! Per document: an existing canonical file wins, a legacy text sibling
//! migrates forward with warnings, and otherwise defaults are written.
//! Every write is atomic. Validation errors from all documents are
//! aggregated into one failure so the operator sees the full list at once.

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;

use super::catalogs::{EquivalentsDoc, SceneTagsDoc, SourcePriorityDoc};
use super::migrate::{migrate_equivalents_text, migrate_source_priority_text};
use super::settings::Settings;
use super::validate::{
    validate_equivalents, validate_scene_tags, validate_settings, validate_source_priority,
    ValidationError, ValidationProfile,
};
use super::writer::atomic_write_yaml;
use super::ConfigPaths;
use crate::normalize::SceneTagMatcher;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration validation failed with {count} error(s)", count = .0.len())]
    Validation(Vec<ValidationError>),
}

impl BootstrapError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The validation errors, when this is a validation failure.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::Validation(errors) => errors,
            Self::Io { .. } => &[],
        }
    }
}

/// Everything the daemon needs out of the config root.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub paths: ConfigPaths,
    pub settings: Settings,
    pub equivalents: EquivalentsDoc,
    pub scene_tags: SceneTagsDoc,
    pub source_priority: SourcePriorityDoc,
    pub matcher: SceneTagMatcher,
    pub warnings: Vec<String>,
}

/// Insert default keys missing from `target`. Existing keys, including
/// wrong-typed ones, are left for the validator to report.
fn merge_missing(target: &mut Value, defaults: &Value) -> bool {
    let (Value::Mapping(target_map), Value::Mapping(default_map)) = (target, defaults) else {
        return false;
    };
    let mut changed = false;
    for (key, default_value) in default_map {
        match target_map.get_mut(key) {
            None => {
                target_map.insert(key.clone(), default_value.clone());
                changed = true;
            }
            Some(existing) => {
                if existing.is_mapping() && default_value.is_mapping() {
                    changed |= merge_missing(existing, default_value);
                }
            }
        }
    }
    changed
}

fn read_to_string(path: &Path) -> Result<String, BootstrapError> {
    std::fs::read_to_string(path).map_err(|e| BootstrapError::io(path, e))
}

fn write_yaml<T: serde::Serialize>(path: &Path, doc: &T) -> Result<(), BootstrapError> {
    atomic_write_yaml(path, doc).map_err(|e| BootstrapError::io(path, e))
}

fn parse_error(file: &str, code: &str, err: &serde_yaml::Error) -> ValidationError {
    ValidationError {
        file: file.to_string(),
        path: String::new(),
        code: code.to_string(),
        message: format!("document is not valid yaml: {err}"),
    }
}

/// Bootstrap the configuration root.
///
/// Runs the ensure/migrate/heal pass, parses every document, and returns
/// the bundle, or the complete aggregated validation error list. A second
/// call over a healthy root migrates nothing, rewrites nothing, and
/// returns an equivalent bundle.
pub fn bootstrap(
    config_root: &Path,
    profile: ValidationProfile,
) -> Result<ConfigBundle, BootstrapError> {
    std::fs::create_dir_all(config_root).map_err(|e| BootstrapError::io(config_root, e))?;
    let paths = ConfigPaths::new(config_root);
    let mut warnings = Vec::new();
    let mut errors: Vec<ValidationError> = Vec::new();

    // settings.yml: self-heal missing keys against the default document.
    let defaults_value = serde_yaml::to_value(Settings::default_for_root(config_root))
        .expect("default settings serialize");
    let settings_value = if paths.settings.exists() {
        let text = read_to_string(&paths.settings)?;
        match serde_yaml::from_str::<Value>(&text) {
            Ok(mut value) => {
                if !value.is_mapping() {
                    value = Value::Mapping(serde_yaml::Mapping::new());
                }
                if merge_missing(&mut value, &defaults_value) {
                    warnings.push("settings.yml: filled missing fields with defaults".to_string());
                    write_yaml(&paths.settings, &value)?;
                }
                Some(value)
            }
            Err(err) => {
                errors.push(parse_error("settings.yml", "CFG-SET-001", &err));
                None
            }
        }
    } else {
        write_yaml(&paths.settings, &defaults_value)?;
        Some(defaults_value.clone())
    };

    // manga_equivalents.yml: canonical wins, legacy text migrates.
    let equivalents = if paths.equivalents.exists() {
        let text = read_to_string(&paths.equivalents)?;
        match serde_yaml::from_str::<EquivalentsDoc>(&text) {
            Ok(doc) => doc,
            Err(err) => {
                errors.push(parse_error("manga_equivalents.yml", "CFG-MEQ-001", &err));
                EquivalentsDoc::default()
            }
        }
    } else if paths.legacy_equivalents.exists() {
        let text = read_to_string(&paths.legacy_equivalents)?;
        let (doc, migration_warnings) = migrate_equivalents_text(&text);
        warnings.push(format!(
            "migrated manga_equivalents.txt to manga_equivalents.yml ({} group(s))",
            doc.groups.len()
        ));
        warnings.extend(migration_warnings);
        write_yaml(&paths.equivalents, &doc)?;
        doc
    } else {
        let doc = EquivalentsDoc::default();
        write_yaml(&paths.equivalents, &doc)?;
        doc
    };

    // scene_tags.yml.
    let scene_tags = if paths.scene_tags.exists() {
        let text = read_to_string(&paths.scene_tags)?;
        match serde_yaml::from_str::<SceneTagsDoc>(&text) {
            Ok(doc) => doc,
            Err(err) => {
                errors.push(parse_error("scene_tags.yml", "CFG-STG-001", &err));
                SceneTagsDoc::default()
            }
        }
    } else {
        let doc = SceneTagsDoc::default_tags();
        write_yaml(&paths.scene_tags, &doc)?;
        doc
    };

    // source_priority.yml: canonical wins, legacy text migrates.
    let source_priority = if paths.source_priority.exists() {
        let text = read_to_string(&paths.source_priority)?;
        match serde_yaml::from_str::<SourcePriorityDoc>(&text) {
            Ok(doc) => doc,
            Err(err) => {
                errors.push(parse_error("source_priority.yml", "CFG-SPR-001", &err));
                SourcePriorityDoc::default()
            }
        }
    } else if paths.legacy_source_priority.exists() {
        let text = read_to_string(&paths.legacy_source_priority)?;
        let (doc, migration_warnings) = migrate_source_priority_text(&text);
        warnings.push(format!(
            "migrated source_priority.txt to source_priority.yml ({} source(s))",
            doc.sources.len()
        ));
        warnings.extend(migration_warnings);
        write_yaml(&paths.source_priority, &doc)?;
        doc
    } else {
        let doc = SourcePriorityDoc::default();
        write_yaml(&paths.source_priority, &doc)?;
        doc
    };

    // Single-document validation, in canonical document order.
    let mut settings = Settings::default_for_root(config_root);
    if let Some(value) = &settings_value {
        errors.extend(validate_settings(value, config_root, profile, "settings.yml"));
        match serde_yaml::from_value::<Settings>(value.clone()) {
            Ok(parsed) => settings = parsed,
            Err(err) => errors.push(parse_error("settings.yml", "CFG-SET-001", &err)),
        }
    }
    errors.extend(validate_equivalents(&equivalents, None, "manga_equivalents.yml"));
    let scene_tag_errors = validate_scene_tags(&scene_tags, "scene_tags.yml");
    let scene_tags_valid = scene_tag_errors.is_empty();
    errors.extend(scene_tag_errors);
    errors.extend(validate_source_priority(&source_priority, "source_priority.yml"));

    // Cross-document pass: equivalence keys change once the accepted
    // scene-tag matcher is applied, so re-validate and merge new errors.
    let matcher = SceneTagMatcher::new(&scene_tags.tags);
    if scene_tags_valid {
        for error in validate_equivalents(&equivalents, Some(&matcher), "manga_equivalents.yml") {
            if !errors.contains(&error) {
                errors.push(error);
            }
        }
    }

    if !errors.is_empty() {
        return Err(BootstrapError::Validation(errors));
    }

    Ok(ConfigBundle {
        paths,
        settings,
        equivalents,
        scene_tags,
        source_priority,
        matcher,
        warnings,
    })
}
