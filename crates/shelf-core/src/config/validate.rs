//! Document validation.
//!
//! Validation is additive: every check runs and every failure becomes one
//! `ValidationError` record, in a fixed traversal order, so the output is
//! a pure function of the input. Settings checks read the raw YAML value
//! (missing fields and wrong types must be reported per field, which a
//! typed parse cannot do).

use std::collections::HashMap;
use std::path::{Component, Path};

use serde::Serialize;
use serde_yaml::Value;

use super::catalogs::{EquivalentsDoc, SceneTagsDoc, SourcePriorityDoc};
use crate::normalize::{normalize_title_key, normalize_token_key, SceneTagMatcher};

/// One validation failure, addressed by file, field path, and stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub file: String,
    pub path: String,
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{} {}", self.file, self.path, self.code, self.message)
    }
}

impl ValidationError {
    fn new(file: &str, path: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            path: path.into(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Validation strictness.
///
/// `StrictRuntime` is what the daemon uses: the shutdown priority fields
/// must be present. `RelaxedTooling` permits their absence but still
/// validates values that are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationProfile {
    StrictRuntime,
    RelaxedTooling,
}

#[derive(Debug, Clone, Copy)]
enum NumericPolicy {
    Positive,
    NonNegative,
    Range(i64, i64),
}

const SETTINGS_PATH_FIELDS: [&str; 5] = [
    "paths.sources_root",
    "paths.overrides_root",
    "paths.merged_root",
    "paths.state_root",
    "paths.log_root",
];

const SETTINGS_NUMERIC_FIELDS: [(&str, NumericPolicy); 20] = [
    ("scan.watch_poll_timeout_seconds", NumericPolicy::Positive),
    ("scan.session_restart_delay_seconds", NumericPolicy::Positive),
    ("scan.max_deep_sessions_per_poll", NumericPolicy::Positive),
    ("rename.delay_seconds", NumericPolicy::NonNegative),
    ("rename.quiet_seconds", NumericPolicy::NonNegative),
    ("rename.rescan_grace_seconds", NumericPolicy::Positive),
    ("diagnostics.command_timeout_seconds", NumericPolicy::Positive),
    ("diagnostics.command_poll_interval_millis", NumericPolicy::Positive),
    ("diagnostics.max_command_output_chars", NumericPolicy::Positive),
    ("shutdown.stop_timeout_seconds", NumericPolicy::Positive),
    ("permissions.uid", NumericPolicy::NonNegative),
    ("permissions.gid", NumericPolicy::NonNegative),
    ("runtime.max_consecutive_mount_failures", NumericPolicy::Positive),
    ("runtime.mount_command_timeout_seconds", NumericPolicy::Positive),
    ("runtime.readiness_probe_timeout_seconds", NumericPolicy::Positive),
    ("runtime.request_timeout_seconds", NumericPolicy::Positive),
    ("runtime.metadata_cooldown_hours", NumericPolicy::NonNegative),
    ("runtime.direct_retry_interval_minutes", NumericPolicy::Positive),
    ("logging.max_bytes", NumericPolicy::Positive),
    ("logging.retained_files", NumericPolicy::NonNegative),
];

const SETTINGS_STRING_FIELDS: [&str; 4] = [
    "runtime.mergerfs_options_base",
    "runtime.api_base_url",
    "runtime.preferred_language",
    "logging.file_name",
];

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "warning", "error", "none"];
const DESCRIPTION_MODES: [&str; 3] = ["text", "br", "html"];
const STARTUP_MODES: [&str; 2] = ["full", "progressive"];

fn lookup<'a>(raw: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = raw;
    for part in dotted.split('.') {
        current = current.as_mapping()?.get(part)?;
    }
    match current {
        Value::Null => None,
        other => Some(other),
    }
}

/// Validate the settings document against the numeric policy, path rules,
/// enum sets, and the root-overlap invariant.
pub fn validate_settings(
    raw: &Value,
    config_root: &Path,
    profile: ValidationProfile,
    file: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for field in SETTINGS_PATH_FIELDS {
        match lookup(raw, field) {
            None => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-002",
                "required field is missing",
            )),
            Some(Value::String(s)) if s.is_empty() => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-005",
                "path must not be empty",
            )),
            Some(Value::String(s)) if !Path::new(s).is_absolute() => {
                errors.push(ValidationError::new(
                    file,
                    field,
                    "CFG-SET-003",
                    format!("path must be absolute, got '{s}'"),
                ));
            }
            Some(Value::String(_)) => {}
            Some(_) => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-005",
                "path must be a string",
            )),
        }
    }

    for (field, policy) in SETTINGS_NUMERIC_FIELDS {
        check_numeric(&mut errors, raw, field, policy, true, file);
    }

    // Shutdown priority fields: profile-gated presence, always-checked range.
    let strict = profile == ValidationProfile::StrictRuntime;
    check_numeric(
        &mut errors,
        raw,
        "shutdown.cleanup_priority_ionice_class",
        NumericPolicy::Range(1, 3),
        strict,
        file,
    );
    check_numeric(
        &mut errors,
        raw,
        "shutdown.cleanup_priority_nice_value",
        NumericPolicy::Range(-20, 19),
        strict,
        file,
    );

    for field in SETTINGS_STRING_FIELDS {
        match lookup(raw, field) {
            None => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-002",
                "required field is missing",
            )),
            Some(Value::String(s)) if s.trim().is_empty() => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-005",
                "value must not be empty",
            )),
            Some(Value::String(_)) => {}
            Some(_) => errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-005",
                "value must be a string",
            )),
        }
    }

    check_enum(&mut errors, raw, "logging.level", &LOG_LEVELS, true, file);
    check_enum(
        &mut errors,
        raw,
        "runtime.details_description_mode",
        &DESCRIPTION_MODES,
        true,
        file,
    );
    check_enum(
        &mut errors,
        raw,
        "scan.watch_startup_mode",
        &STARTUP_MODES,
        false,
        file,
    );

    // The merged tree must never sit inside the configuration tree or
    // vice versa: a union mount over config files would shadow them.
    if let Some(Value::String(merged)) = lookup(raw, "paths.merged_root") {
        let merged = Path::new(merged);
        if merged.is_absolute() && paths_overlap(config_root, merged) {
            errors.push(ValidationError::new(
                file,
                "paths.merged_root",
                "CFG-SET-008",
                format!(
                    "merged root '{}' overlaps config root '{}'",
                    merged.display(),
                    config_root.display()
                ),
            ));
        }
    }

    errors
}

fn check_numeric(
    errors: &mut Vec<ValidationError>,
    raw: &Value,
    field: &str,
    policy: NumericPolicy,
    required: bool,
    file: &str,
) {
    let value = match lookup(raw, field) {
        None => {
            if required {
                errors.push(ValidationError::new(
                    file,
                    field,
                    "CFG-SET-002",
                    "required field is missing",
                ));
            }
            return;
        }
        Some(value) => value,
    };
    let Some(number) = value.as_i64() else {
        errors.push(ValidationError::new(
            file,
            field,
            "CFG-SET-005",
            "value must be an integer",
        ));
        return;
    };
    let in_range = match policy {
        NumericPolicy::Positive => number > 0,
        NumericPolicy::NonNegative => number >= 0,
        NumericPolicy::Range(min, max) => number >= min && number <= max,
    };
    if !in_range {
        let expectation = match policy {
            NumericPolicy::Positive => "a positive integer".to_string(),
            NumericPolicy::NonNegative => "a non-negative integer".to_string(),
            NumericPolicy::Range(min, max) => format!("an integer in [{min}, {max}]"),
        };
        errors.push(ValidationError::new(
            file,
            field,
            "CFG-SET-004",
            format!("value {number} out of range, expected {expectation}"),
        ));
    }
}

fn check_enum(
    errors: &mut Vec<ValidationError>,
    raw: &Value,
    field: &str,
    allowed: &[&str],
    required: bool,
    file: &str,
) {
    match lookup(raw, field) {
        None => {
            if required {
                errors.push(ValidationError::new(
                    file,
                    field,
                    "CFG-SET-002",
                    "required field is missing",
                ));
            }
        }
        Some(Value::String(s)) if allowed.contains(&s.as_str()) => {}
        Some(other) => {
            let got = match other {
                Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
            };
            errors.push(ValidationError::new(
                file,
                field,
                "CFG-SET-005",
                format!("invalid value '{got}', expected one of {}", allowed.join(", ")),
            ));
        }
    }
}

fn normalized_components(path: &Path) -> Vec<std::ffi::OsString> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_os_string())
        .collect()
}

/// True when the paths are equal or one strictly contains the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    let a = normalized_components(a);
    let b = normalized_components(b);
    let shared = a.len().min(b.len());
    a[..shared] == b[..shared]
}

/// Validate equivalence groups, optionally under a scene-tag matcher.
pub fn validate_equivalents(
    doc: &EquivalentsDoc,
    matcher: Option<&SceneTagMatcher>,
    file: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    // key -> index of the owning group
    let mut owners: HashMap<String, usize> = HashMap::new();

    for (index, group) in doc.groups.iter().enumerate() {
        let canonical_path = format!("groups[{index}].canonical");
        let key = normalize_title_key(&group.canonical, matcher);
        if group.canonical.trim().is_empty() || key.is_empty() {
            errors.push(ValidationError::new(
                file,
                canonical_path,
                "CFG-MEQ-002",
                format!("canonical title '{}' is empty or unresolvable", group.canonical),
            ));
            continue;
        }
        if let Some(&owner) = owners.get(&key) {
            errors.push(ValidationError::new(
                file,
                canonical_path,
                "CFG-MEQ-004",
                format!(
                    "canonical '{}' duplicates group {} under key '{key}'",
                    group.canonical, owner
                ),
            ));
            continue;
        }
        owners.insert(key, index);
    }

    for (index, group) in doc.groups.iter().enumerate() {
        for (alias_index, alias) in group.aliases.iter().enumerate() {
            let alias_path = format!("groups[{index}].aliases[{alias_index}]");
            let key = normalize_title_key(alias, matcher);
            if alias.trim().is_empty() || key.is_empty() {
                errors.push(ValidationError::new(
                    file,
                    alias_path,
                    "CFG-MEQ-003",
                    format!("alias '{alias}' is empty or unresolvable"),
                ));
                continue;
            }
            match owners.get(&key) {
                Some(&owner) if owner != index => {
                    errors.push(ValidationError::new(
                        file,
                        alias_path,
                        "CFG-MEQ-005",
                        format!(
                            "alias '{alias}' maps to group {owner} and group {index} under key '{key}'"
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    owners.insert(key, index);
                }
            }
        }
    }

    errors
}

/// Validate the scene-tag set: non-empty, unique under matcher identity.
pub fn validate_scene_tags(doc: &SceneTagsDoc, file: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if doc.tags.is_empty() {
        errors.push(ValidationError::new(
            file,
            "tags",
            "CFG-STG-002",
            "scene tag list must not be empty",
        ));
        return errors;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, tag) in doc.tags.iter().enumerate() {
        let path = format!("tags[{index}]");
        if tag.trim().is_empty() {
            errors.push(ValidationError::new(
                file,
                path,
                "CFG-STG-002",
                "scene tag must not be empty",
            ));
            continue;
        }
        let key = SceneTagMatcher::matcher_key(tag);
        if let Some(&first) = seen.get(&key) {
            errors.push(ValidationError::new(
                file,
                path,
                "CFG-STG-003",
                format!("tag '{tag}' duplicates tags[{first}] under key '{key}'"),
            ));
        } else {
            seen.insert(key, index);
        }
    }

    errors
}

/// Validate the source priority list: non-empty entries, unique token keys.
pub fn validate_source_priority(doc: &SourcePriorityDoc, file: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, source) in doc.sources.iter().enumerate() {
        let path = format!("sources[{index}]");
        let key = normalize_token_key(source);
        if source.trim().is_empty() || key.is_empty() {
            errors.push(ValidationError::new(
                file,
                path,
                "CFG-SPR-002",
                format!("source '{source}' is empty or unresolvable"),
            ));
            continue;
        }
        if let Some(&first) = seen.get(&key) {
            errors.push(ValidationError::new(
                file,
                path,
                "CFG-SPR-003",
                format!("source '{source}' duplicates sources[{first}] under key '{key}'"),
            ));
        } else {
            seen.insert(key, index);
        }
    }

    errors
}
