//! Best-effort equivalents-catalog updates from matched API payloads.
//!
//! Two-phase commit against `manga_equivalents.yml`: read, plan the
//! merged document, validate, then rewrite atomically. Readers tolerate
//! an interleaved rewrite because they only ever see the old or the new
//! complete document.

use std::path::PathBuf;

use tracing::debug;

use shelf_core::config::{
    atomic_write_yaml, validate_equivalents, EquivalenceGroup, EquivalentsDoc,
};
use shelf_core::normalize::{normalize_title_key, SceneTagMatcher};

/// Catalog update seam.
pub trait EquivalenceCatalog: Send + Sync {
    /// Merge aliases under a canonical title. Returns whether the
    /// document changed.
    fn merge_titles(&self, canonical: &str, aliases: &[String]) -> std::io::Result<bool>;
}

/// The YAML-file-backed catalog.
#[derive(Debug, Clone)]
pub struct YamlEquivalenceCatalog {
    path: PathBuf,
    matcher: SceneTagMatcher,
}

impl YamlEquivalenceCatalog {
    pub fn new(path: PathBuf, matcher: SceneTagMatcher) -> Self {
        Self { path, matcher }
    }

    fn keyer(&self) -> impl Fn(&str) -> String + '_ {
        |raw: &str| normalize_title_key(raw, Some(&self.matcher))
    }
}

impl EquivalenceCatalog for YamlEquivalenceCatalog {
    fn merge_titles(&self, canonical: &str, aliases: &[String]) -> std::io::Result<bool> {
        let keyer = self.keyer();
        let canonical_key = keyer(canonical);
        if canonical_key.is_empty() {
            return Ok(false);
        }

        // Read.
        let mut doc: EquivalentsDoc = match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_yaml::from_str(&text).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => EquivalentsDoc::default(),
            Err(err) => return Err(err),
        };

        // Plan: find or create the canonical group, add unknown aliases.
        let mut known: std::collections::HashSet<String> = doc
            .groups
            .iter()
            .flat_map(|group| {
                std::iter::once(keyer(&group.canonical))
                    .chain(group.aliases.iter().map(|alias| keyer(alias)))
            })
            .collect();

        let group_index = doc
            .groups
            .iter()
            .position(|group| keyer(&group.canonical) == canonical_key);
        let mut changed = false;
        let group_index = match group_index {
            Some(index) => index,
            None => {
                doc.groups.push(EquivalenceGroup {
                    canonical: canonical.trim().to_string(),
                    aliases: Vec::new(),
                });
                known.insert(canonical_key);
                changed = true;
                doc.groups.len() - 1
            }
        };

        for alias in aliases {
            let key = keyer(alias);
            if key.is_empty() || known.contains(&key) {
                continue;
            }
            doc.groups[group_index].aliases.push(alias.trim().to_string());
            known.insert(key);
            changed = true;
        }

        if !changed {
            return Ok(false);
        }

        // Validate before committing; an update must never corrupt the
        // catalog other passes read.
        let errors = validate_equivalents(&doc, Some(&self.matcher), "manga_equivalents.yml");
        if !errors.is_empty() {
            debug!(count = errors.len(), "catalog merge abandoned: merged doc invalid");
            return Ok(false);
        }

        atomic_write_yaml(&self.path, &doc)?;
        Ok(true)
    }
}
