//! The three catalog documents: manga equivalence groups, scene tags,
//! and source priority.

use serde::{Deserialize, Serialize};

/// One canonical title with its aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceGroup {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Ordered equivalence groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EquivalentsDoc {
    pub groups: Vec<EquivalenceGroup>,
}

impl EquivalentsDoc {
    /// Look up the canonical title for a raw title key, if catalogued.
    /// Keys are produced by the caller so matcher-aware and plain lookups
    /// share one map shape.
    pub fn canonical_for_key<'a>(
        &'a self,
        key: &str,
        keyer: impl Fn(&str) -> String,
    ) -> Option<&'a str> {
        if key.is_empty() {
            return None;
        }
        for group in &self.groups {
            if keyer(&group.canonical) == key {
                return Some(group.canonical.as_str());
            }
            if group.aliases.iter().any(|alias| keyer(alias) == key) {
                return Some(group.canonical.as_str());
            }
        }
        None
    }
}

/// Scene tags stripped from title suffixes during equivalence matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SceneTagsDoc {
    pub tags: Vec<String>,
}

impl SceneTagsDoc {
    /// Tags present in a fresh install.
    pub fn default_tags() -> Self {
        Self {
            tags: ["official", "colored", "color", "uncensored", "digital"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Source ordering used when assembling union branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SourcePriorityDoc {
    pub sources: Vec<String>,
}

impl SourcePriorityDoc {
    /// Rank of a source under token normalization; unlisted sources sort
    /// after every listed one.
    pub fn rank(&self, source_token_key: &str) -> usize {
        self.sources
            .iter()
            .position(|s| crate::normalize::normalize_token_key(s) == source_token_key)
            .unwrap_or(self.sources.len())
    }
}
