//! Migration of legacy text catalogs to the canonical YAML documents.
//!
//! Legacy formats predate the YAML layout:
//! - `manga_equivalents.txt`: one group per line, `Canonical = Alias | Alias`
//! - `source_priority.txt`: one source per line
//!
//! Blank lines and `#` comments are skipped in both. Malformed lines are
//! dropped with a warning instead of failing the migration.

use super::catalogs::{EquivalenceGroup, EquivalentsDoc, SourcePriorityDoc};

/// Parse legacy equivalence text. Returns the document plus one warning
/// per dropped line.
pub fn migrate_equivalents_text(text: &str) -> (EquivalentsDoc, Vec<String>) {
    let mut groups = Vec::new();
    let mut warnings = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((canonical, aliases)) = trimmed.split_once('=') else {
            warnings.push(format!(
                "manga_equivalents.txt line {line_no}: missing '=', line dropped"
            ));
            continue;
        };
        let canonical = canonical.trim();
        if canonical.is_empty() {
            warnings.push(format!(
                "manga_equivalents.txt line {line_no}: empty canonical, line dropped"
            ));
            continue;
        }
        let aliases: Vec<String> = aliases
            .split('|')
            .map(str::trim)
            .filter(|alias| !alias.is_empty())
            .map(str::to_string)
            .collect();
        groups.push(EquivalenceGroup {
            canonical: canonical.to_string(),
            aliases,
        });
    }

    (EquivalentsDoc { groups }, warnings)
}

/// Parse legacy source priority text.
pub fn migrate_source_priority_text(text: &str) -> (SourcePriorityDoc, Vec<String>) {
    let mut sources = Vec::new();
    let warnings = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        sources.push(trimmed.to_string());
    }

    (SourcePriorityDoc { sources }, warnings)
}
