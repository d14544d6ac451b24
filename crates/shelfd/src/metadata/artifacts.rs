//! Per-title metadata artifacts: `details.json` and `cover.jpg`.
//!
//! The details document uses the Tachiyomi local-source shape so merged
//! titles read as fully-described library entries. Descriptions render
//! per the configured mode: plain text, `<br/>` line breaks, or raw HTML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use shelf_core::config::{atomic_write_bytes, DetailsDescriptionMode};

use super::comicinfo::{decode_entities, ComicInfo};
use super::payload::ComicDetail;

pub const DETAILS_FILE: &str = "details.json";
pub const COVER_FILE: &str = "cover.jpg";
pub const COMICINFO_FILE: &str = "ComicInfo.xml";

/// Tachiyomi-style title details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailsDocument {
    pub title: String,
    pub author: String,
    pub artist: String,
    pub description: String,
    pub genre: Vec<String>,
    /// "0" unknown, "1" ongoing, "2" completed.
    pub status: String,
}

impl DetailsDocument {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.author.is_empty()
            && self.artist.is_empty()
            && self.description.is_empty()
            && self.genre.is_empty()
    }
}

/// Render a description for the configured mode.
pub fn render_description(raw: &str, mode: DetailsDescriptionMode) -> String {
    match mode {
        DetailsDescriptionMode::Html => raw.to_string(),
        DetailsDescriptionMode::Br => raw.replace('\n', "<br/>"),
        DetailsDescriptionMode::Text => {
            let with_breaks = raw
                .replace("<br/>", "\n")
                .replace("<br />", "\n")
                .replace("<br>", "\n");
            let mut out = String::with_capacity(with_breaks.len());
            let mut in_tag = false;
            for c in with_breaks.chars() {
                match c {
                    '<' => in_tag = true,
                    '>' => in_tag = false,
                    _ if !in_tag => out.push(c),
                    _ => {}
                }
            }
            decode_entities(out.trim())
        }
    }
}

fn status_string(status: Option<i64>) -> String {
    match status {
        Some(1) => "1".to_string(),
        Some(2) => "2".to_string(),
        Some(other) if other > 0 => other.to_string(),
        _ => "0".to_string(),
    }
}

/// Build details from a matched API payload.
pub fn details_from_comick(
    display_title: &str,
    detail: &ComicDetail,
    mode: DetailsDescriptionMode,
) -> DetailsDocument {
    DetailsDocument {
        title: display_title.to_string(),
        author: detail.authors.join(", "),
        artist: detail.artists.join(", "),
        description: detail
            .description
            .as_deref()
            .map(|raw| render_description(raw, mode))
            .unwrap_or_default(),
        genre: Vec::new(),
        status: status_string(detail.status),
    }
}

/// Build details from a source `ComicInfo.xml`.
pub fn details_from_comicinfo(
    display_title: &str,
    info: &ComicInfo,
    mode: DetailsDescriptionMode,
) -> DetailsDocument {
    let status = match info.status.as_deref().map(str::to_lowercase).as_deref() {
        Some("ongoing") => "1",
        Some("completed") | Some("ended") => "2",
        _ => "0",
    };
    DetailsDocument {
        title: display_title.to_string(),
        author: info.writer.clone().unwrap_or_default(),
        artist: info.penciller.clone().unwrap_or_default(),
        description: info
            .summary
            .as_deref()
            .map(|raw| render_description(raw, mode))
            .unwrap_or_default(),
        genre: info
            .genre
            .as_deref()
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        status: status.to_string(),
    }
}

/// Read a details document, tolerating absence and corruption.
pub fn read_details(dir: &Path) -> Option<DetailsDocument> {
    let bytes = std::fs::read(dir.join(DETAILS_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Write `details.json` atomically into a title directory.
pub fn write_details(dir: &Path, details: &DetailsDocument) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(details).map_err(std::io::Error::other)?;
    atomic_write_bytes(&dir.join(DETAILS_FILE), &json)
}

/// Write `cover.jpg` atomically into a title directory.
pub fn write_cover(dir: &Path, bytes: &[u8]) -> std::io::Result<()> {
    atomic_write_bytes(&dir.join(COVER_FILE), bytes)
}

/// Find the first source directory carrying a usable fallback artifact.
pub fn find_source_fallback(source_dirs: &[&Path]) -> Option<DetailsDocument> {
    for dir in source_dirs {
        if let Some(details) = read_details(dir) {
            if !details.is_empty() {
                return Some(details);
            }
        }
    }
    for dir in source_dirs {
        if let Ok(text) = std::fs::read_to_string(dir.join(COMICINFO_FILE)) {
            let info = super::comicinfo::parse_comicinfo(&text);
            if !info.is_empty() {
                let title = info.series.clone().unwrap_or_default();
                return Some(details_from_comicinfo(
                    &title,
                    &info,
                    DetailsDescriptionMode::Text,
                ));
            }
        }
    }
    None
}
