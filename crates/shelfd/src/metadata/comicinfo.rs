//! `ComicInfo.xml` parsing.
//!
//! Strict XML first; when that fails (the files in the wild are often
//! hand-edited or truncated), a tolerant line scanner recovers the scalar
//! elements and a multi-line `Summary`, preserving inline `<br/>` and
//! decoding HTML entities.

use roxmltree::Document;

/// The subset of ComicInfo fields the daemon consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComicInfo {
    pub series: Option<String>,
    pub writer: Option<String>,
    pub penciller: Option<String>,
    pub genre: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
}

impl ComicInfo {
    pub fn is_empty(&self) -> bool {
        self.series.is_none()
            && self.writer.is_none()
            && self.penciller.is_none()
            && self.genre.is_none()
            && self.status.is_none()
            && self.summary.is_none()
    }
}

const SCALAR_TAGS: [&str; 5] = ["Series", "Writer", "Penciller", "Genre", "Status"];
/// Tachiyomi writes publishing status under its own element name.
const STATUS_FALLBACK_TAG: &str = "PublishingStatusTachiyomi";

/// Decode the HTML entities that appear in ComicInfo text.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_strict(text: &str) -> Option<ComicInfo> {
    let document = Document::parse(text).ok()?;
    let find = |tag: &str| {
        document
            .descendants()
            .find(|node| node.has_tag_name(tag))
            .and_then(|node| node.text().map(str::to_string))
            .and_then(non_empty)
    };
    let mut info = ComicInfo {
        series: find("Series"),
        writer: find("Writer"),
        penciller: find("Penciller"),
        genre: find("Genre"),
        status: find("Status"),
        summary: find("Summary"),
    };
    if info.status.is_none() {
        info.status = find(STATUS_FALLBACK_TAG);
    }
    Some(info)
}

/// Pull `<Tag>value</Tag>` off a single line.
fn scan_scalar(line: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = line.find(&open)? + open.len();
    let end = line.find(&close)?;
    if end < start {
        return None;
    }
    non_empty(decode_entities(&line[start..end]))
}

fn parse_tolerant(text: &str) -> ComicInfo {
    let mut info = ComicInfo::default();
    let mut status_fallback = None;
    let mut summary_lines: Option<Vec<String>> = None;

    for line in text.lines() {
        if let Some(buffer) = summary_lines.as_mut() {
            if let Some(end) = line.find("</Summary>") {
                buffer.push(line[..end].to_string());
                info.summary = non_empty(decode_entities(&buffer.join("\n")));
                summary_lines = None;
            } else {
                buffer.push(line.to_string());
            }
            continue;
        }

        for tag in SCALAR_TAGS {
            if let Some(value) = scan_scalar(line, tag) {
                let slot = match tag {
                    "Series" => &mut info.series,
                    "Writer" => &mut info.writer,
                    "Penciller" => &mut info.penciller,
                    "Genre" => &mut info.genre,
                    _ => &mut info.status,
                };
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
        }
        if status_fallback.is_none() {
            status_fallback = scan_scalar(line, STATUS_FALLBACK_TAG);
        }

        if info.summary.is_none() {
            if let Some(value) = scan_scalar(line, "Summary") {
                info.summary = Some(value);
            } else if let Some(start) = line.find("<Summary>") {
                summary_lines = Some(vec![line[start + "<Summary>".len()..].to_string()]);
            }
        }
    }

    if info.status.is_none() {
        info.status = status_fallback;
    }
    info
}

/// Parse ComicInfo text: strict pass, then the tolerant scanner.
pub fn parse_comicinfo(text: &str) -> ComicInfo {
    match parse_strict(text) {
        Some(info) if !info.is_empty() => info,
        _ => parse_tolerant(text),
    }
}
