//! Reversible escaping for path segments derived from titles.
//!
//! Canonical titles and branch-link labels become single directory names
//! under the merged root and branch directories. Separator characters and
//! other reserved bytes are percent-encoded so any title maps to exactly
//! one filesystem-safe segment and back.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Bytes that cannot appear raw in a single path segment.
const SEGMENT_RESERVED: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b'%');

/// Escape a title into a single filesystem-safe path segment.
///
/// Empty input and the dot segments (`.`, `..`) are escaped to non-empty,
/// non-special names so a segment can never traverse or vanish.
pub fn escape_segment(raw: &str) -> String {
    match raw {
        "" => "%".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => utf8_percent_encode(raw, SEGMENT_RESERVED).to_string(),
    }
}

/// Invert [`escape_segment`]. Returns `None` for byte sequences that do not
/// decode to UTF-8.
pub fn unescape_segment(segment: &str) -> Option<String> {
    match segment {
        "%" => Some(String::new()),
        "%2E" => Some(".".to_string()),
        "%2E%2E" => Some("..".to_string()),
        _ => percent_decode_str(segment)
            .decode_utf8()
            .ok()
            .map(|s| s.to_string()),
    }
}
