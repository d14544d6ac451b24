//! Title and token normalization.
//!
//! Two pipelines share the same folding front end:
//! - `normalize_title_key`: equivalence key for grouping titles across
//!   sources (articles dropped, per-word trailing `s` trimmed, no spaces).
//! - `normalize_token_key`: word-preserving key for source names and scene
//!   tags (single-space separated, no article/plural handling).
//!
//! An empty key means the input is not resolvable; callers must not treat
//! an empty key as a real group.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Articles dropped from the front of a title key.
const LEADING_ARTICLES: [&str; 3] = ["a", "an", "the"];

/// ASCII-fold a string: NFD decomposition, combining marks dropped, NFC
/// recomposition. Characters without an ASCII base (CJK etc.) pass through.
pub fn ascii_fold(raw: &str) -> String {
    raw.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

fn fold_lower(raw: &str) -> String {
    ascii_fold(raw).to_lowercase()
}

/// Map punctuation to single spaces and split into words.
fn words(folded: &str) -> Vec<String> {
    folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Compute the canonical equivalence key for a title.
///
/// Pipeline: scene-tag suffix strip (when a matcher is supplied), ASCII
/// fold, lowercase, punctuation to spaces, leading-article drop, per-word
/// trailing-`s` trim (words longer than one char), concatenation without
/// spaces. Idempotent: applying it to its own output is a no-op.
pub fn normalize_title_key(raw: &str, matcher: Option<&SceneTagMatcher>) -> String {
    let mut folded = fold_lower(raw);
    if let Some(matcher) = matcher {
        folded = matcher.strip_suffix_tags(&folded);
    }

    let mut parts = words(&folded);
    if let Some(first) = parts.first() {
        if LEADING_ARTICLES.contains(&first.as_str()) {
            parts.remove(0);
        }
    }

    parts
        .iter()
        .map(|word| {
            if word.len() > 1 && word.ends_with('s') {
                &word[..word.len() - 1]
            } else {
                word.as_str()
            }
        })
        .collect()
}

/// Compute the word-preserving token key used for source names and tag
/// identity. Output contains only letters, digits, and single spaces.
pub fn normalize_token_key(raw: &str) -> String {
    words(&fold_lower(raw)).join(" ")
}

/// One configured scene tag.
#[derive(Debug, Clone)]
struct TagEntry {
    /// Folded, lowercased tag value used for suffix comparison.
    value: String,
    /// Punctuation-only tags carry no token key and compare verbatim.
    verbatim: bool,
}

/// Suffix matcher over the configured scene-tag set.
///
/// A tag matches at the suffix when the title ends with the tag value,
/// case- and diacritic-insensitively, wrapped as `[tag]` or `(tag)`, or
/// following a `-` or whitespace boundary. Matching repeats until no tag
/// applies, so stacked suffixes (`Title [Color] [Official]`) strip fully.
#[derive(Debug, Clone, Default)]
pub struct SceneTagMatcher {
    tags: Vec<TagEntry>,
}

impl SceneTagMatcher {
    pub fn new<S: AsRef<str>>(tags: &[S]) -> Self {
        let tags = tags
            .iter()
            .filter_map(|tag| {
                let trimmed = tag.as_ref().trim();
                if trimmed.is_empty() {
                    return None;
                }
                let key = normalize_token_key(trimmed);
                if key.is_empty() {
                    Some(TagEntry {
                        value: trimmed.to_string(),
                        verbatim: true,
                    })
                } else {
                    Some(TagEntry {
                        value: fold_lower(trimmed),
                        verbatim: false,
                    })
                }
            })
            .collect();
        Self { tags }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// The identity under which two configured tags collide.
    ///
    /// Token-normalizable tags collide on their token key; punctuation-only
    /// tags collide on their verbatim trimmed text.
    pub fn matcher_key(tag: &str) -> String {
        let trimmed = tag.trim();
        let key = normalize_token_key(trimmed);
        if key.is_empty() {
            format!("verbatim:{trimmed}")
        } else {
            key
        }
    }

    /// Strip all matching suffix tags from folded, lowercased title text.
    fn strip_suffix_tags(&self, folded: &str) -> String {
        let mut current = folded.trim_end().to_string();
        loop {
            let mut stripped = None;
            for tag in &self.tags {
                if let Some(next) = strip_once(&current, tag) {
                    stripped = Some(next);
                    break;
                }
            }
            match stripped {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }
}

/// Remove trailing separators left behind after a tag is cut off.
fn trim_suffix_boundary(prefix: &str) -> String {
    prefix
        .trim_end()
        .trim_end_matches('-')
        .trim_end()
        .to_string()
}

fn strip_once(title: &str, tag: &TagEntry) -> Option<String> {
    let text = title.trim_end();
    let value = tag.value.as_str();
    if value.is_empty() {
        return None;
    }

    for (open, close) in [('[', ']'), ('(', ')')] {
        if text.ends_with(close) {
            if let Some(pos) = text.rfind(open) {
                let inner = text[pos + 1..text.len() - close.len_utf8()].trim();
                if inner == value {
                    return Some(trim_suffix_boundary(&text[..pos]));
                }
            }
        }
    }

    if text.len() > value.len() && text.ends_with(value) {
        let prefix = &text[..text.len() - value.len()];
        let boundary = prefix.chars().next_back();
        let delimited =
            matches!(boundary, Some(c) if c.is_whitespace() || c == '-') || tag.verbatim;
        if delimited {
            return Some(trim_suffix_boundary(prefix));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_key_drops_leading_article() {
        assert_eq!(normalize_title_key("The Promised Neverland", None), "promisedneverland");
        assert_eq!(normalize_title_key("A Silent Voice", None), "silentvoice");
        assert_eq!(normalize_title_key("An Apple", None), "apple");
    }

    #[test]
    fn title_key_trims_trailing_s_per_word() {
        assert_eq!(normalize_title_key("Attack Titans", None), "attacktitan");
        // A single-char word keeps its `s`.
        assert_eq!(normalize_title_key("S Class", None), "sclas");
    }

    #[test]
    fn title_key_folds_diacritics_and_punctuation() {
        assert_eq!(
            normalize_title_key("Ragnarök: The End!", None),
            normalize_title_key("ragnarok the end", None),
        );
    }

    #[test]
    fn title_key_is_idempotent() {
        for raw in ["The Beasts [Official]", "Café, Noir", "  ", "A", "ONE-PUNCH MAN"] {
            let once = normalize_title_key(raw, None);
            assert_eq!(normalize_title_key(&once, None), once, "input {raw:?}");
        }
    }

    #[test]
    fn empty_and_symbol_only_titles_yield_empty_keys() {
        assert_eq!(normalize_title_key("", None), "");
        assert_eq!(normalize_title_key("!!!", None), "");
    }

    #[test]
    fn token_key_preserves_word_boundaries() {
        assert_eq!(normalize_token_key("Manga-Source_01"), "manga source 01");
        assert_eq!(normalize_token_key("  The   Apples  "), "the apples");
    }

    #[test]
    fn token_key_alphabet_is_alnum_and_single_spaces() {
        for raw in ["Weird!!name", "tabs\tand\nnewlines", "Héllo (World)"] {
            let key = normalize_token_key(raw);
            assert!(
                key.chars().all(|c| c.is_alphanumeric() || c == ' '),
                "key {key:?}"
            );
            assert!(!key.contains("  "), "key {key:?}");
        }
    }

    #[test]
    fn matcher_strips_bracketed_suffix_tag() {
        let matcher = SceneTagMatcher::new(&["official"]);
        assert_eq!(
            normalize_title_key("My Manga [Official]", Some(&matcher)),
            normalize_title_key("My Manga", None),
        );
    }

    #[test]
    fn matcher_strips_paren_dash_and_bare_forms() {
        let matcher = SceneTagMatcher::new(&["color"]);
        for raw in ["Saga (Color)", "Saga - Color", "Saga Color"] {
            assert_eq!(
                normalize_title_key(raw, Some(&matcher)),
                "saga",
                "input {raw:?}"
            );
        }
    }

    #[test]
    fn matcher_requires_word_boundary_for_bare_form() {
        let matcher = SceneTagMatcher::new(&["official"]);
        // "Unofficial" must not lose its suffix.
        assert_eq!(
            normalize_title_key("Unofficial", Some(&matcher)),
            normalize_title_key("Unofficial", None),
        );
    }

    #[test]
    fn matcher_strips_stacked_tags() {
        let matcher = SceneTagMatcher::new(&["official", "color"]);
        assert_eq!(
            normalize_title_key("Saga [Color] [Official]", Some(&matcher)),
            "saga"
        );
    }

    #[test]
    fn matcher_is_diacritic_insensitive() {
        let matcher = SceneTagMatcher::new(&["Händler"]);
        assert_eq!(
            normalize_title_key("Saga [Handler]", Some(&matcher)),
            "saga"
        );
    }

    #[test]
    fn punctuation_only_tag_matches_verbatim() {
        let matcher = SceneTagMatcher::new(&["+!"]);
        assert_eq!(normalize_title_key("Saga+!", Some(&matcher)), "saga");
        // And stays inert for titles without the exact sequence.
        assert_eq!(normalize_title_key("Saga!", Some(&matcher)), "saga");
    }

    #[test]
    fn matcher_key_distinguishes_verbatim_tags() {
        assert_eq!(SceneTagMatcher::matcher_key("Official "), "official");
        assert_eq!(SceneTagMatcher::matcher_key("+!"), "verbatim:+!");
        assert_eq!(
            SceneTagMatcher::matcher_key("official"),
            SceneTagMatcher::matcher_key("OFFICIAL"),
        );
    }
}
