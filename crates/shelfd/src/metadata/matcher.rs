//! Candidate selection over search results.
//!
//! A candidate matches when its main title or any alternate title
//! normalizes to the requested title key. The first match in API order
//! wins; search relevance ordering is part of the contract.

use shelf_core::normalize::{normalize_title_key, SceneTagMatcher};

use super::payload::Candidate;

/// Result of candidate selection.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matched: Option<Candidate>,
    /// Set when the matcher had to give up because of a transient
    /// upstream problem rather than a genuine no-match.
    pub had_service_interruption: bool,
}

/// Matching seam.
pub trait CandidateMatcher: Send + Sync {
    fn select(
        &self,
        title_key: &str,
        candidates: &[Candidate],
        matcher: &SceneTagMatcher,
    ) -> MatchOutcome;
}

/// Key-equality matcher over main and alternate titles.
#[derive(Debug, Default, Clone, Copy)]
pub struct TitleKeyMatcher;

impl CandidateMatcher for TitleKeyMatcher {
    fn select(
        &self,
        title_key: &str,
        candidates: &[Candidate],
        matcher: &SceneTagMatcher,
    ) -> MatchOutcome {
        if title_key.is_empty() {
            return MatchOutcome::default();
        }
        let keyer = |raw: &str| normalize_title_key(raw, Some(matcher));
        let matched = candidates
            .iter()
            .find(|candidate| {
                keyer(&candidate.title) == title_key
                    || candidate
                        .alt_titles
                        .iter()
                        .any(|alt| keyer(&alt.title) == title_key)
            })
            .cloned();
        MatchOutcome {
            matched,
            had_service_interruption: false,
        }
    }
}
