//! Per-title metadata coordination.
//!
//! `ensure_metadata` is the one entry point: it returns immediately when
//! both artifacts exist, gates API traffic through the per-title
//! cooldown, matches search candidates, and ensures `cover.jpg` and
//! `details.json` with graceful fallbacks to source-side metadata.

pub mod artifacts;
pub mod catalog;
pub mod comicinfo;
pub mod cooldown;
pub mod gateway;
pub mod matcher;
pub mod payload;

pub use artifacts::{DetailsDocument, COMICINFO_FILE, COVER_FILE, DETAILS_FILE};
pub use catalog::{EquivalenceCatalog, YamlEquivalenceCatalog};
pub use cooldown::CooldownStore;
pub use gateway::{ComickGateway, GatewayResponse, GatewayStatus, HttpComickGateway};
pub use matcher::{CandidateMatcher, MatchOutcome, TitleKeyMatcher};
pub use payload::{Candidate, ComicDetail};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use shelf_core::config::DetailsDescriptionMode;
use shelf_core::eventlog::EventLog;
use shelf_core::normalize::{normalize_title_key, SceneTagMatcher};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata ensure cancelled")]
    Cancelled,
}

/// One title's metadata request.
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub display_title: String,
    /// Existing override directories, volume order; first is preferred.
    pub override_dirs: Vec<PathBuf>,
    /// Where the preferred override is created when none exists.
    pub fallback_override_dir: PathBuf,
    /// Source title directories, branch order, for artifact fallbacks.
    pub source_dirs: Vec<PathBuf>,
}

/// What one ensure pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub had_service_interruption: bool,
    pub matched: bool,
    pub cover_written: bool,
    pub details_written: bool,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub cooldown: chrono::Duration,
    pub preferred_language: String,
    pub description_mode: DetailsDescriptionMode,
}

/// The per-title metadata coordinator.
pub struct MetadataCoordinator {
    gateway: Arc<dyn ComickGateway>,
    candidate_matcher: Box<dyn CandidateMatcher>,
    catalog: Arc<dyn EquivalenceCatalog>,
    cooldowns: CooldownStore,
    scene_matcher: SceneTagMatcher,
    config: MetadataConfig,
    log: Arc<dyn EventLog>,
}

impl std::fmt::Debug for MetadataCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn dir_with(dirs: &[PathBuf], file: &str) -> Option<PathBuf> {
    dirs.iter().find(|dir| dir.join(file).exists()).cloned()
}

impl MetadataCoordinator {
    pub fn new(
        gateway: Arc<dyn ComickGateway>,
        candidate_matcher: Box<dyn CandidateMatcher>,
        catalog: Arc<dyn EquivalenceCatalog>,
        cooldowns: CooldownStore,
        scene_matcher: SceneTagMatcher,
        config: MetadataConfig,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            gateway,
            candidate_matcher,
            catalog,
            cooldowns,
            scene_matcher,
            config,
            log,
        }
    }

    /// Ensure `cover.jpg` and `details.json` for one title.
    ///
    /// Cancellation propagates as an error and skips the cooldown write;
    /// every other API outcome records a cooldown so retry pressure stays
    /// bounded.
    pub async fn ensure_metadata(
        &self,
        request: &MetadataRequest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<EnsureOutcome, MetadataError> {
        let mut outcome = EnsureOutcome::default();

        let cover_dir = dir_with(&request.override_dirs, COVER_FILE);
        let details_dir = dir_with(&request.override_dirs, DETAILS_FILE);
        if cover_dir.is_some() && details_dir.is_some() {
            return Ok(outcome);
        }

        let title_key = normalize_title_key(&request.display_title, Some(&self.scene_matcher));
        let mut matched: Option<Candidate> = None;

        if !title_key.is_empty() {
            if self.cooldowns.is_cooling(&title_key, now) {
                self.log.debug(
                    "metadata.cooldown.active",
                    "metadata API attempt skipped by cooldown",
                    &[("title", request.display_title.clone())],
                );
            } else {
                let response = self.gateway.search(&request.display_title, cancel).await;
                match response.status {
                    GatewayStatus::Cancelled if cancel.is_cancelled() => {
                        return Err(MetadataError::Cancelled);
                    }
                    GatewayStatus::Cancelled | GatewayStatus::HttpFailure => {
                        outcome.had_service_interruption = true;
                        self.log.warning(
                            "metadata.search.interrupted",
                            "metadata search failed transiently",
                            &[
                                ("title", request.display_title.clone()),
                                ("detail", response.detail.clone()),
                            ],
                        );
                    }
                    GatewayStatus::Success => {
                        let candidates = response.payload.unwrap_or_default();
                        let selection = self.candidate_matcher.select(
                            &title_key,
                            &candidates,
                            &self.scene_matcher,
                        );
                        outcome.had_service_interruption |= selection.had_service_interruption;
                        matched = selection.matched;
                    }
                }
                // Any completed API attempt starts the cooldown.
                self.cooldowns.record(&title_key, now + self.config.cooldown);
            }
        }

        outcome.matched = matched.is_some();
        if let Some(candidate) = &matched {
            self.update_catalog(request, candidate);
        }

        let preferred_dir = request
            .override_dirs
            .first()
            .cloned()
            .unwrap_or_else(|| request.fallback_override_dir.clone());

        if cover_dir.is_none() {
            outcome.cover_written =
                self.ensure_cover(&matched, &preferred_dir, &mut outcome, cancel).await?;
        }

        if details_dir.is_none() {
            outcome.details_written = self
                .ensure_details(request, &matched, &preferred_dir, &mut outcome, cancel)
                .await?;
        }

        Ok(outcome)
    }

    /// Best-effort equivalents update from the matched candidate: main
    /// title plus alternates under the preferred language.
    fn update_catalog(&self, request: &MetadataRequest, candidate: &Candidate) {
        let mut aliases = vec![candidate.title.clone()];
        aliases.extend(
            candidate
                .alt_titles
                .iter()
                .filter(|alt| alt.lang.as_deref() == Some(self.config.preferred_language.as_str()))
                .map(|alt| alt.title.clone()),
        );
        if let Err(err) = self.catalog.merge_titles(&request.display_title, &aliases) {
            warn!(
                title = %request.display_title,
                error = %err,
                "equivalents catalog update failed"
            );
        }
    }

    async fn ensure_cover(
        &self,
        matched: &Option<Candidate>,
        preferred_dir: &Path,
        outcome: &mut EnsureOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool, MetadataError> {
        let Some(candidate) = matched else {
            return Ok(false);
        };
        let Some(b2key) = candidate.cover_keys.first() else {
            return Ok(false);
        };
        let response = self.gateway.fetch_cover(b2key, cancel).await;
        match response.status {
            GatewayStatus::Cancelled if cancel.is_cancelled() => Err(MetadataError::Cancelled),
            GatewayStatus::Cancelled | GatewayStatus::HttpFailure => {
                outcome.had_service_interruption = true;
                Ok(false)
            }
            GatewayStatus::Success => {
                let bytes = response.payload.unwrap_or_default();
                if let Err(err) = std::fs::create_dir_all(preferred_dir)
                    .and_then(|()| artifacts::write_cover(preferred_dir, &bytes))
                {
                    self.log.warning(
                        "metadata.cover.write_failed",
                        "cover could not be written",
                        &[
                            ("dir", preferred_dir.display().to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    async fn ensure_details(
        &self,
        request: &MetadataRequest,
        matched: &Option<Candidate>,
        preferred_dir: &Path,
        outcome: &mut EnsureOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool, MetadataError> {
        let mut details: Option<DetailsDocument> = None;

        if let Some(candidate) = matched {
            let response = self.gateway.comic_detail(&candidate.slug, cancel).await;
            match response.status {
                GatewayStatus::Cancelled if cancel.is_cancelled() => {
                    return Err(MetadataError::Cancelled);
                }
                GatewayStatus::Cancelled | GatewayStatus::HttpFailure => {
                    outcome.had_service_interruption = true;
                }
                GatewayStatus::Success => {
                    if let Some(detail) = response.payload {
                        details = Some(artifacts::details_from_comick(
                            &request.display_title,
                            &detail,
                            self.config.description_mode,
                        ));
                    }
                }
            }
        }

        if details.is_none() {
            let source_dirs: Vec<&Path> =
                request.source_dirs.iter().map(PathBuf::as_path).collect();
            details = artifacts::find_source_fallback(&source_dirs).map(|mut doc| {
                doc.title = request.display_title.clone();
                doc
            });
        }

        let Some(details) = details else {
            return Ok(false);
        };
        if let Err(err) = std::fs::create_dir_all(preferred_dir)
            .and_then(|()| artifacts::write_details(preferred_dir, &details))
        {
            self.log.warning(
                "metadata.details.write_failed",
                "details could not be written",
                &[
                    ("dir", preferred_dir.display().to_string()),
                    ("error", err.to_string()),
                ],
            );
            return Ok(false);
        }
        Ok(true)
    }
}
