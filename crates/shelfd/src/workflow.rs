//! The merge-mount workflow: one pass from discovery to mounted tree.
//!
//! Pass order: discover volumes, group titles, plan and stage branches,
//! snapshot, reconcile, apply, validate, ensure metadata, prune branches.
//! Degradation anywhere (discovery, snapshot visibility, planning) keeps
//! mounts flowing but suppresses stale unmounts: a half-blind pass must
//! never tear down titles it merely failed to see.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shelf_core::config::{EquivalentsDoc, SourcePriorityDoc};
use shelf_core::eventlog::EventLog;
use shelf_core::normalize::{normalize_title_key, SceneTagMatcher};
use shelf_core::pathsafe::{escape_segment, unescape_segment};

use crate::coalesce::{MergeDispatchOutcome, MergeRequest};
use crate::discovery::{build_title_groups, GroupingContext, TitleGroup, VolumeDiscovery};
use crate::metadata::{artifacts, MetadataCoordinator, MetadataError, MetadataRequest, DETAILS_FILE};
use crate::mount::{
    prune_branch_dirs, reconcile, stage_branch_links, BranchPlan, BranchPlanner, DesiredMount,
    MountCommandService, MountSnapshotService, ReadinessProber, ReconcileAction, ReconcileInput,
};

/// Runs merge passes for the coalescer.
#[async_trait]
pub trait MergeRunner: Send + Sync {
    async fn run_pass(
        &self,
        request: &MergeRequest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MergeDispatchOutcome;
}

/// Static workflow inputs.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub sources_root: PathBuf,
    pub overrides_root: PathBuf,
    pub merged_root: PathBuf,
    pub config_root: PathBuf,
    pub equivalents_path: PathBuf,
    pub mergerfs_options_base: String,
    pub max_consecutive_mount_failures: u32,
    pub enable_health_checks: bool,
    /// Token keys of sources excluded from merging.
    pub excluded_sources: HashSet<String>,
}

/// The workflow.
pub struct MergeWorkflow {
    config: WorkflowConfig,
    discovery: Arc<dyn VolumeDiscovery>,
    snapshots: Arc<dyn MountSnapshotService>,
    mounts: Arc<dyn MountCommandService>,
    prober: ReadinessProber,
    planner: BranchPlanner,
    metadata: Option<Arc<MetadataCoordinator>>,
    fallback_equivalents: EquivalentsDoc,
    scene_matcher: SceneTagMatcher,
    priority: SourcePriorityDoc,
    log: Arc<dyn EventLog>,
}

impl std::fmt::Debug for MergeWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeWorkflow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resolve a force-remount target from the request reason.
///
/// Only `override-force:<title>` forces, and only when the title resolves
/// to a mountpoint in the desired set; an unresolvable title forces
/// nothing rather than everything.
fn force_targets(
    reason: &str,
    desired_by_canonical: &[(String, PathBuf)],
    matcher: &SceneTagMatcher,
) -> Vec<PathBuf> {
    let Some(title) = reason.strip_prefix("override-force:") else {
        return Vec::new();
    };
    let wanted = normalize_title_key(title, Some(matcher));
    if wanted.is_empty() {
        return Vec::new();
    }
    desired_by_canonical
        .iter()
        .filter(|(canonical, _)| normalize_title_key(canonical, Some(matcher)) == wanted)
        .map(|(_, mount_point)| mount_point.clone())
        .collect()
}

impl MergeWorkflow {
    pub fn new(
        config: WorkflowConfig,
        discovery: Arc<dyn VolumeDiscovery>,
        snapshots: Arc<dyn MountSnapshotService>,
        mounts: Arc<dyn MountCommandService>,
        prober: ReadinessProber,
        planner: BranchPlanner,
        metadata: Option<Arc<MetadataCoordinator>>,
        fallback_equivalents: EquivalentsDoc,
        scene_matcher: SceneTagMatcher,
        priority: SourcePriorityDoc,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            config,
            discovery,
            snapshots,
            mounts,
            prober,
            planner,
            metadata,
            fallback_equivalents,
            scene_matcher,
            priority,
            log,
        }
    }

    /// The equivalents catalog is rewritten by metadata matches; read the
    /// current document each pass and tolerate an interleaved rewrite.
    fn load_equivalents(&self) -> EquivalentsDoc {
        std::fs::read_to_string(&self.config.equivalents_path)
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_else(|| self.fallback_equivalents.clone())
    }

    fn mount_point_for(&self, canonical_title: &str) -> PathBuf {
        self.config.merged_root.join(escape_segment(canonical_title))
    }

    /// Map a still-mounted managed mountpoint back to its branch dir.
    fn branch_dir_for_mount_point(&self, mount_point: &Path) -> Option<PathBuf> {
        let segment = mount_point.file_name()?.to_string_lossy().to_string();
        let title = unescape_segment(&segment)?;
        let key = normalize_title_key(&title, Some(&self.scene_matcher));
        if key.is_empty() {
            return None;
        }
        Some(self.planner.branch_dir_for_key(&key))
    }

    async fn ensure_group_metadata(
        &self,
        group: &TitleGroup,
        plan: &BranchPlan,
        fallback_base: &Path,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), MetadataError> {
        let source_dirs: Vec<PathBuf> = group
            .source_branches
            .iter()
            .map(|branch| branch.source_path.clone())
            .collect();
        if let Some(metadata) = &self.metadata {
            let request = MetadataRequest {
                display_title: group.canonical_title.clone(),
                override_dirs: group.override_dirs.clone(),
                fallback_override_dir: fallback_base.join(escape_segment(&group.canonical_title)),
                source_dirs,
            };
            let outcome = metadata.ensure_metadata(&request, now, cancel).await?;
            if outcome.had_service_interruption {
                self.log.debug(
                    "merge.workflow.metadata_interrupted",
                    "metadata ensure saw a transient service interruption",
                    &[("title", group.canonical_title.clone())],
                );
            }
            return Ok(());
        }

        // No coordinator wired: still ensure details.json from source-side
        // metadata so merged titles read as described entries.
        let has_details = group
            .override_dirs
            .iter()
            .any(|dir| dir.join(DETAILS_FILE).exists());
        if has_details {
            return Ok(());
        }
        let source_refs: Vec<&Path> = source_dirs.iter().map(PathBuf::as_path).collect();
        if let Some(mut details) = artifacts::find_source_fallback(&source_refs) {
            details.title = group.canonical_title.clone();
            let target = plan.preferred_override_path.clone();
            if let Err(err) = std::fs::create_dir_all(&target)
                .and_then(|()| artifacts::write_details(&target, &details))
            {
                self.log.warning(
                    "merge.workflow.details_write_failed",
                    "details.json could not be written",
                    &[
                        ("dir", target.display().to_string()),
                        ("error", err.to_string()),
                    ],
                );
            }
        }
        Ok(())
    }

    /// Remove mergerfs mounts and residual directories under the merged
    /// root before the first pass of a daemon lifetime.
    pub async fn on_worker_starting(&self, cancel: &CancellationToken) {
        let managed_roots = vec![self.config.merged_root.clone()];
        let pre = self.snapshots.capture(cancel).await;
        for entry in pre.managed_entries(&managed_roots) {
            let result = self.mounts.unmount(&entry.mount_point, cancel).await;
            if !result.success {
                self.log.warning(
                    "cleanup.unmount_failed",
                    "startup unmount failed",
                    &[
                        ("mount_point", entry.mount_point.display().to_string()),
                        ("detail", result.detail.clone()),
                    ],
                );
            }
        }

        let post = self.snapshots.capture(cancel).await;
        let still_mounted: Vec<PathBuf> = post
            .managed_entries(&managed_roots)
            .map(|entry| entry.mount_point.clone())
            .collect();

        if !still_mounted.is_empty() || post.degraded() {
            self.log.debug(
                "cleanup.residual_skipped",
                "residual cleanup skipped, mounts remain or visibility degraded",
                &[("still_mounted", still_mounted.len().to_string())],
            );
        } else if let Ok(entries) = std::fs::read_dir(&self.config.merged_root) {
            let residual_root = self.config.config_root.join("cleanup/merged-residual");
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let empty = std::fs::read_dir(&path)
                    .map(|mut children| children.next().is_none())
                    .unwrap_or(false);
                if empty {
                    let _ = std::fs::remove_dir(&path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let mut target = residual_root.join(&name);
                let mut counter = 1;
                while target.exists() {
                    target = residual_root.join(format!("{name}-{counter}"));
                    counter += 1;
                }
                let moved = std::fs::create_dir_all(&residual_root)
                    .and_then(|()| std::fs::rename(&path, &target));
                match moved {
                    Ok(()) => self.log.warning(
                        "cleanup.residual_moved",
                        "non-empty residual directory moved out of the merged root",
                        &[
                            ("from", path.display().to_string()),
                            ("to", target.display().to_string()),
                        ],
                    ),
                    Err(err) => self.log.warning(
                        "cleanup.residual_move_failed",
                        "residual directory could not be moved",
                        &[
                            ("from", path.display().to_string()),
                            ("error", err.to_string()),
                        ],
                    ),
                }
            }
        }

        // Branch trees are rebuilt per pass; at startup everything not
        // still mounted is stale.
        let keep: HashSet<PathBuf> = still_mounted
            .iter()
            .filter_map(|mount_point| self.branch_dir_for_mount_point(mount_point))
            .collect();
        if post.degraded() {
            debug!("branch prune skipped at startup: snapshot degraded");
        } else {
            match prune_branch_dirs(self.planner.branches_root(), &keep) {
                Ok(removed) if !removed.is_empty() => self.log.debug(
                    "cleanup.branches_pruned",
                    "stale branch directories removed",
                    &[("count", removed.len().to_string())],
                ),
                Ok(_) => {}
                Err(err) => self.log.warning(
                    "cleanup.branches_prune_failed",
                    "stale branch prune failed",
                    &[("error", err.to_string())],
                ),
            }
        }
    }
}

#[async_trait]
impl MergeRunner for MergeWorkflow {
    async fn run_pass(
        &self,
        request: &MergeRequest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MergeDispatchOutcome {
        let mut pass_failed = false;

        // 1. Discover volumes.
        let volumes = self.discovery.discover();
        let source_degraded = volumes.source_discovery_degraded(&self.config.sources_root);
        for warning in &volumes.warnings {
            self.log.warning(
                "merge.workflow.discovery_warning",
                &warning.message,
                &[("root", warning.root.display().to_string())],
            );
        }

        // 2-3. Group titles.
        let equivalents = self.load_equivalents();
        let context = GroupingContext {
            equivalents: &equivalents,
            matcher: &self.scene_matcher,
            priority: &self.priority,
            excluded_sources: &self.config.excluded_sources,
        };
        let (groups, group_warnings) = build_title_groups(&volumes, &context);
        for warning in group_warnings {
            self.log.warning("merge.workflow.grouping_warning", &warning, &[]);
        }
        if cancel.is_cancelled() {
            return MergeDispatchOutcome::Failure;
        }

        // 4. Plan and stage branches; build the desired mount set.
        let fallback_base = volumes
            .override_volumes
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.overrides_root.clone());
        let mut build_degraded = false;
        let mut plans: Vec<(TitleGroup, BranchPlan)> = Vec::new();
        let mut desired: Vec<DesiredMount> = Vec::new();
        let mut desired_by_canonical: Vec<(String, PathBuf)> = Vec::new();
        for group in groups {
            let fallback_override = fallback_base.join(escape_segment(&group.canonical_title));
            let plan = match self.planner.plan(&group, &group.override_dirs, &fallback_override) {
                Ok(plan) => plan,
                Err(err) => {
                    build_degraded = true;
                    self.log.warning(
                        "merge.workflow.plan_failed",
                        "branch planning failed, group skipped",
                        &[
                            ("title", group.canonical_title.clone()),
                            ("error", err.to_string()),
                        ],
                    );
                    continue;
                }
            };
            match stage_branch_links(&plan) {
                Ok(warnings) => {
                    for warning in warnings {
                        self.log.warning("merge.workflow.stage_warning", &warning, &[]);
                    }
                }
                Err(err) => {
                    build_degraded = true;
                    self.log.warning(
                        "merge.workflow.stage_failed",
                        "branch staging failed, group skipped",
                        &[
                            ("title", group.canonical_title.clone()),
                            ("error", err.to_string()),
                        ],
                    );
                    continue;
                }
            }
            let mount_point = self.mount_point_for(&group.canonical_title);
            desired.push(DesiredMount::new(
                mount_point.clone(),
                &self.config.mergerfs_options_base,
                plan.branch_spec.clone(),
            ));
            desired_by_canonical.push((group.canonical_title.clone(), mount_point));
            plans.push((group, plan));
        }

        // 5. One pre-apply snapshot.
        let pre = self.snapshots.capture(cancel).await;
        let degraded_visibility = pre.degraded();
        if cancel.is_cancelled() {
            return MergeDispatchOutcome::Failure;
        }

        // 6. Reconcile.
        let managed_roots = vec![self.config.merged_root.clone()];
        let force = force_targets(&request.reason, &desired_by_canonical, &self.scene_matcher);
        let actions = reconcile(&ReconcileInput {
            desired: &desired,
            snapshot: &pre,
            managed_roots: &managed_roots,
            enable_health_checks: self.config.enable_health_checks,
            force_remount: &force,
        });

        // 7. Apply sequentially with fail-fast.
        let suppress_unmounts = source_degraded || degraded_visibility || build_degraded;
        let mut consecutive_failures: u32 = 0;
        let mut suppressed = 0usize;
        let mut succeeded_points: Vec<PathBuf> = Vec::new();
        for action in &actions {
            if cancel.is_cancelled() {
                return MergeDispatchOutcome::Failure;
            }
            if action.is_unmount() && suppress_unmounts {
                suppressed += 1;
                pass_failed = true;
                continue;
            }
            let success = match action {
                ReconcileAction::Mount(desired_mount) => {
                    self.apply_mount(desired_mount, false, cancel).await
                }
                ReconcileAction::Remount(desired_mount) => {
                    self.apply_mount(desired_mount, true, cancel).await
                }
                ReconcileAction::Unmount { mount_point, .. } => {
                    let result = self.mounts.unmount(mount_point, cancel).await;
                    if !result.success {
                        self.log.warning(
                            "merge.workflow.unmount_failed",
                            "stale unmount failed",
                            &[
                                ("mount_point", mount_point.display().to_string()),
                                ("detail", result.detail.clone()),
                            ],
                        );
                    }
                    result.success
                }
            };
            if success {
                consecutive_failures = 0;
                if !action.is_unmount() {
                    succeeded_points.push(action.mount_point().to_path_buf());
                }
            } else {
                pass_failed = true;
                consecutive_failures += 1;
                if consecutive_failures >= self.config.max_consecutive_mount_failures {
                    self.log.warning(
                        "merge.workflow.action_fail_fast",
                        "consecutive mount failures reached the fail-fast threshold",
                        &[
                            ("failures", consecutive_failures.to_string()),
                            (
                                "threshold",
                                self.config.max_consecutive_mount_failures.to_string(),
                            ),
                        ],
                    );
                    break;
                }
            }
        }
        if suppressed > 0 {
            self.log.warning(
                "merge.workflow.unmounts_suppressed",
                "Suppressed stale-unmount actions",
                &[
                    ("count", suppressed.to_string()),
                    ("source_degraded", source_degraded.to_string()),
                    ("snapshot_degraded", degraded_visibility.to_string()),
                    ("build_degraded", build_degraded.to_string()),
                ],
            );
        }

        // Post-apply snapshot: exactly one capture, then validate.
        let post = self.snapshots.capture(cancel).await;
        for mount_point in &succeeded_points {
            let healthy = post
                .entry_for(mount_point)
                .is_some_and(|entry| entry.fs_type == crate::mount::MERGERFS_FSTYPE);
            if !healthy {
                pass_failed = true;
                self.log.warning(
                    "merge.workflow.post_validate_failed",
                    "mountpoint does not report mergerfs after apply",
                    &[("mount_point", mount_point.display().to_string())],
                );
            }
        }

        // 8. Metadata per group.
        for (group, plan) in &plans {
            if cancel.is_cancelled() {
                return MergeDispatchOutcome::Failure;
            }
            if self
                .ensure_group_metadata(group, plan, &fallback_base, now, cancel)
                .await
                .is_err()
            {
                return MergeDispatchOutcome::Failure;
            }
        }

        // 9. Restage and prune branch directories.
        let mut keep: HashSet<PathBuf> = plans.iter().map(|(_, plan)| plan.branch_dir.clone()).collect();
        keep.extend(
            post.managed_entries(&managed_roots)
                .filter_map(|entry| self.branch_dir_for_mount_point(&entry.mount_point)),
        );
        if degraded_visibility || post.degraded() {
            debug!("branch prune skipped: snapshot reliability degraded");
        } else {
            match prune_branch_dirs(self.planner.branches_root(), &keep) {
                Ok(removed) if !removed.is_empty() => self.log.debug(
                    "merge.workflow.branches_pruned",
                    "inactive branch directories removed",
                    &[("count", removed.len().to_string())],
                ),
                Ok(_) => {}
                Err(err) => self.log.warning(
                    "merge.workflow.branches_prune_failed",
                    "branch prune failed",
                    &[("error", err.to_string())],
                ),
            }
        }

        self.log.normal(
            "merge.workflow.pass_complete",
            "merge pass finished",
            &[
                ("reason", request.reason.clone()),
                ("groups", plans.len().to_string()),
                ("actions", actions.len().to_string()),
                ("failed", pass_failed.to_string()),
            ],
        );

        if pass_failed {
            MergeDispatchOutcome::Failure
        } else {
            MergeDispatchOutcome::Success
        }
    }
}

impl MergeWorkflow {
    /// Mount or remount one desired mount, then probe readiness.
    async fn apply_mount(
        &self,
        desired: &DesiredMount,
        remount: bool,
        cancel: &CancellationToken,
    ) -> bool {
        if remount {
            let result = self.mounts.unmount(&desired.mount_point, cancel).await;
            if !result.success {
                self.log.warning(
                    "merge.workflow.remount_unmount_failed",
                    "unmount before remount failed",
                    &[
                        ("mount_point", desired.mount_point.display().to_string()),
                        ("detail", result.detail.clone()),
                    ],
                );
                return false;
            }
        }
        let result = self.mounts.mount(desired, cancel).await;
        if !result.success {
            self.log.warning(
                "merge.workflow.mount_failed",
                "mount command failed",
                &[
                    ("mount_point", desired.mount_point.display().to_string()),
                    ("detail", result.detail.clone()),
                ],
            );
            return false;
        }
        let readiness = self.prober.probe(&desired.mount_point, cancel).await;
        if !readiness.ready {
            self.log.warning(
                "merge.workflow.readiness_failed",
                "mount did not become ready",
                &[
                    ("mount_point", desired.mount_point.display().to_string()),
                    ("detail", readiness.detail.clone()),
                ],
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use shelf_core::eventlog::CapturingLog;

    use crate::discovery::FsVolumeDiscovery;
    use crate::mount::{
        MountCommandResult, MountSnapshot, MountSnapshotEntry, SnapshotSeverity, SnapshotWarning,
        MERGERFS_FSTYPE,
    };

    #[derive(Debug)]
    struct FakeSnapshots {
        sequence: Mutex<VecDeque<MountSnapshot>>,
        last: Mutex<MountSnapshot>,
    }

    impl FakeSnapshots {
        fn new(sequence: Vec<MountSnapshot>) -> Arc<Self> {
            let mut queue: VecDeque<MountSnapshot> = sequence.into();
            let last = queue.back().cloned().unwrap_or_default();
            if queue.len() > 1 {
                // Keep the final element as the steady state.
                queue.pop_back();
            } else {
                queue.clear();
            }
            Arc::new(Self {
                sequence: Mutex::new(queue),
                last: Mutex::new(last),
            })
        }
    }

    #[async_trait]
    impl MountSnapshotService for FakeSnapshots {
        async fn capture(&self, _cancel: &CancellationToken) -> MountSnapshot {
            if let Some(snapshot) = self.sequence.lock().unwrap().pop_front() {
                return snapshot;
            }
            self.last.lock().unwrap().clone()
        }
    }

    #[derive(Debug, Default)]
    struct FakeMounts {
        mount_calls: Mutex<Vec<PathBuf>>,
        unmount_calls: Mutex<Vec<PathBuf>>,
        fail_mounts: bool,
    }

    #[async_trait]
    impl MountCommandService for FakeMounts {
        async fn mount(
            &self,
            desired: &DesiredMount,
            _cancel: &CancellationToken,
        ) -> MountCommandResult {
            self.mount_calls.lock().unwrap().push(desired.mount_point.clone());
            MountCommandResult {
                success: !self.fail_mounts,
                detail: if self.fail_mounts { "boom".to_string() } else { String::new() },
            }
        }

        async fn unmount(
            &self,
            mount_point: &Path,
            _cancel: &CancellationToken,
        ) -> MountCommandResult {
            self.unmount_calls.lock().unwrap().push(mount_point.to_path_buf());
            MountCommandResult {
                success: true,
                detail: String::new(),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        sources_root: PathBuf,
        overrides_root: PathBuf,
        merged_root: PathBuf,
        log: Arc<CapturingLog>,
    }

    fn fixture(titles: &[&str]) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let sources_root = dir.path().join("sources");
        let overrides_root = dir.path().join("overrides");
        let merged_root = dir.path().join("merged");
        for title in titles {
            std::fs::create_dir_all(sources_root.join("SourceA").join(title)).unwrap();
        }
        std::fs::create_dir_all(&sources_root).unwrap();
        std::fs::create_dir_all(&overrides_root).unwrap();
        std::fs::create_dir_all(&merged_root).unwrap();
        Fixture {
            sources_root,
            overrides_root,
            merged_root,
            log: Arc::new(CapturingLog::new()),
            dir,
        }
    }

    fn mergerfs_entry(mount_point: PathBuf, source: &str) -> MountSnapshotEntry {
        MountSnapshotEntry {
            mount_point,
            fs_type: MERGERFS_FSTYPE.to_string(),
            source: source.to_string(),
            options: String::new(),
            healthy: None,
        }
    }

    fn ready_snapshot(fx: &Fixture, titles: &[&str]) -> MountSnapshot {
        MountSnapshot {
            entries: titles
                .iter()
                .map(|title| mergerfs_entry(fx.merged_root.join(escape_segment(title)), "shelf-x"))
                .collect(),
            warnings: vec![],
        }
    }

    fn workflow(
        fx: &Fixture,
        snapshots: Arc<FakeSnapshots>,
        mounts: Arc<FakeMounts>,
        max_failures: u32,
    ) -> MergeWorkflow {
        let config = WorkflowConfig {
            sources_root: fx.sources_root.clone(),
            overrides_root: fx.overrides_root.clone(),
            merged_root: fx.merged_root.clone(),
            config_root: fx.dir.path().join("config"),
            equivalents_path: fx.dir.path().join("config/manga_equivalents.yml"),
            mergerfs_options_base: "allow_other".to_string(),
            max_consecutive_mount_failures: max_failures,
            enable_health_checks: false,
            excluded_sources: HashSet::new(),
        };
        MergeWorkflow::new(
            config,
            Arc::new(FsVolumeDiscovery::new(
                fx.sources_root.clone(),
                fx.overrides_root.clone(),
            )),
            Arc::clone(&snapshots) as Arc<dyn MountSnapshotService>,
            Arc::clone(&mounts) as Arc<dyn MountCommandService>,
            ReadinessProber::new(
                snapshots as Arc<dyn MountSnapshotService>,
                Duration::from_millis(200),
            ),
            BranchPlanner::new(fx.dir.path().join("state/branches")),
            None,
            EquivalentsDoc::default(),
            SceneTagMatcher::default(),
            SourcePriorityDoc::default(),
            Arc::clone(&fx.log) as Arc<dyn EventLog>,
        )
    }

    fn request(reason: &str) -> MergeRequest {
        MergeRequest {
            reason: reason.to_string(),
            force: false,
        }
    }

    #[tokio::test]
    async fn clean_pass_mounts_each_group_and_stages_branches() {
        let fx = fixture(&["Alpha"]);
        let snapshots = FakeSnapshots::new(vec![
            MountSnapshot::default(),
            ready_snapshot(&fx, &["Alpha"]),
        ]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 3);

        let outcome = wf
            .run_pass(&request("startup"), Utc::now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, MergeDispatchOutcome::Success);
        assert_eq!(
            mounts.mount_calls.lock().unwrap().clone(),
            vec![fx.merged_root.join("Alpha")]
        );
        let branch_dir = fx.dir.path().join("state/branches/alpha");
        assert!(branch_dir.join("10_source_sourcea_000").exists() || std::fs::read_link(branch_dir.join("10_source_sourcea_000")).is_ok());
    }

    #[tokio::test]
    async fn degraded_snapshot_suppresses_stale_unmounts_but_still_mounts() {
        let fx = fixture(&["Alpha"]);
        let stale = fx.merged_root.join("Stale");
        let pre = MountSnapshot {
            entries: vec![mergerfs_entry(stale.clone(), "shelf-old")],
            warnings: vec![SnapshotWarning {
                severity: SnapshotSeverity::DegradedVisibility,
                message: "partial view".to_string(),
            }],
        };
        let snapshots = FakeSnapshots::new(vec![pre, ready_snapshot(&fx, &["Alpha"])]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 3);

        let outcome = wf
            .run_pass(&request("chapter-implied-new:SourceA/Alpha"), Utc::now(), &CancellationToken::new())
            .await;

        // Mount applied, unmount suppressed, outcome contagiously failed.
        assert_eq!(outcome, MergeDispatchOutcome::Failure);
        assert_eq!(mounts.mount_calls.lock().unwrap().len(), 1);
        assert!(mounts.unmount_calls.lock().unwrap().is_empty());
        let warnings = fx.log.with_id("merge.workflow.unmounts_suppressed");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("Suppressed stale-unmount"));
    }

    #[tokio::test]
    async fn consecutive_failures_trip_the_fail_fast_threshold() {
        let fx = fixture(&["Alpha", "Beta", "Gamma"]);
        let snapshots = FakeSnapshots::new(vec![MountSnapshot::default()]);
        let mounts = Arc::new(FakeMounts {
            fail_mounts: true,
            ..FakeMounts::default()
        });
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 2);

        let outcome = wf
            .run_pass(&request("startup"), Utc::now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, MergeDispatchOutcome::Failure);
        assert_eq!(
            mounts.mount_calls.lock().unwrap().len(),
            2,
            "third action is never attempted"
        );
        assert!(fx.log.contains_id("merge.workflow.action_fail_fast"));
    }

    #[tokio::test]
    async fn post_validation_downgrades_silent_mount_failures() {
        let fx = fixture(&["Alpha"]);
        // Mount command "succeeds" and the probe window sees mergerfs,
        // but the final snapshot does not list the mountpoint.
        let snapshots = FakeSnapshots::new(vec![
            MountSnapshot::default(),
            ready_snapshot(&fx, &["Alpha"]),
            MountSnapshot::default(),
        ]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 3);

        let outcome = wf
            .run_pass(&request("startup"), Utc::now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, MergeDispatchOutcome::Failure);
        assert!(fx.log.contains_id("merge.workflow.post_validate_failed"));
    }

    #[tokio::test]
    async fn details_fallback_is_written_without_a_coordinator() {
        let fx = fixture(&["Alpha"]);
        std::fs::write(
            fx.sources_root.join("SourceA/Alpha/ComicInfo.xml"),
            "<ComicInfo><Series>Alpha</Series><Writer>Someone</Writer></ComicInfo>",
        )
        .unwrap();
        let snapshots = FakeSnapshots::new(vec![
            MountSnapshot::default(),
            ready_snapshot(&fx, &["Alpha"]),
        ]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 3);

        let outcome = wf
            .run_pass(&request("startup"), Utc::now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, MergeDispatchOutcome::Success);
        let details = artifacts::read_details(&fx.overrides_root.join("Alpha")).unwrap();
        assert_eq!(details.title, "Alpha");
        assert_eq!(details.author, "Someone");
    }

    #[test]
    fn force_targets_resolve_only_override_force_reasons() {
        let matcher = SceneTagMatcher::default();
        let desired = vec![
            ("One-Punch Man".to_string(), PathBuf::from("/merged/One-Punch Man")),
            ("Saga".to_string(), PathBuf::from("/merged/Saga")),
        ];
        assert_eq!(
            force_targets("override-force:one punch man", &desired, &matcher),
            vec![PathBuf::from("/merged/One-Punch Man")]
        );
        assert!(force_targets("startup", &desired, &matcher).is_empty());
        assert!(force_targets("override-force:Unknown", &desired, &matcher).is_empty());
        assert!(force_targets("override-force:", &desired, &matcher).is_empty());
    }

    #[tokio::test]
    async fn startup_cleanup_unmounts_and_moves_residuals() {
        let fx = fixture(&[]);
        let mounted = fx.merged_root.join("Old Title");
        std::fs::create_dir_all(&mounted).unwrap();
        std::fs::write(mounted.join("stray.txt"), b"leftover").unwrap();
        let empty = fx.merged_root.join("Empty");
        std::fs::create_dir_all(&empty).unwrap();

        let pre = MountSnapshot {
            entries: vec![mergerfs_entry(mounted.clone(), "shelf-old")],
            warnings: vec![],
        };
        // After unmounting, the table is clean.
        let snapshots = FakeSnapshots::new(vec![pre, MountSnapshot::default()]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, Arc::clone(&mounts), 3);

        wf.on_worker_starting(&CancellationToken::new()).await;

        assert_eq!(mounts.unmount_calls.lock().unwrap().clone(), vec![mounted.clone()]);
        assert!(!empty.exists(), "empty residual removed");
        assert!(!mounted.exists(), "non-empty residual moved away");
        let residual_root = fx.dir.path().join("config/cleanup/merged-residual");
        assert!(residual_root.join("Old Title").join("stray.txt").exists());
        assert!(fx.log.contains_id("cleanup.residual_moved"));
    }

    #[tokio::test]
    async fn startup_cleanup_skips_residuals_when_mounts_remain() {
        let fx = fixture(&[]);
        let mounted = fx.merged_root.join("Still Mounted");
        std::fs::create_dir_all(&mounted).unwrap();
        std::fs::write(mounted.join("file"), b"x").unwrap();

        let busy = MountSnapshot {
            entries: vec![mergerfs_entry(mounted.clone(), "shelf-x")],
            warnings: vec![],
        };
        // The unmount "succeeds" but the re-snapshot still shows the mount.
        let snapshots = FakeSnapshots::new(vec![busy.clone(), busy]);
        let mounts = Arc::new(FakeMounts::default());
        let wf = workflow(&fx, snapshots, mounts, 3);

        wf.on_worker_starting(&CancellationToken::new()).await;
        assert!(mounted.exists(), "residual untouched while mounted");
        assert!(fx.log.contains_id("cleanup.residual_skipped"));
    }
}
