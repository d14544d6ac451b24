//! Union-mount management: snapshots, reconciliation, commands, branches.
//!
//! The desired state is one mergerfs mount per canonical title. Identity
//! is a stable hash over the option base and branch specification, carried
//! through the mount's `fsname` so a snapshot read gives it back without
//! any side-channel state.

mod branches;
mod command;
mod reconcile;
mod snapshot;

pub use branches::{
    prune_branch_dirs, stage_branch_links, AccessMode, BranchLink, BranchPlan, BranchPlanner,
    PlanError,
};
pub use command::{
    MergerfsMountService, MountCommandResult, MountCommandService, PriorityWrap, ReadinessProber,
    ReadinessResult,
};
pub use reconcile::{reconcile, ReconcileAction, ReconcileInput, UnmountReason};
pub use snapshot::FindmntSnapshotService;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// The filesystem type every managed mount must report.
pub const MERGERFS_FSTYPE: &str = "fuse.mergerfs";

/// Prefix for the `fsname` identity marker.
const SOURCE_PREFIX: &str = "shelf-";

/// Stable identity over `(options_base, branch_spec)`.
pub fn mount_identity(options_base: &str, branch_spec: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(options_base.as_bytes());
    hasher.update(b"|");
    hasher.update(branch_spec.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// One mount the reconciler should converge towards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredMount {
    pub mount_point: PathBuf,
    pub identity: String,
    pub branch_spec: String,
    pub options: String,
}

impl DesiredMount {
    pub fn new(mount_point: PathBuf, options_base: &str, branch_spec: String) -> Self {
        let identity = mount_identity(options_base, &branch_spec);
        let options = format!("{options_base},fsname={SOURCE_PREFIX}{identity}");
        Self {
            mount_point,
            identity,
            branch_spec,
            options,
        }
    }

    /// The `fsname` the mount reports back through snapshots.
    pub fn source_name(&self) -> String {
        format!("{SOURCE_PREFIX}{}", self.identity)
    }
}

/// Severity of a snapshot warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSeverity {
    Info,
    /// The provider's view of the mount table may be incomplete; stale
    /// unmounts must not be trusted.
    DegradedVisibility,
}

#[derive(Debug, Clone)]
pub struct SnapshotWarning {
    pub severity: SnapshotSeverity,
    pub message: String,
}

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSnapshotEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    pub options: String,
    /// Tri-state: `None` when health checking is disabled.
    pub healthy: Option<bool>,
}

/// Captured mount table plus provider warnings.
#[derive(Debug, Clone, Default)]
pub struct MountSnapshot {
    pub entries: Vec<MountSnapshotEntry>,
    pub warnings: Vec<SnapshotWarning>,
}

impl MountSnapshot {
    pub fn degraded(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| w.severity == SnapshotSeverity::DegradedVisibility)
    }

    pub fn entry_for(&self, mount_point: &Path) -> Option<&MountSnapshotEntry> {
        self.entries.iter().find(|e| e.mount_point == mount_point)
    }

    /// Managed mergerfs entries: mergerfs mounts under any managed root.
    pub fn managed_entries<'a>(
        &'a self,
        managed_roots: &'a [PathBuf],
    ) -> impl Iterator<Item = &'a MountSnapshotEntry> {
        self.entries.iter().filter(move |entry| {
            entry.fs_type == MERGERFS_FSTYPE
                && managed_roots.iter().any(|root| entry.mount_point.starts_with(root))
        })
    }
}

/// Snapshot provider seam.
#[async_trait]
pub trait MountSnapshotService: Send + Sync {
    async fn capture(&self, cancel: &CancellationToken) -> MountSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_input_sensitive() {
        let a = mount_identity("allow_other", "/b/x=RW:/b/y=RO");
        let b = mount_identity("allow_other", "/b/x=RW:/b/y=RO");
        let c = mount_identity("allow_other", "/b/x=RW");
        let d = mount_identity("use_ino", "/b/x=RW:/b/y=RO");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn desired_mount_carries_identity_in_fsname() {
        let desired = DesiredMount::new(
            PathBuf::from("/merged/Title"),
            "allow_other",
            "/branches/key=RW".to_string(),
        );
        assert!(desired.options.starts_with("allow_other,fsname=shelf-"));
        assert!(desired.options.ends_with(&desired.identity));
        assert_eq!(desired.source_name(), format!("shelf-{}", desired.identity));
    }

    #[test]
    fn managed_entries_filter_by_type_and_root() {
        let snapshot = MountSnapshot {
            entries: vec![
                MountSnapshotEntry {
                    mount_point: PathBuf::from("/merged/A"),
                    fs_type: MERGERFS_FSTYPE.to_string(),
                    source: "shelf-1".to_string(),
                    options: String::new(),
                    healthy: None,
                },
                MountSnapshotEntry {
                    mount_point: PathBuf::from("/merged/B"),
                    fs_type: "ext4".to_string(),
                    source: "/dev/sda1".to_string(),
                    options: String::new(),
                    healthy: None,
                },
                MountSnapshotEntry {
                    mount_point: PathBuf::from("/elsewhere/C"),
                    fs_type: MERGERFS_FSTYPE.to_string(),
                    source: "shelf-2".to_string(),
                    options: String::new(),
                    healthy: None,
                },
            ],
            warnings: vec![],
        };
        let managed: Vec<_> = snapshot
            .managed_entries(&[PathBuf::from("/merged")])
            .map(|e| e.mount_point.clone())
            .collect();
        assert_eq!(managed, vec![PathBuf::from("/merged/A")]);
    }
}
