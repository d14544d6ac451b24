//! Desired-vs-actual mount reconciliation.
//!
//! Pure: given the desired mounts, one snapshot, and the managed roots,
//! produce the action list. Apply order is deterministic: desired mounts
//! in input order, then stale unmounts sorted by mountpoint.

use std::collections::HashSet;
use std::path::PathBuf;

use super::{DesiredMount, MountSnapshot, MERGERFS_FSTYPE};

/// Why an unmount was planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountReason {
    /// A managed mount with no desired counterpart.
    StaleMount,
}

/// One planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    Mount(DesiredMount),
    Remount(DesiredMount),
    Unmount {
        mount_point: PathBuf,
        reason: UnmountReason,
    },
}

impl ReconcileAction {
    pub fn mount_point(&self) -> &std::path::Path {
        match self {
            Self::Mount(d) | Self::Remount(d) => &d.mount_point,
            Self::Unmount { mount_point, .. } => mount_point,
        }
    }

    pub fn is_unmount(&self) -> bool {
        matches!(self, Self::Unmount { .. })
    }
}

/// Reconciliation inputs, built from exactly one snapshot per pass.
#[derive(Debug)]
pub struct ReconcileInput<'a> {
    pub desired: &'a [DesiredMount],
    pub snapshot: &'a MountSnapshot,
    pub managed_roots: &'a [PathBuf],
    pub enable_health_checks: bool,
    pub force_remount: &'a [PathBuf],
}

/// Compute the action plan.
pub fn reconcile(input: &ReconcileInput<'_>) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();
    let desired_points: HashSet<&PathBuf> =
        input.desired.iter().map(|d| &d.mount_point).collect();

    for desired in input.desired {
        match input.snapshot.entry_for(&desired.mount_point) {
            None => actions.push(ReconcileAction::Mount(desired.clone())),
            Some(entry) => {
                let wrong_type = entry.fs_type != MERGERFS_FSTYPE;
                let wrong_identity = entry.source != desired.source_name();
                let unhealthy =
                    input.enable_health_checks && entry.healthy == Some(false);
                let forced = input.force_remount.contains(&desired.mount_point);
                if wrong_type || wrong_identity || unhealthy || forced {
                    actions.push(ReconcileAction::Remount(desired.clone()));
                }
            }
        }
    }

    let mut stale: Vec<PathBuf> = input
        .snapshot
        .managed_entries(input.managed_roots)
        .filter(|entry| !desired_points.contains(&entry.mount_point))
        .map(|entry| entry.mount_point.clone())
        .collect();
    stale.sort();
    stale.dedup();
    for mount_point in stale {
        actions.push(ReconcileAction::Unmount {
            mount_point,
            reason: UnmountReason::StaleMount,
        });
    }

    actions
}
