//! Mount and unmount command execution, plus the readiness probe.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DesiredMount, MountSnapshotService, MERGERFS_FSTYPE};
use crate::exec::{CommandExecutor, CommandRequest, CommandTuning};

/// Outcome of one mount-layer command.
#[derive(Debug, Clone)]
pub struct MountCommandResult {
    pub success: bool,
    pub detail: String,
}

/// Mount command seam.
#[async_trait]
pub trait MountCommandService: Send + Sync {
    async fn mount(&self, desired: &DesiredMount, cancel: &CancellationToken)
        -> MountCommandResult;
    async fn unmount(&self, mount_point: &Path, cancel: &CancellationToken) -> MountCommandResult;
}

/// Priority wrapping for cleanup-phase mount work.
#[derive(Debug, Clone, Copy)]
pub struct PriorityWrap {
    pub enabled: bool,
    pub ionice_class: i64,
    pub nice_value: i64,
}

impl Default for PriorityWrap {
    fn default() -> Self {
        Self {
            enabled: false,
            ionice_class: 2,
            nice_value: 10,
        }
    }
}

/// Executes `mergerfs` and `umount` through the command executor.
pub struct MergerfsMountService {
    executor: Arc<dyn CommandExecutor>,
    tuning: CommandTuning,
    priority: PriorityWrap,
}

impl std::fmt::Debug for MergerfsMountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergerfsMountService")
            .field("tuning", &self.tuning)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Build the mount invocation, optionally wrapped in `ionice`/`nice`.
fn mount_invocation(desired: &DesiredMount, priority: PriorityWrap) -> (String, Vec<String>) {
    let tail = vec![
        "-o".to_string(),
        desired.options.clone(),
        desired.branch_spec.clone(),
        desired.mount_point.display().to_string(),
    ];
    if priority.enabled {
        let mut args = vec![
            "-c".to_string(),
            priority.ionice_class.to_string(),
            "nice".to_string(),
            "-n".to_string(),
            priority.nice_value.to_string(),
            "mergerfs".to_string(),
        ];
        args.extend(tail);
        ("ionice".to_string(), args)
    } else {
        ("mergerfs".to_string(), tail)
    }
}

impl MergerfsMountService {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        tuning: CommandTuning,
        priority: PriorityWrap,
    ) -> Self {
        Self {
            executor,
            tuning,
            priority,
        }
    }

    fn describe(result: &crate::exec::CommandResult) -> String {
        format!(
            "outcome {:?} exit {:?} stderr '{}'",
            result.outcome,
            result.exit_code,
            result.stderr.trim()
        )
    }
}

#[async_trait]
impl MountCommandService for MergerfsMountService {
    async fn mount(
        &self,
        desired: &DesiredMount,
        cancel: &CancellationToken,
    ) -> MountCommandResult {
        if let Err(err) = std::fs::create_dir_all(&desired.mount_point) {
            return MountCommandResult {
                success: false,
                detail: format!("cannot create mountpoint: {err}"),
            };
        }
        let (program, args) = mount_invocation(desired, self.priority);
        let request = self.tuning.apply(CommandRequest::new(program).args(args));
        let result = self.executor.execute(request, cancel).await;
        debug!(
            mount_point = %desired.mount_point.display(),
            outcome = ?result.outcome,
            "mount command finished"
        );
        MountCommandResult {
            success: result.success(),
            detail: Self::describe(&result),
        }
    }

    async fn unmount(&self, mount_point: &Path, cancel: &CancellationToken) -> MountCommandResult {
        let request = self
            .tuning
            .apply(CommandRequest::new("umount").arg(mount_point.display().to_string()));
        let result = self.executor.execute(request, cancel).await;
        MountCommandResult {
            success: result.success(),
            detail: Self::describe(&result),
        }
    }
}

/// Result of a readiness probe.
#[derive(Debug, Clone)]
pub struct ReadinessResult {
    pub ready: bool,
    pub detail: String,
}

/// Polls the snapshot provider until a mountpoint reports mergerfs.
pub struct ReadinessProber {
    snapshots: Arc<dyn MountSnapshotService>,
    timeout: Duration,
    interval: Duration,
}

impl std::fmt::Debug for ReadinessProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProber")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ReadinessProber {
    pub fn new(snapshots: Arc<dyn MountSnapshotService>, timeout: Duration) -> Self {
        Self {
            snapshots,
            timeout,
            interval: Duration::from_millis(250),
        }
    }

    pub async fn probe(&self, mount_point: &Path, cancel: &CancellationToken) -> ReadinessResult {
        let deadline = Instant::now() + self.timeout;
        loop {
            let snapshot = self.snapshots.capture(cancel).await;
            if let Some(entry) = snapshot.entry_for(mount_point) {
                if entry.fs_type == MERGERFS_FSTYPE {
                    return ReadinessResult {
                        ready: true,
                        detail: String::new(),
                    };
                }
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                return ReadinessResult {
                    ready: false,
                    detail: format!(
                        "mountpoint '{}' did not report {MERGERFS_FSTYPE} within {:?}",
                        mount_point.display(),
                        self.timeout
                    ),
                };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountSnapshot;

    #[test]
    fn plain_mount_invocation_calls_mergerfs_directly() {
        let desired = DesiredMount::new(
            PathBuf::from("/merged/Title"),
            "allow_other",
            "/branches/key/00_override=RW".to_string(),
        );
        let (program, args) = mount_invocation(&desired, PriorityWrap::default());
        assert_eq!(program, "mergerfs");
        assert_eq!(args[0], "-o");
        assert!(args[1].contains("fsname=shelf-"));
        assert_eq!(args[2], "/branches/key/00_override=RW");
        assert_eq!(args[3], "/merged/Title");
    }

    #[test]
    fn high_priority_wraps_with_ionice_and_nice() {
        let desired = DesiredMount::new(
            PathBuf::from("/merged/Title"),
            "allow_other",
            "/b=RW".to_string(),
        );
        let priority = PriorityWrap {
            enabled: true,
            ionice_class: 3,
            nice_value: 15,
        };
        let (program, args) = mount_invocation(&desired, priority);
        assert_eq!(program, "ionice");
        assert_eq!(&args[..6], &["-c", "3", "nice", "-n", "15", "mergerfs"]);
    }

    #[derive(Debug)]
    struct FixedSnapshots(MountSnapshot);

    #[async_trait]
    impl MountSnapshotService for FixedSnapshots {
        async fn capture(&self, _cancel: &CancellationToken) -> MountSnapshot {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn probe_succeeds_when_mountpoint_reports_mergerfs() {
        let snapshot = MountSnapshot {
            entries: vec![crate::mount::MountSnapshotEntry {
                mount_point: PathBuf::from("/merged/Title"),
                fs_type: MERGERFS_FSTYPE.to_string(),
                source: "shelf-x".to_string(),
                options: String::new(),
                healthy: None,
            }],
            warnings: vec![],
        };
        let prober = ReadinessProber::new(
            Arc::new(FixedSnapshots(snapshot)),
            Duration::from_millis(200),
        );
        let result = prober
            .probe(Path::new("/merged/Title"), &CancellationToken::new())
            .await;
        assert!(result.ready);
    }

    #[tokio::test]
    async fn probe_times_out_when_mountpoint_never_appears() {
        let prober = ReadinessProber::new(
            Arc::new(FixedSnapshots(MountSnapshot::default())),
            Duration::from_millis(100),
        );
        let start = Instant::now();
        let result = prober
            .probe(Path::new("/merged/Missing"), &CancellationToken::new())
            .await;
        assert!(!result.ready);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(result.detail.contains("/merged/Missing"));
    }
}
