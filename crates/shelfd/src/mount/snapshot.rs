//! Mount table snapshots via `findmnt`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    MountSnapshot, MountSnapshotEntry, MountSnapshotService, SnapshotSeverity, SnapshotWarning,
    MERGERFS_FSTYPE,
};
use crate::exec::{CommandExecutor, CommandRequest, CommandTuning};

/// How long a health probe may block before the mount counts as wedged.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// `findmnt`-backed snapshot provider.
///
/// A failed or missing `findmnt` yields an empty snapshot carrying a
/// `DegradedVisibility` warning rather than an error: callers must keep
/// running, they just may not trust stale-unmount decisions.
pub struct FindmntSnapshotService {
    executor: Arc<dyn CommandExecutor>,
    tuning: CommandTuning,
    health_checks: bool,
    managed_roots: Vec<PathBuf>,
}

impl std::fmt::Debug for FindmntSnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindmntSnapshotService")
            .field("health_checks", &self.health_checks)
            .field("managed_roots", &self.managed_roots)
            .finish_non_exhaustive()
    }
}

impl FindmntSnapshotService {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        tuning: CommandTuning,
        health_checks: bool,
        managed_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            executor,
            tuning,
            health_checks,
            managed_roots,
        }
    }
}

/// Decode the octal escapes `findmnt -r` applies to whitespace in fields.
fn decode_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 && digits.chars().all(|d| ('0'..='7').contains(&d)) {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Parse `findmnt -rn -o TARGET,FSTYPE,SOURCE,OPTIONS` output.
fn parse_findmnt(stdout: &str) -> (Vec<MountSnapshotEntry>, Vec<SnapshotWarning>) {
    let mut entries = Vec::new();
    let mut warnings = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 4 {
            warnings.push(SnapshotWarning {
                severity: SnapshotSeverity::Info,
                message: format!("unparseable findmnt line skipped: '{trimmed}'"),
            });
            continue;
        }
        entries.push(MountSnapshotEntry {
            mount_point: PathBuf::from(decode_field(fields[0])),
            fs_type: decode_field(fields[1]),
            source: decode_field(fields[2]),
            options: decode_field(fields[3]),
            healthy: None,
        });
    }
    (entries, warnings)
}

/// Probe a mountpoint by listing it off the async runtime, bounded.
async fn probe_health(mount_point: PathBuf) -> bool {
    let probe = tokio::task::spawn_blocking(move || std::fs::read_dir(&mount_point).is_ok());
    match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, probe).await {
        Ok(Ok(ok)) => ok,
        _ => false,
    }
}

#[async_trait]
impl MountSnapshotService for FindmntSnapshotService {
    async fn capture(&self, cancel: &CancellationToken) -> MountSnapshot {
        let request = self.tuning.apply(
            CommandRequest::new("findmnt").args(["-rn", "-o", "TARGET,FSTYPE,SOURCE,OPTIONS"]),
        );
        let result = self.executor.execute(request, cancel).await;

        if !result.success() {
            debug!(outcome = ?result.outcome, "findmnt capture failed");
            return MountSnapshot {
                entries: Vec::new(),
                warnings: vec![SnapshotWarning {
                    severity: SnapshotSeverity::DegradedVisibility,
                    message: format!(
                        "mount snapshot unavailable: findmnt outcome {:?} exit {:?}",
                        result.outcome, result.exit_code
                    ),
                }],
            };
        }

        let (mut entries, mut warnings) = parse_findmnt(&result.stdout);
        if result.stdout_truncated {
            warnings.push(SnapshotWarning {
                severity: SnapshotSeverity::DegradedVisibility,
                message: "findmnt output truncated; snapshot may be incomplete".to_string(),
            });
        }

        if self.health_checks {
            for entry in &mut entries {
                let managed = entry.fs_type == MERGERFS_FSTYPE
                    && self
                        .managed_roots
                        .iter()
                        .any(|root| entry.mount_point.starts_with(root));
                if managed {
                    entry.healthy = Some(probe_health(entry.mount_point.clone()).await);
                }
            }
        }

        MountSnapshot { entries, warnings }
    }
}
