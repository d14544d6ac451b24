//! Filesystem event readers built on `inotifywait`.
//!
//! Both readers expose the same poll contract: given watch roots, a
//! timeout, and a cancellation token, return an outcome plus parsed
//! events and warnings. The one-shot reader runs a bounded process per
//! poll; the persistent reader keeps monitor sessions alive across polls.

mod persistent;

pub use persistent::{PersistentConfig, PersistentWatchReader};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::exec::{CommandExecutor, CommandFailureKind, CommandOutcome, CommandRequest};

/// Aggregate result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Success,
    TimedOut,
    CommandFailed,
    ToolNotFound,
}

/// One parsed inotify event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub mask: Vec<String>,
    pub raw: String,
}

impl WatchEvent {
    pub fn is_dir(&self) -> bool {
        self.mask.iter().any(|m| m == "ISDIR")
    }

    /// Creation-like events: something new appeared under the watch root.
    pub fn is_arrival(&self) -> bool {
        self.mask.iter().any(|m| m == "CREATE" || m == "MOVED_TO")
    }
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub struct WatchPoll {
    pub outcome: WatchOutcome,
    pub events: Vec<WatchEvent>,
    pub warnings: Vec<String>,
}

impl WatchPoll {
    fn empty(outcome: WatchOutcome) -> Self {
        Self {
            outcome,
            events: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Poll seam shared by both reader variants.
#[async_trait]
pub trait WatchReader: Send + Sync {
    async fn poll(
        &mut self,
        roots: &[PathBuf],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WatchPoll;

    /// Release persistent resources; bounded. One-shot readers have none.
    async fn shutdown(&mut self) {}
}

/// Event kinds every reader subscribes to.
const WATCHED_EVENTS: [&str; 5] = ["create", "moved_to", "moved_from", "close_write", "delete"];

pub(crate) fn format_args() -> Vec<String> {
    let mut args = vec!["--format".to_string(), "%w%f|%e".to_string()];
    for event in WATCHED_EVENTS {
        args.push("-e".to_string());
        args.push(event.to_string());
    }
    args
}

/// Parse one `<path>|<mask_tokens>` line. `None` means malformed.
pub(crate) fn parse_event_line(line: &str) -> Option<WatchEvent> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    // The mask never contains '|'; the path may.
    let (path, mask) = trimmed.rsplit_once('|')?;
    if path.is_empty() || mask.is_empty() {
        return None;
    }
    Some(WatchEvent {
        path: PathBuf::from(path),
        mask: mask.split(',').map(str::to_string).collect(),
        raw: trimmed.to_string(),
    })
}

/// Timeout-bounded reader: one `inotifywait` run per poll.
pub struct OneShotWatchReader {
    executor: std::sync::Arc<dyn CommandExecutor>,
    max_output_chars: usize,
}

impl std::fmt::Debug for OneShotWatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotWatchReader").finish_non_exhaustive()
    }
}

impl OneShotWatchReader {
    pub fn new(executor: std::sync::Arc<dyn CommandExecutor>, max_output_chars: usize) -> Self {
        Self {
            executor,
            max_output_chars,
        }
    }
}

#[async_trait]
impl WatchReader for OneShotWatchReader {
    async fn poll(
        &mut self,
        roots: &[PathBuf],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WatchPoll {
        let existing: Vec<&Path> = roots
            .iter()
            .map(PathBuf::as_path)
            .filter(|p| p.exists())
            .collect();
        if existing.is_empty() {
            return WatchPoll::empty(WatchOutcome::TimedOut);
        }

        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut request = CommandRequest::new("inotifywait")
            .args(["-q", "-r", "-t"])
            .arg(wait_secs)
            .args(format_args())
            // Give the process itself a margin past the inotifywait timeout.
            .timeout(timeout + Duration::from_secs(5))
            .max_output_chars(self.max_output_chars);
        for root in &existing {
            request = request.arg(root.display().to_string());
        }

        let result = self.executor.execute(request, cancel).await;
        let mut poll = match result.outcome {
            CommandOutcome::Success => WatchPoll::empty(WatchOutcome::Success),
            // inotifywait exits 2 when the timeout elapses without events.
            CommandOutcome::NonZeroExit if result.exit_code == Some(2) => {
                WatchPoll::empty(WatchOutcome::TimedOut)
            }
            CommandOutcome::TimedOut | CommandOutcome::Cancelled => {
                WatchPoll::empty(WatchOutcome::TimedOut)
            }
            CommandOutcome::StartFailed
                if result.failure_kind == CommandFailureKind::ToolNotFound =>
            {
                return WatchPoll {
                    outcome: WatchOutcome::ToolNotFound,
                    events: Vec::new(),
                    warnings: vec!["inotifywait not found on PATH".to_string()],
                };
            }
            CommandOutcome::NonZeroExit | CommandOutcome::StartFailed => {
                let mut poll = WatchPoll::empty(WatchOutcome::CommandFailed);
                poll.warnings.push(format!(
                    "inotifywait failed: exit={:?} stderr={}",
                    result.exit_code,
                    result.stderr.trim()
                ));
                poll
            }
        };

        for line in result.stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_event_line(line) {
                Some(event) => poll.events.push(event),
                None => poll
                    .warnings
                    .push(format!("unparseable inotify line skipped: '{line}'")),
            }
        }
        if poll.outcome == WatchOutcome::Success && poll.events.is_empty() {
            poll.outcome = WatchOutcome::TimedOut;
        }

        poll
    }
}
