//! Persistent monitor sessions with progressive startup.
//!
//! One long-running `inotifywait -m` per `(root, recursive)` key. Every
//! poll reconciles the live session set against the roots that currently
//! exist, gates restarts of failed sessions, drains buffered lines, and
//! enforces the per-poll event/warning caps with a drop-oldest policy.
//!
//! Progressive mode starts one shallow session per root and promotes
//! top-level children to deep recursive sessions as they appear, bounded
//! per poll, so a huge library does not stall startup on recursive watch
//! establishment.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shelf_core::config::WatchStartupMode;

use super::{format_args, parse_event_line, WatchEvent, WatchOutcome, WatchPoll, WatchReader};
use crate::exec::MonitorProcess;

/// Hard cap on events returned by one poll.
const MAX_EVENTS_PER_POLL: usize = 4096;
/// Hard cap on warnings returned by one poll.
const MAX_WARNINGS_PER_POLL: usize = 1024;
/// Bounded wait for a session task while disposing.
const DISPOSE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct PersistentConfig {
    pub startup_mode: WatchStartupMode,
    pub session_restart_delay: Duration,
    pub max_deep_sessions_per_poll: usize,
    /// Monitor binary; overridable for tests and alternate tools.
    pub monitor_program: String,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            startup_mode: WatchStartupMode::Full,
            session_restart_delay: Duration::from_secs(15),
            max_deep_sessions_per_poll: 8,
            monitor_program: "inotifywait".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SessionKey {
    root: PathBuf,
    recursive: bool,
}

/// Reader maintaining monitor sessions across polls.
#[derive(Debug)]
pub struct PersistentWatchReader {
    config: PersistentConfig,
    sessions: HashMap<SessionKey, MonitorProcess>,
    restart_not_before: HashMap<SessionKey, Instant>,
    /// Progressive mode: children that should have deep sessions.
    known_deep: BTreeSet<PathBuf>,
    /// Progressive mode: children waiting for a start slot.
    pending_deep: VecDeque<PathBuf>,
}

impl PersistentWatchReader {
    pub fn new(config: PersistentConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            restart_not_before: HashMap::new(),
            known_deep: BTreeSet::new(),
            pending_deep: VecDeque::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Dispose every session, waiting a bounded interval per session.
    pub async fn dispose_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            let _ = tokio::time::timeout(DISPOSE_WAIT, session.dispose()).await;
        }
        self.restart_not_before.clear();
        self.pending_deep.clear();
        self.known_deep.clear();
    }

    fn monitor_arguments(&self, key: &SessionKey) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "-q".to_string()];
        if key.recursive {
            args.push("-r".to_string());
        }
        args.extend(format_args());
        args.push(key.root.display().to_string());
        args
    }

    fn progressive(&self) -> bool {
        self.config.startup_mode == WatchStartupMode::Progressive
    }
}

#[derive(Debug, Default)]
struct Bounded<T> {
    items: VecDeque<T>,
    cap: usize,
    dropped: u64,
}

impl<T> Bounded<T> {
    fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(item);
    }
}

#[async_trait]
impl WatchReader for PersistentWatchReader {
    async fn shutdown(&mut self) {
        self.dispose_all().await;
    }

    async fn poll(
        &mut self,
        roots: &[PathBuf],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WatchPoll {
        let mut events = Bounded::<WatchEvent>::new(MAX_EVENTS_PER_POLL);
        let mut warnings = Bounded::<String>::new(MAX_WARNINGS_PER_POLL);
        let mut tool_missing = false;
        let mut command_failed = false;

        let existing_roots: Vec<PathBuf> =
            roots.iter().filter(|r| r.exists()).cloned().collect();

        // Lost children leave every bookkeeping set.
        if self.progressive() {
            let under_existing = |child: &PathBuf| {
                child.exists() && existing_roots.iter().any(|root| child.starts_with(root))
            };
            self.known_deep.retain(&under_existing);
            self.pending_deep.retain(&under_existing);

            // Promote queued children into the desired set, bounded per poll.
            let mut promoted = 0;
            while promoted < self.config.max_deep_sessions_per_poll {
                let Some(child) = self.pending_deep.pop_front() else {
                    break;
                };
                if self.known_deep.insert(child) {
                    promoted += 1;
                }
            }
        } else {
            self.known_deep.clear();
            self.pending_deep.clear();
        }

        // Desired session keys for this poll.
        let mut desired: BTreeSet<SessionKey> = existing_roots
            .iter()
            .map(|root| SessionKey {
                root: root.clone(),
                recursive: !self.progressive(),
            })
            .collect();
        if self.progressive() {
            desired.extend(self.known_deep.iter().map(|child| SessionKey {
                root: child.clone(),
                recursive: true,
            }));
        }

        // Dispose sessions that are no longer desired.
        let undesired: Vec<SessionKey> = self
            .sessions
            .keys()
            .filter(|key| !desired.contains(key))
            .cloned()
            .collect();
        for key in undesired {
            if let Some(session) = self.sessions.remove(&key) {
                debug!(root = %key.root.display(), "disposing undesired monitor session");
                let _ = tokio::time::timeout(DISPOSE_WAIT, session.dispose()).await;
            }
        }
        self.restart_not_before.retain(|key, _| desired.contains(key));

        // Start phase.
        let now = Instant::now();
        for key in &desired {
            if self.sessions.contains_key(key) {
                continue;
            }
            if let Some(not_before) = self.restart_not_before.get(key) {
                if now < *not_before {
                    continue;
                }
            }
            let arguments = self.monitor_arguments(key);
            match MonitorProcess::spawn(&self.config.monitor_program, &arguments) {
                Ok(session) => {
                    self.restart_not_before.remove(key);
                    self.sessions.insert(key.clone(), session);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tool_missing = true;
                    warnings.push(format!(
                        "monitor tool '{}' not found on PATH",
                        self.config.monitor_program
                    ));
                }
                Err(err) => {
                    command_failed = true;
                    self.restart_not_before
                        .insert(key.clone(), now + self.config.session_restart_delay);
                    warnings.push(format!(
                        "failed to start monitor session for '{}': {err}",
                        key.root.display()
                    ));
                }
            }
        }

        // Wait out the poll window, waking early on cancellation.
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel.cancelled() => {}
        }

        // Drain phase, deterministic session order.
        let progressive = self.progressive();
        let mut keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        keys.sort();
        for key in keys {
            // Take everything out of the session before touching other
            // bookkeeping; the borrow on the session map must end first.
            let (lines, dropped, running, status, stderr_tail) = {
                let Some(session) = self.sessions.get_mut(&key) else {
                    continue;
                };
                let (lines, dropped) = session.drain_lines();
                let running = session.is_running();
                let status = session.exit_status();
                let stderr_tail = session.stderr_tail();
                (lines, dropped, running, status, stderr_tail)
            };
            events.dropped += dropped;
            for line in lines {
                match parse_event_line(&line) {
                    Some(event) => {
                        if progressive
                            && !key.recursive
                            && event.is_dir()
                            && event.is_arrival()
                            && event.path.parent() == Some(key.root.as_path())
                        {
                            let child = event.path.clone();
                            let deep_key = SessionKey { root: child.clone(), recursive: true };
                            if !self.known_deep.contains(&child)
                                && !self.pending_deep.contains(&child)
                                && !self.sessions.contains_key(&deep_key)
                            {
                                self.pending_deep.push_back(child);
                            }
                        }
                        events.push(event);
                    }
                    None => warnings.push(format!("unparseable inotify line skipped: '{line}'")),
                }
            }

            if !running {
                command_failed = true;
                warnings.push(format!(
                    "monitor session for '{}' exited status={status:?} stderr='{}'",
                    key.root.display(),
                    stderr_tail.join(" | ")
                ));
                self.sessions.remove(&key);
                self.restart_not_before
                    .insert(key, Instant::now() + self.config.session_restart_delay);
            }
        }

        if events.dropped > 0 || warnings.dropped > 0 {
            // Exactly one summary, regardless of how much was shed.
            let summary = format!(
                "watch buffer overflow dropped_events='{}' dropped_warnings='{}' policy='drop_oldest'",
                events.dropped, warnings.dropped
            );
            warnings.push(summary);
        }

        let outcome = if tool_missing {
            WatchOutcome::ToolNotFound
        } else if command_failed {
            WatchOutcome::CommandFailed
        } else if events.items.is_empty() {
            WatchOutcome::TimedOut
        } else {
            WatchOutcome::Success
        };

        WatchPoll {
            outcome,
            events: events.items.into(),
            warnings: warnings.items.into(),
        }
    }
}
