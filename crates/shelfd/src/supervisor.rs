//! Daemon supervisor: single-instance lock, worker lifecycle, bounded stop.
//!
//! The exclusive lock on `supervisor.lock` is taken before `daemon.pid`
//! is written, so a second instance fails before it can clobber state.
//! Stop signals cancellation and waits out `stop_timeout`; a worker that
//! ignores cancellation is abandoned, state files are removed anyway, and
//! the run exits non-zero.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use shelf_core::eventlog::EventLog;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("another instance holds the supervisor lock: {0}")]
    AlreadyRunning(#[source] std::io::Error),
    #[error("supervisor i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// The daemon's long-running work, cancellation-aware.
#[async_trait]
pub trait SupervisorWorker: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()>;
}

/// Injectable OS-signal seam.
///
/// Implementations resolve `wait_for_stop` when a stop signal arrives; a
/// signal that fired before the wait began must still resolve it.
#[async_trait]
pub trait SignalRegistrar: Send + Sync {
    async fn wait_for_stop(&self);
}

/// SIGINT/SIGTERM via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSignals;

#[async_trait]
impl SignalRegistrar for TokioSignals {
    async fn wait_for_stop(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Token-backed registrar, latching: a trigger before the wait still
/// stops the daemon.
#[derive(Debug, Default)]
pub struct ManualSignals {
    token: CancellationToken,
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }
}

#[async_trait]
impl SignalRegistrar for ManualSignals {
    async fn wait_for_stop(&self) {
        self.token.cancelled().await;
    }
}

/// How a stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Worker exited cooperatively (or was never running).
    Clean,
    /// Worker returned an error before or during stop.
    WorkerFailed,
    /// Worker ignored cancellation past the stop timeout.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub state_root: PathBuf,
    pub stop_timeout: Duration,
}

struct Running {
    // Held for the daemon's lifetime; dropping releases the flock.
    #[allow(dead_code)]
    lock_file: File,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    done: Option<oneshot::Receiver<Result<(), String>>>,
}

/// The supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    worker: Arc<dyn SupervisorWorker>,
    log: Arc<dyn EventLog>,
    state: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        worker: Arc<dyn SupervisorWorker>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            config,
            worker,
            log,
            state: Mutex::new(None),
        }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.config.state_root.join("daemon.pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.state_root.join("supervisor.lock")
    }

    /// Acquire the instance lock, write the pid file, start the worker.
    ///
    /// Idempotent while running; concurrent calls coalesce on the state
    /// lock so the startup side effect happens exactly once.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.config.state_root)?;

        // Open without truncating: wiping the file before holding the
        // lock would erase a running instance's pid.
        let mut lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;
        lock_file
            .try_lock_exclusive()
            .map_err(SupervisorError::AlreadyRunning)?;
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;

        std::fs::write(self.pid_path(), format!("{}\n", std::process::id()))?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let worker = Arc::clone(&self.worker);
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = worker.run(worker_cancel).await;
            let _ = done_tx.send(result.map_err(|e| format!("{e:#}")));
        });

        self.log.normal(
            "supervisor.started",
            "daemon supervisor started",
            &[("pid", std::process::id().to_string())],
        );

        *state = Some(Running {
            lock_file,
            cancel,
            handle,
            done: done_rx.into(),
        });
        Ok(())
    }

    /// Signal cancellation, wait out the stop timeout, clean up state
    /// files. Idempotent: stopping a stopped supervisor is a no-op.
    pub async fn stop(&self) -> StopOutcome {
        let running = {
            let mut state = self.state.lock().await;
            state.take()
        };
        let Some(mut running) = running else {
            return StopOutcome::Clean;
        };

        running.cancel.cancel();
        let outcome = match tokio::time::timeout(self.config.stop_timeout, &mut running.handle)
            .await
        {
            Ok(_) => {
                // The worker result travels through the oneshot; a missing
                // result means the worker panicked.
                match running.done.take() {
                    Some(done) => match done.await {
                        Ok(Ok(())) => StopOutcome::Clean,
                        Ok(Err(error)) => {
                            self.log.error(
                                "supervisor.worker_failed",
                                "worker exited with an error",
                                &[("error", error)],
                            );
                            StopOutcome::WorkerFailed
                        }
                        Err(_) => StopOutcome::Clean,
                    },
                    None => StopOutcome::Clean,
                }
            }
            Err(_) => {
                self.log.warning(
                    "supervisor.stop_timeout",
                    "worker ignored cancellation past the stop timeout",
                    &[(
                        "stop_timeout_secs",
                        self.config.stop_timeout.as_secs().to_string(),
                    )],
                );
                running.handle.abort();
                StopOutcome::TimedOut
            }
        };

        // State files go away even when the worker hung.
        let _ = std::fs::remove_file(self.pid_path());
        // Dropping the file releases the flock before the unlink.
        drop(running.lock_file);
        let _ = std::fs::remove_file(self.lock_path());

        info!("supervisor stopped");
        outcome
    }

    /// Start, then run until a stop signal or worker exit.
    ///
    /// Exit code 0 for a cooperative stop or clean worker exit, 1 for a
    /// failed start, worker error, or stop timeout.
    pub async fn run(&self, signals: Arc<dyn SignalRegistrar>) -> i32 {
        if let Err(err) = self.start().await {
            self.log.error(
                "supervisor.start_failed",
                "daemon could not start",
                &[("error", err.to_string())],
            );
            return 1;
        }

        let done = {
            let mut state = self.state.lock().await;
            state.as_mut().and_then(|running| running.done.take())
        };
        let Some(done) = done else {
            // A concurrent run consumed the worker; treat as failure.
            return 1;
        };

        let worker_result: Option<Result<(), String>> = tokio::select! {
            _ = signals.wait_for_stop() => None,
            result = done => Some(result.unwrap_or_else(|_| Err("worker panicked".to_string()))),
        };

        match worker_result {
            None => {
                self.log.normal("supervisor.signal", "stop signal received", &[]);
                match self.stop().await {
                    StopOutcome::Clean => 0,
                    StopOutcome::WorkerFailed | StopOutcome::TimedOut => 1,
                }
            }
            Some(Ok(())) => {
                let _ = self.stop().await;
                0
            }
            Some(Err(error)) => {
                self.log.error(
                    "supervisor.worker_failed",
                    "worker exited with an error",
                    &[("error", error)],
                );
                let _ = self.stop().await;
                1
            }
        }
    }
}
