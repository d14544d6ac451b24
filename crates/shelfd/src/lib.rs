//! shelfd - unified manga library daemon.
//!
//! Watches per-source and per-override volumes, groups equivalent titles,
//! maintains one mergerfs union mount per canonical title under the
//! merged root, sanitizes chapter directory names, and keeps per-title
//! `cover.jpg`/`details.json` artifacts fresh through the Comick API.

pub mod coalesce;
pub mod discovery;
pub mod exec;
pub mod metadata;
pub mod mount;
pub mod pipeline;
pub mod rename;
pub mod supervisor;
pub mod watch;
pub mod workflow;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shelf_core::config::{ConfigBundle, WatchStartupMode};
use shelf_core::eventlog::{EventLog, EventLogger, RollingFileSink};
use shelf_core::normalize::normalize_token_key;

use coalesce::MergeCoalescer;
use discovery::FsVolumeDiscovery;
use exec::SystemCommandExecutor;
use metadata::{
    CooldownStore, HttpComickGateway, MetadataConfig, MetadataCoordinator, TitleKeyMatcher,
    YamlEquivalenceCatalog,
};
use mount::{
    BranchPlanner, FindmntSnapshotService, MergerfsMountService, MountCommandService,
    MountSnapshotService, PriorityWrap, ReadinessProber,
};
use pipeline::{EventPipeline, PipelineConfig};
use rename::{
    DefaultChapterSanitizer, RenameConfig, RenameProcessor, RenameQueueStore, StdRenameFileSystem,
};
use supervisor::{SignalRegistrar, Supervisor, SupervisorConfig, SupervisorWorker};
use watch::{PersistentConfig, PersistentWatchReader};
use workflow::{MergeWorkflow, WorkflowConfig};

/// Application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

fn secs(value: i64) -> Duration {
    Duration::from_secs(value.max(0) as u64)
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

/// Build the operator event log from the logging section.
pub fn build_event_log(bundle: &ConfigBundle) -> Arc<EventLogger> {
    let logging = &bundle.settings.logging;
    let sink = RollingFileSink::new(
        bundle.settings.paths.log_root.join(&logging.file_name),
        logging.max_bytes.max(0) as u64,
        logging.retained_files.max(0) as u32,
    );
    Arc::new(EventLogger::new(logging.level, vec![Box::new(sink)]))
}

/// Fail fast when `FUSE_DEVICE_PATH` names something that is not an
/// accessible character device; mergerfs cannot work without it.
pub fn preflight_fuse_device() -> Result<(), String> {
    let Ok(device) = std::env::var("FUSE_DEVICE_PATH") else {
        return Ok(());
    };
    let metadata = std::fs::metadata(&device).map_err(|err| {
        format!(
            "FUSE device '{device}' is not accessible: {err}. \
             Pass the host's /dev/fuse through to the container \
             (e.g. --device /dev/fuse) or correct FUSE_DEVICE_PATH."
        )
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_char_device() {
            return Err(format!(
                "FUSE device '{device}' exists but is not a character device. \
                 Mount the real /dev/fuse into the container."
            ));
        }
    }
    let _ = metadata;
    Ok(())
}

/// The supervisor worker: startup cleanup, then the tick loop.
struct DaemonWorker {
    workflow: Arc<MergeWorkflow>,
    rename: Arc<RenameProcessor>,
    pipeline: Mutex<EventPipeline>,
}

#[async_trait]
impl SupervisorWorker for DaemonWorker {
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        self.workflow.on_worker_starting(&cancel).await;
        let rescanned = self.rename.rescan_and_enqueue(Utc::now());
        if rescanned > 0 {
            info!(count = rescanned, "startup rescan queued chapter renames");
        }

        let mut pipeline = self.pipeline.lock().await;
        while !cancel.is_cancelled() {
            let _ = pipeline.tick(Utc::now(), &cancel).await;
        }
        pipeline.shutdown().await;
        Ok(())
    }
}

/// The assembled daemon.
pub struct Daemon {
    supervisor: Arc<Supervisor>,
    state_root: PathBuf,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("state_root", &self.state_root)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Wire every component from a validated configuration bundle.
    pub fn new(bundle: &ConfigBundle, log: Arc<dyn EventLog>) -> AppResult<Self> {
        let settings = &bundle.settings;
        let paths = &settings.paths;
        let excluded_sources: HashSet<String> = settings
            .scan
            .excluded_sources
            .iter()
            .map(|source| normalize_token_key(source))
            .collect();

        let executor = Arc::new(SystemCommandExecutor::new());
        let managed_roots = vec![paths.merged_root.clone()];
        let diagnostics_tuning = exec::CommandTuning {
            timeout: secs(settings.diagnostics.command_timeout_seconds),
            poll_interval: millis(settings.diagnostics.command_poll_interval_millis),
            max_output_chars: settings.diagnostics.max_command_output_chars.max(1) as usize,
        };
        let mount_tuning = exec::CommandTuning {
            timeout: secs(settings.runtime.mount_command_timeout_seconds),
            ..diagnostics_tuning
        };

        let snapshots: Arc<dyn MountSnapshotService> = Arc::new(FindmntSnapshotService::new(
            Arc::clone(&executor) as Arc<dyn exec::CommandExecutor>,
            diagnostics_tuning,
            settings.runtime.enable_health_checks,
            managed_roots,
        ));
        let mounts: Arc<dyn MountCommandService> = Arc::new(MergerfsMountService::new(
            Arc::clone(&executor) as Arc<dyn exec::CommandExecutor>,
            mount_tuning,
            PriorityWrap {
                enabled: settings.shutdown.cleanup_apply_high_priority,
                ionice_class: settings.shutdown.cleanup_priority_ionice_class.unwrap_or(2),
                nice_value: settings.shutdown.cleanup_priority_nice_value.unwrap_or(10),
            },
        ));
        let prober = ReadinessProber::new(
            Arc::clone(&snapshots),
            secs(settings.runtime.readiness_probe_timeout_seconds),
        );
        let planner = BranchPlanner::new(paths.state_root.join("branches"));

        let gateway = Arc::new(HttpComickGateway::new(
            settings.runtime.api_base_url.clone(),
            settings.runtime.challenge_proxy_url.clone(),
            secs(settings.runtime.direct_retry_interval_minutes * 60),
            secs(settings.runtime.request_timeout_seconds),
            Arc::clone(&log),
        ));
        let catalog = Arc::new(YamlEquivalenceCatalog::new(
            bundle.paths.equivalents.clone(),
            bundle.matcher.clone(),
        ));
        let coordinator = Arc::new(MetadataCoordinator::new(
            gateway,
            Box::new(TitleKeyMatcher),
            catalog,
            CooldownStore::open(paths.state_root.join("cooldowns.json")),
            bundle.matcher.clone(),
            MetadataConfig {
                cooldown: chrono::Duration::hours(settings.runtime.metadata_cooldown_hours),
                preferred_language: settings.runtime.preferred_language.clone(),
                description_mode: settings.runtime.details_description_mode,
            },
            Arc::clone(&log),
        ));

        let workflow = Arc::new(MergeWorkflow::new(
            WorkflowConfig {
                sources_root: paths.sources_root.clone(),
                overrides_root: paths.overrides_root.clone(),
                merged_root: paths.merged_root.clone(),
                config_root: bundle.paths.config_root.clone(),
                equivalents_path: bundle.paths.equivalents.clone(),
                mergerfs_options_base: settings.runtime.mergerfs_options_base.clone(),
                max_consecutive_mount_failures: settings
                    .runtime
                    .max_consecutive_mount_failures
                    .max(1) as u32,
                enable_health_checks: settings.runtime.enable_health_checks,
                excluded_sources: excluded_sources.clone(),
            },
            Arc::new(FsVolumeDiscovery::new(
                paths.sources_root.clone(),
                paths.overrides_root.clone(),
            )),
            snapshots,
            mounts,
            prober,
            planner,
            Some(coordinator),
            bundle.equivalents.clone(),
            bundle.matcher.clone(),
            bundle.source_priority.clone(),
            Arc::clone(&log),
        ));

        let rename = Arc::new(RenameProcessor::new(
            RenameQueueStore::open(paths.state_root.join("rename-queue.json")),
            Box::new(DefaultChapterSanitizer),
            Box::new(StdRenameFileSystem),
            paths.sources_root.clone(),
            excluded_sources.clone(),
            RenameConfig {
                delay: chrono::Duration::seconds(settings.rename.delay_seconds),
                quiet: chrono::Duration::seconds(settings.rename.quiet_seconds),
                rescan_grace: chrono::Duration::seconds(settings.rename.rescan_grace_seconds),
            },
            Arc::clone(&log),
        ));

        let watcher = PersistentWatchReader::new(PersistentConfig {
            startup_mode: settings
                .scan
                .watch_startup_mode
                .unwrap_or(WatchStartupMode::Full),
            session_restart_delay: secs(settings.scan.session_restart_delay_seconds),
            max_deep_sessions_per_poll: settings.scan.max_deep_sessions_per_poll.max(1) as usize,
            monitor_program: "inotifywait".to_string(),
        });

        let pipeline = EventPipeline::new(
            PipelineConfig {
                sources_root: paths.sources_root.clone(),
                poll_timeout: secs(settings.scan.watch_poll_timeout_seconds),
                excluded_sources,
            },
            Box::new(watcher),
            Arc::clone(&rename),
            Arc::new(MergeCoalescer::new()),
            Arc::clone(&workflow) as Arc<dyn workflow::MergeRunner>,
            Arc::clone(&log),
        );

        let worker = Arc::new(DaemonWorker {
            workflow,
            rename,
            pipeline: Mutex::new(pipeline),
        });

        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig {
                state_root: paths.state_root.clone(),
                stop_timeout: secs(settings.shutdown.stop_timeout_seconds),
            },
            worker as Arc<dyn SupervisorWorker>,
            Arc::clone(&log),
        ));

        Ok(Self {
            supervisor,
            state_root: paths.state_root.clone(),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run until a signal or worker exit; returns the process exit code.
    pub async fn run(&self, signals: Arc<dyn SignalRegistrar>) -> i32 {
        self.supervisor.run(signals).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::config::{bootstrap, ValidationProfile};
    use shelf_core::eventlog::{CapturingLog, LogLevel};

    #[tokio::test]
    async fn daemon_wires_from_a_bootstrapped_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_root = dir.path().join("config");
        let bundle = bootstrap(&config_root, ValidationProfile::StrictRuntime).unwrap();
        let daemon = Daemon::new(&bundle, Arc::new(CapturingLog::new())).unwrap();
        assert_eq!(daemon.state_root, config_root.join("state"));
    }

    #[test]
    fn fuse_preflight_passes_without_the_variable() {
        // The variable is unset in the test environment.
        assert!(preflight_fuse_device().is_ok());
    }

    #[test]
    fn build_event_log_respects_configured_level() {
        let dir = tempfile::TempDir::new().unwrap();
        let bundle = bootstrap(&dir.path().join("config"), ValidationProfile::StrictRuntime).unwrap();
        let log = build_event_log(&bundle);
        assert!(log.enabled(LogLevel::Warning));
        assert!(!log.enabled(LogLevel::Trace));
    }
}
