//! Per-tick filesystem event pipeline.
//!
//! One tick: dispatch the startup merge request (first tick only), poll
//! the watcher, drive the rename queue's periodic pass, convert events
//! into rename enqueues and coalesced merge requests, then dispatch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use shelf_core::eventlog::EventLog;
use shelf_core::normalize::normalize_token_key;

use crate::coalesce::{MergeCoalescer, MergeDispatchOutcome};
use crate::rename::RenameProcessor;
use crate::watch::{WatchEvent, WatchOutcome, WatchReader};
use crate::workflow::MergeRunner;

/// Static pipeline inputs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources_root: PathBuf,
    pub poll_timeout: Duration,
    /// Token keys of sources whose events are ignored.
    pub excluded_sources: HashSet<String>,
}

/// The tick-driven pipeline.
pub struct EventPipeline {
    config: PipelineConfig,
    watcher: Box<dyn WatchReader>,
    rename: Arc<RenameProcessor>,
    coalescer: Arc<MergeCoalescer>,
    runner: Arc<dyn MergeRunner>,
    log: Arc<dyn EventLog>,
    first_tick: bool,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("config", &self.config)
            .field("first_tick", &self.first_tick)
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    pub fn new(
        config: PipelineConfig,
        watcher: Box<dyn WatchReader>,
        rename: Arc<RenameProcessor>,
        coalescer: Arc<MergeCoalescer>,
        runner: Arc<dyn MergeRunner>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            config,
            watcher,
            rename,
            coalescer,
            runner,
            log,
            first_tick: true,
        }
    }

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MergeDispatchOutcome {
        let runner = Arc::clone(&self.runner);
        let cancel = cancel.clone();
        self.coalescer
            .dispatch(move |request| async move { runner.run_pass(&request, now, &cancel).await })
            .await
    }

    fn is_excluded(&self, source_name: &str) -> bool {
        self.config
            .excluded_sources
            .contains(&normalize_token_key(source_name))
    }

    /// Queue every `Source/Manga/Chapter` directory below `root`, which
    /// is either a source (depth 2 below it) or a manga (depth 1).
    fn enqueue_nested_chapters(&self, root: &Path, levels: usize, now: DateTime<Utc>) {
        let mut frontier = vec![root.to_path_buf()];
        for _ in 0..levels {
            let mut next = Vec::new();
            for dir in frontier {
                if let Ok(entries) = std::fs::read_dir(&dir) {
                    next.extend(
                        entries
                            .filter_map(Result::ok)
                            .map(|entry| entry.path())
                            .filter(|path| path.is_dir()),
                    );
                }
            }
            frontier = next;
        }
        for chapter in frontier {
            self.rename.enqueue_chapter_path(&chapter, now);
        }
    }

    async fn classify_event(&self, event: &WatchEvent, now: DateTime<Utc>) {
        let Ok(relative) = event.path.strip_prefix(&self.config.sources_root) else {
            return;
        };
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let Some(source_name) = components.first() else {
            return;
        };
        if self.is_excluded(source_name) {
            debug!(source = %source_name, "event for excluded source ignored");
            return;
        }

        match components.len() {
            1 if event.is_dir() && event.is_arrival() => {
                self.enqueue_nested_chapters(&event.path, 2, now);
                self.coalescer
                    .request(&format!("new-source:{source_name}"), false)
                    .await;
            }
            2 if event.is_dir() && event.is_arrival() => {
                self.enqueue_nested_chapters(&event.path, 1, now);
                self.coalescer
                    .request(&format!("new-manga:{source_name}/{}", components[1]), false)
                    .await;
            }
            3 if event.is_dir() => {
                self.rename.enqueue_chapter_path(&event.path, now);
                self.coalescer
                    .request(
                        &format!("chapter-implied-new:{source_name}/{}", components[1]),
                        false,
                    )
                    .await;
            }
            _ => {}
        }
    }

    /// Release watcher resources on worker shutdown.
    pub async fn shutdown(&mut self) {
        self.watcher.shutdown().await;
    }

    /// One pipeline tick. Returns the final dispatch outcome.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MergeDispatchOutcome {
        if self.first_tick {
            self.first_tick = false;
            if !self.coalescer.has_pending().await {
                self.coalescer.request("startup", false).await;
            }
            // Startup merge runs before the first watcher poll; a failed
            // startup pass is logged, not fatal.
            if self.dispatch(now, cancel).await == MergeDispatchOutcome::Failure {
                self.log.warning(
                    "pipeline.startup_merge_failed",
                    "startup merge pass failed; continuing",
                    &[],
                );
            }
        }

        if cancel.is_cancelled() {
            return MergeDispatchOutcome::NoPendingRequest;
        }

        let roots = [self.config.sources_root.clone()];
        let poll = self
            .watcher
            .poll(&roots, self.config.poll_timeout, cancel)
            .await;
        for warning in &poll.warnings {
            self.log.warning("pipeline.watch_warning", warning, &[]);
        }
        if poll.outcome == WatchOutcome::ToolNotFound {
            self.log.error(
                "pipeline.watch_tool_missing",
                "inotify tooling unavailable; event-driven merging is degraded",
                &[],
            );
        }

        let _ = self.rename.process_once(now);

        for event in &poll.events {
            self.classify_event(event, now).await;
        }

        self.dispatch(now, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use shelf_core::eventlog::CapturingLog;

    use crate::coalesce::MergeRequest;
    use crate::rename::{
        DefaultChapterSanitizer, RenameConfig, RenameQueueStore, StdRenameFileSystem,
    };
    use crate::watch::WatchPoll;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MergeRunner for RecordingRunner {
        async fn run_pass(
            &self,
            request: &MergeRequest,
            _now: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> MergeDispatchOutcome {
            self.reasons.lock().unwrap().push(request.reason.clone());
            MergeDispatchOutcome::Success
        }
    }

    #[derive(Debug)]
    struct ScriptedWatcher {
        polls: Mutex<VecDeque<WatchPoll>>,
    }

    impl ScriptedWatcher {
        fn new(polls: Vec<WatchPoll>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
            }
        }
    }

    #[async_trait]
    impl WatchReader for ScriptedWatcher {
        async fn poll(
            &mut self,
            _roots: &[PathBuf],
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> WatchPoll {
            self.polls.lock().unwrap().pop_front().unwrap_or(WatchPoll {
                outcome: WatchOutcome::TimedOut,
                events: Vec::new(),
                warnings: Vec::new(),
            })
        }
    }

    fn event(path: PathBuf, mask: &str) -> WatchEvent {
        WatchEvent {
            raw: format!("{}|{mask}", path.display()),
            mask: mask.split(',').map(str::to_string).collect(),
            path,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        sources_root: PathBuf,
        rename: Arc<RenameProcessor>,
        coalescer: Arc<MergeCoalescer>,
        runner: Arc<RecordingRunner>,
        log: Arc<CapturingLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let sources_root = dir.path().join("sources");
        std::fs::create_dir_all(&sources_root).unwrap();
        let log = Arc::new(CapturingLog::new());
        let rename = Arc::new(RenameProcessor::new(
            RenameQueueStore::open(dir.path().join("queue.json")),
            Box::new(DefaultChapterSanitizer),
            Box::new(StdRenameFileSystem),
            sources_root.clone(),
            HashSet::new(),
            RenameConfig {
                delay: TimeDelta::minutes(5),
                quiet: TimeDelta::minutes(2),
                rescan_grace: TimeDelta::hours(24),
            },
            Arc::clone(&log) as Arc<dyn EventLog>,
        ));
        Fixture {
            _dir: dir,
            sources_root,
            rename,
            coalescer: Arc::new(MergeCoalescer::new()),
            runner: Arc::new(RecordingRunner::default()),
            log,
        }
    }

    fn pipeline(fx: &Fixture, polls: Vec<WatchPoll>, excluded: HashSet<String>) -> EventPipeline {
        EventPipeline::new(
            PipelineConfig {
                sources_root: fx.sources_root.clone(),
                poll_timeout: Duration::from_millis(10),
                excluded_sources: excluded,
            },
            Box::new(ScriptedWatcher::new(polls)),
            Arc::clone(&fx.rename),
            Arc::clone(&fx.coalescer),
            Arc::clone(&fx.runner) as Arc<dyn MergeRunner>,
            Arc::clone(&fx.log) as Arc<dyn EventLog>,
        )
    }

    fn success_poll(events: Vec<WatchEvent>) -> WatchPoll {
        WatchPoll {
            outcome: WatchOutcome::Success,
            events,
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn chapter_event_enqueues_rename_and_requests_in_order() {
        let fx = fixture();
        let chapter = fx.sources_root.join("SourceA/MangaA/Chapter001");
        let polls = vec![success_poll(vec![event(chapter.clone(), "CREATE,ISDIR")])];
        let mut pipeline = pipeline(&fx, polls, HashSet::new());

        let outcome = pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        assert_eq!(outcome, MergeDispatchOutcome::Success);

        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(
            reasons,
            vec!["startup", "chapter-implied-new:SourceA/MangaA"],
            "startup dispatches before the event-driven request"
        );
        assert_eq!(fx.rename.queue_len(), 1);
    }

    #[tokio::test]
    async fn new_source_event_enqueues_all_nested_chapters() {
        let fx = fixture();
        let source = fx.sources_root.join("SourceA");
        std::fs::create_dir_all(source.join("MangaA/Ch1")).unwrap();
        std::fs::create_dir_all(source.join("MangaA/Ch2")).unwrap();
        std::fs::create_dir_all(source.join("MangaB/Ch1")).unwrap();

        let polls = vec![success_poll(vec![event(source.clone(), "MOVED_TO,ISDIR")])];
        let mut pipeline = pipeline(&fx, polls, HashSet::new());
        pipeline.tick(Utc::now(), &CancellationToken::new()).await;

        assert_eq!(fx.rename.queue_len(), 3);
        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(reasons, vec!["startup", "new-source:SourceA"]);
    }

    #[tokio::test]
    async fn new_manga_event_enqueues_its_chapters() {
        let fx = fixture();
        let manga = fx.sources_root.join("SourceA/MangaA");
        std::fs::create_dir_all(manga.join("Ch1")).unwrap();
        std::fs::create_dir_all(manga.join("Ch2")).unwrap();

        let polls = vec![success_poll(vec![event(manga.clone(), "CREATE,ISDIR")])];
        let mut pipeline = pipeline(&fx, polls, HashSet::new());
        pipeline.tick(Utc::now(), &CancellationToken::new()).await;

        assert_eq!(fx.rename.queue_len(), 2);
        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(reasons, vec!["startup", "new-manga:SourceA/MangaA"]);
    }

    #[tokio::test]
    async fn excluded_source_events_are_ignored() {
        let fx = fixture();
        let chapter = fx.sources_root.join("Local-Import/MangaA/Ch1");
        let polls = vec![success_poll(vec![event(chapter, "CREATE,ISDIR")])];
        let excluded: HashSet<String> = [normalize_token_key("local import")].into();
        let mut pipeline = pipeline(&fx, polls, excluded);

        pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(reasons, vec!["startup"], "no event-driven request");
        assert_eq!(fx.rename.queue_len(), 0);
    }

    #[tokio::test]
    async fn startup_request_is_not_queued_when_one_is_pending() {
        let fx = fixture();
        fx.coalescer.request("boot-probe", false).await;
        let mut pipeline = pipeline(&fx, vec![], HashSet::new());

        pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(reasons, vec!["boot-probe"]);
    }

    #[tokio::test]
    async fn second_tick_does_not_replay_startup() {
        let fx = fixture();
        let mut pipeline = pipeline(&fx, vec![], HashSet::new());

        pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        let outcome = pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        assert_eq!(outcome, MergeDispatchOutcome::NoPendingRequest);
        let reasons = fx.runner.reasons.lock().unwrap().clone();
        assert_eq!(reasons, vec!["startup"]);
    }

    #[tokio::test]
    async fn watch_warnings_are_logged() {
        let fx = fixture();
        let polls = vec![WatchPoll {
            outcome: WatchOutcome::CommandFailed,
            events: Vec::new(),
            warnings: vec!["session died".to_string()],
        }];
        let mut pipeline = pipeline(&fx, polls, HashSet::new());
        pipeline.tick(Utc::now(), &CancellationToken::new()).await;
        assert!(fx.log.contains_id("pipeline.watch_warning"));
    }

    #[tokio::test]
    async fn cancelled_tick_returns_without_polling() {
        let fx = fixture();
        let mut pipeline = pipeline(&fx, vec![], HashSet::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = pipeline.tick(Utc::now(), &cancel).await;
        assert_eq!(outcome, MergeDispatchOutcome::NoPendingRequest);
    }
}
