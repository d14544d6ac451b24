//! Chapter rename queue.
//!
//! Chapter directories arriving from sources often carry scene cruft in
//! their names. Renames are queued, delayed, and gated on a quiet window
//! so a chapter still being written is never moved under the writer.
//! Collisions resolve through `_alt-a`..`_alt-z` suffixes; an exhausted
//! suffix space drops the entry with a warning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use shelf_core::config::atomic_write_bytes;
use shelf_core::eventlog::EventLog;
use shelf_core::normalize::normalize_token_key;

/// Sanitation seam: owns the chapter-name rewrite rules.
pub trait ChapterSanitizer: Send + Sync {
    fn sanitize(&self, raw: &str) -> String;
}

/// Default rules: drop leading bracketed group tags, replace
/// path-reserved characters, collapse whitespace, trim trailing dots.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChapterSanitizer;

impl ChapterSanitizer for DefaultChapterSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        let mut text = raw.trim();
        // Leading "[Group] " prefixes, possibly stacked.
        while text.starts_with('[') {
            match text.find(']') {
                Some(end) if end + 1 < text.len() => text = text[end + 1..].trim_start(),
                _ => break,
            }
        }
        let replaced: String = text
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
        let cleaned = collapsed.trim_end_matches(['.', ' ']).to_string();
        if cleaned.is_empty() {
            raw.trim().to_string()
        } else {
            cleaned
        }
    }
}

/// Filesystem seam for the processor.
pub trait RenameFileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn modified(&self, path: &Path) -> Option<std::time::SystemTime>;
    fn list_children(&self, path: &Path) -> Vec<PathBuf>;
    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdRenameFileSystem;

impl RenameFileSystem for StdRenameFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn modified(&self, path: &Path) -> Option<std::time::SystemTime> {
        path.metadata().and_then(|m| m.modified()).ok()
    }

    fn list_children(&self, path: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(path)
            .map(|entries| entries.filter_map(Result::ok).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        std::fs::rename(from, to)
    }
}

/// One queued rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub allow_at: DateTime<Utc>,
    pub chapter_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue persist failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Order-preserving persisted queue. All mutation flows through one
/// `transform` critical section.
#[derive(Debug)]
pub struct RenameQueueStore {
    path: PathBuf,
    entries: Mutex<Vec<QueueEntry>>,
}

impl RenameQueueStore {
    pub fn open(path: PathBuf) -> Self {
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the queue under the lock and persist the result.
    pub fn transform<F>(&self, f: F) -> Result<usize, QueueError>
    where
        F: FnOnce(Vec<QueueEntry>) -> Vec<QueueEntry>,
    {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = f(std::mem::take(&mut *entries));
        let json = serde_json::to_vec_pretty(&next).map_err(std::io::Error::other)?;
        atomic_write_bytes(&self.path, &json)?;
        let len = next.len();
        *entries = next;
        Ok(len)
    }
}

/// Counters from one `process_once` pass; the drop/defer counters sum to
/// `processed`, which is the queue length at entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenamePassCounters {
    pub processed: usize,
    pub renamed: usize,
    pub unchanged: usize,
    pub deferred_missing: usize,
    pub dropped_missing: usize,
    pub deferred_not_ready: usize,
    pub deferred_not_quiet: usize,
    pub collision_skipped: usize,
    pub move_failed: usize,
    pub remaining: usize,
}

impl RenamePassCounters {
    pub fn accounted(&self) -> usize {
        self.renamed
            + self.unchanged
            + self.deferred_missing
            + self.dropped_missing
            + self.deferred_not_ready
            + self.deferred_not_quiet
            + self.collision_skipped
            + self.move_failed
    }
}

/// Timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct RenameConfig {
    /// Wait after arrival before a rename may run.
    pub delay: chrono::Duration,
    /// Required quiet window over the chapter's direct children.
    pub quiet: chrono::Duration,
    /// How long a missing entry survives before it drops.
    pub rescan_grace: chrono::Duration,
}

/// The queue processor.
pub struct RenameProcessor {
    store: RenameQueueStore,
    sanitizer: Box<dyn ChapterSanitizer>,
    fs: Box<dyn RenameFileSystem>,
    sources_root: PathBuf,
    excluded_sources: HashSet<String>,
    config: RenameConfig,
    log: Arc<dyn EventLog>,
}

impl std::fmt::Debug for RenameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenameProcessor")
            .field("sources_root", &self.sources_root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const COLLISION_SUFFIXES: std::ops::RangeInclusive<char> = 'a'..='z';

impl RenameProcessor {
    pub fn new(
        store: RenameQueueStore,
        sanitizer: Box<dyn ChapterSanitizer>,
        fs: Box<dyn RenameFileSystem>,
        sources_root: PathBuf,
        excluded_sources: HashSet<String>,
        config: RenameConfig,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            store,
            sanitizer,
            fs,
            sources_root,
            excluded_sources,
            config,
            log,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.store.len()
    }

    /// Depth-3 check: `Source/Manga/Chapter` under the sources root.
    fn classify(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.sources_root).ok()?;
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if components.len() != 3 {
            return None;
        }
        Some(components[0].clone())
    }

    fn is_excluded(&self, source_name: &str) -> bool {
        self.excluded_sources
            .contains(&normalize_token_key(source_name))
    }

    /// Queue one chapter path. Returns whether it was enqueued.
    pub fn enqueue_chapter_path(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let Some(source) = self.classify(path) else {
            return false;
        };
        if self.is_excluded(&source) {
            return false;
        }
        let entry = QueueEntry {
            allow_at: now + self.config.delay,
            chapter_path: path.to_path_buf(),
        };
        let queued = self.store.transform(|mut entries| {
            if !entries.iter().any(|e| e.chapter_path == entry.chapter_path) {
                entries.push(entry);
            }
            entries
        });
        queued.is_ok()
    }

    fn latest_mtime(&self, path: &Path) -> Option<DateTime<Utc>> {
        let children = self.fs.list_children(path);
        let newest = children
            .iter()
            .filter_map(|child| self.fs.modified(child))
            .max()
            .or_else(|| self.fs.modified(path))?;
        Some(DateTime::<Utc>::from(newest))
    }

    fn resolve_destination(&self, parent: &Path, sanitized: &str) -> Option<PathBuf> {
        let plain = parent.join(sanitized);
        if !self.fs.exists(&plain) {
            return Some(plain);
        }
        for suffix in COLLISION_SUFFIXES {
            let candidate = parent.join(format!("{sanitized}_alt-{suffix}"));
            if !self.fs.exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// One full pass over the queue.
    pub fn process_once(&self, now: DateTime<Utc>) -> RenamePassCounters {
        let entries = self.store.snapshot();
        let mut counters = RenamePassCounters {
            processed: entries.len(),
            ..RenamePassCounters::default()
        };
        let mut retained = Vec::new();

        for entry in entries {
            let path = &entry.chapter_path;
            if !self.fs.exists(path) {
                if now - entry.allow_at > self.config.rescan_grace {
                    counters.dropped_missing += 1;
                    debug!(path = %path.display(), "rename entry dropped, path gone past grace");
                } else {
                    counters.deferred_missing += 1;
                    retained.push(entry);
                }
                continue;
            }
            if now < entry.allow_at {
                counters.deferred_not_ready += 1;
                retained.push(entry);
                continue;
            }
            if let Some(latest) = self.latest_mtime(path) {
                if now - latest < self.config.quiet {
                    counters.deferred_not_quiet += 1;
                    retained.push(entry);
                    continue;
                }
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let sanitized = self.sanitizer.sanitize(&name);
            if sanitized == name {
                counters.unchanged += 1;
                continue;
            }

            let parent = path.parent().unwrap_or(Path::new("/"));
            let Some(destination) = self.resolve_destination(parent, &sanitized) else {
                counters.collision_skipped += 1;
                self.log.warning(
                    "rename.collision_exhausted",
                    "all collision suffixes taken, entry dropped",
                    &[
                        ("path", path.display().to_string()),
                        ("sanitized", sanitized.clone()),
                    ],
                );
                continue;
            };

            match self.fs.rename(path, &destination) {
                Ok(()) => {
                    counters.renamed += 1;
                    self.log.normal(
                        "rename.applied",
                        "chapter directory renamed",
                        &[
                            ("from", path.display().to_string()),
                            ("to", destination.display().to_string()),
                        ],
                    );
                }
                Err(err) => {
                    counters.move_failed += 1;
                    self.log.warning(
                        "rename.move_failed",
                        "chapter rename failed, entry dropped",
                        &[
                            ("path", path.display().to_string()),
                            ("error", err.to_string()),
                        ],
                    );
                }
            }
        }

        counters.remaining = retained.len();
        if self.store.transform(|_| retained).is_err() {
            self.log.warning(
                "rename.queue_persist_failed",
                "rename queue could not be persisted",
                &[],
            );
        }
        counters
    }

    /// Walk `sources/*/*/*`, queueing every sanitizable chapter that is
    /// not queued yet. Returns the number of entries added.
    pub fn rescan_and_enqueue(&self, now: DateTime<Utc>) -> usize {
        let queued: HashSet<PathBuf> = self
            .store
            .snapshot()
            .into_iter()
            .map(|entry| entry.chapter_path)
            .collect();
        let mut added = Vec::new();

        let sources = std::fs::read_dir(&self.sources_root)
            .map(|entries| entries.filter_map(Result::ok).map(|e| e.path()).collect())
            .unwrap_or_else(|_| Vec::<PathBuf>::new());
        for source in sources.iter().filter(|p| p.is_dir()) {
            let source_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if self.is_excluded(&source_name) {
                continue;
            }
            for manga in self.fs.list_children(source) {
                if !manga.is_dir() {
                    continue;
                }
                for chapter in self.fs.list_children(&manga) {
                    if !chapter.is_dir() || queued.contains(&chapter) {
                        continue;
                    }
                    let name = chapter
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if self.sanitizer.sanitize(&name) == name {
                        continue;
                    }
                    let last_write = self
                        .fs
                        .modified(&chapter)
                        .map(DateTime::<Utc>::from)
                        .unwrap_or(now);
                    let base = (last_write + self.config.delay).max(now);
                    added.push(QueueEntry {
                        allow_at: base + self.config.delay,
                        chapter_path: chapter,
                    });
                }
            }
        }

        let count = added.len();
        if count > 0
            && self
                .store
                .transform(|mut entries| {
                    entries.extend(added);
                    entries
                })
                .is_err()
        {
            self.log.warning(
                "rename.queue_persist_failed",
                "rename queue could not be persisted",
                &[],
            );
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use shelf_core::eventlog::CapturingLog;

    #[test]
    fn sanitizer_strips_group_tags_and_reserved_chars() {
        let sanitizer = DefaultChapterSanitizer;
        assert_eq!(sanitizer.sanitize("[Group] Chapter 1"), "Chapter 1");
        assert_eq!(sanitizer.sanitize("[A][B] Chapter 2"), "Chapter 2");
        assert_eq!(sanitizer.sanitize("Ch: 1/2?"), "Ch_ 1_2_");
        assert_eq!(sanitizer.sanitize("  spaced   out  "), "spaced out");
        assert_eq!(sanitizer.sanitize("Trailing dots..."), "Trailing dots");
        // Already-clean names come back unchanged.
        assert_eq!(sanitizer.sanitize("Chapter 10"), "Chapter 10");
    }

    #[test]
    fn sanitizer_never_returns_empty() {
        assert_eq!(DefaultChapterSanitizer.sanitize("..."), "...");
    }

    struct Fixture {
        dir: tempfile::TempDir,
        sources_root: PathBuf,
        log: Arc<CapturingLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let sources_root = dir.path().join("sources");
        std::fs::create_dir_all(&sources_root).unwrap();
        Fixture {
            sources_root,
            log: Arc::new(CapturingLog::new()),
            dir,
        }
    }

    fn processor(fx: &Fixture, config: RenameConfig) -> RenameProcessor {
        RenameProcessor::new(
            RenameQueueStore::open(fx.dir.path().join("rename-queue.json")),
            Box::new(DefaultChapterSanitizer),
            Box::new(StdRenameFileSystem),
            fx.sources_root.clone(),
            HashSet::new(),
            config,
            Arc::clone(&fx.log) as Arc<dyn EventLog>,
        )
    }

    fn immediate_config() -> RenameConfig {
        RenameConfig {
            delay: TimeDelta::zero(),
            quiet: TimeDelta::zero(),
            rescan_grace: TimeDelta::hours(24),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn enqueue_accepts_only_depth_three_paths() {
        let fx = fixture();
        let p = processor(&fx, immediate_config());
        assert!(p.enqueue_chapter_path(&fx.sources_root.join("S/M/C"), now()));
        assert!(!p.enqueue_chapter_path(&fx.sources_root.join("S/M"), now()));
        assert!(!p.enqueue_chapter_path(&fx.sources_root.join("S/M/C/deep"), now()));
        assert!(!p.enqueue_chapter_path(Path::new("/elsewhere/S/M/C"), now()));
        assert_eq!(p.queue_len(), 1);
    }

    #[test]
    fn enqueue_skips_excluded_sources_and_duplicates() {
        let fx = fixture();
        let mut excluded = HashSet::new();
        excluded.insert(normalize_token_key("Local-Import"));
        let p = RenameProcessor::new(
            RenameQueueStore::open(fx.dir.path().join("q.json")),
            Box::new(DefaultChapterSanitizer),
            Box::new(StdRenameFileSystem),
            fx.sources_root.clone(),
            excluded,
            immediate_config(),
            Arc::clone(&fx.log) as Arc<dyn EventLog>,
        );
        assert!(!p.enqueue_chapter_path(&fx.sources_root.join("Local-Import/M/C"), now()));
        assert!(p.enqueue_chapter_path(&fx.sources_root.join("S/M/C"), now()));
        assert!(p.enqueue_chapter_path(&fx.sources_root.join("S/M/C"), now()));
        assert_eq!(p.queue_len(), 1);
    }

    #[test]
    fn ready_quiet_entry_is_renamed() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] Chapter 1");
        std::fs::create_dir_all(&chapter).unwrap();
        let p = processor(&fx, immediate_config());
        assert!(p.enqueue_chapter_path(&chapter, now()));

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.renamed, 1);
        assert_eq!(counters.remaining, 0);
        assert!(fx.sources_root.join("S/M/Chapter 1").exists());
        assert!(!chapter.exists());
    }

    #[test]
    fn not_ready_entries_defer() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] C1");
        std::fs::create_dir_all(&chapter).unwrap();
        let config = RenameConfig {
            delay: TimeDelta::minutes(5),
            ..immediate_config()
        };
        let p = processor(&fx, config);
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now());
        assert_eq!(counters.deferred_not_ready, 1);
        assert_eq!(counters.remaining, 1);
        assert!(chapter.exists());
    }

    #[test]
    fn recently_written_entries_defer_on_quiet_window() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] C1");
        std::fs::create_dir_all(&chapter).unwrap();
        std::fs::write(chapter.join("page1.png"), b"fresh").unwrap();
        let config = RenameConfig {
            quiet: TimeDelta::minutes(10),
            ..immediate_config()
        };
        let p = processor(&fx, config);
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.deferred_not_quiet, 1);
        assert_eq!(counters.remaining, 1);
    }

    #[test]
    fn missing_entries_defer_then_drop_after_grace() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] Gone");
        let p = processor(&fx, immediate_config());
        // Enqueue without creating the directory.
        assert!(p.enqueue_chapter_path(&chapter, now()));

        let counters = p.process_once(now() + TimeDelta::hours(1));
        assert_eq!(counters.deferred_missing, 1);

        let counters = p.process_once(now() + TimeDelta::hours(48));
        assert_eq!(counters.dropped_missing, 1);
        assert_eq!(counters.remaining, 0);
    }

    #[test]
    fn unchanged_names_drop_quietly() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/Chapter 1");
        std::fs::create_dir_all(&chapter).unwrap();
        let p = processor(&fx, immediate_config());
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.unchanged, 1);
        assert_eq!(counters.remaining, 0);
        assert!(chapter.exists());
    }

    #[test]
    fn collisions_resolve_through_alt_suffixes() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] Chapter 1");
        std::fs::create_dir_all(&chapter).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/Chapter 1")).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/Chapter 1_alt-a")).unwrap();
        let p = processor(&fx, immediate_config());
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.renamed, 1);
        assert!(fx.sources_root.join("S/M/Chapter 1_alt-b").exists());
    }

    #[test]
    fn exhausted_suffixes_drop_with_warning() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] Ch");
        std::fs::create_dir_all(&chapter).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/Ch")).unwrap();
        for c in 'a'..='z' {
            std::fs::create_dir_all(fx.sources_root.join(format!("S/M/Ch_alt-{c}"))).unwrap();
        }
        let p = processor(&fx, immediate_config());
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.collision_skipped, 1);
        assert_eq!(counters.remaining, 0);
        assert!(fx.log.contains_id("rename.collision_exhausted"));
    }

    #[derive(Debug)]
    struct FailingRenameFs;

    impl RenameFileSystem for FailingRenameFs {
        fn exists(&self, path: &Path) -> bool {
            StdRenameFileSystem.exists(path)
        }
        fn modified(&self, path: &Path) -> Option<std::time::SystemTime> {
            StdRenameFileSystem.modified(path)
        }
        fn list_children(&self, path: &Path) -> Vec<PathBuf> {
            StdRenameFileSystem.list_children(path)
        }
        fn rename(&self, _from: &Path, _to: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("device busy"))
        }
    }

    #[test]
    fn move_failure_drops_with_warning() {
        let fx = fixture();
        let chapter = fx.sources_root.join("S/M/[Grp] Ch");
        std::fs::create_dir_all(&chapter).unwrap();
        let p = RenameProcessor::new(
            RenameQueueStore::open(fx.dir.path().join("q.json")),
            Box::new(DefaultChapterSanitizer),
            Box::new(FailingRenameFs),
            fx.sources_root.clone(),
            HashSet::new(),
            immediate_config(),
            Arc::clone(&fx.log) as Arc<dyn EventLog>,
        );
        p.enqueue_chapter_path(&chapter, now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.move_failed, 1);
        assert_eq!(counters.remaining, 0);
        assert!(fx.log.contains_id("rename.move_failed"));
    }

    #[test]
    fn counters_account_for_every_entry() {
        let fx = fixture();
        std::fs::create_dir_all(fx.sources_root.join("S/M/[G] A")).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/Clean")).unwrap();
        let p = processor(&fx, immediate_config());
        p.enqueue_chapter_path(&fx.sources_root.join("S/M/[G] A"), now());
        p.enqueue_chapter_path(&fx.sources_root.join("S/M/Clean"), now());
        p.enqueue_chapter_path(&fx.sources_root.join("S/M/Missing"), now());

        let counters = p.process_once(now() + TimeDelta::seconds(1));
        assert_eq!(counters.processed, 3);
        assert_eq!(counters.accounted(), 3);
        assert_eq!(counters.remaining, counters.deferred_missing);
    }

    #[test]
    fn rescan_queues_only_sanitizable_unqueued_chapters() {
        let fx = fixture();
        std::fs::create_dir_all(fx.sources_root.join("S/M/[G] Dirty")).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/Clean")).unwrap();
        std::fs::create_dir_all(fx.sources_root.join("S/M/[G] Queued")).unwrap();
        let config = RenameConfig {
            delay: TimeDelta::minutes(5),
            ..immediate_config()
        };
        let p = processor(&fx, config);
        p.enqueue_chapter_path(&fx.sources_root.join("S/M/[G] Queued"), now());

        let added = p.rescan_and_enqueue(now());
        assert_eq!(added, 1);
        assert_eq!(p.queue_len(), 2);

        // Rescan entries wait out the doubled delay.
        let counters = p.process_once(now() + TimeDelta::minutes(6));
        assert!(counters.deferred_not_ready >= 1, "{counters:?}");
    }

    #[test]
    fn queue_survives_reopen_in_order() {
        let fx = fixture();
        let path = fx.dir.path().join("q.json");
        let store = RenameQueueStore::open(path.clone());
        store
            .transform(|mut entries| {
                for name in ["a", "b", "c"] {
                    entries.push(QueueEntry {
                        allow_at: now(),
                        chapter_path: PathBuf::from(format!("/s/{name}")),
                    });
                }
                entries
            })
            .unwrap();

        let reopened = RenameQueueStore::open(path);
        let paths: Vec<PathBuf> = reopened
            .snapshot()
            .into_iter()
            .map(|e| e.chapter_path)
            .collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/s/a"), PathBuf::from("/s/b"), PathBuf::from("/s/c")]
        );
    }
}
