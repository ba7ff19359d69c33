pub mod event;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ignore::WalkBuilder;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ContextError, Result};
use crate::events::{AppEvent, EventSender, emit};
use crate::patterns::IgnoreRules;
use crate::walker::relative_to;
use event::{ChangeKind, classify};

/// Default quiet window for coalescing "files changed" notifications.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(75);

/// How often the consumer wakes up to check for cancellation when idle.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Starting,
    Watching,
}

type RawEvent = notify::Result<notify::Event>;

/// The directories subscribed under one root, with the OS watcher that holds
/// the subscriptions and the rule snapshot that decided them.
///
/// Only the event consumer mutates a live set; `start` and the rescan build a
/// fresh one before the consumer exists.
pub struct WatchSet {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    dirs: HashSet<PathBuf>,
    rules: IgnoreRules,
}

impl WatchSet {
    /// Create the OS watcher and run the registration pass from `root`.
    /// Failing to watch the root itself is an error; anything below is logged
    /// and skipped.
    fn open(root: PathBuf, rules: IgnoreRules, sender: std_mpsc::Sender<RawEvent>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = sender.send(res);
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;

        let mut set = Self {
            dirs: HashSet::from([root.clone()]),
            root,
            watcher: Some(watcher),
            rules,
        };
        let root = set.root.clone();
        let added = set.register_tree(&root);
        info!("watching {} ({} directories)", root.display(), added + 1);
        Ok(set)
    }

    /// Whether `dir` must not be subscribed.
    fn skips_dir(root: &Path, rules: &IgnoreRules, dir: &Path) -> bool {
        let rel = relative_to(root, dir);
        if rel.as_os_str().is_empty() {
            return false;
        }
        rel == Path::new(".git") || rules.is_ignored(&rel, true)
    }

    /// Depth-first registration of `start` and every directory below it that
    /// is not skipped. Returns the number of newly subscribed directories.
    fn register_tree(&mut self, start: &Path) -> usize {
        let Some(watcher) = self.watcher.as_mut() else {
            return 0;
        };
        if Self::skips_dir(&self.root, &self.rules, start) {
            return 0;
        }

        let root = self.root.clone();
        let rules = self.rules.clone();
        let mut builder = WalkBuilder::new(start);
        builder.standard_filters(false).follow_links(false);
        builder.filter_entry(move |entry| {
            entry.file_type().is_some_and(|ft| ft.is_dir())
                && !Self::skips_dir(&root, &rules, entry.path())
        });

        let mut added = 0;
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable directory during watch registration: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_dir()) {
                continue;
            }
            let dir = entry.into_path();
            if self.dirs.contains(&dir) {
                continue;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    debug!("watching {}", dir.display());
                    self.dirs.insert(dir);
                    added += 1;
                }
                Err(err) => warn!("failed to watch {}: {err}", dir.display()),
            }
        }
        added
    }

    /// Drop `path` and every subscribed directory below it.
    fn unsubscribe_tree(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        for dir in gone {
            if let Some(watcher) = self.watcher.as_mut() {
                // The OS usually drops the watch with the directory already.
                if let Err(err) = watcher.unwatch(&dir) {
                    debug!("unwatch {}: {err}", dir.display());
                }
            }
            self.dirs.remove(&dir);
            debug!("stopped watching {}", dir.display());
        }
    }

    /// Update the subscriptions for one raw event. Returns whether consumers
    /// should be told that files changed.
    fn apply(&mut self, event: &notify::Event) -> bool {
        if event.need_rescan() {
            warn!("watch backend dropped events under {}", self.root.display());
            self.rescan();
            return true;
        }

        let mut changed = false;
        for change in classify(event, &self.dirs) {
            let Ok(rel) = change.path.strip_prefix(&self.root) else {
                continue;
            };
            if !rel.as_os_str().is_empty() && self.is_ignored(rel, change.is_dir) {
                debug!("ignored change: {}", rel.display());
                continue;
            }
            changed |= change.kind.notifies();

            match change.kind {
                ChangeKind::Created if change.is_dir == Some(true) => {
                    self.register_tree(&change.path);
                }
                ChangeKind::Removed => self.unsubscribe_tree(&change.path),
                _ => {}
            }
        }
        changed
    }

    /// A path of unknown type is ignored if a rule matches it either as a file
    /// or as a directory.
    fn is_ignored(&self, rel: &Path, is_dir: Option<bool>) -> bool {
        match is_dir {
            Some(is_dir) => self.rules.is_ignored(rel, is_dir),
            None => self.rules.is_ignored(rel, false) || self.rules.is_ignored(rel, true),
        }
    }

    /// Bring the subscriptions back in line with the filesystem after the
    /// backend lost events: vanished directories are dropped and the tree is
    /// registered again from the root.
    fn rescan(&mut self) {
        let gone: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| !dir.is_dir())
            .cloned()
            .collect();
        for dir in &gone {
            self.unsubscribe_tree(dir);
        }
        let root = self.root.clone();
        let added = self.register_tree(&root);
        debug!(
            "rescanned {}: {} dropped, {added} added",
            self.root.display(),
            gone.len()
        );
    }

    /// Release the OS subscriptions. Late events are applied to an empty set.
    fn close(&mut self) {
        self.watcher = None;
        self.dirs.clear();
    }
}

fn lock(set: &Mutex<WatchSet>) -> MutexGuard<'_, WatchSet> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    root: PathBuf,
    debounce: Duration,
    set: Arc<Mutex<WatchSet>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    async fn open(
        root: PathBuf,
        rules: IgnoreRules,
        events: EventSender,
        debounce: Duration,
    ) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel();
        let set_root = root.clone();
        let set = tokio::task::spawn_blocking(move || WatchSet::open(set_root, rules, tx))
            .await
            .map_err(|err| ContextError::io(&root, std::io::Error::other(err)))??;

        let set = Arc::new(Mutex::new(set));
        let cancel = CancellationToken::new();
        let consumer = Consumer {
            set: Arc::clone(&set),
            events,
            debounce,
            cancel: cancel.clone(),
        };
        let task = tokio::task::spawn_blocking(move || consumer.run(rx));
        Ok(Self {
            root,
            debounce,
            set,
            cancel,
            task,
        })
    }

    /// Stop the consumer, then release the OS subscriptions off the runtime.
    async fn close(self) {
        let Self {
            root,
            set,
            cancel,
            task,
            ..
        } = self;
        cancel.cancel();
        if let Err(err) = task.await {
            warn!(
                "watch consumer for {} ended abnormally: {err}",
                root.display()
            );
        }
        if let Err(err) = tokio::task::spawn_blocking(move || lock(&set).close()).await {
            warn!("closing the watch on {} failed: {err}", root.display());
        }
    }
}

/// The single serialized consumer of raw watch events for one session.
struct Consumer {
    set: Arc<Mutex<WatchSet>>,
    events: EventSender,
    debounce: Duration,
    cancel: CancellationToken,
}

impl Consumer {
    fn run(self, rx: std_mpsc::Receiver<RawEvent>) {
        let root = lock(&self.set).root.clone();
        let mut deadline: Option<Instant> = None;

        while !self.cancel.is_cancelled() {
            let wait = deadline
                .map(|d| d.saturating_duration_since(Instant::now()).min(IDLE_POLL))
                .unwrap_or(IDLE_POLL);
            match rx.recv_timeout(wait) {
                Ok(Ok(event)) => {
                    if lock(&self.set).apply(&event) {
                        if self.debounce.is_zero() {
                            self.notify(&root);
                        } else {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                }
                Ok(Err(err)) => warn!("watch error under {}: {err}", root.display()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                deadline = None;
                if !self.cancel.is_cancelled() {
                    self.notify(&root);
                }
            }
        }
        debug!("watch consumer for {} stopped", root.display());
    }

    fn notify(&self, root: &Path) {
        debug!("files changed under {}", root.display());
        emit(
            &self.events,
            AppEvent::FilesChanged {
                root: root.to_path_buf(),
            },
        );
    }
}

/// Keeps the watch set for at most one root in step with the filesystem and
/// reports coarse "files changed" notifications.
pub struct WatchManager {
    session: TokioMutex<Option<Session>>,
    state: Mutex<WatchState>,
    events: EventSender,
}

impl WatchManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            session: TokioMutex::new(None),
            state: Mutex::new(WatchState::Stopped),
            events,
        }
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: WatchState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Watch `root` with the given rule snapshot, replacing any earlier watch.
    /// Notifications are coalesced over `debounce`; zero sends one per event.
    pub async fn start(&self, root: &Path, rules: IgnoreRules, debounce: Duration) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            debug!("replacing watch on {}", previous.root.display());
            previous.close().await;
        }

        self.set_state(WatchState::Starting);
        match Session::open(root.to_path_buf(), rules, self.events.clone(), debounce).await {
            Ok(opened) => {
                *session = Some(opened);
                self.set_state(WatchState::Watching);
                Ok(())
            }
            Err(err) => {
                self.set_state(WatchState::Stopped);
                Err(err)
            }
        }
    }

    /// Stop watching. Safe to call when nothing is watched.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            info!("stopped watching {}", current.root.display());
            current.close().await;
        }
        self.set_state(WatchState::Stopped);
    }

    /// Rebuild the whole watch set under new rules and tell consumers to
    /// refresh. Returns `false` when nothing is being watched.
    pub async fn refresh_ignores_and_rescan(&self, rules: IgnoreRules) -> Result<bool> {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            return Ok(false);
        };
        let root = current.root.clone();
        let debounce = current.debounce;
        current.close().await;

        match Session::open(root.clone(), rules, self.events.clone(), debounce).await {
            Ok(opened) => {
                *session = Some(opened);
                info!("rescanned watch set for {}", root.display());
                emit(&self.events, AppEvent::FilesChanged { root });
                Ok(true)
            }
            Err(err) => {
                self.set_state(WatchState::Stopped);
                Err(err)
            }
        }
    }

    pub async fn root(&self) -> Option<PathBuf> {
        self.session.lock().await.as_ref().map(|s| s.root.clone())
    }

    /// Currently subscribed directories, sorted.
    #[cfg(test)]
    pub async fn watched_dirs(&self) -> Vec<PathBuf> {
        let session = self.session.lock().await;
        let mut dirs: Vec<PathBuf> = session
            .as_ref()
            .map(|s| lock(&s.set).dirs.iter().cloned().collect())
            .unwrap_or_default();
        dirs.sort();
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventReceiver};
    use crate::patterns::PatternSet;
    use notify::event::{EventKind, Flag};
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("r");
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        (dir, root)
    }

    fn rules(project: &str) -> IgnoreRules {
        IgnoreRules::new(Some(Arc::new(PatternSet::compile(project))), None)
    }

    async fn watching(root: &Path, rules: IgnoreRules) -> (WatchManager, EventReceiver) {
        let (tx, rx) = events::channel();
        let manager = WatchManager::new(tx);
        manager.start(root, rules, DEFAULT_DEBOUNCE).await.unwrap();
        (manager, rx)
    }

    /// Collect `FilesChanged` notifications arriving within `window`.
    async fn drain(rx: &mut EventReceiver, window: Duration) -> usize {
        let until = tokio::time::Instant::now() + window;
        let mut count = 0;
        while let Ok(Some(event)) = tokio::time::timeout_at(until, rx.recv()).await {
            if matches!(event, AppEvent::FilesChanged { .. }) {
                count += 1;
            }
        }
        count
    }

    async fn wait_for(manager: &WatchManager, check: impl Fn(&[PathBuf]) -> bool) -> bool {
        for _ in 0..100 {
            if check(&manager.watched_dirs().await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_registration_skips_git_and_ignored_dirs() {
        let (_dir, root) = fixture();
        let (manager, _rx) = watching(&root, rules("node_modules/\n")).await;

        assert_eq!(manager.state(), WatchState::Watching);
        assert_eq!(
            manager.watched_dirs().await,
            vec![root.clone(), root.join("src"), root.join("src/nested")]
        );
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ignored_changes_are_silent_and_real_changes_notify_once() {
        let (_dir, root) = fixture();
        let (manager, mut rx) = watching(&root, rules("build/\n")).await;

        fs::create_dir(root.join("build")).unwrap();
        fs::write(root.join("build/x.txt"), "out").unwrap();
        assert_eq!(drain(&mut rx, Duration::from_millis(500)).await, 0);
        let dirs = manager.watched_dirs().await;
        assert!(!dirs.contains(&root.join("build")));

        fs::write(root.join("src/y.txt"), "hello").unwrap();
        assert_eq!(drain(&mut rx, Duration::from_millis(800)).await, 1);
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removing_an_ignored_directory_is_silent() {
        let (_dir, root) = fixture();
        fs::create_dir(root.join("build")).unwrap();
        let (manager, mut rx) = watching(&root, rules("build/\n")).await;

        fs::remove_dir(root.join("build")).unwrap();
        assert_eq!(drain(&mut rx, Duration::from_millis(500)).await, 0);

        fs::write(root.join("src/z.txt"), "z").unwrap();
        assert_eq!(drain(&mut rx, Duration::from_millis(800)).await, 1);
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_created_and_removed_directories_track_the_set() {
        let (_dir, root) = fixture();
        let (manager, _rx) = watching(&root, IgnoreRules::default()).await;

        let fresh = root.join("fresh");
        fs::create_dir(&fresh).unwrap();
        assert!(wait_for(&manager, |dirs| dirs.contains(&fresh)).await);

        fs::remove_dir_all(root.join("src")).unwrap();
        let src = root.join("src");
        assert!(
            wait_for(&manager, |dirs| !dirs.iter().any(|d| d.starts_with(&src))).await,
            "removed dir and its descendants leave the watch set"
        );
        manager.stop().await;
    }

    #[test]
    fn test_rescan_flag_rebuilds_the_set_from_disk() {
        let (_dir, root) = fixture();
        let (tx, _rx) = std_mpsc::channel();
        let mut set = WatchSet::open(root.clone(), rules("node_modules/\n"), tx).unwrap();
        assert!(set.dirs.contains(&root.join("src/nested")));

        fs::remove_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("lib/deep")).unwrap();
        fs::create_dir_all(root.join("node_modules/other")).unwrap();
        let overflow = notify::Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert!(set.apply(&overflow));

        assert!(!set.dirs.iter().any(|d| d.starts_with(root.join("src"))));
        assert!(set.dirs.contains(&root.join("lib")));
        assert!(set.dirs.contains(&root.join("lib/deep")));
        assert!(!set.dirs.contains(&root.join("node_modules/other")));
        set.close();
    }

    #[tokio::test]
    async fn test_refresh_rebuilds_and_notifies() {
        let (_dir, root) = fixture();
        let (manager, mut rx) = watching(&root, IgnoreRules::default()).await;
        assert!(manager.watched_dirs().await.contains(&root.join("src")));

        let rescanned = manager.refresh_ignores_and_rescan(rules("src/\n")).await;
        assert!(rescanned.unwrap());
        match rx.recv().await {
            Some(AppEvent::FilesChanged { root: notified }) => assert_eq!(notified, root),
            other => panic!("expected FilesChanged, got {other:?}"),
        }
        assert!(!manager.watched_dirs().await.contains(&root.join("src")));
        assert_eq!(manager.state(), WatchState::Watching);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refresh_without_watch_is_noop() {
        let (_dir, root) = fixture();
        let (manager, _rx) = watching(&root, IgnoreRules::default()).await;
        manager.stop().await;
        manager.stop().await;

        assert_eq!(manager.state(), WatchState::Stopped);
        assert!(manager.watched_dirs().await.is_empty());
        assert!(manager.root().await.is_none());
        let rescanned = manager
            .refresh_ignores_and_rescan(IgnoreRules::default())
            .await;
        assert!(!rescanned.unwrap());

        manager
            .start(&root, IgnoreRules::default(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(manager.root().await, Some(root));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_on_missing_root_fails_and_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = events::channel();
        let manager = WatchManager::new(tx);
        let missing = dir.path().join("missing");
        let err = manager
            .start(&missing, IgnoreRules::default(), DEFAULT_DEBOUNCE)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Watch(_)));
        assert_eq!(manager.state(), WatchState::Stopped);
    }
}
