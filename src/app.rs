use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::assembler::RootSpec;
use crate::config::ProjectConfig;
use crate::events::{self, EventReceiver, EventSender};
use crate::job::{ContextGenerator, GenerationRequest, JobId};
use crate::patterns::DEFAULT_CUSTOM_IGNORE_RULES;
use crate::rules::IgnoreState;
use crate::settings::SettingsStore;
use crate::walker::{ExclusionSet, TreeNode, list_tree};
use crate::watcher::{WatchManager, WatchState};

/// Options for one generation request on top of each root's `ctxpack.toml`.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Relative paths apply to every root; absolute paths to the root that
    /// contains them.
    pub exclude: Vec<String>,
    /// Overrides the ceiling from the first root's config.
    pub max_output_bytes: Option<usize>,
}

/// Everything the surrounding application talks to: settings, ignore state,
/// the generation job manager and the watch manager.
pub struct App {
    settings: Mutex<SettingsStore>,
    ignore: IgnoreState,
    generator: ContextGenerator,
    watcher: WatchManager,
}

impl App {
    /// Build the app around the settings found in `config_dir` (or the
    /// platform config directory). Notifications arrive on the returned
    /// receiver.
    pub fn new(config_dir: Option<&Path>) -> (Self, EventReceiver) {
        let (tx, rx) = events::channel();
        (Self::with_sender(SettingsStore::load(config_dir), tx), rx)
    }

    pub fn with_sender(settings: SettingsStore, events: EventSender) -> Self {
        let ignore = IgnoreState::new(effective_rules(settings.custom_ignore_rules()));
        Self {
            settings: Mutex::new(settings),
            ignore,
            generator: ContextGenerator::new(events.clone()),
            watcher: WatchManager::new(events),
        }
    }

    fn settings(&self) -> MutexGuard<'_, SettingsStore> {
        self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Where the user settings are persisted.
    pub fn settings_path(&self) -> PathBuf {
        self.settings().path().to_path_buf()
    }

    /// The listing of `root` with display flags from both rule sets.
    pub async fn list_files(&self, root: &Path) -> Result<TreeNode> {
        let root = root.to_path_buf();
        let rules = self.ignore.display_rules(&root);
        debug!("listing files under {}", root.display());
        let tree = tokio::task::spawn_blocking(move || {
            list_tree(
                &root,
                &rules,
                &ExclusionSet::new(),
                &CancellationToken::new(),
            )
        })
        .await
        .context("listing task failed")??;
        Ok(tree)
    }

    /// Build the per-root specs for a request: active rules with `.gitignore`
    /// read afresh, `ctxpack.toml` exclusions and the caller's exclusions.
    pub fn build_request(&self, roots: &[PathBuf], options: &GenerateOptions) -> GenerationRequest {
        let mut max_output_bytes = options.max_output_bytes;
        let specs = roots
            .iter()
            .map(|root| {
                let config = ProjectConfig::load(root);
                max_output_bytes.get_or_insert(config.max_output_bytes());
                let mut exclusions: ExclusionSet = config.exclude.iter().collect();
                for raw in &options.exclude {
                    let path = Path::new(raw);
                    if !path.is_absolute() {
                        exclusions.insert(raw);
                    } else if let Ok(rel) = path.strip_prefix(root) {
                        exclusions.insert(rel.to_string_lossy());
                    }
                }
                RootSpec::new(root.clone(), self.ignore.fresh_rules(root), exclusions)
            })
            .collect();

        let request = GenerationRequest::new(specs);
        match max_output_bytes {
            Some(max) => request.with_max_output_bytes(max),
            None => request,
        }
    }

    /// Start a generation job, superseding any job still running.
    pub fn request_generation(&self, roots: &[PathBuf], options: &GenerateOptions) -> JobId {
        self.generator
            .request_generation(self.build_request(roots, options))
    }

    pub fn generator(&self) -> &ContextGenerator {
        &self.generator
    }

    pub async fn start_watcher(&self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            bail!("not a directory: {}", root.display());
        }
        let rules = self.ignore.active_rules(root);
        let debounce = ProjectConfig::load(root).debounce();
        self.watcher
            .start(root, rules, debounce)
            .await
            .with_context(|| format!("failed to watch {}", root.display()))
    }

    pub async fn stop_watcher(&self) {
        self.watcher.stop().await;
    }

    #[cfg(test)]
    pub fn watcher(&self) -> &WatchManager {
        &self.watcher
    }

    /// Rebuild an active watch against the current rules.
    async fn refresh_watcher(&self) -> Result<()> {
        if self.watcher.state() != WatchState::Watching {
            return Ok(());
        }
        let Some(root) = self.watcher.root().await else {
            return Ok(());
        };
        self.ignore.reload_gitignore(&root);
        let rules = self.ignore.active_rules(&root);
        self.watcher
            .refresh_ignores_and_rescan(rules)
            .await
            .with_context(|| format!("failed to rescan {}", root.display()))?;
        Ok(())
    }

    pub fn custom_ignore_rules(&self) -> String {
        self.settings().custom_ignore_rules().to_string()
    }

    /// Install new custom rules. The rules take effect even when saving them
    /// fails; the save error is still reported.
    pub async fn set_custom_ignore_rules(&self, rules: &str) -> Result<()> {
        let saved = self.settings().set_custom_ignore_rules(rules);
        self.ignore.set_custom_rules(effective_rules(rules));
        info!("custom ignore rules updated");
        self.refresh_watcher().await?;
        saved
    }

    pub async fn set_use_gitignore(&self, enabled: bool) -> Result<()> {
        info!("use gitignore: {enabled}");
        self.ignore.set_use_gitignore(enabled);
        self.refresh_watcher().await
    }

    pub async fn set_use_custom_ignore(&self, enabled: bool) -> Result<()> {
        info!("use custom ignore rules: {enabled}");
        self.ignore.set_use_custom_ignore(enabled);
        self.refresh_watcher().await
    }

    pub fn custom_prompt_rules(&self) -> String {
        self.settings().custom_prompt_rules().to_string()
    }

    pub fn set_custom_prompt_rules(&self, rules: &str) -> Result<()> {
        self.settings().set_custom_prompt_rules(rules)
    }

    pub async fn shutdown(&self) {
        self.generator.shutdown();
        self.watcher.stop().await;
    }
}

/// Blank custom rules mean "use the bundled defaults".
fn effective_rules(text: &str) -> &str {
    if text.trim().is_empty() {
        DEFAULT_CUSTOM_IGNORE_RULES
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AppEvent;
    use std::fs;
    use std::time::Duration;

    fn app_in(dir: &Path) -> (App, EventReceiver) {
        App::new(Some(&dir.join("config")))
    }

    async fn watched(app: &App) -> Vec<PathBuf> {
        app.watcher().watched_dirs().await
    }

    #[tokio::test]
    async fn test_list_files_flags_without_descending() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("main.rs"), "fn main() {}").unwrap();
        let (app, _rx) = app_in(dir.path());

        let tree = app.list_files(&root).await.unwrap();
        assert_eq!(tree.rel_path, ".");
        let modules = tree
            .children
            .iter()
            .find(|n| n.name == "node_modules")
            .unwrap();
        assert!(modules.custom_ignored, "bundled rules ignore node_modules");
        assert!(modules.children.is_empty());
    }

    #[tokio::test]
    async fn test_build_request_merges_config_and_caller_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join("ctxpack.toml"),
            "exclude = [\"fixtures\"]\nmax_output_bytes = 2048\n",
        )
        .unwrap();
        let (app, _rx) = app_in(dir.path());

        let absolute = root.join("secret.txt").to_string_lossy().into_owned();
        let options = GenerateOptions {
            exclude: vec!["notes.md".to_string(), absolute],
            max_output_bytes: None,
        };
        let request = app.build_request(&[root.clone()], &options);
        assert_eq!(request.max_output_bytes, 2048);
        let exclusions = &request.roots[0].exclusions;
        assert!(exclusions.contains(Path::new("fixtures")));
        assert!(exclusions.contains(Path::new("notes.md")));
        assert!(exclusions.contains(Path::new("secret.txt")));
    }

    #[tokio::test]
    async fn test_generation_round_trip_through_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        let (app, mut rx) = app_in(dir.path());

        let job = app.request_generation(&[root], &GenerateOptions::default());
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if !event.is_terminal() {
                continue;
            }
            assert_eq!(event.job(), Some(job));
            let AppEvent::Generated { artifact, .. } = &event else {
                panic!("expected Generated, got {event:?}");
            };
            assert_eq!(
                artifact,
                "proj/\n└── a.txt\n\n<file path=\"a.txt\">\nalpha\n</file>"
            );
            break;
        }
    }

    #[tokio::test]
    async fn test_custom_rules_change_rescans_active_watch() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(root.join("gen")).unwrap();
        let (app, mut rx) = app_in(dir.path());

        app.start_watcher(&root).await.unwrap();
        assert!(watched(&app).await.contains(&root.join("gen")));

        app.set_custom_ignore_rules("gen/\n").await.unwrap();
        assert!(matches!(rx.recv().await, Some(AppEvent::FilesChanged { .. })));
        assert!(!watched(&app).await.contains(&root.join("gen")));
        assert_eq!(app.custom_ignore_rules(), "gen/\n");

        app.set_use_custom_ignore(false).await.unwrap();
        assert!(watched(&app).await.contains(&root.join("gen")));
        app.stop_watcher().await;
        assert_eq!(app.watcher().state(), WatchState::Stopped);
    }

    #[tokio::test]
    async fn test_gitignore_toggle_rescans_active_watch() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join(".gitignore"), "out/\n").unwrap();
        let (app, mut rx) = app_in(dir.path());

        app.start_watcher(&root).await.unwrap();
        assert!(!watched(&app).await.contains(&root.join("out")));

        app.set_use_gitignore(false).await.unwrap();
        assert!(matches!(rx.recv().await, Some(AppEvent::FilesChanged { .. })));
        assert!(watched(&app).await.contains(&root.join("out")));

        let request = app.build_request(&[root.clone()], &GenerateOptions::default());
        assert!(!request.roots[0].rules.is_ignored(Path::new("out"), true));

        app.set_use_gitignore(true).await.unwrap();
        assert!(!watched(&app).await.contains(&root.join("out")));
        app.stop_watcher().await;
    }

    #[tokio::test]
    async fn test_each_request_reads_gitignore_afresh() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("secret.txt"), "hunter2").unwrap();
        let (app, _rx) = app_in(dir.path());
        let options = GenerateOptions::default();

        let secret = Path::new("secret.txt");
        let before = app.build_request(&[root.clone()], &options);
        assert!(!before.roots[0].rules.is_ignored(secret, false));

        fs::write(root.join(".gitignore"), "secret.txt\n").unwrap();
        let after = app.build_request(&[root.clone()], &options);
        assert!(after.roots[0].rules.is_ignored(secret, false));
    }

    #[tokio::test]
    async fn test_prompt_rules_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _rx) = app_in(dir.path());
        assert_eq!(app.custom_prompt_rules(), "no additional rules");
        app.set_custom_prompt_rules("cite files").unwrap();
        assert_eq!(app.custom_prompt_rules(), "cite files");
    }
}
