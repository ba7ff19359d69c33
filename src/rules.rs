use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::patterns::{IgnoreRules, PatternSet};

/// The ignore configuration shared by listing, assembly and watching.
///
/// The custom set is replaced, never edited, so a reader holding the old
/// `Arc` keeps a consistent rule set while a new one is installed.
#[derive(Debug)]
pub struct IgnoreState {
    custom: RwLock<Arc<PatternSet>>,
    gitignores: Mutex<HashMap<PathBuf, Option<Arc<PatternSet>>>>,
    use_gitignore: AtomicBool,
    use_custom_ignore: AtomicBool,
}

impl IgnoreState {
    pub fn new(custom_rule_text: &str) -> Self {
        Self {
            custom: RwLock::new(Arc::new(PatternSet::compile(custom_rule_text))),
            gitignores: Mutex::new(HashMap::new()),
            use_gitignore: AtomicBool::new(true),
            use_custom_ignore: AtomicBool::new(true),
        }
    }

    pub fn custom(&self) -> Arc<PatternSet> {
        Arc::clone(&self.custom.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Compile `rule_text` and install it as the custom set.
    pub fn set_custom_rules(&self, rule_text: &str) {
        let compiled = Arc::new(PatternSet::compile(rule_text));
        debug!("custom ignore rules recompiled ({} rules)", compiled.len());
        *self.custom.write().unwrap_or_else(|p| p.into_inner()) = compiled;
    }

    pub fn use_gitignore(&self) -> bool {
        self.use_gitignore.load(Ordering::Relaxed)
    }

    pub fn set_use_gitignore(&self, enabled: bool) {
        self.use_gitignore.store(enabled, Ordering::Relaxed);
    }

    pub fn use_custom_ignore(&self) -> bool {
        self.use_custom_ignore.load(Ordering::Relaxed)
    }

    pub fn set_use_custom_ignore(&self, enabled: bool) {
        self.use_custom_ignore.store(enabled, Ordering::Relaxed);
    }

    /// Recompile `root/.gitignore` and cache the result.
    pub fn reload_gitignore(&self, root: &Path) -> Option<Arc<PatternSet>> {
        let compiled = PatternSet::from_gitignore_file(root).map(Arc::new);
        self.gitignores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(root.to_path_buf(), compiled.clone());
        compiled
    }

    /// The cached `.gitignore` set for `root`, compiling it on first use.
    pub fn gitignore(&self, root: &Path) -> Option<Arc<PatternSet>> {
        let cached = self
            .gitignores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(root)
            .cloned();
        match cached {
            Some(set) => set,
            None => self.reload_gitignore(root),
        }
    }

    /// Both rule sets regardless of the toggles, for display flags.
    pub fn display_rules(&self, root: &Path) -> IgnoreRules {
        IgnoreRules::new(self.reload_gitignore(root), Some(self.custom()))
    }

    /// The rule sets currently switched on, for assembly and watching.
    pub fn active_rules(&self, root: &Path) -> IgnoreRules {
        let project = if self.use_gitignore() {
            self.gitignore(root)
        } else {
            None
        };
        let custom = self.use_custom_ignore().then(|| self.custom());
        IgnoreRules::new(project, custom)
    }

    /// Like [`active_rules`](Self::active_rules), but `.gitignore` is read
    /// from disk again. Every generation run starts from this.
    pub fn fresh_rules(&self, root: &Path) -> IgnoreRules {
        if self.use_gitignore() {
            self.reload_gitignore(root);
        }
        self.active_rules(root)
    }
}
