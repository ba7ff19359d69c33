use std::path::Path;
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

/// Rule text bundled into the binary, used when no custom rules are configured.
pub const DEFAULT_CUSTOM_IGNORE_RULES: &str = include_str!("default_ignore.glob");

/// A compiled, immutable set of gitignore-syntax rules matched against
/// root-relative paths.
///
/// Rule changes never mutate an existing set; callers compile a new one and
/// swap the `Arc` they hand out.
#[derive(Debug, Clone)]
pub struct PatternSet {
    matcher: Gitignore,
}

impl PatternSet {
    /// A set that matches nothing.
    pub fn empty() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    /// Compile rule text. Blank lines and `#` comments are skipped by the
    /// gitignore parser; a line that fails to compile is dropped with a warning.
    /// Never fails: the worst case is the empty set.
    pub fn compile(rule_text: &str) -> Self {
        let normalized = rule_text.replace("\r\n", "\n");
        let mut builder = GitignoreBuilder::new("");
        for line in normalized.lines() {
            if let Err(err) = builder.add_line(None, line) {
                warn!("skipping ignore rule {line:?}: {err}");
            }
        }
        Self::finish(builder)
    }

    /// Compile the `.gitignore` found directly under `root`, if there is one.
    pub fn from_gitignore_file(root: &Path) -> Option<Self> {
        let gitignore_path = root.join(".gitignore");
        if !gitignore_path.is_file() {
            debug!(".gitignore not found at {}", gitignore_path.display());
            return None;
        }
        // Root is left empty: matching is always done on root-relative paths.
        let mut builder = GitignoreBuilder::new("");
        if let Some(err) = builder.add(&gitignore_path) {
            warn!(
                "error compiling .gitignore at {}: {err}",
                gitignore_path.display()
            );
        }
        debug!(".gitignore compiled from {}", gitignore_path.display());
        Some(Self::finish(builder))
    }

    fn finish(builder: GitignoreBuilder) -> Self {
        match builder.build() {
            Ok(matcher) => Self { matcher },
            Err(err) => {
                warn!("ignore rules failed to build, using empty set: {err}");
                Self::empty()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_empty()
    }

    /// Number of ignore (non-whitelist) rules in the set.
    pub fn len(&self) -> usize {
        self.matcher.num_ignores() as usize
    }

    /// Whether `relative_path` is ignored. A rule ending in `/` only matches
    /// when `is_dir` is true. Parent directories are consulted, so a file under
    /// an ignored directory is itself ignored.
    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        if self.is_empty() || relative_path.has_root() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Per-entry result of evaluating both rule sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreFlags {
    pub gitignored: bool,
    pub custom_ignored: bool,
}

impl IgnoreFlags {
    pub fn any(self) -> bool {
        self.gitignored || self.custom_ignored
    }
}

/// The two rule sets in effect for one scan: project `.gitignore` rules and
/// the global custom rules. They are OR-ed, never merged. A `None` slot is a
/// disabled or absent set.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    pub project: Option<Arc<PatternSet>>,
    pub custom: Option<Arc<PatternSet>>,
}

impl IgnoreRules {
    pub fn new(project: Option<Arc<PatternSet>>, custom: Option<Arc<PatternSet>>) -> Self {
        Self { project, custom }
    }

    pub fn flags(&self, relative_path: &Path, is_dir: bool) -> IgnoreFlags {
        IgnoreFlags {
            gitignored: self
                .project
                .as_ref()
                .is_some_and(|set| set.matches(relative_path, is_dir)),
            custom_ignored: self
                .custom
                .as_ref()
                .is_some_and(|set| set.matches(relative_path, is_dir)),
        }
    }

    pub fn is_ignored(&self, relative_path: &Path, is_dir: bool) -> bool {
        self.flags(relative_path, is_dir).any()
    }

    /// Display flag for the scan root itself. Only the custom set is consulted
    /// and the result never stops traversal.
    pub fn root_custom_ignored(&self) -> bool {
        self.custom
            .as_ref()
            .is_some_and(|set| set.matches(Path::new("."), true))
    }
}
