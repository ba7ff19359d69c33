use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ContextError, Result};
use crate::patterns::IgnoreRules;

/// One entry of a directory listing, with its ignore flags and (for
/// directories that were descended into) its ordered children.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub path: PathBuf,
    /// Forward-slash path relative to the listing root; `"."` for the root.
    pub rel_path: String,
    pub is_dir: bool,
    pub gitignored: bool,
    pub custom_ignored: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Root-relative paths the user excluded by hand, checked in addition to the
/// ignore rules. Entries use forward slashes; `"."` excludes the root itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    paths: HashSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel_path: impl AsRef<str>) {
        self.paths.insert(normalize_rel(rel_path.as_ref()));
    }

    pub fn contains(&self, rel_path: &Path) -> bool {
        !self.paths.is_empty() && self.paths.contains(&to_slash(rel_path))
    }

    pub fn root_excluded(&self) -> bool {
        self.paths.contains(".")
    }
}

impl<S: AsRef<str>> FromIterator<S> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for p in iter {
            set.insert(p);
        }
        set
    }
}

fn normalize_rel(raw: &str) -> String {
    let trimmed = raw.trim().replace('\\', "/");
    let trimmed = trimmed.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Render a relative path with `/` separators regardless of platform.
pub fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// `path` relative to `root`; the path itself if it is not under `root`.
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Display name of a root directory: its final component, or the whole path
/// for `/` and similar.
pub fn root_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned())
}

/// A directory entry as seen by every traversal in this crate.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Directories before files; within a kind, case-insensitive by name, with
/// the raw name as a tie-break so the order is total.
pub fn compare_entries(a_is_dir: bool, a_name: &str, b_is_dir: bool, b_name: &str) -> Ordering {
    b_is_dir
        .cmp(&a_is_dir)
        .then_with(|| a_name.to_lowercase().cmp(&b_name.to_lowercase()))
        .then_with(|| a_name.cmp(b_name))
}

/// List `dir` and sort the entries with [`compare_entries`]. Symlinks are
/// reported as files and never followed.
pub fn read_sorted_dir(dir: &Path) -> std::io::Result<Vec<DirEntryInfo>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            is_dir,
        });
    }
    entries.sort_by(|a, b| compare_entries(a.is_dir, &a.name, b.is_dir, &b.name));
    Ok(entries)
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ContextError::Cancelled)
    } else {
        Ok(())
    }
}

/// Build the listing for `root`.
///
/// Entries ignored by either rule set are included with their flags set but
/// are never descended into. Excluded entries are left out. A subdirectory
/// that cannot be read is logged and shown without children; an unreadable
/// root is an error.
pub fn list_tree(
    root: &Path,
    rules: &IgnoreRules,
    exclusions: &ExclusionSet,
    cancel: &CancellationToken,
) -> Result<TreeNode> {
    check_cancelled(cancel)?;
    let entries = read_sorted_dir(root).map_err(|e| ContextError::io(root, e))?;
    let children = build_children(entries, root, rules, exclusions, cancel)?;

    Ok(TreeNode {
        name: root_name(root),
        path: root.to_path_buf(),
        rel_path: ".".to_string(),
        is_dir: true,
        gitignored: false,
        custom_ignored: rules.root_custom_ignored(),
        children,
    })
}

fn build_children(
    entries: Vec<DirEntryInfo>,
    root: &Path,
    rules: &IgnoreRules,
    exclusions: &ExclusionSet,
    cancel: &CancellationToken,
) -> Result<Vec<TreeNode>> {
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let rel = relative_to(root, &entry.path);
        if exclusions.contains(&rel) {
            continue;
        }
        let flags = rules.flags(&rel, entry.is_dir);

        let mut children = Vec::new();
        if entry.is_dir && !flags.any() {
            check_cancelled(cancel)?;
            match read_sorted_dir(&entry.path) {
                Ok(sub) => children = build_children(sub, root, rules, exclusions, cancel)?,
                Err(err) => warn!("error building subtree for {}: {err}", entry.path.display()),
            }
        } else if flags.any() {
            debug!(
                "{} ignored (gitignore: {}, custom: {})",
                rel.display(),
                flags.gitignored,
                flags.custom_ignored
            );
        }

        nodes.push(TreeNode {
            name: entry.name,
            path: entry.path,
            rel_path: to_slash(&rel),
            is_dir: entry.is_dir,
            gitignored: flags.gitignored,
            custom_ignored: flags.custom_ignored,
            children,
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternSet;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn names(nodes: &[TreeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_sibling_order_dirs_first_then_case_insensitive() {
        let dir = tmp();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::create_dir(dir.path().join("A")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let tree = list_tree(
            dir.path(),
            &IgnoreRules::default(),
            &ExclusionSet::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&tree.children), vec!["A", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_compare_entries_is_total() {
        assert_eq!(compare_entries(false, "Z", false, "a"), Ordering::Greater);
        assert_eq!(compare_entries(true, "z", false, "a"), Ordering::Less);
        assert_eq!(compare_entries(false, "A", false, "a"), Ordering::Less);
        assert_eq!(compare_entries(false, "a", false, "a"), Ordering::Equal);
    }

    #[test]
    fn test_ignored_directory_is_listed_without_children() {
        let dir = tmp();
        fs::create_dir_all(dir.path().join("build/deep")).unwrap();
        fs::write(dir.path().join("build/deep/out.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let rules = IgnoreRules::new(Some(Arc::new(PatternSet::compile("build/\n"))), None);
        let tree = list_tree(
            dir.path(),
            &rules,
            &ExclusionSet::new(),
            &CancellationToken::new(),
        )
        .unwrap();

        let build = tree.children.iter().find(|n| n.name == "build").unwrap();
        assert!(build.gitignored);
        assert!(!build.custom_ignored);
        assert!(
            build.children.is_empty(),
            "ignored dir must not be descended"
        );

        let src = tree.children.iter().find(|n| n.name == "src").unwrap();
        assert_eq!(names(&src.children), vec!["main.rs"]);
        assert_eq!(src.children[0].rel_path, "src/main.rs");
    }

    #[test]
    fn test_root_flags() {
        let dir = tmp();
        let rules = IgnoreRules::new(
            Some(Arc::new(PatternSet::compile("*\n"))),
            Some(Arc::new(PatternSet::compile("*.md\n"))),
        );
        let tree = list_tree(
            dir.path(),
            &rules,
            &ExclusionSet::new(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(tree.rel_path, ".");
        assert!(tree.is_dir);
        assert!(!tree.gitignored, "the root is never gitignored");
        assert!(!tree.custom_ignored);
    }

    #[test]
    fn test_excluded_entries_are_omitted() {
        let dir = tmp();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.md"), "a").unwrap();
        fs::write(dir.path().join("docs/b.md"), "b").unwrap();

        let exclusions: ExclusionSet = ["docs/a.md"].into_iter().collect();
        let tree = list_tree(
            dir.path(),
            &IgnoreRules::default(),
            &exclusions,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(names(&tree.children[0].children), vec!["b.md"]);
    }

    #[test]
    fn test_cancelled_walk_returns_cancelled() {
        let dir = tmp();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = list_tree(
            dir.path(),
            &IgnoreRules::default(),
            &ExclusionSet::new(),
            &cancel,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_unreadable_root_is_an_error() {
        let dir = tmp();
        let missing = dir.path().join("missing");
        let err = list_tree(
            &missing,
            &IgnoreRules::default(),
            &ExclusionSet::new(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::Io { .. }));
    }

    #[test]
    fn test_exclusion_set_normalizes_paths() {
        let set: ExclusionSet = ["./src/", "a\\b.txt", ""].into_iter().collect();
        assert!(set.contains(Path::new("src")));
        assert!(set.contains(Path::new("a/b.txt")));
        assert!(set.root_excluded());
        assert!(!set.contains(Path::new("b.txt")));
    }

    #[test]
    fn test_to_slash_and_root_name() {
        assert_eq!(to_slash(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(to_slash(Path::new("")), ".");
        assert_eq!(root_name(Path::new("/tmp/project")), "project");
    }
}
