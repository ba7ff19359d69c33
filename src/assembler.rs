use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ContextError, Result};
use crate::patterns::IgnoreRules;
use crate::progress::{ProgressTracker, SizeBudget};
use crate::walker::{
    DirEntryInfo, ExclusionSet, check_cancelled, read_sorted_dir, relative_to, root_name,
    to_slash,
};

pub const CANCELLED_MARKER: &str =
    "*** Context generation was cancelled before completion. Output may be incomplete. ***";

/// One root to assemble, with the rules and exclusions that apply to it.
#[derive(Debug, Clone)]
pub struct RootSpec {
    pub path: PathBuf,
    pub rules: IgnoreRules,
    pub exclusions: ExclusionSet,
}

impl RootSpec {
    pub fn new(path: impl Into<PathBuf>, rules: IgnoreRules, exclusions: ExclusionSet) -> Self {
        Self {
            path: path.into(),
            rules,
            exclusions,
        }
    }

    pub fn name(&self) -> String {
        root_name(&self.path)
    }

    fn includes(&self, rel: &Path, is_dir: bool) -> bool {
        !self.exclusions.contains(rel) && !self.rules.is_ignored(rel, is_dir)
    }

    /// Entries of `dir` that make it into the artifact, in render order.
    /// An unreadable subdirectory yields nothing; an unreadable root is an error.
    fn visible_entries(&self, dir: &Path) -> Result<Vec<DirEntryInfo>> {
        let entries = match read_sorted_dir(dir) {
            Ok(entries) => entries,
            Err(err) if dir == self.path => return Err(ContextError::io(dir, err)),
            Err(err) => {
                warn!("error reading dir {}: {err}", dir.display());
                return Ok(Vec::new());
            }
        };
        Ok(entries
            .into_iter()
            .filter(|e| self.includes(&relative_to(&self.path, &e.path), e.is_dir))
            .collect())
    }
}

/// Result of a multi-root assembly that was not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Complete(String),
    /// Cancelled after at least one root block was written; the text ends with
    /// [`CANCELLED_MARKER`].
    CancelledPartial(String),
}

/// Count work units for progress: one for the root line, one per rendered
/// entry, and one more per file for its content.
pub fn count_items(spec: &RootSpec, cancel: &CancellationToken) -> Result<usize> {
    fn count_dir(spec: &RootSpec, dir: &Path, cancel: &CancellationToken) -> Result<usize> {
        check_cancelled(cancel)?;
        let mut count = 0;
        for entry in spec.visible_entries(dir)? {
            count += 1;
            if entry.is_dir {
                count += count_dir(spec, &entry.path, cancel)?;
            } else {
                count += 1;
            }
        }
        Ok(count)
    }

    Ok(1 + count_dir(spec, &spec.path, cancel)?)
}

/// Depth-first iterator over the files of a root that would be included in its
/// artifact. Stops early when dropped, so probing for content is cheap.
pub struct IncludableFiles<'a> {
    spec: &'a RootSpec,
    cancel: &'a CancellationToken,
    stack: Vec<std::vec::IntoIter<DirEntryInfo>>,
    done: bool,
}

impl<'a> IncludableFiles<'a> {
    pub fn new(spec: &'a RootSpec, cancel: &'a CancellationToken) -> Self {
        let mut stack = Vec::new();
        if !spec.exclusions.root_excluded() {
            match read_sorted_dir(&spec.path) {
                Ok(entries) => stack.push(entries.into_iter()),
                Err(err) => warn!("error reading dir {}: {err}", spec.path.display()),
            }
        }
        Self {
            spec,
            cancel,
            stack,
            done: false,
        }
    }
}

impl Iterator for IncludableFiles<'_> {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.cancel.is_cancelled() {
                self.done = true;
                return Some(Err(ContextError::Cancelled));
            }
            let top = self.stack.last_mut()?;
            let Some(entry) = top.next() else {
                self.stack.pop();
                continue;
            };
            let rel = relative_to(&self.spec.path, &entry.path);
            if !self.spec.includes(&rel, entry.is_dir) {
                continue;
            }
            if !entry.is_dir {
                return Some(Ok(entry.path));
            }
            match read_sorted_dir(&entry.path) {
                Ok(entries) => self.stack.push(entries.into_iter()),
                Err(err) => warn!("error reading dir {}: {err}", entry.path.display()),
            }
        }
    }
}

/// Whether `spec` has at least one file that would be included.
pub fn has_includable_content(spec: &RootSpec, cancel: &CancellationToken) -> Result<bool> {
    IncludableFiles::new(spec, cancel)
        .next()
        .transpose()
        .map(|f| f.is_some())
}

/// Tree and file-content buffers for one root, checked against a shared budget
/// after every write.
struct RootWriter {
    tree: String,
    files: String,
    budget: SizeBudget,
}

impl RootWriter {
    fn new(budget: SizeBudget) -> Self {
        Self {
            tree: String::new(),
            files: String::new(),
            budget,
        }
    }

    fn len(&self) -> usize {
        self.tree.len() + self.files.len()
    }

    fn push_root_line(&mut self, name: &str) -> Result<()> {
        self.tree.push_str(name);
        self.tree.push_str("/\n");
        self.budget
            .check(self.len(), || "after root dir line".to_string())
    }

    fn push_tree_line(&mut self, prefix: &str, branch: &str, name: &str) -> Result<()> {
        self.tree.push_str(prefix);
        self.tree.push_str(branch);
        self.tree.push_str(name);
        self.tree.push('\n');
        self.budget
            .check(self.len(), || "during tree generation".to_string())
    }

    fn push_file(&mut self, rel_path: &str, content: &str) -> Result<()> {
        self.files.push_str("<file path=\"");
        self.files.push_str(rel_path);
        self.files.push_str("\">\n");
        self.files.push_str(content);
        self.files.push_str("\n</file>\n");
        self.budget
            .check(self.len(), || format!("after appending file {rel_path}"))
    }

    /// Tree, a blank separator line, then the file blocks without the final
    /// newline. With no file blocks, the tree alone.
    fn finish(self) -> String {
        if self.files.is_empty() {
            return self.tree;
        }
        let mut out = self.tree;
        out.push('\n');
        out.push_str(self.files.trim_end_matches('\n'));
        out
    }
}

fn render_dir(
    spec: &RootSpec,
    dir: &Path,
    prefix: &str,
    out: &mut RootWriter,
    progress: &mut ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    check_cancelled(cancel)?;
    let entries = spec.visible_entries(dir)?;
    let last_index = entries.len().saturating_sub(1);

    for (i, entry) in entries.iter().enumerate() {
        check_cancelled(cancel)?;
        let (branch, child_prefix) = if i == last_index {
            ("└── ", format!("{prefix}    "))
        } else {
            ("├── ", format!("{prefix}│   "))
        };
        out.push_tree_line(prefix, branch, &entry.name)?;
        progress.tick();

        if entry.is_dir {
            render_dir(spec, &entry.path, &child_prefix, out, progress, cancel)?;
            continue;
        }

        check_cancelled(cancel)?;
        // Bytes that are not UTF-8 become U+FFFD; the ceiling counts the text
        // as written, not the bytes on disk.
        let content = match std::fs::read(&entry.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                warn!("error reading file {}: {err}", entry.path.display());
                format!("Error reading file: {err}")
            }
        };
        let rel = to_slash(&relative_to(&spec.path, &entry.path));
        out.push_file(&rel, &content)?;
        progress.tick();
    }
    Ok(())
}

/// Render one root's artifact without starting the progress count. `budget`
/// carries any bytes already committed by the caller.
fn render_root(
    spec: &RootSpec,
    budget: SizeBudget,
    progress: &mut ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut out = RootWriter::new(budget);
    out.push_root_line(&spec.name())?;
    progress.tick();
    render_dir(spec, &spec.path, "", &mut out, progress, cancel)?;
    check_cancelled(cancel)?;
    Ok(out.finish())
}

/// Assemble the artifact for a single root.
///
/// A root excluded as `"."` yields just its `name/` line. Exceeding `limit`
/// fails with [`ContextError::TooLong`]; cancellation with
/// [`ContextError::Cancelled`].
pub fn assemble(
    spec: &RootSpec,
    limit: usize,
    progress: &mut ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<String> {
    check_cancelled(cancel)?;
    if spec.exclusions.root_excluded() {
        debug!(
            "root {} is excluded, returning minimal context",
            spec.path.display()
        );
        return Ok(format!("{}/\n", spec.name()));
    }

    let total = count_items(spec, cancel)?;
    progress.start(total);
    let text = render_root(spec, SizeBudget::new(limit), progress, cancel)?;
    info!(
        "assembled {} ({} bytes, {} units)",
        spec.path.display(),
        text.len(),
        progress.state().current
    );
    Ok(text)
}

fn project_header(spec: &RootSpec) -> String {
    format!(
        "=== PROJECT: {} ===\nProject Root: {}\n\n",
        spec.name(),
        spec.path.display()
    )
}

fn truncated_marker(name: &str) -> String {
    format!("\n*** TRUNCATED for project {name}: Context size limit reached. ***\n")
}

fn cancelled(output: String) -> Result<Assembled> {
    if output.is_empty() {
        return Err(ContextError::Cancelled);
    }
    Ok(Assembled::CancelledPartial(format!("{output}\n{CANCELLED_MARKER}")))
}

/// Assemble several roots into one artifact.
///
/// Roots without any includable file are skipped and get no header. Each
/// remaining root gets a `=== PROJECT: <name> ===` header followed by its
/// single-root artifact; blocks are separated by a blank line. The ceiling is
/// shared across all roots: once a block has been written, an overflowing
/// root is replaced by a TRUNCATED marker and generation stops.
pub fn assemble_many(
    roots: &[RootSpec],
    limit: usize,
    progress: &mut ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<Assembled> {
    check_cancelled(cancel)?;

    let mut with_content = Vec::new();
    for spec in roots {
        if has_includable_content(spec, cancel)? {
            with_content.push(spec);
        } else {
            debug!("skipping {}: no includable content", spec.path.display());
        }
    }
    if with_content.is_empty() {
        return Ok(Assembled::Complete(String::new()));
    }

    let mut total = 0;
    for spec in &with_content {
        total += 1 + count_items(spec, cancel)?;
    }
    progress.start(total);

    let mut output = String::new();
    for (i, spec) in with_content.iter().enumerate() {
        if cancel.is_cancelled() {
            return cancelled(output);
        }
        let block_start = output.len();
        if i > 0 {
            output.push_str("\n\n");
        }
        output.push_str(&project_header(spec));
        progress.tick();

        let budget = SizeBudget::with_committed(limit, output.len());
        let header_detail = || format!("after project header {}", spec.name());
        let rendered = budget
            .check(0, header_detail)
            .and_then(|()| render_root(spec, budget, progress, cancel));

        let overflow = match rendered {
            Ok(block) => {
                output.push_str(&block);
                continue;
            }
            Err(ContextError::Cancelled) => {
                output.truncate(block_start);
                return cancelled(output);
            }
            Err(err) if err.is_too_long() => err,
            Err(err) => return Err(err),
        };

        if i == 0 {
            return Err(overflow);
        }
        warn!("{overflow}; truncating at project {}", spec.name());
        output.push_str(&truncated_marker(&spec.name()));
        break;
    }

    if cancel.is_cancelled() {
        return cancelled(output);
    }
    Ok(Assembled::Complete(output))
}
