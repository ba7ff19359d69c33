use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};

/// What happened to a single path, after folding notify's event taxonomy
/// down to the distinctions the watch set cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The path now exists (created, or renamed into place).
    Created,
    /// The path is gone (removed, or renamed away).
    Removed,
    /// Content or an unspecified change.
    Modified,
    /// Permissions, timestamps, ownership.
    Attribute,
    /// Opened, read or closed.
    Access,
}

impl ChangeKind {
    /// Whether consumers should hear about this change.
    pub fn notifies(self) -> bool {
        !matches!(self, Self::Attribute | Self::Access)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// `None` when the path is gone and was never subscribed.
    pub is_dir: Option<bool>,
}

/// Split one raw event into per-path changes.
///
/// `subscribed` is consulted for paths that no longer exist: a removed entry
/// is known to be a directory only if it was being watched, and otherwise its
/// type is unknown.
pub fn classify(event: &notify::Event, subscribed: &HashSet<PathBuf>) -> Vec<PathChange> {
    let change = |path: &Path, kind: ChangeKind| PathChange {
        path: path.to_path_buf(),
        kind,
        is_dir: dir_status(path, subscribed),
    };

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                change(from, ChangeKind::Removed),
                change(to, ChangeKind::Created),
            ],
            paths => paths.iter().map(|p| change(p, by_existence(p))).collect(),
        },
        kind => event
            .paths
            .iter()
            .map(|p| change(p, kind_for(kind, p)))
            .collect(),
    }
}

fn kind_for(kind: EventKind, path: &Path) -> ChangeKind {
    match kind {
        EventKind::Access(_) => ChangeKind::Access,
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeKind::Attribute,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(_)) => by_existence(path),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => ChangeKind::Modified,
    }
}

fn by_existence(path: &Path) -> ChangeKind {
    if path.symlink_metadata().is_ok() {
        ChangeKind::Created
    } else {
        ChangeKind::Removed
    }
}

fn dir_status(path: &Path, subscribed: &HashSet<PathBuf>) -> Option<bool> {
    match path.symlink_metadata() {
        Ok(meta) => Some(meta.is_dir()),
        Err(_) => subscribed.contains(path).then_some(true),
    }
}
