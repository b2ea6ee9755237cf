//! Structural comparison of two generated trees.
//!
//! Renames are reported as Removed + Added. Files containing a NUL byte or
//! invalid UTF-8 are binary: they get Modified entries without line diffs.
//! A mode change on identical contents is Modified with zero changed lines.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use diffy::Line;
use serde::{Deserialize, Serialize};

use super::tree::{DirectoryTree, FileEntry};

/// How a path changed between base and head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,

    pub kind: ChangeKind,

    /// Either side is not text
    #[serde(default)]
    pub binary: bool,

    pub lines_added: usize,

    pub lines_removed: usize,

    /// Unified diff, only for modified text files
    #[serde(default)]
    pub patch: Option<String>,

    #[serde(default)]
    pub old_mode: Option<u32>,

    #[serde(default)]
    pub new_mode: Option<u32>,
}

/// Totals over a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Comparison between the trees generated for two revisions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub base: String,
    pub head: String,

    /// Changed paths in sorted order; unchanged paths are omitted
    pub changes: Vec<FileChange>,

    pub generated_at: DateTime<Utc>,
}

impl DiffReport {
    /// Compare `base_tree` (old) against `head_tree` (new)
    pub fn between(
        base: impl Into<String>,
        head: impl Into<String>,
        base_tree: &DirectoryTree,
        head_tree: &DirectoryTree,
    ) -> Self {
        let paths: BTreeSet<&str> = base_tree.paths().chain(head_tree.paths()).collect();

        let changes = paths
            .into_iter()
            .filter_map(|path| match (base_tree.get(path), head_tree.get(path)) {
                (None, Some(new)) => Some(one_sided(path, ChangeKind::Added, new)),
                (Some(old), None) => Some(one_sided(path, ChangeKind::Removed, old)),
                (Some(old), Some(new)) => modified(path, old, new),
                (None, None) => None,
            })
            .collect();

        Self {
            base: base.into(),
            head: head.into(),
            changes,
            generated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths_of(&self, kind: ChangeKind) -> BTreeSet<&str> {
        self.changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.path.as_str())
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.changes.iter().find(|c| c.path == path)
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for change in &self.changes {
            match change.kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Removed => summary.removed += 1,
                ChangeKind::Modified => summary.modified += 1,
            }
            summary.lines_added += change.lines_added;
            summary.lines_removed += change.lines_removed;
        }
        summary
    }

    /// Short human-readable summary, used as the review comment headline
    pub fn headline(&self) -> String {
        if self.is_empty() {
            return format!("No changes in generated code between {} and {}", self.base, self.head);
        }
        let s = self.summary();
        format!(
            "Generated code changes {}..{}: {} added, {} removed, {} modified (+{} -{} lines)",
            self.base, self.head, s.added, s.removed, s.modified, s.lines_added, s.lines_removed
        )
    }
}

fn as_text(entry: &FileEntry) -> Option<&str> {
    if entry.contents.contains(&0) {
        return None;
    }
    std::str::from_utf8(&entry.contents).ok()
}

fn one_sided(path: &str, kind: ChangeKind, entry: &FileEntry) -> FileChange {
    let text = as_text(entry);
    let lines = text.map(|t| t.lines().count()).unwrap_or(0);
    let (lines_added, lines_removed, old_mode, new_mode) = match kind {
        ChangeKind::Added => (lines, 0, None, Some(entry.mode)),
        _ => (0, lines, Some(entry.mode), None),
    };

    FileChange {
        path: path.to_string(),
        kind,
        binary: text.is_none(),
        lines_added,
        lines_removed,
        patch: None,
        old_mode,
        new_mode,
    }
}

fn modified(path: &str, old: &FileEntry, new: &FileEntry) -> Option<FileChange> {
    if old == new {
        return None;
    }

    let mut change = FileChange {
        path: path.to_string(),
        kind: ChangeKind::Modified,
        binary: false,
        lines_added: 0,
        lines_removed: 0,
        patch: None,
        old_mode: Some(old.mode),
        new_mode: Some(new.mode),
    };

    if old.contents == new.contents {
        return Some(change);
    }

    match (as_text(old), as_text(new)) {
        (Some(old_text), Some(new_text)) => {
            let patch = diffy::create_patch(old_text, new_text);
            for hunk in patch.hunks() {
                for line in hunk.lines() {
                    match line {
                        Line::Insert(_) => change.lines_added += 1,
                        Line::Delete(_) => change.lines_removed += 1,
                        Line::Context(_) => {}
                    }
                }
            }
            change.patch = Some(patch.to_string());
        }
        _ => change.binary = true,
    }

    Some(change)
}
