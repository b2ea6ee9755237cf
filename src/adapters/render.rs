//! Plain-text rendering of diff reports.

use std::fmt::Write;

use anyhow::Result;

use crate::domain::{ChangeKind, DiffReport};

use super::ReportRenderer;

/// Renders a report as a unified-diff style text document
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

impl ReportRenderer for TextRenderer {
    fn name(&self) -> &str {
        "text"
    }

    fn extension(&self) -> &str {
        "txt"
    }

    fn render(&self, report: &DiffReport) -> Result<Vec<u8>> {
        let mut out = String::new();
        writeln!(out, "{}", report.headline())?;
        writeln!(out)?;

        for change in &report.changes {
            let marker = match change.kind {
                ChangeKind::Added => "A",
                ChangeKind::Removed => "D",
                ChangeKind::Modified => "M",
            };
            write!(out, "{} {}", marker, change.path)?;
            if change.binary {
                write!(out, " (binary)")?;
            }
            if let (Some(old), Some(new)) = (change.old_mode, change.new_mode) {
                if old != new {
                    write!(out, " (mode {:o} -> {:o})", old, new)?;
                }
            }
            writeln!(out, " +{} -{}", change.lines_added, change.lines_removed)?;
        }

        for change in &report.changes {
            if let Some(ref patch) = change.patch {
                writeln!(out)?;
                writeln!(out, "diff {}", change.path)?;
                out.push_str(patch);
            }
        }

        Ok(out.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DirectoryTree;

    #[test]
    fn test_render_lists_changes_and_patches() {
        let mut base = DirectoryTree::new();
        base.insert("client.gen", 0o644, "a\nb\n").unwrap();
        base.insert("gone.gen", 0o644, "x\n").unwrap();
        let mut head = DirectoryTree::new();
        head.insert("client.gen", 0o644, "a\nc\n").unwrap();

        let report = DiffReport::between("v1", "v2", &base, &head);
        let text = String::from_utf8(TextRenderer.render(&report).unwrap()).unwrap();

        assert!(text.starts_with("Generated code changes v1..v2"));
        assert!(text.contains("M client.gen +1 -1"));
        assert!(text.contains("D gone.gen +0 -1"));
        assert!(text.contains("diff client.gen"));
        assert!(text.contains("+c"));
    }
}
