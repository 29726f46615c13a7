//! Unified diff parsing and application.
//!
//! A diff targets exactly one file. Hunks are located in the current content
//! at their declared line first, then searched for outward from there; the
//! context and removed lines must match exactly (no fuzz). Each located hunk
//! becomes an [`Edit`] and all of them are spliced in one pass.

use crate::edit::{Edit, EditError};
use similar::TextDiff;
use thiserror::Error;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("malformed diff at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("diff contains no hunks")]
    NoHunks,

    #[error("diff touches more than one file")]
    MultipleFiles,

    #[error("hunk {hunk} does not match current content (expected near line {line})")]
    HunkMismatch { hunk: usize, line: usize },

    #[error(transparent)]
    Edit(#[from] EditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Remove,
    Add,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub kind: LineKind,
    /// Line body without its line ending
    pub text: String,
    /// Ended with `\r\n` in the diff
    pub crlf: bool,
    /// Followed by a `\ No newline at end of file` marker
    pub no_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> impl Iterator<Item = &HunkLine> {
        self.lines.iter().filter(|l| l.kind != LineKind::Add)
    }

    /// Zero-based line index the hunk claims to start at.
    fn anchor(&self) -> usize {
        if self.old_len == 0 {
            // "-N,0" means "insert after line N"
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

/// A parsed single-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnifiedDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl UnifiedDiff {
    /// Parse unified diff text. Git extended headers are tolerated and ignored.
    pub fn parse(text: &str) -> Result<Self, DiffError> {
        let mut diff = UnifiedDiff::default();
        let lines: Vec<DiffLine<'_>> = text.split_inclusive('\n').map(DiffLine::new).collect();
        let mut i = 0;
        let mut seen_file_header = false;

        while i < lines.len() {
            let line = lines[i].body;
            if let Some(rest) = line.strip_prefix("--- ") {
                if seen_file_header && !diff.hunks.is_empty() {
                    return Err(DiffError::MultipleFiles);
                }
                seen_file_header = true;
                diff.old_path = header_path(rest);
                i += 1;
                continue;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                diff.new_path = header_path(rest);
                i += 1;
                continue;
            }
            if line.starts_with("@@") {
                let (hunk, next) = parse_hunk(&lines, i)?;
                diff.hunks.push(hunk);
                i = next;
                continue;
            }
            if line.starts_with("diff --git") && !diff.hunks.is_empty() {
                return Err(DiffError::MultipleFiles);
            }
            // Body lines past the declared hunk length; "-- " is a format-patch signature
            if !diff.hunks.is_empty()
                && line != "-- "
                && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
            {
                return Err(DiffError::Malformed {
                    line: i + 1,
                    reason: "hunk body longer than its header declares".to_string(),
                });
            }
            // "diff --git", "index ...", "new file mode", prose: skip
            i += 1;
        }

        if diff.hunks.is_empty() {
            return Err(DiffError::NoHunks);
        }
        Ok(diff)
    }

    /// Whether the diff declares the file as newly created.
    pub fn creates_file(&self) -> bool {
        self.old_path.is_none() && self.new_path.is_some()
    }

    /// Apply the diff to `current`, returning the new content.
    pub fn apply(&self, current: &str) -> Result<String, DiffError> {
        let lines: Vec<&str> = current.split_inclusive('\n').collect();
        let mut offsets = Vec::with_capacity(lines.len() + 1);
        let mut pos = 0;
        for line in &lines {
            offsets.push(pos);
            pos += line.len();
        }
        offsets.push(pos);

        let mut edits = Vec::with_capacity(self.hunks.len());
        let mut min_index = 0;
        let mut drift: isize = 0;

        for (n, hunk) in self.hunks.iter().enumerate() {
            let number = n + 1;
            let old: Vec<&HunkLine> = hunk.old_lines().collect();
            let anchor = hunk.anchor().saturating_add_signed(drift);
            let found = locate(&lines, &old, anchor, min_index).ok_or(DiffError::HunkMismatch {
                hunk: number,
                line: hunk.old_start,
            })?;
            let end = found + old.len();
            let mut replacement = String::new();
            let mut old_cursor = found;
            for line in &hunk.lines {
                match line.kind {
                    LineKind::Context => {
                        // Keep the file's own bytes for context lines
                        replacement.push_str(lines[old_cursor]);
                        old_cursor += 1;
                    }
                    LineKind::Remove => old_cursor += 1,
                    LineKind::Add => {
                        replacement.push_str(&line.text);
                        if !line.no_newline {
                            replacement.push_str(if line.crlf { "\r\n" } else { "\n" });
                        }
                    }
                }
            }

            let start_byte = offsets[found];
            let end_byte = offsets[end];
            edits.push(Edit::new(
                start_byte,
                end_byte,
                replacement,
                &current[start_byte..end_byte],
            ));

            drift = found as isize - hunk.anchor() as isize;
            min_index = end;
        }

        Ok(Edit::apply_all(current, &edits)?)
    }
}

/// Apply unified diff text to `current` content.
///
/// `Ok` carries the new content, which may legitimately be empty.
pub fn apply_unified_diff(current: &str, diff: &str) -> Result<String, DiffError> {
    UnifiedDiff::parse(diff)?.apply(current)
}

/// Render a unified diff from `old` to `new` for previews.
///
/// `None` on either side renders as `/dev/null`. Identical inputs render empty.
pub fn render_unified_diff(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    let old_text = old.unwrap_or("");
    let new_text = new.unwrap_or("");
    if old.is_some() == new.is_some() && old_text == new_text {
        return String::new();
    }
    let old_label = if old.is_some() {
        format!("a/{path}")
    } else {
        "/dev/null".to_string()
    };
    let new_label = if new.is_some() {
        format!("b/{path}")
    } else {
        "/dev/null".to_string()
    };
    TextDiff::from_lines(old_text, new_text)
        .unified_diff()
        .context_radius(3)
        .header(&old_label, &new_label)
        .to_string()
}

/// One diff line split from its `\n` or `\r\n` ending.
#[derive(Debug, Clone, Copy)]
struct DiffLine<'a> {
    body: &'a str,
    crlf: bool,
}

impl<'a> DiffLine<'a> {
    fn new(raw: &'a str) -> Self {
        if let Some(body) = raw.strip_suffix("\r\n") {
            Self { body, crlf: true }
        } else {
            Self {
                body: raw.strip_suffix('\n').unwrap_or(raw),
                crlf: false,
            }
        }
    }
}

fn header_path(rest: &str) -> Option<String> {
    // Strip an optional tab-separated timestamp
    let path = rest.split('\t').next().unwrap_or("").trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

fn parse_range(spec: &str, line: usize) -> Result<(usize, usize), DiffError> {
    let malformed = || DiffError::Malformed {
        line,
        reason: format!("bad hunk range '{spec}'"),
    };
    let (start, len) = match spec.split_once(',') {
        Some((start, len)) => (start, Some(len)),
        None => (spec, None),
    };
    let start = start.parse::<usize>().map_err(|_| malformed())?;
    let len = match len {
        Some(len) => len.parse::<usize>().map_err(|_| malformed())?,
        None => 1,
    };
    Ok((start, len))
}

fn parse_hunk(lines: &[DiffLine<'_>], header_index: usize) -> Result<(Hunk, usize), DiffError> {
    let header = lines[header_index].body;
    let line_no = header_index + 1;
    let inner = header
        .strip_prefix("@@")
        .and_then(|rest| rest.split("@@").next())
        .map(str::trim)
        .ok_or_else(|| DiffError::Malformed {
            line: line_no,
            reason: "unterminated hunk header".to_string(),
        })?;

    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| DiffError::Malformed {
            line: line_no,
            reason: "missing old range".to_string(),
        })?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| DiffError::Malformed {
            line: line_no,
            reason: "missing new range".to_string(),
        })?;
    let (old_start, old_len) = parse_range(old, line_no)?;
    let (new_start, new_len) = parse_range(new, line_no)?;

    let mut hunk = Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    };
    let (mut old_seen, mut new_seen) = (0, 0);
    let mut i = header_index + 1;

    while i < lines.len() && (old_seen < old_len || new_seen < new_len) {
        let DiffLine { body: raw, crlf } = lines[i];
        let (kind, text) = match raw.chars().next() {
            Some(' ') => (LineKind::Context, &raw[1..]),
            Some('-') => (LineKind::Remove, &raw[1..]),
            Some('+') => (LineKind::Add, &raw[1..]),
            // Some generators strip the lone space of blank context lines
            None => (LineKind::Context, ""),
            Some('\\') => {
                mark_no_newline(&mut hunk);
                i += 1;
                continue;
            }
            Some(_) => {
                return Err(DiffError::Malformed {
                    line: i + 1,
                    reason: "unexpected line inside hunk".to_string(),
                })
            }
        };
        match kind {
            LineKind::Context => {
                old_seen += 1;
                new_seen += 1;
            }
            LineKind::Remove => old_seen += 1,
            LineKind::Add => new_seen += 1,
        }
        hunk.lines.push(HunkLine {
            kind,
            text: text.to_string(),
            crlf,
            no_newline: false,
        });
        i += 1;
    }

    if old_seen != old_len || new_seen != new_len {
        return Err(DiffError::Malformed {
            line: line_no,
            reason: format!(
                "hunk body has {old_seen}/{new_seen} lines, header declares {old_len}/{new_len}"
            ),
        });
    }

    // A trailing marker belongs to the last body line
    if i < lines.len() && lines[i].body == NO_NEWLINE_MARKER {
        mark_no_newline(&mut hunk);
        i += 1;
    }

    Ok((hunk, i))
}

fn mark_no_newline(hunk: &mut Hunk) {
    if let Some(last) = hunk.lines.last_mut() {
        last.no_newline = true;
    }
}

/// Find where `old` lines sit in `lines`, searching outward from `anchor`.
fn locate(lines: &[&str], old: &[&HunkLine], anchor: usize, min_index: usize) -> Option<usize> {
    if old.len() > lines.len() {
        return None;
    }
    let last_start = lines.len() - old.len();
    let anchor = anchor.clamp(min_index.min(last_start), last_start);

    let matches_at = |start: usize| {
        old.iter()
            .zip(&lines[start..start + old.len()])
            .all(|(want, have)| DiffLine::new(have).body == want.text)
    };

    let span = last_start.max(anchor) + 1;
    for delta in 0..span {
        let forward = anchor + delta;
        if forward <= last_start && forward >= min_index && matches_at(forward) {
            return Some(forward);
        }
        if delta > 0 {
            if let Some(back) = anchor.checked_sub(delta) {
                if back >= min_index && matches_at(back) {
                    return Some(back);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_simple_replacement() {
        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let out = apply_unified_diff("one\ntwo\nthree\n", diff).unwrap();
        assert_eq!(out, "one\nTWO\nthree\n");
    }

    #[test]
    fn test_apply_mismatched_context_fails() {
        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n alpha\n-beta\n+BETA\n";
        let result = apply_unified_diff("one\ntwo\n", diff);
        assert!(matches!(
            result,
            Err(DiffError::HunkMismatch { hunk: 1, .. })
        ));
    }

    #[test]
    fn test_apply_with_offset() {
        // Declared at line 1 but the context actually sits at line 3
        let diff = "@@ -1,2 +1,2 @@\n c\n-d\n+D\n";
        let out = apply_unified_diff("a\nb\nc\nd\ne\n", diff).unwrap();
        assert_eq!(out, "a\nb\nc\nD\ne\n");
    }

    #[test]
    fn test_creation_diff_against_empty() {
        let diff = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n";
        let parsed = UnifiedDiff::parse(diff).unwrap();
        assert!(parsed.creates_file());
        assert_eq!(parsed.apply("").unwrap(), "hello\nworld\n");
    }

    #[test]
    fn test_result_may_be_empty() {
        let diff = "--- a/x\n+++ b/x\n@@ -1 +0,0 @@\n-only line\n";
        assert_eq!(apply_unified_diff("only line\n", diff).unwrap(), "");
    }

    #[test]
    fn test_no_newline_markers() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n-b\n\\ No newline at end of file\n+c\n\\ No newline at end of file\n";
        assert_eq!(apply_unified_diff("a\nb", diff).unwrap(), "a\nc");
    }

    #[test]
    fn test_multiple_hunks_applied_together() {
        let old: String = (1..=20).map(|n| format!("line{n}\n")).collect();
        let new = old.replace("line2\n", "LINE2\n").replace("line18\n", "LINE18\n");
        let diff = render_unified_diff("f.txt", Some(&old), Some(&new));
        assert_eq!(UnifiedDiff::parse(&diff).unwrap().hunks.len(), 2);
        assert_eq!(apply_unified_diff(&old, &diff).unwrap(), new);
    }

    #[test]
    fn test_second_hunk_failure_leaves_no_partial_result() {
        let old: String = (1..=20).map(|n| format!("line{n}\n")).collect();
        let new = old.replace("line2\n", "LINE2\n").replace("line18\n", "LINE18\n");
        let diff = render_unified_diff("f.txt", Some(&old), Some(&new));
        let drifted = old.replace("line18\n", "changed\n");
        assert!(matches!(
            apply_unified_diff(&drifted, &diff),
            Err(DiffError::HunkMismatch { hunk: 2, .. })
        ));
    }

    #[test]
    fn test_render_roundtrip_without_trailing_newline() {
        let old = "fn main() {}\n";
        let new = "fn main() {\n    run();\n}";
        let diff = render_unified_diff("src/main.rs", Some(old), Some(new));
        assert_eq!(apply_unified_diff(old, &diff).unwrap(), new);
    }

    #[test]
    fn test_render_identical_is_empty() {
        assert!(render_unified_diff("x", Some("same\n"), Some("same\n")).is_empty());
    }

    #[test]
    fn test_parse_rejects_empty_and_garbage() {
        assert!(matches!(UnifiedDiff::parse(""), Err(DiffError::NoHunks)));
        assert!(matches!(
            UnifiedDiff::parse("@@ -x +1 @@\n+a\n"),
            Err(DiffError::Malformed { .. })
        ));
        assert!(matches!(
            UnifiedDiff::parse("@@ -1,2 +1,2 @@\n a\n"),
            Err(DiffError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_multiple_files() {
        let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n--- a/y\n+++ b/y\n@@ -1 +1 @@\n-c\n+d\n";
        assert!(matches!(
            UnifiedDiff::parse(diff),
            Err(DiffError::MultipleFiles)
        ));
    }

    #[test]
    fn test_git_headers_ignored() {
        let diff = "diff --git a/x b/x\nindex 83db48f..bf269f4 100644\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n";
        let parsed = UnifiedDiff::parse(diff).unwrap();
        assert_eq!(parsed.old_path.as_deref(), Some("x"));
        assert_eq!(parsed.apply("a\n").unwrap(), "b\n");
    }

    #[test]
    fn test_parse_rejects_body_past_declared_length() {
        let result = apply_unified_diff("a\n", "@@ -1 +1 @@\n-a\n+b\n+c\n");
        assert!(matches!(result, Err(DiffError::Malformed { line: 4, .. })));
    }

    #[test]
    fn test_format_patch_signature_after_hunk_is_ignored() {
        let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n-- \n2.43.0\n";
        assert_eq!(apply_unified_diff("a\n", diff).unwrap(), "b\n");
    }

    #[test]
    fn test_crlf_diff_against_crlf_file() {
        let diff = "@@ -1,2 +1,3 @@\r\n one\r\n-two\r\n+TWO\r\n+three\r\n";
        let out = apply_unified_diff("one\r\ntwo\r\n", diff).unwrap();
        assert_eq!(out, "one\r\nTWO\r\nthree\r\n");
    }

    #[test]
    fn test_lf_diff_keeps_crlf_context_bytes() {
        let diff = "@@ -1,2 +1,2 @@\n one\n-two\n+TWO\n";
        let out = apply_unified_diff("one\r\ntwo\r\n", diff).unwrap();
        assert_eq!(out, "one\r\nTWO\n");
    }
}
