use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Byte-span replacement with before-text verification.
///
/// Diff hunks compile down to this primitive once their position in the
/// current content is known. Application is in-memory; writing the result
/// is [`atomic_write`]'s job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Edit does nothing until applied"]
pub struct Edit {
    /// Starting byte offset (inclusive)
    pub byte_start: usize,
    /// Ending byte offset (exclusive)
    pub byte_end: usize,
    /// New text to insert at [byte_start, byte_end)
    pub new_text: String,
    /// Verification of what we expect to find before applying
    pub expected_before: EditVerification,
}

/// Verification strategy for edit safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Exact text match required
    ExactMatch(String),
    /// xxh3 hash of expected text (faster for large spans)
    Hash(u64),
}

impl EditVerification {
    /// Check if the provided text matches the verification criteria.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            EditVerification::ExactMatch(expected) => text == expected,
            EditVerification::Hash(expected_hash) => xxh3_64(text.as_bytes()) == *expected_hash,
        }
    }

    /// Create verification from text, using hash for text over 1KB.
    pub fn from_text(text: &str) -> Self {
        if text.len() > 1024 {
            EditVerification::Hash(xxh3_64(text.as_bytes()))
        } else {
            EditVerification::ExactMatch(text.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("before-text verification failed at byte {byte_start}")]
    BeforeTextMismatch {
        byte_start: usize,
        byte_end: usize,
        found: String,
    },

    #[error("invalid byte range: [{byte_start}, {byte_end}) in content of length {len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        len: usize,
    },

    #[error("overlapping edits at byte {byte_start}")]
    Overlap { byte_start: usize },

    #[error("edit splits a UTF-8 character at byte {0}")]
    CharBoundary(usize),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Edit {
    /// Create a new edit with automatic verification generation.
    pub fn new(
        byte_start: usize,
        byte_end: usize,
        new_text: impl Into<String>,
        expected_before: impl AsRef<str>,
    ) -> Self {
        Self {
            byte_start,
            byte_end,
            new_text: new_text.into(),
            expected_before: EditVerification::from_text(expected_before.as_ref()),
        }
    }

    /// Validate the edit against content and return the current span text.
    fn validate<'a>(&self, content: &'a str) -> Result<&'a str, EditError> {
        if self.byte_start > self.byte_end || self.byte_end > content.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                len: content.len(),
            });
        }
        for offset in [self.byte_start, self.byte_end] {
            if !content.is_char_boundary(offset) {
                return Err(EditError::CharBoundary(offset));
            }
        }

        let current = &content[self.byte_start..self.byte_end];
        if !self.expected_before.matches(current) {
            return Err(EditError::BeforeTextMismatch {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                found: current.to_string(),
            });
        }
        Ok(current)
    }

    /// Apply this edit to `content`, returning the new text.
    pub fn apply_to(&self, content: &str) -> Result<String, EditError> {
        Self::apply_all(content, std::slice::from_ref(self))
    }

    /// Apply non-overlapping edits to `content` in one pass.
    ///
    /// Every edit is verified against the original content before any
    /// splice happens, so a failing edit leaves nothing half-applied.
    pub fn apply_all(content: &str, edits: &[Edit]) -> Result<String, EditError> {
        let mut ordered: Vec<&Edit> = edits.iter().collect();
        ordered.sort_by_key(|e| (e.byte_start, e.byte_end));

        for edit in &ordered {
            edit.validate(content)?;
        }
        for window in ordered.windows(2) {
            if window[0].byte_end > window[1].byte_start {
                return Err(EditError::Overlap {
                    byte_start: window[1].byte_start,
                });
            }
        }

        let mut out = String::with_capacity(content.len());
        let mut cursor = 0;
        for edit in ordered {
            out.push_str(&content[cursor..edit.byte_start]);
            out.push_str(&edit.new_text);
            cursor = edit.byte_end;
        }
        out.push_str(&content[cursor..]);
        Ok(out)
    }
}

/// Read a file as UTF-8, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>, EditError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EditError::Io(e)),
    }
}

/// Atomic file write: tempfile + fsync + rename, creating parent directories.
///
/// Either the full write succeeds or the previous content stays in place.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EditError> {
    let parent = path.parent().ok_or_else(|| {
        EditError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        ))
    })?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    // Bump mtime so incremental tooling in the tree notices the change
    filetime::set_file_mtime(path, filetime::FileTime::now())?;

    Ok(())
}

/// Remove a file; a file that is already gone is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<(), EditError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EditError::Io(e)),
    }
}

/// Put a path back into a captured state: `None` deletes, `Some` overwrites.
pub fn restore(path: &Path, content: Option<&str>) -> Result<(), EditError> {
    match content {
        Some(content) => atomic_write(path, content.as_bytes()),
        None => remove_file_if_exists(path),
    }
}
