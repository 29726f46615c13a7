//! Proposed file mutations and their wire format.
//!
//! A [`Patch`] carries either full replacement content or a unified diff,
//! never both. The JSON shape is `{ "path", "content"?, "diff"? }`; the
//! exactly-one rule is enforced while deserializing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What a patch does to its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchBody {
    /// Replace the whole file with this content
    Content(String),
    /// Apply this unified diff to the current content
    Diff(String),
}

/// A proposed mutation to one tree-relative file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPatch", into = "RawPatch")]
pub struct Patch {
    pub path: String,
    pub body: PatchBody,
}

impl Patch {
    /// Full replacement content.
    pub fn content(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            body: PatchBody::Content(content.into()),
        }
    }

    /// Unified diff against current content.
    pub fn diff(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            body: PatchBody::Diff(diff.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawPatch {
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff: Option<String>,
}

impl TryFrom<RawPatch> for Patch {
    type Error = PatchValidationError;

    fn try_from(raw: RawPatch) -> Result<Self, Self::Error> {
        let body = match (raw.content, raw.diff) {
            (Some(content), None) => PatchBody::Content(content),
            (None, Some(diff)) => PatchBody::Diff(diff),
            (Some(_), Some(_)) => {
                return Err(PatchValidationError::single(PatchIssue::BothBodies {
                    path: raw.path,
                }))
            }
            (None, None) => {
                return Err(PatchValidationError::single(PatchIssue::MissingBody {
                    path: raw.path,
                }))
            }
        };
        Ok(Patch {
            path: raw.path,
            body,
        })
    }
}

impl From<Patch> for RawPatch {
    fn from(patch: Patch) -> Self {
        let (content, diff) = match patch.body {
            PatchBody::Content(c) => (Some(c), None),
            PatchBody::Diff(d) => (None, Some(d)),
        };
        RawPatch {
            path: patch.path,
            content,
            diff,
        }
    }
}

/// Ordered patches applied together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSet(Vec<Patch>);

impl PatchSet {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self(patches)
    }

    pub fn push(&mut self, patch: Patch) {
        self.0.push(patch);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Structural checks that need no filesystem access.
    ///
    /// Path safety is not checked here; that is the guard's job.
    pub fn validate(&self) -> Result<(), PatchValidationError> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();

        for patch in &self.0 {
            if patch.path.trim().is_empty() {
                issues.push(PatchIssue::MissingPath);
                continue;
            }
            if !seen.insert(patch.path.as_str()) {
                issues.push(PatchIssue::DuplicatePath {
                    path: patch.path.clone(),
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(PatchValidationError { issues })
        }
    }
}

impl FromIterator<Patch> for PatchSet {
    fn from_iter<T: IntoIterator<Item = Patch>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PatchSet {
    type Item = &'a Patch;
    type IntoIter = std::slice::Iter<'a, Patch>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<Patch>> for PatchSet {
    fn from(patches: Vec<Patch>) -> Self {
        Self(patches)
    }
}

/// What a patch request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    #[default]
    Dry,
    Apply,
    Validate,
}

/// Wire payload for the validate/apply entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub patches: PatchSet,
    #[serde(default)]
    pub mode: RequestMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchValidationError {
    pub issues: Vec<PatchIssue>,
}

impl PatchValidationError {
    fn single(issue: PatchIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }
}

impl fmt::Display for PatchValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PatchValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchIssue {
    MissingPath,
    MissingBody { path: String },
    BothBodies { path: String },
    DuplicatePath { path: String },
}

impl fmt::Display for PatchIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchIssue::MissingPath => write!(f, "patch missing required field 'path'"),
            PatchIssue::MissingBody { path } => {
                write!(f, "patch '{path}' needs exactly one of 'content' or 'diff'")
            }
            PatchIssue::BothBodies { path } => {
                write!(f, "patch '{path}' sets both 'content' and 'diff'")
            }
            PatchIssue::DuplicatePath { path } => {
                write!(f, "patch set names '{path}' more than once")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_content_and_diff() {
        let json = r#"[{"path":"a.txt","content":"hi"},{"path":"b.txt","diff":"@@ -1 +1 @@\n-a\n+b\n"}]"#;
        let set: PatchSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next().unwrap(), &Patch::content("a.txt", "hi"));
        assert!(matches!(
            set.iter().nth(1).unwrap().body,
            PatchBody::Diff(_)
        ));
    }

    #[test]
    fn test_deserialize_rejects_both_or_neither() {
        let both = r#"{"path":"a.txt","content":"x","diff":"y"}"#;
        let err = serde_json::from_str::<Patch>(both).unwrap_err();
        assert!(err.to_string().contains("both"));

        let neither = r#"{"path":"a.txt"}"#;
        let err = serde_json::from_str::<Patch>(neither).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_empty_content_is_still_content() {
        let patch: Patch = serde_json::from_str(r#"{"path":"a.txt","content":""}"#).unwrap();
        assert_eq!(patch.body, PatchBody::Content(String::new()));
    }

    #[test]
    fn test_serialize_omits_absent_body() {
        let json = serde_json::to_value(Patch::content("a.txt", "hi")).unwrap();
        assert_eq!(json, serde_json::json!({"path": "a.txt", "content": "hi"}));
    }

    #[test]
    fn test_request_mode_defaults_to_dry() {
        let req: PatchRequest =
            serde_json::from_str(r#"{"patches":[{"path":"a","content":"b"}]}"#).unwrap();
        assert_eq!(req.mode, RequestMode::Dry);

        let req: PatchRequest =
            serde_json::from_str(r#"{"patches":[],"mode":"validate"}"#).unwrap();
        assert_eq!(req.mode, RequestMode::Validate);
    }

    #[test]
    fn test_validate_duplicates_and_missing_path() {
        let set = PatchSet::new(vec![
            Patch::content("a.txt", "1"),
            Patch::content("a.txt", "2"),
            Patch::content("  ", "3"),
        ]);
        let err = set.validate().unwrap_err();
        assert_eq!(err.issues.len(), 2);
        assert!(err.issues.contains(&PatchIssue::MissingPath));
        assert!(err.issues.contains(&PatchIssue::DuplicatePath {
            path: "a.txt".to_string()
        }));
    }
}
