//! Relative paths for directory-tree uploads.

use std::fmt;

use serde::Serialize;

use crate::errors::UploadError;

/// A normalized relative path inside an uploaded tree.
///
/// Always `/`-separated, never empty, with no leading slash and no `.` or `..` segments.
/// The only way to build one is [`ContentPath::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentPath(String);

impl ContentPath {
    /// Validate and normalize a caller-supplied path.
    ///
    /// Empty and `.` segments are dropped (`./a//b` becomes `a/b`). Absolute paths, `..`
    /// segments, backslashes and NUL bytes are rejected with [`UploadError::InvalidPath`].
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let invalid = |reason| UploadError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        if raw.starts_with('/') {
            return Err(invalid("absolute paths are not allowed"));
        }
        if raw.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }
        if raw.contains('\0') {
            return Err(invalid("NUL bytes are not allowed"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(invalid("parent directory segments are not allowed")),
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(invalid("path is empty"));
        }

        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(raw: &str) -> &'static str {
        match ContentPath::parse(raw) {
            Err(UploadError::InvalidPath { reason, .. }) => reason,
            other => panic!("expected InvalidPath for {raw:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_plain_relative_paths() {
        assert_eq!(ContentPath::parse("test.txt").unwrap().as_str(), "test.txt");
        assert_eq!(
            ContentPath::parse("folder1/nested/world.txt").unwrap().as_str(),
            "folder1/nested/world.txt"
        );
    }

    #[test]
    fn test_normalizes_redundant_segments() {
        assert_eq!(ContentPath::parse("./a//b/./c.json").unwrap().as_str(), "a/b/c.json");
        assert_eq!(ContentPath::parse("dir/").unwrap().as_str(), "dir");
    }

    #[test]
    fn test_rejects_traversal_and_absolute_paths() {
        assert_eq!(reason("../secret"), "parent directory segments are not allowed");
        assert_eq!(reason("a/../../b"), "parent directory segments are not allowed");
        assert_eq!(reason("/etc/passwd"), "absolute paths are not allowed");
        assert_eq!(reason("a\\b"), "backslashes are not allowed");
    }

    #[test]
    fn test_rejects_empty_paths() {
        assert_eq!(reason(""), "path is empty");
        assert_eq!(reason("./."), "path is empty");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(ContentPath::parse("a/b/c.txt").unwrap().file_name(), "c.txt");
        assert_eq!(ContentPath::parse("c.txt").unwrap().file_name(), "c.txt");
    }
}
