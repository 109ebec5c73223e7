//! Canonical path handling for node keys
//!
//! Every path-valued input entering the command pipeline passes through
//! [`normalize_path`] exactly once. Normalized paths are relative, use `/`
//! separators, and contain no empty or `..` segments.

use crate::shared::error::{FilestoreError, FilestoreResult};

/// Normalize a caller-supplied path to its canonical form.
///
/// Strips surrounding whitespace, folds backslashes into `/`, collapses
/// repeated separators, and trims leading/trailing separators. Rejects
/// inputs that resolve to an empty path or contain a `..` segment.
pub fn normalize_path(input: &str) -> FilestoreResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FilestoreError::invalid_path("path must not be empty"));
    }

    let unified = trimmed.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == ".." {
            return Err(FilestoreError::invalid_path(format!(
                "path must not contain '..' segments: {input}"
            )));
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(FilestoreError::invalid_path(format!(
            "path resolves to empty: {input}"
        )));
    }

    Ok(segments.join("/"))
}

/// Parent of a normalized path, or `None` for root-level paths.
pub fn parent_path(path: &str) -> Option<String> {
    path.rfind('/').map(|idx| path[..idx].to_string())
}

/// Last segment of a normalized path.
pub fn path_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Segment count of a normalized path.
pub fn path_depth(path: &str) -> i32 {
    path.split('/').count() as i32
}

/// All ancestor paths of a normalized path, shallowest first.
///
/// `"a/b/c"` yields `["a", "a/b"]`.
pub fn ancestor_paths(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    (1..segments.len())
        .map(|end| segments[..end].join("/"))
        .collect()
}

/// Join a normalized parent with a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Whether `path` equals `prefix` or sits below it.
pub fn is_within(prefix: &str, path: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_slashes() {
        assert_eq!(normalize_path("/a//b/c/").unwrap(), "a/b/c");
        assert_eq!(normalize_path("a/b/c").unwrap(), "a/b/c");
        assert_eq!(normalize_path("  a\\b\\c  ").unwrap(), "a/b/c");
        assert_eq!(
            normalize_path("/a//b/c/").unwrap(),
            normalize_path("a/b/c").unwrap()
        );
    }

    #[test]
    fn rejects_empty_and_traversal() {
        assert!(normalize_path("").is_err());
        assert!(normalize_path("   ").is_err());
        assert!(normalize_path("///").is_err());
        assert!(normalize_path("a/../b").is_err());
        assert!(normalize_path("..").is_err());
    }

    #[test]
    fn derived_accessors() {
        assert_eq!(parent_path("a/b/c"), Some("a/b".to_string()));
        assert_eq!(parent_path("a"), None);
        assert_eq!(path_name("a/b/c"), "c");
        assert_eq!(path_name("a"), "a");
        assert_eq!(path_depth("a/b/c"), 3);
        assert_eq!(path_depth("a"), 1);
    }

    #[test]
    fn ancestors_shallowest_first() {
        assert_eq!(ancestor_paths("a/b/c"), vec!["a", "a/b"]);
        assert!(ancestor_paths("a").is_empty());
    }

    #[test]
    fn prefix_containment() {
        assert!(is_within("datasets", "datasets/a"));
        assert!(is_within("datasets", "datasets"));
        assert!(!is_within("datasets", "datasets2/a"));
    }
}
