//! Artifact path validation
//!
//! Artifact paths end up both as filesystem path components under the store
//! root and as text in rendered pages, so every path is checked here once at
//! upload time. Everything downstream (tree building, storage, rendering)
//! treats validated paths as trusted.

use crate::{Error, Result};

/// Check an uploaded artifact path.
///
/// Accepts `/`-separated segments made of ASCII alphanumerics, `-`, `_` and
/// `.`. Rejects empty paths, absolute paths, `..` and `.` segments, empty
/// segments and any other character.
pub fn validate_artifact_path(path: &str) -> Result<()> {
    let reject = |reason: &'static str| {
        Err(Error::InvalidArtifactPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return reject("path is empty");
    }

    if path.starts_with('/') {
        return reject("absolute paths are not allowed");
    }

    for segment in path.split('/') {
        match segment {
            ".." => return reject("path traversal is not allowed"),
            "." => return reject("'.' segments are not allowed"),
            "" => return reject("empty path segment"),
            s if !is_safe_segment(s) => return reject("path contains a forbidden character"),
            _ => {}
        }
    }

    Ok(())
}

/// Infer the display type of an artifact from its extension
pub fn infer_artifact_type(path: &str) -> &'static str {
    if path.ends_with(".png") {
        "image"
    } else {
        "unknown"
    }
}

/// True if `s` can be used verbatim as one directory name under the store root
pub fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
