//! Artifact blob store
//!
//! Uploaded artifacts live on disk under `{root}/{run_uuid}/{artifact_path}`
//! and are addressed by `file://` URIs. Reads resolve a client supplied URI
//! and must never leave the store root.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::paths::{is_safe_segment, validate_artifact_path};
use crate::{parse_store_uri, Error, Result};

pub const FILE_SCHEME: &str = "file://";

/// Filesystem-backed artifact store rooted at one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        info!("Artifact store initialized at {:?}", root);
        Ok(Self { root })
    }

    /// Open a store from a `file://` URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::open(&parse_store_uri(uri)?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an artifact and return its `file://` URI.
    ///
    /// Overwrites any existing file at the same path. No cleanup is attempted
    /// on a failed write; re-uploading the same path is safe.
    pub fn store_artifact<R: Read>(
        &self,
        run_uuid: &str,
        artifact_path: &str,
        mut content: R,
    ) -> Result<String> {
        validate_artifact_path(artifact_path)?;
        if !is_safe_segment(run_uuid) {
            return Err(Error::Validation(format!("invalid run uuid {:?}", run_uuid)));
        }

        let full_path = self.root.join(run_uuid).join(artifact_path);
        if let Some(dir) = full_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = fs::File::create(&full_path)?;
        let written = io::copy(&mut content, &mut file)?;
        file.sync_all()?;

        debug!("Stored artifact {} for run {} ({} bytes)", artifact_path, run_uuid, written);

        Ok(format!("{}{}", FILE_SCHEME, full_path.display()))
    }

    /// Resolve a requested blob URI to a file inside this store
    pub fn resolve_blob(&self, requested_uri: &str) -> Result<PathBuf> {
        resolve_blob_path(requested_uri, &self.root)
    }

    /// Store-relative locator (`file://run/path`) for a stored absolute URI.
    ///
    /// Returns `None` when the URI does not point inside this store.
    pub fn blob_locator(&self, stored_uri: &str) -> Option<String> {
        let path = Path::new(stored_uri.strip_prefix(FILE_SCHEME)?);
        if !path.is_absolute() {
            return Some(stored_uri.to_string());
        }
        let relative = normalize(path).strip_prefix(&self.root).ok()?.to_path_buf();
        if relative.as_os_str().is_empty() {
            return None;
        }
        Some(format!("{}{}", FILE_SCHEME, relative.display()))
    }

    /// Bytes on disk used by one run's artifacts
    pub fn run_size_bytes(&self, run_uuid: &str) -> u64 {
        if !is_safe_segment(run_uuid) {
            return 0;
        }
        walkdir::WalkDir::new(self.root.join(run_uuid))
            .into_iter()
            .flatten()
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.metadata().map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

/// Resolve a `file://` blob URI against `store_root`.
///
/// The scheme must be `file://` ([`Error::UnsupportedScheme`] otherwise); the
/// remainder must be a relative path that, once `.`/`..` are collapsed, stays
/// strictly inside the root, and whose on-disk target (following symlinks)
/// does too ([`Error::Forbidden`] otherwise). The file itself is not checked
/// for existence. `store_root` may be relative or contain `.`/`..`.
pub fn resolve_blob_path(requested_uri: &str, store_root: &Path) -> Result<PathBuf> {
    let Some(requested) = requested_uri.strip_prefix(FILE_SCHEME) else {
        return Err(Error::UnsupportedScheme(requested_uri.to_string()));
    };

    let requested = Path::new(requested);
    if requested.is_absolute() || requested.has_root() {
        warn!("Rejected absolute blob path {:?}", requested);
        return Err(Error::Forbidden("absolute paths are not allowed".into()));
    }

    let store_root = canonical_root(store_root)?;
    let clean = normalize(&store_root.join(requested));
    if clean == store_root || !clean.starts_with(&store_root) {
        warn!("Rejected blob path escaping the store: {:?}", requested);
        return Err(Error::Forbidden("path escapes the artifact store".into()));
    }

    // A symlink inside the store may still point outside of it
    if let Ok(real) = fs::canonicalize(&clean) {
        if !real.starts_with(&store_root) {
            warn!("Rejected blob symlink escaping the store: {:?}", requested);
            return Err(Error::Forbidden("path escapes the artifact store".into()));
        }
    }

    Ok(clean)
}

/// Absolute form of a store root, resolved on disk when it exists
fn canonical_root(root: &Path) -> Result<PathBuf> {
    match fs::canonicalize(root) {
        Ok(real) => Ok(real),
        Err(_) => Ok(normalize(&std::path::absolute(root)?)),
    }
}

/// Lexically collapse `.` and `..` components.
///
/// `..` at the filesystem root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_file() -> (TempDir, ArtifactStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let run_dir = store.root().join("run123");
        fs::create_dir_all(&run_dir).unwrap();
        fs::write(run_dir.join("artifact.txt"), b"test artifact content").unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_resolve_valid_relative_uri() {
        let (_tmp, store) = store_with_file();
        let path = store.resolve_blob("file://run123/artifact.txt").unwrap();
        assert_eq!(path, store.root().join("run123/artifact.txt"));
        assert_eq!(fs::read(path).unwrap(), b"test artifact content");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_tmp, store) = store_with_file();
        for uri in [
            "file://run123/../../../etc/passwd",
            "file://../etc/passwd",
            "file://run123/../../../..",
            "file://..",
            "file://",
            "file://.",
        ] {
            assert!(
                matches!(store.resolve_blob(uri), Err(Error::Forbidden(_))),
                "should forbid {:?}",
                uri
            );
        }
    }

    #[test]
    fn test_resolve_rejects_absolute() {
        let (_tmp, store) = store_with_file();
        assert!(matches!(
            store.resolve_blob("file:///etc/passwd"),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_other_schemes() {
        let (_tmp, store) = store_with_file();
        for uri in ["run123/artifact.txt", "http://run123/artifact.txt", "FILE://run123/a"] {
            assert!(
                matches!(store.resolve_blob(uri), Err(Error::UnsupportedScheme(_))),
                "should reject scheme of {:?}",
                uri
            );
        }
    }

    #[test]
    fn test_resolve_inner_dotdot_that_stays_inside() {
        let (_tmp, store) = store_with_file();
        let path = store.resolve_blob("file://run123/sub/../artifact.txt").unwrap();
        assert_eq!(path, store.root().join("run123/artifact.txt"));
    }

    #[test]
    fn test_resolve_missing_file_is_not_checked() {
        let (_tmp, store) = store_with_file();
        let path = store.resolve_blob("file://run123/missing.txt").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_resolve_against_relative_root() {
        let temp_dir = tempfile::Builder::new()
            .prefix("blob-root")
            .tempdir_in(".")
            .unwrap();
        fs::create_dir_all(temp_dir.path().join("run123")).unwrap();
        fs::write(temp_dir.path().join("run123/artifact.txt"), b"relative root").unwrap();

        let name = temp_dir.path().file_name().unwrap();
        for root in [PathBuf::from(name), Path::new(".").join(name)] {
            let path = resolve_blob_path("file://run123/artifact.txt", &root).unwrap();
            assert_eq!(fs::read(&path).unwrap(), b"relative root");
            assert!(matches!(
                resolve_blob_path("file://run123/../../outside.txt", &root),
                Err(Error::Forbidden(_))
            ));
        }
    }

    #[test]
    fn test_resolve_against_unnormalized_root() {
        let (_tmp, store) = store_with_file();
        let root = store.root().join("run123").join("..").join(".");

        let path = resolve_blob_path("file://run123/artifact.txt", &root).unwrap();
        assert_eq!(path, store.root().join("run123/artifact.txt"));
        assert!(matches!(
            resolve_blob_path("file://..", &root),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_resolve_against_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("not-created");
        let path = resolve_blob_path("file://run123/a.txt", &root).unwrap();
        assert!(path.ends_with("not-created/run123/a.txt"));
        assert!(path.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (_tmp, store) = store_with_file();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), store.root().join("run123/link")).unwrap();

        assert!(matches!(
            store.resolve_blob("file://run123/link/secret.txt"),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_store_artifact_writes_and_returns_uri() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();

        let uri = store
            .store_artifact("run-a", "plots/loss.png", &b"png bytes"[..])
            .unwrap();

        let expected = store.root().join("run-a/plots/loss.png");
        assert_eq!(uri, format!("file://{}", expected.display()));
        assert!(Path::new(uri.strip_prefix(FILE_SCHEME).unwrap()).is_absolute());
        assert_eq!(fs::read(&expected).unwrap(), b"png bytes");
    }

    #[test]
    fn test_store_artifact_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();

        let first = store.store_artifact("run-a", "notes.txt", &b"a much longer first version"[..]).unwrap();
        let second = store.store_artifact("run-a", "notes.txt", &b"short"[..]).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(store.root().join("run-a/notes.txt")).unwrap(), b"short");
    }

    #[test]
    fn test_store_artifact_revalidates() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();

        assert!(store.store_artifact("run-a", "../escape.txt", &b"x"[..]).is_err());
        assert!(store.store_artifact("..", "a.txt", &b"x"[..]).is_err());
        assert!(store.store_artifact("run/a", "a.txt", &b"x"[..]).is_err());
        assert!(!temp_dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_stored_uri_round_trips_through_locator() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let uri = store.store_artifact("run-a", "data/x.json", &b"{}"[..]).unwrap();

        let locator = store.blob_locator(&uri).unwrap();
        assert_eq!(locator, "file://run-a/data/x.json");
        let resolved = store.resolve_blob(&locator).unwrap();
        assert_eq!(fs::read(resolved).unwrap(), b"{}");
    }

    #[test]
    fn test_blob_locator_outside_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        assert!(store.blob_locator("file:///etc/passwd").is_none());
        assert!(store.blob_locator("s3://bucket/key").is_none());
    }

    #[test]
    fn test_run_size_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        store.store_artifact("run-a", "a.bin", &[0u8; 100][..]).unwrap();
        store.store_artifact("run-a", "d/b.bin", &[0u8; 28][..]).unwrap();
        assert_eq!(store.run_size_bytes("run-a"), 128);
        assert_eq!(store.run_size_bytes("run-b"), 0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/../../..")), PathBuf::from("/"));
    }
}
