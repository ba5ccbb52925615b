//! Mapping of blob keys to files for filesystem-backed stores.

use std::{
    fmt::Debug,
    fs, io,
    path::{Component, Path, PathBuf},
};

use crate::{
    digest::DigestAlgorithm,
    error::{BlobError, BlobResult},
};

pub const TEMP_PREFIX: &str = "bin_";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Maps keys to paths under a storage directory.
pub trait PathStrategy: Debug + Send + Sync + 'static {
    /// Root directory of the storage.
    fn dir(&self) -> &Path;

    fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.dir())
    }

    /// Creates an empty temporary file on the same filesystem as the
    /// storage, so that it can later be renamed into place atomically.
    fn create_temp_file(&self) -> io::Result<PathBuf> {
        create_temp_file_in(self.dir())
    }

    /// Final path of the file for `key`.
    fn path_for_key(&self, key: &str) -> BlobResult<PathBuf>;

    /// Inverse of [`PathStrategy::path_for_key`]. `Ok(None)` for files that
    /// do not correspond to any key, such as temporary files.
    fn key_for_path(&self, path: &Path) -> BlobResult<Option<String>>;

    fn is_temp_file(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_PREFIX) && n.ends_with(TEMP_SUFFIX))
    }
}

pub fn create_temp_file_in(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    Ok(tmp.into_temp_path().keep()?)
}

/// Resolves `key` lexically under `dir`, rejecting anything that would
/// escape it.
fn resolve_under(dir: &Path, key: &str) -> BlobResult<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(BlobError::InvalidKey(key.to_owned()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BlobError::InvalidKey(key.to_owned()));
            }
        }
    }
    if parts.is_empty() {
        return Err(BlobError::InvalidKey(key.to_owned()));
    }
    let mut path = dir.to_path_buf();
    path.extend(parts);
    Ok(path)
}

fn single_segment(key: &str) -> BlobResult<&str> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
    {
        return Err(BlobError::InvalidKey(key.to_owned()));
    }
    Ok(key)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(ToOwned::to_owned)
}

/// One file per key directly under the directory.
#[derive(Debug, Clone)]
pub struct PathStrategyFlat {
    dir: PathBuf,
}

impl PathStrategyFlat {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PathStrategy for PathStrategyFlat {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for_key(&self, key: &str) -> BlobResult<PathBuf> {
        resolve_under(&self.dir, key)
    }

    fn key_for_path(&self, path: &Path) -> BlobResult<Option<String>> {
        if self.is_temp_file(path) {
            return Ok(None);
        }
        Ok(path
            .strip_prefix(&self.dir)
            .ok()
            .and_then(|rel| rel.to_str())
            .map(|rel| rel.replace(std::path::MAIN_SEPARATOR, "/")))
    }
}

/// Files are spread over `depth` levels of two-character prefix
/// directories, so that `abcdef` with depth 2 lives at `ab/cd/abcdef`.
#[derive(Debug, Clone)]
pub struct PathStrategySubDirs {
    dir: PathBuf,
    depth: usize,
}

impl PathStrategySubDirs {
    pub fn new(dir: impl Into<PathBuf>, depth: usize) -> Self {
        Self {
            dir: dir.into(),
            depth,
        }
    }
}

impl PathStrategy for PathStrategySubDirs {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for_key(&self, key: &str) -> BlobResult<PathBuf> {
        let key = single_segment(key)?;
        if key.len() < 2 * self.depth || !key.is_char_boundary(2 * self.depth) {
            return Err(BlobError::InvalidKey(key.to_owned()));
        }
        let mut path = self.dir.clone();
        for i in 0..self.depth {
            path.push(&key[2 * i..2 * i + 2]);
        }
        path.push(key);
        Ok(path)
    }

    fn key_for_path(&self, path: &Path) -> BlobResult<Option<String>> {
        if self.is_temp_file(path) {
            return Ok(None);
        }
        // only files at exactly `depth` levels below the root are keys
        let Ok(rel) = path.strip_prefix(&self.dir) else {
            return Ok(None);
        };
        if rel.components().count() != self.depth + 1 {
            return Ok(None);
        }
        Ok(file_name(path))
    }
}

/// One file per SHA-512 hex of the key, which bounds file name length for
/// arbitrary keys. Keys cannot be recovered from paths.
#[derive(Debug, Clone)]
pub struct PathStrategyShortened {
    dir: PathBuf,
}

impl PathStrategyShortened {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PathStrategy for PathStrategyShortened {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for_key(&self, key: &str) -> BlobResult<PathBuf> {
        if key.is_empty() {
            return Err(BlobError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(DigestAlgorithm::Sha512.hex_digest(key)))
    }

    fn key_for_path(&self, _path: &Path) -> BlobResult<Option<String>> {
        Err(BlobError::unsupported(
            "shortened paths cannot be mapped back to keys",
        ))
    }
}

/// Moves `source` to `dest` atomically. If the OS cannot rename across the
/// two locations, copies to a temporary file next to `dest`, renames that
/// into place and removes the source.
pub fn atomic_move(source: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::warn!(
                "atomic move not supported from {} to {}, falling back to copy (slow)",
                source.display(),
                dest.display()
            );
            let dir = dest.parent().unwrap_or_else(|| Path::new("."));
            let tmp = create_temp_file_in(dir)?;
            if let Err(e) = fs::copy(source, &tmp).and_then(|_| fs::rename(&tmp, dest)) {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            if let Err(e) = fs::remove_file(source) {
                tracing::warn!("failed to remove {} after copy: {e}", source.display());
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_paths_and_traversal_guard() {
        let ps = PathStrategyFlat::new("/data");
        assert_eq!(ps.path_for_key("abc").unwrap(), Path::new("/data/abc"));
        assert_eq!(ps.path_for_key("a/../b").unwrap(), Path::new("/data/b"));
        for bad in ["", "..", "../etc/passwd", "a/../../b", "/etc/passwd", "."] {
            assert!(
                matches!(ps.path_for_key(bad), Err(BlobError::InvalidKey(_))),
                "key {bad:?} should be rejected"
            );
        }
        assert_eq!(
            ps.key_for_path(Path::new("/data/abc")).unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(ps.key_for_path(Path::new("/data/bin_12.tmp")).unwrap(), None);
    }

    #[test]
    fn subdirs_paths_roundtrip() {
        let ps = PathStrategySubDirs::new("/data", 2);
        let path = ps.path_for_key("abcdef").unwrap();
        assert_eq!(path, Path::new("/data/ab/cd/abcdef"));
        assert_eq!(ps.key_for_path(&path).unwrap().as_deref(), Some("abcdef"));
        assert_eq!(ps.key_for_path(Path::new("/data/stray")).unwrap(), None);
        assert!(ps.path_for_key("abc").is_err());
        assert!(ps.path_for_key("ab/cdef").is_err());
    }

    #[test]
    fn shortened_paths_are_bounded() {
        let ps = PathStrategyShortened::new("/cache");
        let long_key = "k".repeat(1000);
        let path = ps.path_for_key(&long_key).unwrap();
        assert_eq!(path.file_name().unwrap().len(), 128);
        assert_eq!(path, ps.path_for_key(&long_key).unwrap());
        assert!(matches!(
            ps.key_for_path(&path),
            Err(BlobError::Unsupported(_))
        ));
    }

    #[test]
    fn temp_files_live_in_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PathStrategyFlat::new(dir.path());
        let tmp = ps.create_temp_file().unwrap();
        assert_eq!(tmp.parent().unwrap(), dir.path());
        assert!(ps.is_temp_file(&tmp));
    }

    #[test]
    fn atomic_move_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("a/b/dest");
        atomic_move(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"data");
    }
}
