//! Directory tree helpers shared by the cache, workspaces and deployments
//!
//! Copies run on the blocking pool; walkdir does the traversal.

use crate::error::{PreviewError, PreviewResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory names never carried into cache entries or deployments
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git"];

/// Exclusion predicate applied to every entry of a copied tree
pub fn is_excluded(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

/// Recursively copy `src` into `dst`, skipping excluded subtrees.
///
/// `dst` is created if needed. Symlinks are not followed and not copied, so
/// a copied tree never points outside itself. Returns the number of bytes
/// copied.
pub async fn copy_tree(src: &Path, dst: &Path) -> PreviewResult<u64> {
    copy_tree_excluding(src, dst, vec![]).await
}

/// Like [`copy_tree`], additionally skipping the exact paths in `skip`.
///
/// Paths in `skip` are compared against `src.join(relative)`, so they must be
/// spelled the same way as `src` (canonicalize both when in doubt).
pub async fn copy_tree_excluding(
    src: &Path,
    dst: &Path,
    skip: Vec<PathBuf>,
) -> PreviewResult<u64> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let context = format!("copying {} to {}", src.display(), dst.display());

    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst, &skip))
        .await
        .map_err(|e| PreviewError::Internal(format!("copy task failed: {e}")))?
        .map_err(|e| PreviewError::io(context, e))
}

fn copy_tree_blocking(src: &Path, dst: &Path, skip: &[PathBuf]) -> io::Result<u64> {
    fs::metadata(src)?;
    fs::create_dir_all(dst)?;
    let mut bytes = 0;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_excluded(e.path()) && !skip.iter().any(|s| s == e.path()));

    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            bytes += fs::copy(entry.path(), &target)?;
        } else {
            debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }

    Ok(bytes)
}

/// Total size in bytes of regular files under `path`
pub fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Remove a directory tree, logging instead of failing
pub async fn remove_best_effort(path: &Path, what: &str) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed {} {}", what, path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {} {}: {}", what, path.display(), e),
    }
}

/// A directory owned by one in-flight operation.
///
/// Dropping the guard without [`DirGuard::keep`] or [`DirGuard::remove`]
/// removes the directory on the blocking pool, so an abandoned build or a
/// dropped request future does not leave it behind.
#[derive(Debug)]
pub struct DirGuard {
    path: PathBuf,
    what: &'static str,
    armed: bool,
}

impl DirGuard {
    pub fn new(path: PathBuf, what: &'static str) -> Self {
        Self {
            path,
            what,
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the directory; it outlives the guard
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Remove the directory now
    pub async fn remove(mut self) {
        self.armed = false;
        remove_best_effort(&self.path, self.what).await;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let what = self.what;
        debug!("Abandoned {} {}, removing", what, path.display());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_blocking(&path, what));
            }
            Err(_) => remove_blocking(&path, what),
        }
    }
}

fn remove_blocking(path: &Path, what: &str) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {} {}: {}", what, path.display(), e),
    }
}

/// Sibling path used to stage a tree before renaming it into place
pub fn staging_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!(".partial-{}-{}", name, uuid::Uuid::new_v4()))
}
