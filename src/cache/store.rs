//! Content-addressed store of compiled build trees
//!
//! Each entry is a directory named by the full digest under the cache root.
//! Entries are written to a hidden staging directory and renamed into place
//! while the digest's write lock is held, so a lookup either sees a complete
//! tree or nothing. Removal is the same in reverse: the entry is renamed to a
//! hidden tombstone first, then deleted.

use crate::cache::digest::ContentDigest;
use crate::cache::lock::KeyedLocks;
use crate::error::{PreviewError, PreviewResult};
use crate::tree::{self, DirGuard};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, info, warn};

/// Prefix of in-flight staging directories inside the cache root
const STAGING_PREFIX: &str = ".partial-";

/// A complete build tree in the cache
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: ContentDigest,
    pub path: PathBuf,
    /// Last modification of the entry directory, used for retention
    pub modified: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.modified < cutoff
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.modified
    }
}

/// Read access to a cache entry. The janitor cannot evict the entry while
/// the pin is alive.
#[derive(Debug)]
pub struct CachePin {
    entry: CacheEntry,
    _guard: OwnedRwLockReadGuard<()>,
}

impl CachePin {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn path(&self) -> &Path {
        &self.entry.path
    }
}

/// Outcome of a single eviction attempt
#[derive(Debug)]
pub enum Eviction {
    Evicted(CacheEntry),
    /// Entry is newer than the cutoff
    Fresh,
    /// Entry is being read or written; retry on the next sweep
    Locked,
    /// Entry vanished before it could be inspected
    Missing,
}

/// Build cache rooted at a directory
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    locks: KeyedLocks,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root.join(digest.as_str())
    }

    /// Check whether a complete entry exists for `digest`
    pub async fn lookup(&self, digest: &ContentDigest) -> PreviewResult<Option<CacheEntry>> {
        let path = self.entry_path(digest);
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PreviewError::io(
                    format!("inspecting cache entry {}", path.display()),
                    e,
                ))
            }
        };

        if !metadata.is_dir() {
            return Ok(None);
        }

        let modified = metadata
            .modified()
            .map_err(|e| PreviewError::io(format!("reading mtime of {}", path.display()), e))?;

        Ok(Some(CacheEntry {
            digest: digest.clone(),
            path,
            modified: DateTime::<Utc>::from(modified),
        }))
    }

    /// Look up an entry and hold it against eviction until the pin is dropped
    pub async fn pin(&self, digest: &ContentDigest) -> PreviewResult<Option<CachePin>> {
        let guard = self.locks.read(digest).await;
        Ok(self.lookup(digest).await?.map(|entry| CachePin {
            entry,
            _guard: guard,
        }))
    }

    /// Copy a finished build tree into the cache under `digest`.
    ///
    /// If another writer stored the digest first, the existing entry is
    /// returned untouched.
    pub async fn store(
        &self,
        digest: &ContentDigest,
        source_tree: &Path,
    ) -> PreviewResult<CacheEntry> {
        let _guard = self.locks.write(digest).await;

        if let Some(existing) = self.lookup(digest).await? {
            debug!("Cache entry {} already present", digest.short());
            return Ok(existing);
        }

        fs::create_dir_all(&self.root).await.map_err(|e| {
            PreviewError::io(format!("creating cache root {}", self.root.display()), e)
        })?;

        let staging = DirGuard::new(
            tree::staging_path(&self.root, digest.short()),
            "cache staging directory",
        );
        let target = self.entry_path(digest);

        if let Err(e) = tree::copy_tree(source_tree, staging.path()).await {
            staging.remove().await;
            return Err(e);
        }

        if let Err(e) = fs::rename(staging.path(), &target).await {
            staging.remove().await;
            return Err(PreviewError::io(
                format!("publishing cache entry {}", target.display()),
                e,
            ));
        }
        staging.keep();

        info!("Cached build {}", digest.short());

        self.lookup(digest)
            .await?
            .ok_or_else(|| PreviewError::CacheEntryNotFound(digest.to_string()))
    }

    /// List complete entries. Staging directories and foreign files are ignored.
    pub async fn entries(&self) -> PreviewResult<Vec<CacheEntry>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(PreviewError::io("reading cache directory", e)),
        };

        let mut entries = vec![];
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| PreviewError::io("reading cache entry", e))?
        {
            let name = item.file_name();
            let Ok(digest) = ContentDigest::parse(&name.to_string_lossy()) else {
                continue;
            };
            // Entries can vanish between read_dir and stat
            if let Some(entry) = self.lookup(&digest).await? {
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    /// Staging directories left behind by crashed writers, older than `cutoff`
    pub async fn stale_staging(&self, cutoff: DateTime<Utc>) -> PreviewResult<Vec<PathBuf>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(PreviewError::io("reading cache directory", e)),
        };

        let mut stale = vec![];
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| PreviewError::io("reading cache entry", e))?
        {
            if !item.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let Ok(modified) = item.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if DateTime::<Utc>::from(modified) < cutoff {
                stale.push(item.path());
            }
        }

        Ok(stale)
    }

    /// Evict the entry if it was last modified before `cutoff`. Never waits
    /// on a lock; an entry in use is reported as `Eviction::Locked`.
    pub async fn evict_if_older(
        &self,
        digest: &ContentDigest,
        cutoff: DateTime<Utc>,
    ) -> PreviewResult<Eviction> {
        let Some(_guard) = self.locks.try_write(digest) else {
            return Ok(Eviction::Locked);
        };

        let Some(entry) = self.lookup(digest).await? else {
            return Ok(Eviction::Missing);
        };

        if !entry.is_older_than(cutoff) {
            return Ok(Eviction::Fresh);
        }

        self.bury(digest).await?;
        Ok(Eviction::Evicted(entry))
    }

    /// Remove one entry, waiting for readers to finish
    pub async fn remove(&self, digest: &ContentDigest) -> PreviewResult<bool> {
        let _guard = self.locks.write(digest).await;
        self.bury(digest).await
    }

    /// Remove an entry found to be incomplete, unless it was replaced since
    /// `seen` was looked up. Waits for readers to finish.
    pub async fn discard_damaged(&self, seen: &CacheEntry) -> PreviewResult<bool> {
        let _guard = self.locks.write(&seen.digest).await;

        match self.lookup(&seen.digest).await? {
            Some(current) if current.modified == seen.modified => {
                warn!("Discarding damaged cache entry {}", seen.digest.short());
                self.bury(&seen.digest).await
            }
            _ => Ok(false),
        }
    }

    /// Take the entry out of view with a rename, then delete it.
    ///
    /// Caller holds the digest's write lock. A tombstone that cannot be
    /// deleted is left for the stale staging sweep.
    async fn bury(&self, digest: &ContentDigest) -> PreviewResult<bool> {
        let path = self.entry_path(digest);
        let tombstone = tree::staging_path(&self.root, &format!("evicted-{}", digest.short()));

        match fs::rename(&path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(PreviewError::io(
                    format!("removing cache entry {}", path.display()),
                    e,
                ))
            }
        }

        tree::remove_best_effort(&tombstone, "evicted cache entry").await;
        Ok(true)
    }

    /// Remove every entry. Returns how many were removed.
    pub async fn clear(&self) -> PreviewResult<usize> {
        let mut removed = 0;
        for entry in self.entries().await? {
            if self.remove(&entry.digest).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Forget locks for digests nobody is using
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}
