//! Deployment materialization
//!
//! A deployment is an independent copy of a build tree under a fresh id.
//! The tree is copied into `.partial-<id>`, patched, then renamed to `<id>`,
//! so a deployment directory is either complete and patched or absent.

use crate::cache::ContentDigest;
use crate::deploy::patch;
use crate::error::{PreviewError, PreviewResult};
use crate::tree::{self, DirGuard};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

/// A materialized, independently servable build
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: Uuid,
    pub digest: ContentDigest,
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// Browse locator
    pub fn deployment_url(&self) -> String {
        format!("/d/{}", self.id)
    }

    /// Download locator. Archive generation happens elsewhere.
    pub fn download_url(&self) -> String {
        format!("/download/{}", self.id)
    }
}

/// Owns the deployments root
#[derive(Debug, Clone)]
pub struct DeploymentManager {
    root: PathBuf,
    html_entry: String,
}

impl DeploymentManager {
    pub fn new(root: impl Into<PathBuf>, html_entry: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            html_entry: html_entry.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source_tree` into a new deployment and make its assets relocatable.
    ///
    /// The source tree is never moved or modified.
    pub async fn materialize(
        &self,
        digest: &ContentDigest,
        source_tree: &Path,
    ) -> PreviewResult<Deployment> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            PreviewError::io(
                format!("creating deployments directory {}", self.root.display()),
                e,
            )
        })?;

        let id = Uuid::new_v4();
        let staging = DirGuard::new(
            self.root.join(format!(".partial-{id}")),
            "partial deployment",
        );
        let target = self.root.join(id.to_string());

        if let Err(e) = self.stage(source_tree, staging.path()).await {
            staging.remove().await;
            return Err(e);
        }

        if let Err(e) = fs::rename(staging.path(), &target).await {
            staging.remove().await;
            return Err(PreviewError::io(
                format!("publishing deployment {}", target.display()),
                e,
            ));
        }
        staging.keep();

        info!("Deployed {} as {}", digest.short(), id);
        Ok(Deployment {
            id,
            digest: digest.clone(),
            dir: target,
            created_at: Utc::now(),
        })
    }

    async fn stage(&self, source_tree: &Path, staging: &Path) -> PreviewResult<()> {
        tree::copy_tree(source_tree, staging).await?;
        patch::patch_asset_paths(staging, &self.html_entry).await?;
        Ok(())
    }

    /// Path a deployment with `id` would occupy
    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }
}
