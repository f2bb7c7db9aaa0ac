//! Fresh builds for submissions missing from the cache

use crate::build::bundler::{Bundler, BundlerRun};
use crate::build::workspace::{Workspace, WorkspaceLayout};
use crate::cache::SourceSubmission;
use crate::error::{PreviewError, PreviewResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A finished build. The output tree lives inside the workspace, so the
/// caller must copy it out before calling [`BuildOutput::discard`].
#[derive(Debug)]
pub struct BuildOutput {
    workspace: Workspace,
    output_dir: PathBuf,
    pub run: BundlerRun,
}

impl BuildOutput {
    /// Bundler output directory: an HTML entry plus static assets
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn discard(self) {
        self.workspace.discard().await;
    }
}

/// Stages workspaces and drives the bundler
pub struct BuildOrchestrator {
    bundler: Arc<dyn Bundler>,
    layout: WorkspaceLayout,
    html_entry: String,
}

impl BuildOrchestrator {
    pub fn new(bundler: Arc<dyn Bundler>, layout: WorkspaceLayout, html_entry: String) -> Self {
        Self {
            bundler,
            layout,
            html_entry,
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Build `submission` in a fresh workspace.
    ///
    /// On failure the workspace is removed before returning.
    pub async fn build(
        &self,
        submission: &SourceSubmission,
        cancel: CancellationToken,
    ) -> PreviewResult<BuildOutput> {
        let digest = submission.digest.clone();
        let workspace = Workspace::create(&self.layout, submission).await?;
        debug!(
            "Building {} in {} with {}",
            digest.short(),
            workspace.dir().display(),
            self.bundler.name()
        );

        let run = match self.bundler.bundle(workspace.dir(), cancel).await {
            Ok(run) => run,
            Err(e) => {
                workspace.discard().await;
                return Err(e);
            }
        };

        if let Err(e) = self.check(&run, &workspace).await {
            warn!("Build {} failed after {:?}", digest.short(), run.elapsed);
            workspace.discard().await;
            return Err(e);
        }

        info!("Built {} in {:?}", digest.short(), run.elapsed);
        let output_dir = workspace.dir().join(&self.layout.output_dir);
        Ok(BuildOutput {
            workspace,
            output_dir,
            run,
        })
    }

    async fn check(&self, run: &BundlerRun, workspace: &Workspace) -> PreviewResult<()> {
        let digest = workspace.digest().as_str();

        if run.cancelled {
            return Err(PreviewError::BuildCancelled(digest.to_string()));
        }
        if run.timed_out {
            return Err(PreviewError::BuildTimeout {
                digest: digest.to_string(),
                secs: run.elapsed.as_secs(),
                output: run.diagnostics(),
            });
        }
        if !run.success() {
            let status = match run.exit_code {
                Some(code) => format!("bundler exited with status {code}"),
                None => "bundler terminated by signal".to_string(),
            };
            let diagnostics = run.diagnostics();
            let reason = if diagnostics.trim().is_empty() {
                status
            } else {
                format!("{status}\n{diagnostics}")
            };
            return Err(PreviewError::build(digest, reason));
        }

        let entry = workspace
            .dir()
            .join(&self.layout.output_dir)
            .join(&self.html_entry);
        match tokio::fs::metadata(&entry).await {
            Ok(m) if m.is_file() => Ok(()),
            _ => Err(PreviewError::OutputMissing(entry)),
        }
    }
}
