//! Request-level build pipeline
//!
//! source → digest → cache lookup → (hit) copy the cached tree, (miss) build,
//! store, copy the fresh output → patched deployment.
//!
//! Concurrent first builds of one digest are coalesced: the first request
//! builds while the rest wait on a per-digest flight lock, then find the
//! entry in the cache. Builds of different digests run fully in parallel.

use crate::audit::AuditLog;
use crate::build::{BuildOrchestrator, BuildOutput, Bundler, WorkspaceLayout};
use crate::cache::lock::KeyedLocks;
use crate::cache::{CacheStore, ContentDigest, SourceSubmission};
use crate::config::Config;
use crate::deploy::{Deployment, DeploymentManager};
use crate::error::{PreviewError, PreviewResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error body for a missing or empty submission
pub const COMPONENT_REQUIRED: &str = "Component code is required";

/// Result of one successful request
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub deployment: Deployment,
    pub from_cache: bool,
}

/// Short-lived memory of failed digests
#[derive(Debug)]
struct FailureMemo {
    ttl: Duration,
    failures: Mutex<HashMap<ContentDigest, (Instant, String)>>,
}

impl FailureMemo {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, digest: &ContentDigest, reason: String) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        failures.retain(|_, (at, _)| at.elapsed() < ttl);
        failures.insert(digest.clone(), (Instant::now(), reason));
    }

    fn recall(&self, digest: &ContentDigest) -> Option<String> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures
            .get(digest)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, reason)| reason.clone())
    }
}

/// Composition of cache, orchestrator and deployment manager
pub struct BuildPipeline {
    cache: Option<Arc<CacheStore>>,
    orchestrator: BuildOrchestrator,
    deployments: DeploymentManager,
    flights: KeyedLocks,
    failures: Option<FailureMemo>,
    audit: Arc<AuditLog>,
}

impl BuildPipeline {
    pub fn new(config: &Config, bundler: Arc<dyn Bundler>, audit: Arc<AuditLog>) -> Self {
        let paths = &config.paths;
        let layout = WorkspaceLayout {
            workspaces_root: paths.workspaces.clone(),
            project_root: paths.project_root.clone(),
            output_dir: config.bundler.output_dir.clone(),
            skip: vec![paths.deployments.clone(), paths.cache.clone()],
        };

        Self {
            cache: config
                .cache
                .enabled
                .then(|| Arc::new(CacheStore::new(&paths.cache))),
            orchestrator: BuildOrchestrator::new(
                bundler,
                layout,
                config.bundler.html_entry.clone(),
            ),
            deployments: DeploymentManager::new(
                &paths.deployments,
                config.bundler.html_entry.clone(),
            ),
            flights: KeyedLocks::new(),
            failures: config.cache.failure_ttl().map(FailureMemo::new),
            audit,
        }
    }

    /// The build cache, `None` when caching is disabled
    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Turn submitted source into a deployment.
    ///
    /// Empty source fails with a validation error before anything touches
    /// the filesystem.
    pub async fn build(
        &self,
        source: &str,
        cancel: CancellationToken,
    ) -> PreviewResult<BuildOutcome> {
        if source.is_empty() {
            return Err(PreviewError::Validation(COMPONENT_REQUIRED.to_string()));
        }

        let submission = SourceSubmission::new(source.to_string());
        let digest = submission.digest.clone();

        if let Some(deployment) = self.from_cache(&digest).await? {
            return Ok(self.finish(deployment, true).await);
        }

        let flight = self.flights.write(&digest).await;

        // A coalesced request finds the leader's result here
        if let Some(deployment) = self.from_cache(&digest).await? {
            drop(flight);
            return Ok(self.finish(deployment, true).await);
        }

        if let Some(reason) = self.failures.as_ref().and_then(|m| m.recall(&digest)) {
            debug!("Build {} failed recently, not retrying", digest.short());
            return Err(PreviewError::build(digest.as_str(), reason));
        }

        let result = self.build_fresh(&submission, cancel).await;
        drop(flight);
        self.flights.prune();

        let deployment = result?;
        Ok(self.finish(deployment, false).await)
    }

    async fn build_fresh(
        &self,
        submission: &SourceSubmission,
        cancel: CancellationToken,
    ) -> PreviewResult<Deployment> {
        let digest = &submission.digest;

        let output = match self.orchestrator.build(submission, cancel).await {
            Ok(output) => output,
            Err(e) => {
                self.remember_failure(digest, &e);
                return Err(e);
            }
        };

        let result = self.publish(digest, &output).await;
        output.discard().await;
        result
    }

    async fn publish(
        &self,
        digest: &ContentDigest,
        output: &BuildOutput,
    ) -> PreviewResult<Deployment> {
        if let Some(cache) = &self.cache {
            cache.store(digest, output.output_dir()).await?;
        }
        self.deployments
            .materialize(digest, output.output_dir())
            .await
    }

    /// Materialize from the cache if an entry exists.
    ///
    /// An entry that turns out to be incomplete is a miss, and is discarded so
    /// the rebuild can take its place.
    async fn from_cache(&self, digest: &ContentDigest) -> PreviewResult<Option<Deployment>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let Some(pin) = cache.pin(digest).await? else {
            return Ok(None);
        };

        match self.deployments.materialize(digest, pin.path()).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(e) if e.is_not_found() => {
                warn!(
                    "Cache entry {} is incomplete, rebuilding: {}",
                    digest.short(),
                    e
                );
                let seen = pin.entry().clone();
                drop(pin);
                cache.discard_damaged(&seen).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn remember_failure(&self, digest: &ContentDigest, err: &PreviewError) {
        let Some(memo) = &self.failures else {
            return;
        };
        let reason = match err {
            PreviewError::Build { reason, .. } => reason.clone(),
            PreviewError::BuildCancelled(_) => return,
            e if e.is_build_failure() => e.to_string(),
            _ => return,
        };
        memo.remember(digest, reason);
    }

    async fn finish(&self, deployment: Deployment, from_cache: bool) -> BuildOutcome {
        info!(
            "Deployment {} ready ({}, {})",
            deployment.id,
            deployment.digest.short(),
            if from_cache { "cached" } else { "fresh build" }
        );

        self.audit
            .log(
                "deployment.created",
                &serde_json::json!({
                    "deploymentId": deployment.id.to_string(),
                    "digest": deployment.digest.as_str(),
                    "fromCache": from_cache,
                }),
            )
            .await;

        BuildOutcome {
            deployment,
            from_cache,
        }
    }
}
