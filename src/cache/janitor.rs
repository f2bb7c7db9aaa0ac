//! Background eviction of expired cache entries
//!
//! The janitor lists entries, then evicts each one under its own try-lock.
//! Entries that are being read or written are skipped until the next sweep,
//! and a failure on one entry never stops the rest of the sweep.

use crate::audit::AuditLog;
use crate::cache::store::{CacheEntry, CacheStore, Eviction};
use crate::tree;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub evicted: usize,
    /// Entries in use during the sweep
    pub skipped: usize,
    pub failed: usize,
    /// Leftover staging directories removed
    pub staging_removed: usize,
}

/// Periodic evictor for the build cache
pub struct CacheJanitor {
    store: Arc<CacheStore>,
    retention: Duration,
    interval: Duration,
    audit: Option<Arc<AuditLog>>,
}

impl CacheJanitor {
    pub fn new(store: Arc<CacheStore>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
            audit: None,
        }
    }

    /// Record evictions in the audit log
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Entries a sweep would evict right now
    pub async fn expired(&self) -> Vec<CacheEntry> {
        let cutoff = self.cutoff(Utc::now());
        match self.store.entries().await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.is_older_than(cutoff))
                .collect(),
            Err(e) => {
                warn!("Failed to list cache entries: {}", e);
                vec![]
            }
        }
    }

    /// Run one sweep against the current time
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep, treating `now` as the current time
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = self.cutoff(now);
        let mut report = SweepReport::default();

        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cache sweep aborted, could not list entries: {}", e);
                return report;
            }
        };

        for entry in entries {
            report.scanned += 1;
            match self.store.evict_if_older(&entry.digest, cutoff).await {
                Ok(Eviction::Evicted(evicted)) => {
                    report.evicted += 1;
                    debug!("Evicted cache entry {}", evicted.digest.short());
                    if let Some(audit) = &self.audit {
                        audit
                            .log(
                                "cache.evicted",
                                &serde_json::json!({
                                    "digest": evicted.digest.as_str(),
                                    "modified": evicted.modified.to_rfc3339(),
                                }),
                            )
                            .await;
                    }
                }
                Ok(Eviction::Locked) => {
                    report.skipped += 1;
                    debug!("Cache entry {} in use, skipping", entry.digest.short());
                }
                Ok(Eviction::Fresh | Eviction::Missing) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to evict {}: {}", entry.digest.short(), e);
                }
            }
        }

        match self.store.stale_staging(cutoff).await {
            Ok(stale) => {
                for path in stale {
                    tree::remove_best_effort(&path, "stale staging directory").await;
                    report.staging_removed += 1;
                }
            }
            Err(e) => warn!("Failed to scan staging directories: {}", e),
        }

        self.store.prune_locks();

        if report.evicted > 0 || report.failed > 0 {
            info!(
                "Cache sweep: {} scanned, {} evicted, {} skipped, {} failed",
                report.scanned, report.evicted, report.skipped, report.failed
            );
        }
        report
    }

    /// Start sweeping on a fixed interval until `token` is cancelled.
    ///
    /// The first sweep runs one interval after start.
    pub fn spawn(self, token: CancellationToken) -> JanitorHandle {
        let child = token.child_token();
        let task_token = child.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Cache janitor started (interval {:?}, retention {:?})",
                self.interval, self.retention
            );

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }

            debug!("Cache janitor stopped");
        });

        JanitorHandle {
            token: child,
            handle,
        }
    }
}

/// Running janitor task
pub struct JanitorHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop the janitor and wait for an in-progress sweep to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Cache janitor task failed: {}", e);
        }
    }
}
