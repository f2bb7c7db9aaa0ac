//! Audit logging for deployments and cache evictions
//!
//! Writes JSON lines to `~/.local/state/previewd/audit.log` unless
//! `[paths] audit_log` points elsewhere. Off by default.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
    // serializes appends from concurrent requests
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: config
                .paths
                .audit_log
                .clone()
                .unwrap_or_else(ConfigManager::audit_log_path),
            write_lock: Mutex::new(()),
        }
    }

    /// A logger that drops every event
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Log an audit event as a JSON line
    ///
    /// IO failures are logged and dropped; they never fail the caller.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_audit_log(dir: &TempDir, enabled: bool) -> AuditLog {
        let mut config = Config::default();
        config.general.audit_log = enabled;
        config.paths.audit_log = Some(dir.path().join("audit.log"));
        AuditLog::new(&config)
    }

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit
            .log(
                "deployment.created",
                &serde_json::json!({"deploymentId": "abc", "fromCache": true}),
            )
            .await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "deployment.created");
        assert_eq!(parsed["data"]["deploymentId"], "abc");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, true);

        audit.log("cache.evicted", &serde_json::json!({})).await;
        audit.log("cache.evicted", &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        assert_eq!(content.trim().lines().count(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let audit = test_audit_log(&dir, false);

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }
}
