//! Configuration schema for previewd
//!
//! Configuration is stored at `~/.config/previewd/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// HTTP server settings
    pub server: ServerConfig,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// External bundler invocation
    pub bundler: BundlerConfig,

    /// Build cache settings
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging of deployments and evictions
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind: String,

    /// Largest accepted request body in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Filesystem roots. Relative paths resolve against the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Template project the bundler runs against (package.json, node_modules, src/)
    pub project_root: PathBuf,

    /// One subdirectory per deployment id
    pub deployments: PathBuf,

    /// One subdirectory per content digest
    pub cache: PathBuf,

    /// Per-build isolated workspaces
    pub workspaces: PathBuf,

    /// Audit log file (defaults to the state directory)
    pub audit_log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            deployments: PathBuf::from("deployments"),
            cache: PathBuf::from(".build-cache"),
            workspaces: PathBuf::from(".build-workspaces"),
            audit_log: None,
        }
    }
}

/// Bundler invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// Program to execute
    pub program: String,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Extra environment for the bundler process
    pub env: BTreeMap<String, String>,

    /// Output directory relative to the workspace
    pub output_dir: PathBuf,

    /// HTML entry file inside the output directory
    pub html_entry: String,

    /// Kill the bundler after this many seconds
    pub timeout_secs: u64,

    /// Maximum captured bytes per output stream
    pub max_output_bytes: usize,
}

impl BundlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BundlerConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        Self {
            program: "npm".to_string(),
            args: vec!["run".to_string(), "build".to_string()],
            env,
            output_dir: PathBuf::from("dist"),
            html_entry: "index.html".to_string(),
            timeout_secs: 300,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse builds for identical source (default: true)
    pub enabled: bool,

    /// Evict entries older than N days
    pub retention_days: u32,

    /// Hours between janitor sweeps (0 = janitor disabled)
    pub sweep_interval_hours: u32,

    /// Remember failed digests for N seconds (0 = always rebuild)
    pub failure_ttl_secs: u64,
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_hours == 0 {
            return None;
        }
        Some(Duration::from_secs(
            u64::from(self.sweep_interval_hours) * 60 * 60,
        ))
    }

    pub fn failure_ttl(&self) -> Option<Duration> {
        (self.failure_ttl_secs > 0).then(|| Duration::from_secs(self.failure_ttl_secs))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
            sweep_interval_hours: 24,
            failure_ttl_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[bundler]"));
        assert!(toml.contains("[cache]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bundler.program, "npm");
        assert_eq!(config.cache.retention_days, 7);
        assert_eq!(
            config.bundler.env.get("NODE_ENV").map(String::as_str),
            Some("production")
        );
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [bundler]
            program = "pnpm"
            timeout_secs = 60
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bundler.program, "pnpm");
        assert_eq!(config.bundler.timeout(), Duration::from_secs(60));
        assert_eq!(config.bundler.args, vec!["run", "build"]); // default preserved
    }

    #[test]
    fn cache_durations() {
        let mut cache = CacheConfig::default();
        assert_eq!(cache.retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(cache.sweep_interval(), Some(Duration::from_secs(86_400)));
        assert_eq!(cache.failure_ttl(), None);

        cache.sweep_interval_hours = 0;
        cache.failure_ttl_secs = 30;
        assert_eq!(cache.sweep_interval(), None);
        assert_eq!(cache.failure_ttl(), Some(Duration::from_secs(30)));
    }
}
