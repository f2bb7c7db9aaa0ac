//! Serve command - run the build server and cache janitor

use crate::audit::AuditLog;
use crate::build::CommandBundler;
use crate::cache::CacheJanitor;
use crate::cli::args::ServeArgs;
use crate::config::{Config, ConfigManager};
use crate::error::PreviewResult;
use crate::pipeline::BuildPipeline;
use crate::server::PreviewServer;
use console::style;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> PreviewResult<()> {
    ConfigManager::ensure_dirs(config).await?;

    let audit = Arc::new(AuditLog::new(config));
    let bundler = Arc::new(CommandBundler::from_config(&config.bundler));
    debug!("Bundler: {}", bundler);
    let pipeline = Arc::new(BuildPipeline::new(config, bundler, Arc::clone(&audit)));

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let server = PreviewServer::bind(&bind, Arc::clone(&pipeline), config.server.max_body_bytes)?;
    let addr = server.local_addr()?;

    let token = CancellationToken::new();

    let janitor = match (pipeline.cache(), config.cache.sweep_interval()) {
        (Some(store), Some(interval)) if config.cache.retention_days > 0 => Some(
            CacheJanitor::new(Arc::clone(store), config.cache.retention(), interval)
                .with_audit(Arc::clone(&audit))
                .spawn(token.clone()),
        ),
        _ => {
            debug!("Cache janitor disabled");
            None
        }
    };

    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    println!(
        "{} Serving previews on {}",
        style("✓").green(),
        style(format!("http://{addr}")).cyan()
    );

    let result = server.run(token.clone()).await;

    token.cancel();
    if let Some(janitor) = janitor {
        janitor.shutdown().await;
    }

    result
}
