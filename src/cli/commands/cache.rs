//! Cache command - inspect and prune the build cache

use crate::cache::{CacheEntry, CacheJanitor, CacheStore};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::PreviewResult;
use crate::tree;
use console::style;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> PreviewResult<()> {
    let store = Arc::new(CacheStore::new(&config.paths.cache));

    match args.action {
        CacheAction::List { format } => list_entries(&store, format).await,
        CacheAction::Gc { days, dry_run } => gc_entries(store, config, days, dry_run).await,
        CacheAction::Clear { yes } => clear_entries(&store, yes).await,
    }
}

async fn list_entries(store: &CacheStore, format: OutputFormat) -> PreviewResult<()> {
    let entries = store.entries().await?;

    if entries.is_empty() && !matches!(format, OutputFormat::Json) {
        println!("No cached builds in {}", store.root().display());
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_entry_table(&entries),
        OutputFormat::Json => print_entry_json(&entries)?,
        OutputFormat::Plain => print_entry_plain(&entries),
    }

    Ok(())
}

fn print_entry_table(entries: &[CacheEntry]) {
    println!("{:<14} {:<10} {:<8} {:<20}", "DIGEST", "SIZE", "AGE", "MODIFIED");
    println!("{}", "-".repeat(56));

    let mut total = 0;
    for entry in entries {
        let size = tree::tree_size(&entry.path);
        total += size;
        println!(
            "{:<14} {:<10} {:<8} {:<20}",
            entry.digest.short(),
            format_size(size),
            format!("{}d", entry.age().num_days()),
            entry.modified.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!(
        "Total: {} build(s), {}",
        entries.len(),
        style(format_size(total)).bold()
    );
}

fn print_entry_json(entries: &[CacheEntry]) -> PreviewResult<()> {
    #[derive(serde::Serialize)]
    struct EntryJson {
        digest: String,
        path: String,
        size_bytes: u64,
        modified: String,
    }

    let json_entries: Vec<EntryJson> = entries
        .iter()
        .map(|e| EntryJson {
            digest: e.digest.to_string(),
            path: e.path.display().to_string(),
            size_bytes: tree::tree_size(&e.path),
            modified: e.modified.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_entries)?);
    Ok(())
}

fn print_entry_plain(entries: &[CacheEntry]) {
    for entry in entries {
        println!("{}", entry.digest);
    }
}

/// Run one janitor sweep now
async fn gc_entries(
    store: Arc<CacheStore>,
    config: &Config,
    days_override: Option<u32>,
    dry_run: bool,
) -> PreviewResult<()> {
    let days = days_override.unwrap_or(config.cache.retention_days);

    if days == 0 {
        println!("Cache eviction is disabled (retention_days = 0)");
        return Ok(());
    }

    let retention = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    // interval is unused for a one-shot sweep
    let janitor = CacheJanitor::new(store, retention, Duration::ZERO);

    let expired = janitor.expired().await;
    if expired.is_empty() {
        println!("No cached builds older than {} days.", days);
        return Ok(());
    }

    println!(
        "Found {} cached build(s) older than {} days:",
        expired.len(),
        days
    );
    for entry in &expired {
        println!(
            "  {} {} ({} days old)",
            style("•").red(),
            entry.digest.short(),
            entry.age().num_days()
        );
    }

    if dry_run {
        println!();
        println!("Dry run - nothing removed.");
        return Ok(());
    }

    println!();
    print!("Evicting... ");
    let _ = io::stdout().flush();

    let report = janitor.sweep().await;
    println!(
        "{} evicted {} build(s)",
        style("✓").green(),
        report.evicted
    );
    if report.skipped > 0 {
        println!(
            "{} {} build(s) in use, skipped",
            style("!").yellow(),
            report.skipped
        );
    }
    if report.failed > 0 {
        println!(
            "{} {} build(s) could not be removed (run with -v for details)",
            style("✗").red(),
            report.failed
        );
    }

    Ok(())
}

/// Remove every cached build
async fn clear_entries(store: &CacheStore, skip_confirm: bool) -> PreviewResult<()> {
    let entries = store.entries().await?;

    if entries.is_empty() {
        println!("No cached builds to clear.");
        return Ok(());
    }

    println!("This will remove {} cached build(s):", entries.len());
    for entry in &entries {
        println!("  {} {}", style("•").red(), entry.digest.short());
    }
    println!();

    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            println!("Failed to read input, aborting.");
            return Ok(());
        }

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = store.clear().await?;
    println!("{} cleared {} build(s)", style("✓").green(), removed);

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    match bytes {
        b if b >= GIB => format!("{:.1} GiB", b as f64 / GIB as f64),
        b if b >= MIB => format!("{:.1} MiB", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB", b as f64 / KIB as f64),
        b => format!("{b} B"),
    }
}
