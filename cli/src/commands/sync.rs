use std::time::Duration;

use anyhow::{Result, bail};
use tracing::info;

use fitstat_core::engine::{SkipReason, SyncConfig, SyncOutcome};
use fitstat_core::monitor::SyncMonitor;

use super::App;
use super::helpers::{display_time, print_json};

pub(crate) struct WatchArgs {
    pub debounce_secs: u64,
    pub interval_secs: u64,
    pub retry_secs: u64,
    pub probe_secs: u64,
}

impl WatchArgs {
    fn config(&self) -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_secs(self.debounce_secs),
            periodic_interval: Duration::from_secs(self.interval_secs.max(1)),
            retry_backoff: Duration::from_secs(self.retry_secs),
            probe_interval: Duration::from_secs(self.probe_secs.max(1)),
            ..SyncConfig::default()
        }
    }
}

pub(crate) async fn cmd_status(app: &App, json: bool) -> Result<()> {
    app.engine.refresh_connectivity().await;
    let status = app.engine.status();

    if json {
        return print_json(&serde_json::json!({
            "status": status,
            "label": status.label(),
            "user_id": app.engine.user_id(),
            "remote": app.remote_url,
        }));
    }

    println!("{}", status.label());
    println!(
        "  User:      {}",
        app.engine.user_id().as_deref().unwrap_or("(none)")
    );
    println!(
        "  Remote:    {}",
        app.remote_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "  Last sync: {}",
        status
            .last_sync
            .as_ref()
            .map(display_time)
            .unwrap_or_else(|| "never".to_string())
    );
    println!("  Pending:   {}", status.pending_changes);
    Ok(())
}

pub(crate) async fn cmd_sync(app: &App, json: bool) -> Result<()> {
    if app.remote_url.is_none() {
        bail!("No remote configured. Set FITSTAT_REMOTE_URL");
    }
    if !app.engine.refresh_connectivity().await {
        bail!("Remote is unreachable. Changes stay queued locally");
    }

    let report = match app.engine.force_sync().await? {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Skipped(SkipReason::NoUser) => {
            bail!("No user signed in. Run `fitstat user set <id>`")
        }
        SyncOutcome::Skipped(SkipReason::AlreadyRunning) => {
            bail!("A sync is already running")
        }
    };

    if json {
        return print_json(&report);
    }
    for c in &report.collections {
        if c.pushed > 0 || c.pulled > 0 {
            println!("  {:<18} pushed {:>4}  pulled {:>4}", c.collection, c.pushed, c.pulled);
        }
    }
    println!(
        "Synced: {} pushed, {} pulled ({} pending)",
        report.pushed(),
        report.pulled(),
        app.engine.status().pending_changes
    );
    Ok(())
}

/// Keep the store in sync until interrupted.
pub(crate) async fn cmd_watch(app: App, args: WatchArgs) -> Result<()> {
    if app.remote_url.is_none() {
        bail!("No remote configured. Set FITSTAT_REMOTE_URL");
    }
    let App {
        engine, signals, ..
    } = app;

    let online = engine.refresh_connectivity().await;
    info!(online, "sync monitor starting");
    let handle = SyncMonitor::spawn(engine.clone(), signals, args.config());
    if online {
        engine.request_sync();
    }
    eprintln!("Watching for changes. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("shutting down sync monitor");
    handle.shutdown().await;
    Ok(())
}
