//! Application wiring and lifecycle.

use crate::config::Config;
use crate::paths::Paths;
use anyhow::{Context, Result};
use dispatcher_core::{DispatchConfig, DispatchLoop, NewOutboxEvent, RetryPolicy};
use dispatcher_database::{Database, SqliteEventStore};
use dispatcher_relay_client::{RelayClient, RelayConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Run the dispatcher until a shutdown signal arrives.
pub async fn run_dispatcher(config: Config, paths: Paths) -> Result<()> {
    paths.ensure_dirs()?;

    let db_path = paths.database_file();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let store = Arc::new(SqliteEventStore::shared(
        Arc::new(Mutex::new(db)),
        config.unblock_on_failure,
    ));

    let client = Arc::new(
        RelayClient::new(RelayConfig {
            base_url: config.relay_url.clone(),
            auth_token: config.relay_auth_token.clone(),
            timeout_secs: config.request_timeout_secs,
            route_map: config.route_map.clone(),
        })
        .context("Failed to build relay client")?,
    );

    let policy = RetryPolicy {
        base_delay: Duration::from_secs(config.retry_base_delay_secs),
        max_delay: Duration::from_secs(config.retry_max_delay_secs),
        max_attempts: config.max_attempts,
        jitter: config.jitter,
    };

    let dispatch_config = DispatchConfig {
        batch_size: config.batch_size,
        idle_interval: Duration::from_secs(config.idle_interval_secs),
        stale_claim_timeout: Duration::from_secs(config.stale_claim_timeout_secs),
        ..DispatchConfig::default()
    };
    let idle_interval = dispatch_config.idle_interval;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = DispatchLoop::new(store, client, policy, dispatch_config, shutdown_rx);
    let liveness = dispatch.liveness();

    info!(
        database = %db_path.display(),
        relay_url = %config.relay_url,
        "Dispatcher starting"
    );

    // Periodic check that the loop is still making cycles. A wedged relay
    // call inside a cycle would otherwise go unnoticed until restart.
    let watchdog = tokio::spawn({
        let liveness = liveness.clone();
        async move {
            let mut ticker = tokio::time::interval(idle_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !liveness.is_live(idle_interval * 2) {
                    warn!(
                        last_cycle_at = ?liveness.last_cycle_at(),
                        "Dispatch loop has not completed a cycle recently"
                    );
                }
            }
        }
    });

    let run = dispatch.run();
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {
            info!("Dispatch loop stopped on its own");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping dispatch loop");
            if shutdown_tx.send(true).is_err() {
                error!("Dispatch loop already gone");
            }
            // Let the in-flight cycle finish and release its claims.
            run.await;
        }
    }

    watchdog.abort();
    info!("Dispatcher stopped");
    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                // Fall back to ctrl-c only.
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Append one event to the outbox.
pub async fn enqueue_event(
    paths: &Paths,
    aggregate_key: String,
    event_type: String,
    payload: String,
) -> Result<()> {
    paths.ensure_dirs()?;
    let db = Database::open(&paths.database_file())?;
    let event = db.insert_event(&NewOutboxEvent {
        aggregate_key,
        event_type,
        payload: payload.into_bytes(),
    })?;
    println!(
        "Enqueued {} (aggregate {}, sequence {})",
        event.id, event.aggregate_key, event.sequence
    );
    Ok(())
}

/// Print outbox status counts.
pub async fn show_status(paths: &Paths) -> Result<()> {
    let db_path = paths.database_file();
    if !db_path.exists() {
        println!("No outbox database at {}", db_path.display());
        return Ok(());
    }

    let db = Database::open(&db_path)?;
    let counts = db.status_counts()?;

    if counts.is_empty() {
        println!("Outbox is empty");
        return Ok(());
    }

    println!("Outbox status:");
    for (status, count) in counts {
        println!("  {:<10} {}", status, count);
    }
    Ok(())
}
