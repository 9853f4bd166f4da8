mod api;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::{anyhow, Result};
use affinity_core::config::{AppConfig, LoadOptions};
use affinity_engine::{run_daily, CancellationToken, DailySchedule};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use affinity_core::config::LogFormat::*;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let shutdown = CancellationToken::new();

    let scheduler = if app.config.recalculation.enabled {
        let schedule = DailySchedule::from_config(&app.config.recalculation)
            .ok_or_else(|| anyhow!("recalculation schedule is not a valid time of day"))?;
        Some(tokio::spawn(run_daily(
            app.services.recalculation.clone(),
            schedule,
            shutdown.clone(),
        )))
    } else {
        tracing::info!(
            event_name = "affinity.server.scheduler_disabled",
            "scheduled recalculation disabled by configuration"
        );
        None
    };

    let router = health::router(app.db_pool.clone()).merge(api::router(api::ApiState::new(
        app.services.clone(),
        app.config.server.admin_token.clone(),
        shutdown.clone(),
    )));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "affinity.server.started",
        bind_address = %address,
        "affinity-server listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal.cancel();
    });

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    tracing::info!(event_name = "affinity.server.stopping", "affinity-server stopping");
    if let Some(handle) = scheduler {
        let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!(
                event_name = "affinity.server.scheduler_timeout",
                grace_secs = grace.as_secs(),
                "scheduler did not stop within the grace period"
            );
        }
    }
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "affinity.server.signal_error",
            error = %error,
            "could not listen for shutdown signal; stopping"
        );
    }
}
