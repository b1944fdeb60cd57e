use anyhow::Context;
use ridepool_audit::{HmacSealer, IntegrityLog};
use ridepool_booking::{BookingLifecycle, ExpirySweep};
use ridepool_core::policy::FullRefundPolicy;
use ridepool_store::{BroadcastNotifier, Config, DbClient, PgStore};
use ridepool_worker::{run_anchor_job, run_expiry_job};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ridepool_worker=debug,ridepool_booking=info,ridepool_audit=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!(
        pending_ttl_hours = config.lifecycle.pending_ttl_hours,
        key_version = %config.audit.key_version,
        "Starting ridepool worker"
    );

    let db = DbClient::new(&config.database).await.context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    let sealer = HmacSealer::new(config.audit.hmac_secret.expose().as_bytes(), config.audit.key_version.clone())
        .context("Invalid audit signing key")?;
    let log = Arc::new(IntegrityLog::new(store.clone(), Arc::new(sealer)));

    // Notification broadcast
    let notifier = BroadcastNotifier::new(100);
    let lifecycle = Arc::new(BookingLifecycle::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(FullRefundPolicy),
        Arc::new(notifier),
    ));
    let sweep = Arc::new(ExpirySweep::new(
        lifecycle,
        config.lifecycle.pending_ttl(),
        config.lifecycle.sweep_batch_size,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let expiry = tokio::spawn(run_expiry_job(sweep, config.lifecycle.sweep_interval(), shutdown_rx.clone()));
    let anchors = tokio::spawn(run_anchor_job(log, config.audit.anchor_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");
    shutdown_tx.send(true).context("Background jobs already gone")?;

    for (name, handle) in [("expiry", expiry), ("anchor", anchors)] {
        if let Err(e) = handle.await {
            tracing::error!(job = name, error = %e, "Background job panicked");
        }
    }
    Ok(())
}
