//! `leaseq-sweeper`: runs the stale lease sweep against Postgres until ctrl-c.
//!
//! Workers embed `leaseq_infra::JobRunner` with their own handlers; this
//! process only returns abandoned leases to the queue, for deployments that
//! keep the sweep out of the workers.

use anyhow::Context;
use tokio::time::MissedTickBehavior;

use leaseq_infra::{ConfigError, PostgresJobStore, QueueConfig, StaleLeaseReclaimer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leaseq_observability::init();

    let config = QueueConfig::from_env().context("invalid queue configuration")?;
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

    let store = PostgresJobStore::connect(&database_url, 2)
        .await
        .context("failed to connect to Postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to create job table")?;

    let reclaimer = StaleLeaseReclaimer::new(store);

    tracing::info!(
        lease_timeout_secs = config.lease_timeout.as_secs(),
        interval_secs = config.reclaim_interval.as_secs(),
        "sweeper started"
    );

    let mut ticker = tokio::time::interval(config.reclaim_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Storage errors are retried on the next tick.
                if let Err(e) = reclaimer.reclaim_stale(config.lease_timeout).await {
                    tracing::error!(error = %e, "stale lease sweep failed");
                }
            }
            signal = &mut shutdown => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }

    tracing::info!("sweeper stopped");
    Ok(())
}
