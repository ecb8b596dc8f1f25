use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AutopilotConfig, Config};
use crate::engine::{CycleOutcome, Engine};

/// How often the compactor checks the WAL append count.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the autopilot, overrun scanner and WAL compactor. They all stop
/// when `shutdown` is cancelled.
pub fn spawn_background(engine: Arc<Engine>, config: &Config, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_autopilot(
            engine.clone(),
            config.instance_id.clone(),
            config.autopilot.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(run_overrun_scan(
            engine.clone(),
            config.autopilot.overrun_interval,
            shutdown.clone(),
        )),
        tokio::spawn(run_compactor(
            engine,
            config.compact_threshold,
            COMPACT_CHECK_INTERVAL,
            shutdown,
        )),
    ]
}

/// One lifecycle cycle per business every `config.interval`.
pub async fn run_autopilot(
    engine: Arc<Engine>,
    instance_id: String,
    config: AutopilotConfig,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for business in engine.list_businesses() {
            match engine.run_autopilot_cycle(business.id, &instance_id, &config).await {
                Ok(CycleOutcome::Standby) => debug!(business = %business.id, "autopilot standby"),
                Ok(CycleOutcome::Overlapping) => debug!(business = %business.id, "autopilot cycle still running"),
                Ok(CycleOutcome::Ran { .. }) => {}
                Err(e) => warn!(business = %business.id, "autopilot cycle failed: {e}"),
            }
        }
    }
    info!("autopilot stopped");
}

/// Periodically check active sessions for overruns.
pub async fn run_overrun_scan(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for business in engine.list_businesses() {
            match engine.scan_overruns(business.id).await {
                Ok(0) => {}
                Ok(n) => info!(business = %business.id, overruns = n, "rippled overrunning sessions"),
                Err(e) => warn!(business = %business.id, "overrun scan failed: {e}"),
            }
        }
    }
}

/// Compact the WAL once `threshold` appends have accumulated since the last
/// compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(Some(events)) => info!(events, "compacted WAL"),
            Ok(None) => debug!("compaction deferred, provider busy"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
