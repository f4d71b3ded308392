//! Background expiry of abandoned uploads.

use crate::services::upload_service::UploadService;
use std::time::Duration;
use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

/// Run `UploadService::sweep_idle` every `every`, forever.
///
/// The first sweep happens immediately, which reclaims chunk directories
/// left behind by a previous process once they are older than `ttl`.
pub fn spawn(service: UploadService, ttl: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.sweep_idle(ttl).await {
                Ok(report) if report.expired_sessions > 0 || report.orphan_dirs > 0 => info!(
                    "Idle sweep expired {} sessions and {} orphaned chunk directories",
                    report.expired_sessions, report.orphan_dirs
                ),
                Ok(_) => {}
                Err(err) => warn!("Idle sweep failed: {}", err),
            }
        }
    })
}
