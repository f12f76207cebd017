//! Background reaper for stale presence records.
//!
//! Runs periodically, evicts devices that have been silent longer than the
//! staleness window, and publishes one roster change per affected user.

use crate::bus::EventBus;
use crate::registry::PresenceRegistry;
use crate::relay::publish_roster;
use crate::server::{RelayMetrics, UnlockRelay};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices removed from the registry.
    pub evicted: usize,
    /// Users that received a roster notification.
    pub users_notified: usize,
}

/// Evict everything stale at `now` and announce the new rosters.
///
/// Several devices of one user going stale together produce a single
/// notification carrying the post-removal roster.
pub fn sweep(
    registry: &PresenceRegistry,
    bus: &EventBus,
    metrics: &RelayMetrics,
    now: DateTime<Utc>,
    timeout: Duration,
) -> SweepReport {
    let mut affected = BTreeSet::new();
    let mut evicted = 0;

    for (user_id, device_id) in registry.list_stale(now, timeout) {
        if registry.remove_if_stale(&user_id, &device_id, now, timeout) {
            tracing::debug!("Evicted stale device {} of user {}", device_id, user_id);
            evicted += 1;
            affected.insert(user_id);
        }
    }

    for user_id in &affected {
        publish_roster(registry, bus, metrics, user_id);
    }

    metrics
        .devices_evicted_total
        .fetch_add(evicted as u64, Ordering::Relaxed);

    SweepReport {
        evicted,
        users_notified: affected.len(),
    }
}

/// Spawn the reaper task.
///
/// The task stops when the relay shuts down. A sweep in progress always
/// completes; shutdown is only observed between sweeps.
pub fn spawn_reaper(relay: Arc<UnlockRelay>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = relay.config().presence.clone();
        if !config.reaper_enabled {
            tracing::info!("Reaper disabled");
            return;
        }

        let timeout = config.stale_timeout();
        tracing::info!(
            "Reaper started (interval: {}s, stale after: {}s)",
            config.sweep_interval_secs,
            config.stale_timeout_secs
        );

        let mut timer = interval(config.sweep_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = relay.shutdown_token();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopped");
                    break;
                }
                _ = timer.tick() => {}
            }

            let report = sweep(
                relay.registry(),
                relay.bus(),
                relay.metrics(),
                Utc::now(),
                timeout,
            );
            relay.rate_limits().shrink();

            if report.evicted > 0 {
                tracing::info!(
                    "Reaper: evicted {} devices across {} users",
                    report.evicted,
                    report.users_notified
                );
            } else {
                tracing::debug!("Reaper: nothing stale");
            }
        }
    })
}
