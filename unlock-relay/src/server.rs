//! Main UnlockRelay service.
//!
//! UnlockRelay owns all presence and subscription state for one process.
//! It is constructed explicitly and shut down explicitly, so tests can run
//! isolated instances side by side.

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::limits::{RateLimitError, RateLimits};
use crate::registry::PresenceRegistry;
use crate::relay;
use crate::stream::{SessionParams, StreamManager, UnlockStream};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use unlock_types::{DeviceId, DeviceRecord, Role, UserId};

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart), except
/// `streams_active` which tracks currently open streams.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total push streams opened.
    pub streams_opened_total: AtomicU64,
    /// Total push streams closed.
    pub streams_closed_total: AtomicU64,
    /// Currently open push streams.
    pub streams_active: AtomicU64,
    /// Total messages accepted by the send endpoint.
    pub messages_relayed_total: AtomicU64,
    /// Relayed messages that reached at least one session.
    pub messages_delivered_total: AtomicU64,
    /// Items written to outbound streams.
    pub stream_items_sent_total: AtomicU64,
    /// Roster notifications published.
    pub roster_broadcasts_total: AtomicU64,
    /// Presence refreshes (stream heartbeats and explicit heartbeats).
    pub heartbeats_total: AtomicU64,
    /// Devices evicted by the reaper.
    pub devices_evicted_total: AtomicU64,
    /// Total rate limit rejections.
    pub rate_limit_hits: AtomicU64,
}

/// Main relay service.
pub struct UnlockRelay {
    config: Config,
    registry: Arc<PresenceRegistry>,
    bus: Arc<EventBus>,
    streams: StreamManager,
    /// Rate limiters for opens, sends, and global throughput.
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl std::fmt::Debug for UnlockRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("users_online", &self.registry.user_count())
            .field("subscribers", &self.bus.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl UnlockRelay {
    /// Create a relay authenticating with the static tokens from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a token maps to
    /// an empty user id.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let authenticator = StaticTokenAuthenticator::from_config(&config.auth)?;
        Ok(Self::with_authenticator(config, Arc::new(authenticator)))
    }

    /// Create a relay with a caller-supplied authenticator.
    pub fn with_authenticator(config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        let bus = Arc::new(EventBus::new(config.stream.buffer_size));
        let metrics = Arc::new(RelayMetrics::default());
        let shutdown = CancellationToken::new();
        let streams = StreamManager::new(
            registry.clone(),
            bus.clone(),
            metrics.clone(),
            &config.presence,
            &config.stream,
            shutdown.clone(),
        );
        let rate_limits = RateLimits::new(&config.limits);

        Self {
            config,
            registry,
            bus,
            streams,
            rate_limits,
            metrics,
            authenticator,
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the presence registry.
    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Get access to the event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Get the authenticator used by the HTTP layer.
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Open a push stream for an authenticated caller.
    ///
    /// Approvers are registered and announced before this returns.
    /// Requesters receive the current roster as their first item.
    pub fn open_session(
        &self,
        user_id: UserId,
        role: Role,
        device_id: DeviceId,
        device_name: Option<String>,
    ) -> Result<UnlockStream> {
        self.check_device_id(&device_id)?;
        self.check_rate(self.rate_limits.check_open(&user_id))?;

        let device_name = match role {
            Role::Approver => self.clean_device_name(device_name),
            Role::Requester => None,
        };

        Ok(self.streams.open(SessionParams {
            user_id,
            device_id,
            role,
            device_name,
        }))
    }

    /// Relay `payload` from the caller to `target`.
    ///
    /// Succeeds whether or not the target is connected.
    pub fn send(&self, caller: &UserId, role: Role, target: DeviceId, payload: Value) -> Result<()> {
        self.check_device_id(&target)?;
        self.check_rate(self.rate_limits.check_send(caller))?;

        let target_label = target.to_string();
        let delivered = relay::send(&self.bus, caller, role, target, payload);

        self.metrics.messages_relayed_total.fetch_add(1, Ordering::Relaxed);
        if delivered > 0 {
            self.metrics.messages_delivered_total.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            "Relayed {:?} from user {} to device {} ({} sessions)",
            role.outbound_kind(),
            caller,
            target_label,
            delivered
        );
        Ok(())
    }

    /// Explicit presence signal from an approver.
    ///
    /// Announces the roster only if the device was not already present.
    pub fn heartbeat(
        &self,
        user_id: &UserId,
        device_id: DeviceId,
        device_name: Option<String>,
    ) -> Result<DeviceRecord> {
        self.check_device_id(&device_id)?;
        self.check_rate(self.rate_limits.check_open(user_id))?;

        let device_name = self.clean_device_name(device_name);
        let upsert = self.registry.upsert(user_id, &device_id, device_name);
        self.metrics.heartbeats_total.fetch_add(1, Ordering::Relaxed);

        if upsert.created {
            relay::publish_roster(&self.registry, &self.bus, &self.metrics, user_id);
        }
        Ok(upsert.record)
    }

    /// Current roster of the caller's approver devices.
    pub fn approvers(&self, user_id: &UserId) -> Vec<DeviceRecord> {
        self.registry.list(user_id)
    }

    /// Spawn the stale-presence reaper for this relay.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        crate::reaper::spawn_reaper(self.clone())
    }

    /// Close every open stream and stop background tasks.
    ///
    /// Approver streams deregister as they close. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(
                "Shutting down relay ({} open streams)",
                self.open_streams()
            );
        }
        self.shutdown.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Currently open push streams.
    pub fn open_streams(&self) -> u64 {
        self.metrics.streams_active.load(Ordering::Relaxed)
    }

    /// Users with at least one approver online.
    pub fn users_online(&self) -> usize {
        self.registry.user_count()
    }

    /// Approver devices online across all users.
    pub fn devices_online(&self) -> usize {
        self.registry.device_count()
    }

    /// Seconds since the relay was constructed.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn check_device_id(&self, device_id: &DeviceId) -> Result<()> {
        let max = self.config.limits.max_device_id_len;
        if device_id.len() > max {
            return Err(RelayError::invalid(format!(
                "deviceId too long: {} > {} bytes",
                device_id.len(),
                max
            )));
        }
        Ok(())
    }

    fn check_rate(&self, check: std::result::Result<(), RateLimitError>) -> Result<()> {
        check.map_err(|e| {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Rate limited: {}", e);
            RelayError::RateLimited {
                reason: e.to_string(),
            }
        })
    }

    /// Trim, drop empty names, and truncate to the configured limit.
    fn clean_device_name(&self, name: Option<String>) -> Option<String> {
        let name = name?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(truncate_device_name(name, self.config.limits.max_device_name_len))
    }
}

impl Drop for UnlockRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Truncate a device name to a maximum character length.
///
/// Uses char boundaries to avoid splitting multi-byte UTF-8.
fn truncate_device_name(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        name.to_string()
    } else {
        name.chars().take(max_chars).collect()
    }
}
