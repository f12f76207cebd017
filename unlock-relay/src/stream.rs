//! Per-connection push stream management.
//!
//! Each open stream gets one spawned task that races the next bus envelope
//! against transport closure and server shutdown. Approver streams own a
//! presence registration for their whole lifetime; requester streams are
//! pure consumers that start with a roster snapshot.
//!
//! ```text
//!   Opening ──► Active ──► Closed
//!                 │  ▲
//!                 └──┘ envelope / heartbeat
//! ```

use crate::bus::{EventBus, Subscription};
use crate::config::{PresenceConfig, StreamConfig};
use crate::registry::PresenceRegistry;
use crate::relay::publish_roster;
use crate::server::RelayMetrics;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use unlock_types::{
    ConnectionId, DeviceId, EnvelopeKind, MessageEnvelope, Role, StreamItem, UserId,
};

/// Lifecycle of one push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscriptions and presence are being set up.
    Opening,
    /// Delivering envelopes.
    Active,
    /// Terminal. Finalize has run.
    Closed,
}

/// Why a connection task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Client went away or the outbound write failed.
    Disconnected,
    /// Server is shutting down.
    Shutdown,
    /// The bus dropped the subscription.
    BusClosed,
}

/// Parameters of a stream being opened, already authenticated and validated.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Authenticated owner of the session.
    pub user_id: UserId,
    /// The caller's own device id.
    pub device_id: DeviceId,
    /// Declared role.
    pub role: Role,
    /// Display name (approvers only; ignored for requesters).
    pub device_name: Option<String>,
}

/// Opens push streams and runs their connection tasks.
#[derive(Debug)]
pub struct StreamManager {
    registry: Arc<PresenceRegistry>,
    bus: Arc<EventBus>,
    metrics: Arc<RelayMetrics>,
    heartbeat_interval: Duration,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl StreamManager {
    /// Create a stream manager over shared registry and bus.
    pub fn new(
        registry: Arc<PresenceRegistry>,
        bus: Arc<EventBus>,
        metrics: Arc<RelayMetrics>,
        presence: &PresenceConfig,
        stream: &StreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            bus,
            metrics,
            heartbeat_interval: presence.heartbeat_interval(),
            buffer_size: stream.buffer_size.max(1),
            shutdown,
        }
    }

    /// Open a stream and spawn its connection task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, params: SessionParams) -> UnlockStream {
        let connection_id = ConnectionId::new();
        let (outbound, receiver) = mpsc::channel(self.buffer_size);
        let (state_tx, state_rx) = watch::channel(SessionState::Opening);

        // Subscribe before announcing or snapshotting so nothing published
        // in between is missed.
        let subscription = self.bus.subscribe(inbound_filter(&params));

        let presence = match params.role {
            Role::Approver => Some(PresenceGuard::announce(
                self.registry.clone(),
                self.bus.clone(),
                self.metrics.clone(),
                connection_id,
                &params,
            )),
            Role::Requester => {
                let snapshot = MessageEnvelope::roster_changed(
                    params.user_id.clone(),
                    self.registry.list(&params.user_id),
                );
                // Fresh channel, capacity >= 1: the snapshot is the first item.
                if outbound.try_send(StreamItem::from(snapshot)).is_err() {
                    tracing::warn!("Could not enqueue roster snapshot for {}", connection_id);
                }
                None
            }
        };

        self.metrics.streams_opened_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.streams_active.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "Stream opened: connection={} user={} device={} role={}",
            connection_id,
            params.user_id,
            params.device_id,
            params.role
        );

        let connection = Connection {
            id: connection_id,
            params: params.clone(),
            subscription,
            outbound,
            presence,
            state: state_tx,
            shutdown: self.shutdown.clone(),
            heartbeat_interval: self.heartbeat_interval,
            metrics: self.metrics.clone(),
        };
        tokio::spawn(connection.run());

        UnlockStream {
            receiver,
            state: state_rx,
        }
    }
}

/// Envelopes a session should see: its own user's, and either roster
/// changes (requesters) or the role's inbound kind addressed to its device.
fn inbound_filter(
    params: &SessionParams,
) -> impl Fn(&MessageEnvelope) -> bool + Send + Sync + 'static {
    let user_id = params.user_id.clone();
    let device_id = params.device_id.clone();
    let role = params.role;

    move |env| {
        if env.source_user_id != user_id {
            return false;
        }
        match env.kind {
            EnvelopeKind::RosterChanged => {
                role == Role::Requester && env.is_addressed_to(&device_id)
            }
            kind => {
                kind == role.inbound_kind() && env.target_device_id.as_ref() == Some(&device_id)
            }
        }
    }
}

/// Presence registration held by an approver connection.
///
/// Finalize releases the hold exactly once, whether triggered by the
/// connection task or by drop. The record is removed and the new roster
/// announced only when no other open connection holds the same device.
#[derive(Debug)]
struct PresenceGuard {
    registry: Arc<PresenceRegistry>,
    bus: Arc<EventBus>,
    metrics: Arc<RelayMetrics>,
    connection_id: ConnectionId,
    user_id: UserId,
    device_id: DeviceId,
    device_name: Option<String>,
    finalized: AtomicBool,
}

impl PresenceGuard {
    fn announce(
        registry: Arc<PresenceRegistry>,
        bus: Arc<EventBus>,
        metrics: Arc<RelayMetrics>,
        connection_id: ConnectionId,
        params: &SessionParams,
    ) -> Self {
        registry.attach(
            &params.user_id,
            &params.device_id,
            params.device_name.clone(),
            connection_id,
        );
        publish_roster(&registry, &bus, &metrics, &params.user_id);

        Self {
            registry,
            bus,
            metrics,
            connection_id,
            user_id: params.user_id.clone(),
            device_id: params.device_id.clone(),
            device_name: params.device_name.clone(),
            finalized: AtomicBool::new(false),
        }
    }

    fn refresh(&self) {
        let upsert = self.registry.attach(
            &self.user_id,
            &self.device_id,
            self.device_name.clone(),
            self.connection_id,
        );
        self.metrics.heartbeats_total.fetch_add(1, Ordering::Relaxed);

        if upsert.created {
            // Reaped while connected; announce it again.
            tracing::debug!("Re-registered {} for user {}", self.device_id, self.user_id);
            publish_roster(&self.registry, &self.bus, &self.metrics, &self.user_id);
        }
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .registry
            .detach(&self.user_id, &self.device_id, self.connection_id)
        {
            publish_roster(&self.registry, &self.bus, &self.metrics, &self.user_id);
        }
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// State owned by one connection task.
struct Connection {
    id: ConnectionId,
    params: SessionParams,
    subscription: Subscription,
    outbound: mpsc::Sender<StreamItem>,
    presence: Option<PresenceGuard>,
    state: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    heartbeat_interval: Duration,
    metrics: Arc<RelayMetrics>,
}

impl Connection {
    async fn run(self) {
        let Connection {
            id,
            params,
            mut subscription,
            outbound,
            presence,
            state,
            shutdown,
            heartbeat_interval,
            metrics,
        } = self;

        state.send_replace(SessionState::Active);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let is_approver = presence.is_some();

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
                _ = outbound.closed() => break CloseReason::Disconnected,
                _ = heartbeat.tick(), if is_approver => {
                    if let Some(guard) = &presence {
                        guard.refresh();
                    }
                }
                next = subscription.recv() => {
                    let Some(envelope) = next else {
                        break CloseReason::BusClosed;
                    };
                    tokio::select! {
                        sent = outbound.send(StreamItem::from(envelope)) => {
                            if sent.is_err() {
                                break CloseReason::Disconnected;
                            }
                            metrics.stream_items_sent_total.fetch_add(1, Ordering::Relaxed);
                        }
                        _ = shutdown.cancelled() => break CloseReason::Shutdown,
                    }
                }
            }
        };

        drop(subscription);
        if let Some(guard) = &presence {
            guard.finalize();
        }
        drop(outbound);

        metrics.streams_closed_total.fetch_add(1, Ordering::Relaxed);
        metrics.streams_active.fetch_sub(1, Ordering::Relaxed);
        state.send_replace(SessionState::Closed);

        tracing::info!(
            "Stream closed: connection={} user={} device={} role={} reason={:?}",
            id,
            params.user_id,
            params.device_id,
            params.role,
            reason
        );
    }
}

/// Outbound sequence of a push connection.
///
/// Dropping it is how the transport signals closure.
#[derive(Debug)]
pub struct UnlockStream {
    receiver: mpsc::Receiver<StreamItem>,
    state: watch::Receiver<SessionState>,
}

impl UnlockStream {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A handle that can observe the lifecycle after the stream is dropped.
    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            state: self.state.clone(),
        }
    }
}

impl Stream for UnlockStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Observer of a connection's lifecycle.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    state: watch::Receiver<SessionState>,
}

impl SessionMonitor {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the connection task has finalized.
    pub async fn closed(&mut self) {
        // A dropped sender means the task is gone, which is also closed.
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay;
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    struct Harness {
        registry: Arc<PresenceRegistry>,
        bus: Arc<EventBus>,
        metrics: Arc<RelayMetrics>,
        shutdown: CancellationToken,
        manager: StreamManager,
    }

    fn harness() -> Harness {
        let registry = Arc::new(PresenceRegistry::new());
        let bus = Arc::new(EventBus::new(16));
        let metrics = Arc::new(RelayMetrics::default());
        let shutdown = CancellationToken::new();
        let manager = StreamManager::new(
            registry.clone(),
            bus.clone(),
            metrics.clone(),
            &PresenceConfig::default(),
            &StreamConfig::default(),
            shutdown.clone(),
        );
        Harness {
            registry,
            bus,
            metrics,
            shutdown,
            manager,
        }
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn approver(u: &str, d: &str, name: Option<&str>) -> SessionParams {
        SessionParams {
            user_id: user(u),
            device_id: device(d),
            role: Role::Approver,
            device_name: name.map(str::to_string),
        }
    }

    fn requester(u: &str, d: &str) -> SessionParams {
        SessionParams {
            user_id: user(u),
            device_id: device(d),
            role: Role::Requester,
            device_name: None,
        }
    }

    fn roster_ids(item: &StreamItem) -> Vec<String> {
        assert_eq!(item.data["type"], "approvers-list");
        item.data["approvers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["deviceId"].as_str().unwrap().to_string())
            .collect()
    }

    async fn next(stream: &mut UnlockStream) -> StreamItem {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for stream item")
            .expect("stream ended")
    }

    async fn assert_quiet(stream: &mut UnlockStream) {
        let res = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(res.is_err(), "unexpected item: {:?}", res);
    }

    #[tokio::test]
    async fn requester_first_item_is_roster_snapshot() {
        let h = harness();
        h.registry.upsert(&user("u1"), &device("d1"), Some("Laptop".into()));

        let mut stream = h.manager.open(requester("u1", "r1"));
        let first = next(&mut stream).await;

        assert_eq!(roster_ids(&first), ["d1"]);
        assert_eq!(first.data["approvers"][0]["deviceName"], "Laptop");
    }

    #[tokio::test]
    async fn requester_snapshot_is_empty_when_nobody_online() {
        let h = harness();
        let mut stream = h.manager.open(requester("u1", "r1"));
        assert!(roster_ids(&next(&mut stream).await).is_empty());
    }

    #[tokio::test]
    async fn approver_lifecycle_broadcasts_roster() {
        let h = harness();
        let mut req = h.manager.open(requester("u1", "r1"));
        assert!(roster_ids(&next(&mut req).await).is_empty());

        let a1 = h.manager.open(approver("u1", "d1", Some("Laptop")));
        let joined = next(&mut req).await;
        assert_eq!(roster_ids(&joined), ["d1"]);
        assert_eq!(joined.data["approvers"][0]["deviceName"], "Laptop");

        // A second requester opened now sees the same roster first.
        let mut late = h.manager.open(requester("u1", "r2"));
        assert_eq!(roster_ids(&next(&mut late).await), ["d1"]);

        let mut monitor = a1.monitor();
        drop(a1);
        monitor.closed().await;

        assert!(roster_ids(&next(&mut req).await).is_empty());
        assert!(h.registry.list(&user("u1")).is_empty());
    }

    #[tokio::test]
    async fn approval_request_reaches_only_target_approver() {
        let h = harness();
        let mut a1 = h.manager.open(approver("u1", "d1", None));
        let mut a2 = h.manager.open(approver("u1", "d2", None));
        // Let both connection tasks start.
        tokio::task::yield_now().await;

        let delivered = relay::send(
            &h.bus,
            &user("u1"),
            Role::Requester,
            device("d1"),
            json!({"type": "auth-request"}),
        );
        assert_eq!(delivered, 1);

        assert_eq!(next(&mut a1).await.data, json!({"type": "auth-request"}));
        assert_quiet(&mut a2).await;
    }

    #[tokio::test]
    async fn approval_grant_reaches_target_requester() {
        let h = harness();
        let mut req = h.manager.open(requester("u1", "r1"));
        let _snapshot = next(&mut req).await;

        relay::send(
            &h.bus,
            &user("u1"),
            Role::Approver,
            device("r1"),
            json!({"type": "auth-response", "encrypted": "xyz"}),
        );

        let item = next(&mut req).await;
        assert_eq!(item.data["type"], "auth-response");
    }

    #[tokio::test]
    async fn approvers_do_not_receive_grants_or_rosters() {
        let h = harness();
        let mut a1 = h.manager.open(approver("u1", "d1", None));

        relay::send(&h.bus, &user("u1"), Role::Approver, device("d1"), Value::Null);
        let _other = h.manager.open(approver("u1", "d2", None));

        assert_quiet(&mut a1).await;
    }

    #[tokio::test]
    async fn other_users_messages_are_invisible() {
        let h = harness();
        let mut a1 = h.manager.open(approver("alice", "d1", None));
        let mut req = h.manager.open(requester("alice", "r1"));
        let _ = next(&mut req).await;

        relay::send(&h.bus, &user("mallory"), Role::Requester, device("d1"), json!(1));
        let _m = h.manager.open(approver("mallory", "d9", None));

        assert_quiet(&mut a1).await;
        assert_quiet(&mut req).await;
    }

    #[tokio::test]
    async fn requester_close_does_not_touch_registry() {
        let h = harness();
        h.registry.upsert(&user("u1"), &device("d1"), None);

        let req = h.manager.open(requester("u1", "r1"));
        let mut monitor = req.monitor();
        drop(req);
        monitor.closed().await;

        assert_eq!(h.registry.list(&user("u1")).len(), 1);
    }

    #[tokio::test]
    async fn state_moves_to_active_then_closed() {
        let h = harness();
        let stream = h.manager.open(approver("u1", "d1", None));
        let mut monitor = stream.monitor();
        tokio::time::timeout(Duration::from_secs(1), async {
            while stream.state() != SessionState::Active {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connection task never became active");

        drop(stream);
        monitor.closed().await;
        assert_eq!(monitor.state(), SessionState::Closed);
        assert_eq!(h.metrics.streams_active.load(Ordering::Relaxed), 0);
        assert_eq!(h.bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_streams_and_deregisters() {
        let h = harness();
        let mut a1 = h.manager.open(approver("u1", "d1", None));
        let mut monitor = a1.monitor();
        assert!(h.registry.contains(&user("u1"), &device("d1")));

        h.shutdown.cancel();
        monitor.closed().await;

        assert!(!h.registry.contains(&user("u1"), &device("d1")));
        // Outbound sender dropped: the stream ends.
        assert!(a1.next().await.is_none());
    }

    #[tokio::test]
    async fn finalize_runs_once() {
        let h = harness();
        let params = approver("u1", "d1", None);
        let guard = PresenceGuard::announce(
            h.registry.clone(),
            h.bus.clone(),
            h.metrics.clone(),
            ConnectionId::new(),
            &params,
        );
        let mut sub = h.bus.subscribe(|env| env.kind == EnvelopeKind::RosterChanged);

        guard.finalize();
        guard.finalize();
        drop(guard);

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finalize_announces_once() {
        let h = harness();
        let params = approver("u1", "d1", None);
        let guard = Arc::new(PresenceGuard::announce(
            h.registry.clone(),
            h.bus.clone(),
            h.metrics.clone(),
            ConnectionId::new(),
            &params,
        ));
        let mut sub = h.bus.subscribe(|env| env.kind == EnvelopeKind::RosterChanged);

        let barrier = Arc::new(std::sync::Barrier::new(4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.finalize();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        drop(guard);

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
        assert!(!h.registry.contains(&user("u1"), &device("d1")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_racing_shutdown_announces_once() {
        let h = harness();
        let stream = h.manager.open(approver("u1", "d1", None));
        let mut monitor = stream.monitor();
        let mut sub = h.bus.subscribe(|env| env.kind == EnvelopeKind::RosterChanged);

        let shutdown = h.shutdown.clone();
        let closer = tokio::spawn(async move { drop(stream) });
        let canceller = tokio::spawn(async move { shutdown.cancel() });
        closer.await.unwrap();
        canceller.await.unwrap();
        monitor.closed().await;

        let roster = sub.try_recv().expect("roster after close");
        assert!(roster.payload["approvers"].as_array().unwrap().is_empty());
        assert!(sub.try_recv().is_none());
        assert_eq!(h.metrics.streams_closed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shared_device_stays_listed_until_last_stream_closes() {
        let h = harness();
        let mut req = h.manager.open(requester("u1", "r1"));
        assert!(roster_ids(&next(&mut req).await).is_empty());

        let old = h.manager.open(approver("u1", "d1", Some("Laptop")));
        assert_eq!(roster_ids(&next(&mut req).await), ["d1"]);
        let new = h.manager.open(approver("u1", "d1", Some("Laptop")));
        assert_eq!(roster_ids(&next(&mut req).await), ["d1"]);

        let mut old_monitor = old.monitor();
        drop(old);
        old_monitor.closed().await;

        assert!(h.registry.contains(&user("u1"), &device("d1")));
        assert_ne!(new.state(), SessionState::Closed);
        assert_quiet(&mut req).await;

        let mut new_monitor = new.monitor();
        drop(new);
        new_monitor.closed().await;

        assert!(roster_ids(&next(&mut req).await).is_empty());
        assert!(!h.registry.contains(&user("u1"), &device("d1")));
    }

    #[tokio::test]
    async fn finalize_after_eviction_does_not_rebroadcast() {
        let h = harness();
        let a1 = h.manager.open(approver("u1", "d1", None));
        let mut monitor = a1.monitor();

        // Reaper already evicted and announced it.
        assert!(h.registry.remove(&user("u1"), &device("d1")));
        let mut sub = h.bus.subscribe(|env| env.kind == EnvelopeKind::RosterChanged);

        drop(a1);
        monitor.closed().await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_restores_evicted_approver() {
        let h = harness();
        let _a1 = h.manager.open(approver("u1", "d1", Some("Laptop")));
        let mut req = h.manager.open(requester("u1", "r1"));
        assert_eq!(roster_ids(&next(&mut req).await), ["d1"]);

        h.registry.remove(&user("u1"), &device("d1"));

        tokio::time::advance(PresenceConfig::default().heartbeat_interval()).await;
        let restored = next(&mut req).await;

        assert_eq!(roster_ids(&restored), ["d1"]);
        assert_eq!(restored.data["approvers"][0]["deviceName"], "Laptop");
        assert!(h.metrics.heartbeats_total.load(Ordering::Relaxed) >= 1);
    }
}
