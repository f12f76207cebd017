//! Prometheus metrics endpoint.

use crate::server::UnlockRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<UnlockRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay),
    )
}

fn render(relay: &UnlockRelay) -> String {
    let m = relay.metrics();

    // Gauges
    let open_streams = relay.open_streams();
    let users = relay.users_online();
    let devices = relay.devices_online();
    let subscribers = relay.bus().subscriber_count();

    // Counters
    let opened = m.streams_opened_total.load(Ordering::Relaxed);
    let closed = m.streams_closed_total.load(Ordering::Relaxed);
    let relayed = m.messages_relayed_total.load(Ordering::Relaxed);
    let delivered = m.messages_delivered_total.load(Ordering::Relaxed);
    let items = m.stream_items_sent_total.load(Ordering::Relaxed);
    let rosters = m.roster_broadcasts_total.load(Ordering::Relaxed);
    let heartbeats = m.heartbeats_total.load(Ordering::Relaxed);
    let evicted = m.devices_evicted_total.load(Ordering::Relaxed);
    let bus_dropped = relay.bus().dropped_count();
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    format!(
        r#"# HELP unlock_relay_streams_open Number of open push streams
# TYPE unlock_relay_streams_open gauge
unlock_relay_streams_open {open_streams}

# HELP unlock_relay_users_online Users with at least one approver online
# TYPE unlock_relay_users_online gauge
unlock_relay_users_online {users}

# HELP unlock_relay_devices_online Approver devices online
# TYPE unlock_relay_devices_online gauge
unlock_relay_devices_online {devices}

# HELP unlock_relay_bus_subscribers Active bus subscriptions
# TYPE unlock_relay_bus_subscribers gauge
unlock_relay_bus_subscribers {subscribers}

# HELP unlock_relay_info Server information
# TYPE unlock_relay_info gauge
unlock_relay_info{{version="{version}"}} 1

# HELP unlock_relay_streams_opened_total Total push streams opened
# TYPE unlock_relay_streams_opened_total counter
unlock_relay_streams_opened_total {opened}

# HELP unlock_relay_streams_closed_total Total push streams closed
# TYPE unlock_relay_streams_closed_total counter
unlock_relay_streams_closed_total {closed}

# HELP unlock_relay_messages_relayed_total Messages accepted for relay
# TYPE unlock_relay_messages_relayed_total counter
unlock_relay_messages_relayed_total {relayed}

# HELP unlock_relay_messages_delivered_total Relayed messages that reached a session
# TYPE unlock_relay_messages_delivered_total counter
unlock_relay_messages_delivered_total {delivered}

# HELP unlock_relay_stream_items_sent_total Items written to push streams
# TYPE unlock_relay_stream_items_sent_total counter
unlock_relay_stream_items_sent_total {items}

# HELP unlock_relay_roster_broadcasts_total Roster notifications published
# TYPE unlock_relay_roster_broadcasts_total counter
unlock_relay_roster_broadcasts_total {rosters}

# HELP unlock_relay_heartbeats_total Presence refreshes
# TYPE unlock_relay_heartbeats_total counter
unlock_relay_heartbeats_total {heartbeats}

# HELP unlock_relay_devices_evicted_total Devices evicted as stale
# TYPE unlock_relay_devices_evicted_total counter
unlock_relay_devices_evicted_total {evicted}

# HELP unlock_relay_bus_dropped_total Envelopes dropped on full subscriber buffers
# TYPE unlock_relay_bus_dropped_total counter
unlock_relay_bus_dropped_total {bus_dropped}

# HELP unlock_relay_rate_limit_hits_total Total rate limit rejections
# TYPE unlock_relay_rate_limit_hits_total counter
unlock_relay_rate_limit_hits_total {rate_limits}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
