//! Publications onto the bus: relayed client messages and roster changes.
//!
//! For relayed messages the source user is always the authenticated caller.
//! There is no check that the target device is connected; an absent target
//! simply receives nothing.

use crate::bus::EventBus;
use crate::registry::PresenceRegistry;
use crate::server::RelayMetrics;
use serde_json::Value;
use std::sync::atomic::Ordering;
use unlock_types::{DeviceId, MessageEnvelope, Role, UserId};

/// Publish `payload` from `caller` to `target` as the envelope kind implied
/// by the caller's role.
///
/// Approvers produce `ApprovalGranted`, requesters `ApprovalRequested`.
/// Returns the number of sessions that received it (0 or 1 in practice).
pub fn send(
    bus: &EventBus,
    caller: &UserId,
    role: Role,
    target: DeviceId,
    payload: Value,
) -> usize {
    let kind = role.outbound_kind();
    let envelope = MessageEnvelope::targeted(caller.clone(), target, kind, payload);
    bus.publish(envelope)
}

/// Announce `user_id`'s current roster to all of that user's requesters.
///
/// Reads the registry at call time, so the payload reflects any mutation
/// the caller just made.
pub fn publish_roster(
    registry: &PresenceRegistry,
    bus: &EventBus,
    metrics: &RelayMetrics,
    user_id: &UserId,
) -> usize {
    let roster = registry.list(user_id);
    let devices = roster.len();
    let delivered = bus.publish(MessageEnvelope::roster_changed(user_id.clone(), roster));
    metrics.roster_broadcasts_total.fetch_add(1, Ordering::Relaxed);

    tracing::debug!(
        "Roster for {} ({} devices) sent to {} requesters",
        user_id,
        devices,
        delivered
    );
    delivered
}
