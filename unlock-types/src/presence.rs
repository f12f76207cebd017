//! Presence records and the roster payload sent to requesters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// An approver device currently known to be online.
///
/// Ephemeral: created on the first presence signal, refreshed on every
/// heartbeat or reconnect, deleted on disconnect or eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Client-chosen device identifier.
    pub device_id: DeviceId,
    /// Human-readable label, e.g. "Laptop".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Time of the most recent presence signal.
    pub last_seen_at: DateTime<Utc>,
}

/// Payload carried by `RosterChanged` envelopes.
///
/// Serializes as `{"type":"approvers-list","approvers":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RosterEvent {
    /// Snapshot of every approver device of the user.
    ApproversList {
        /// Current roster, ordered by device id.
        approvers: Vec<DeviceRecord>,
    },
}

impl RosterEvent {
    /// Build a roster snapshot event.
    pub fn approvers(approvers: Vec<DeviceRecord>) -> Self {
        RosterEvent::ApproversList { approvers }
    }
}
