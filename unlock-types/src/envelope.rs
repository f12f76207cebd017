//! Envelope - the routing wrapper for everything the relay fans out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DeviceId, DeviceRecord, RosterEvent, UserId};

/// Kind discriminator used by subscribers to filter envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Requester -> approver (e.g. public key + PIN challenge)
    ApprovalRequested,
    /// Approver -> requester (e.g. encrypted passphrase)
    ApprovalGranted,
    /// Roster of a user's approver devices changed
    RosterChanged,
}

/// A message as it travels across the event bus.
///
/// The payload is opaque: the relay never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Authenticated user that produced the envelope.
    pub source_user_id: UserId,
    /// Target device, or `None` for "any session of this user".
    pub target_device_id: Option<DeviceId>,
    /// Kind discriminator.
    pub kind: EnvelopeKind,
    /// Opaque payload.
    pub payload: Value,
}

impl MessageEnvelope {
    /// Create an envelope addressed to one device.
    pub fn targeted(
        source_user_id: UserId,
        target_device_id: DeviceId,
        kind: EnvelopeKind,
        payload: Value,
    ) -> Self {
        Self {
            source_user_id,
            target_device_id: Some(target_device_id),
            kind,
            payload,
        }
    }

    /// Create a roster notification for every requester of `user_id`.
    pub fn roster_changed(user_id: UserId, approvers: Vec<DeviceRecord>) -> Self {
        let payload = serde_json::to_value(RosterEvent::approvers(approvers))
            .unwrap_or(Value::Null);
        Self {
            source_user_id: user_id,
            target_device_id: None,
            kind: EnvelopeKind::RosterChanged,
            payload,
        }
    }

    /// Whether a session bound to `device_id` should see this envelope.
    ///
    /// Untargeted envelopes are visible to every device of the user.
    pub fn is_addressed_to(&self, device_id: &DeviceId) -> bool {
        match &self.target_device_id {
            Some(target) => target == device_id,
            None => true,
        }
    }
}

/// One item of an outbound push stream: `{ "data": <payload> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    /// The envelope payload, forwarded verbatim.
    pub data: Value,
}

impl From<MessageEnvelope> for StreamItem {
    fn from(envelope: MessageEnvelope) -> Self {
        Self {
            data: envelope.payload,
        }
    }
}
