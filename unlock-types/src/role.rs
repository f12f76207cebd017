//! Session roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{EnvelopeKind, TypesError};

/// The role a browser session declares when it opens a stream or sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Session whose private key is already decrypted.
    Approver,
    /// Session waiting to be handed the passphrase.
    Requester,
}

impl Role {
    /// Envelope kind produced when a session of this role sends a message.
    pub fn outbound_kind(self) -> EnvelopeKind {
        match self {
            Role::Approver => EnvelopeKind::ApprovalGranted,
            Role::Requester => EnvelopeKind::ApprovalRequested,
        }
    }

    /// Targeted envelope kind a session of this role receives.
    pub fn inbound_kind(self) -> EnvelopeKind {
        match self {
            Role::Approver => EnvelopeKind::ApprovalRequested,
            Role::Requester => EnvelopeKind::ApprovalGranted,
        }
    }

    /// Wire name (`approver` / `requester`).
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Approver => "approver",
            Role::Requester => "requester",
        }
    }
}

impl FromStr for Role {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approver" => Ok(Role::Approver),
            "requester" => Ok(Role::Requester),
            other => Err(TypesError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roles() {
        assert_eq!("approver".parse::<Role>().unwrap(), Role::Approver);
        assert_eq!("requester".parse::<Role>().unwrap(), Role::Requester);
        assert!("Approver".parse::<Role>().is_err());
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn outbound_and_inbound_kinds_pair_up() {
        // What a requester sends is what an approver receives, and vice versa.
        assert_eq!(Role::Requester.outbound_kind(), Role::Approver.inbound_kind());
        assert_eq!(Role::Approver.outbound_kind(), Role::Requester.inbound_kind());
    }

    #[test]
    fn serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Approver).unwrap(), "\"approver\"");
        let role: Role = serde_json::from_str("\"requester\"").unwrap();
        assert_eq!(role, Role::Requester);
    }
}
