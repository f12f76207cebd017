//! In-memory presence registry of connected approver devices.
//!
//! Two-level map: `UserId -> (DeviceId -> DeviceRecord)`. Each user's device
//! set lives under one DashMap shard lock, so mutations for the same user are
//! serialized while different users proceed independently. The registry only
//! mutates its own state; callers publish roster notifications.
//!
//! A record also remembers which approver connections hold it. Several
//! connections may share one device id (a reloaded page opens its new stream
//! before the old one closes); the record outlives all but the last of them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use unlock_types::{ConnectionId, DeviceId, DeviceRecord, UserId};

/// Outcome of [`PresenceRegistry::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    /// The record after the upsert.
    pub record: DeviceRecord,
    /// True if the device was not present before.
    pub created: bool,
}

#[derive(Debug)]
struct Presence {
    record: DeviceRecord,
    owners: HashSet<ConnectionId>,
}

/// Presence registry shared by every connection task and the reaper.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: DashMap<UserId, HashMap<DeviceId, Presence>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a device, stamping it with the current time.
    pub fn upsert(&self, user_id: &UserId, device_id: &DeviceId, device_name: Option<String>) -> Upsert {
        self.upsert_at(user_id, device_id, device_name, Utc::now())
    }

    /// Insert or refresh a device with an explicit timestamp.
    ///
    /// A refresh without a name keeps the previously announced name.
    pub fn upsert_at(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        device_name: Option<String>,
        now: DateTime<Utc>,
    ) -> Upsert {
        self.store(user_id, device_id, device_name, None, now)
    }

    /// Insert or refresh a device on behalf of an open approver connection,
    /// recording the connection as one of its holders.
    pub fn attach(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        device_name: Option<String>,
        connection_id: ConnectionId,
    ) -> Upsert {
        self.store(user_id, device_id, device_name, Some(connection_id), Utc::now())
    }

    fn store(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        device_name: Option<String>,
        owner: Option<ConnectionId>,
        now: DateTime<Utc>,
    ) -> Upsert {
        let mut devices = self.users.entry(user_id.clone()).or_default();

        let (presence, created) = match devices.entry(device_id.clone()) {
            Entry::Occupied(entry) => {
                let presence = entry.into_mut();
                presence.record.last_seen_at = now;
                if device_name.is_some() {
                    presence.record.device_name = device_name;
                }
                (presence, false)
            }
            Entry::Vacant(entry) => {
                let presence = entry.insert(Presence {
                    record: DeviceRecord {
                        device_id: device_id.clone(),
                        device_name,
                        last_seen_at: now,
                    },
                    owners: HashSet::new(),
                });
                (presence, true)
            }
        };
        if let Some(owner) = owner {
            presence.owners.insert(owner);
        }

        Upsert {
            record: presence.record.clone(),
            created,
        }
    }

    /// Delete a device. Returns whether a record was removed.
    ///
    /// The per-user entry is dropped once its device set is empty.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        let mut removed = false;
        self.users.remove_if_mut(user_id, |_, devices| {
            removed = devices.remove(device_id).is_some();
            devices.is_empty()
        });
        removed
    }

    /// Drop `connection_id` as a holder of a device, deleting the record once
    /// no open connection holds it. Returns whether a record was removed.
    pub fn detach(&self, user_id: &UserId, device_id: &DeviceId, connection_id: ConnectionId) -> bool {
        let mut removed = false;
        self.users.remove_if_mut(user_id, |_, devices| {
            let unheld = devices.get_mut(device_id).is_some_and(|presence| {
                presence.owners.remove(&connection_id);
                presence.owners.is_empty()
            });
            if unheld {
                removed = devices.remove(device_id).is_some();
            }
            devices.is_empty()
        });
        removed
    }

    /// Delete a device only if it is still stale at `now`.
    ///
    /// Used by the reaper so a heartbeat that lands between listing and
    /// removal keeps the device alive.
    pub fn remove_if_stale(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        let mut removed = false;
        self.users.remove_if_mut(user_id, |_, devices| {
            let stale = devices
                .get(device_id)
                .is_some_and(|presence| is_stale(&presence.record, now, timeout));
            if stale {
                removed = devices.remove(device_id).is_some();
            }
            devices.is_empty()
        });
        removed
    }

    /// Snapshot of a user's devices, ordered by device id.
    pub fn list(&self, user_id: &UserId) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .users
            .get(user_id)
            .map(|devices| devices.values().map(|p| p.record.clone()).collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Every `(user, device)` whose silence exceeds `timeout`. Does not mutate.
    pub fn list_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<(UserId, DeviceId)> {
        let mut stale = Vec::new();
        for entry in self.users.iter() {
            for presence in entry.value().values() {
                if is_stale(&presence.record, now, timeout) {
                    stale.push((entry.key().clone(), presence.record.device_id.clone()));
                }
            }
        }
        stale
    }

    /// Whether a device is currently present.
    pub fn contains(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.users
            .get(user_id)
            .is_some_and(|devices| devices.contains_key(device_id))
    }

    /// Number of users with at least one device online.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of devices online across all users.
    pub fn device_count(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }
}

/// `now - last_seen_at > timeout`. Records stamped in the future are fresh.
fn is_stale(record: &DeviceRecord, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(record.last_seen_at)
        .to_std()
        .map(|age| age > timeout)
        .unwrap_or(false)
}
