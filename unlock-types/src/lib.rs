//! # unlock-types
//!
//! Shared types for the cross-device unlock relay.
//!
//! This crate provides the types used by the relay and its clients:
//! - [`UserId`], [`DeviceId`], [`ConnectionId`] - Identity types
//! - [`Role`] - Approver or requester
//! - [`DeviceRecord`], [`RosterEvent`] - Presence roster
//! - [`MessageEnvelope`], [`EnvelopeKind`], [`StreamItem`] - Routed messages
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod presence;
mod role;

pub use envelope::{EnvelopeKind, MessageEnvelope, StreamItem};
pub use error::TypesError;
pub use ids::{ConnectionId, DeviceId, UserId};
pub use presence::{DeviceRecord, RosterEvent};
pub use role::Role;
