//! # unlock-relay
//!
//! Presence and message relay for cross-device unlock approval.
//!
//! This crate implements a relay server that:
//! - Tracks which approver devices of each user are online
//! - Evicts devices that stop sending heartbeats
//! - Pushes roster changes to the user's requester devices
//! - Relays opaque approval requests and grants between devices of the same user
//!
//! ## Architecture
//!
//! ```text
//! Requester ──┐                          ┌── Approver
//!   (SSE)     │   POST /api/unlock/message   │   (SSE)
//!             ▼                          ▼
//!        ┌─────────────────────────────────────┐
//!        │            unlock-relay             │
//!        │  PresenceRegistry ◄── Reaper        │
//!        │        │                            │
//!        │        ▼                            │
//!        │    EventBus ──► per-stream tasks    │
//!        └─────────────────────────────────────┘
//! ```
//!
//! Nothing is persisted. Presence is rebuilt from heartbeats after a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stream;
