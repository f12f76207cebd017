//! Health check endpoint.

use crate::server::UnlockRelay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall status: `ok`, or `shutting-down` once shutdown has begun.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of open push streams.
    pub open_streams: u64,
    /// Users with at least one approver online.
    pub users_online: usize,
    /// Approver devices online.
    pub devices_online: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<UnlockRelay>>) -> Json<HealthStatus> {
    let status = if relay.is_shutting_down() {
        "shutting-down"
    } else {
        "ok"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        open_streams: relay.open_streams(),
        users_online: relay.users_online(),
        devices_online: relay.devices_online(),
        uptime_seconds: relay.uptime_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            open_streams: 3,
            users_online: 2,
            devices_online: 5,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"openStreams\":3"));
        assert!(json.contains("\"devicesOnline\":5"));
    }
}
