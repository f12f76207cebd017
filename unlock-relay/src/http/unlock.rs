//! Unlock endpoints: push stream, message send, heartbeat, roster.
//!
//! The caller's user id always comes from [`AuthUser`], never from the
//! query string or body.

use crate::auth::AuthUser;
use crate::error::{RelayError, Result};
use crate::server::UnlockRelay;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use unlock_types::{DeviceId, DeviceRecord, Role, RosterEvent};

/// Query of `GET /api/unlock/stream`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    /// The caller's own device id.
    pub device_id: Option<String>,
    /// `approver` or `requester`.
    pub role: Option<String>,
    /// Display name, approvers only.
    pub device_name: Option<String>,
}

/// Query of `POST /api/unlock/message`.
#[derive(Debug, Default, Deserialize)]
pub struct RoleQuery {
    /// `approver` or `requester`.
    pub role: Option<String>,
}

/// Body of `POST /api/unlock/message`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target device id.
    pub device_id: Option<String>,
    /// Opaque payload delivered as-is.
    #[serde(default)]
    pub message: Value,
}

/// Body of `POST /api/unlock/heartbeat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// The approver's own device id.
    pub device_id: Option<String>,
    /// Display name.
    pub device_name: Option<String>,
}

/// Response of `POST /api/unlock/heartbeat`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// The refreshed record.
    pub device: DeviceRecord,
}

fn required_device_id(value: Option<String>) -> Result<DeviceId> {
    let raw = value.ok_or_else(|| RelayError::invalid("deviceId is required"))?;
    Ok(DeviceId::new(raw)?)
}

fn required_role(value: Option<String>) -> Result<Role> {
    let raw = value.ok_or_else(|| RelayError::invalid("role is required"))?;
    Ok(raw.parse::<Role>()?)
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| RelayError::invalid(rejection.body_text()))
}

fn query_params<T>(query: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| RelayError::invalid(rejection.body_text()))
}

/// `GET /api/unlock/stream`: open a push stream as server-sent events.
///
/// Each event's `data` is the JSON payload of one stream item.
pub async fn stream_handler(
    AuthUser(user_id): AuthUser,
    Extension(relay): Extension<Arc<UnlockRelay>>,
    query: std::result::Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let query = query_params(query)?;
    let device_id = required_device_id(query.device_id)?;
    let role = required_role(query.role)?;

    let stream = relay.open_session(user_id, role, device_id, query.device_name)?;
    let keepalive = Duration::from_secs(relay.config().stream.keepalive_secs.max(1));

    let events = stream.map(|item| Event::default().json_data(item.data));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(keepalive)))
}

/// `POST /api/unlock/message?role=`: relay a message to a device of the
/// caller's own user.
///
/// Always 204 once accepted, whether or not the target is connected.
pub async fn send_handler(
    AuthUser(user_id): AuthUser,
    Extension(relay): Extension<Arc<UnlockRelay>>,
    query: std::result::Result<Query<RoleQuery>, QueryRejection>,
    body: std::result::Result<Json<SendRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let role = required_role(query_params(query)?.role)?;
    let request = json_body(body)?;
    let target = required_device_id(request.device_id)?;

    relay.send(&user_id, role, target, request.message)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/unlock/heartbeat`: explicit presence refresh from an approver.
pub async fn heartbeat_handler(
    AuthUser(user_id): AuthUser,
    Extension(relay): Extension<Arc<UnlockRelay>>,
    body: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>> {
    let request = json_body(body)?;
    let device_id = required_device_id(request.device_id)?;

    let device = relay.heartbeat(&user_id, device_id, request.device_name)?;
    Ok(Json(HeartbeatResponse { device }))
}

/// `GET /api/unlock/approvers`: the caller's current roster.
pub async fn approvers_handler(
    AuthUser(user_id): AuthUser,
    Extension(relay): Extension<Arc<UnlockRelay>>,
) -> Json<RosterEvent> {
    Json(RosterEvent::approvers(relay.approvers(&user_id)))
}
