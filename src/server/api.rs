//! Device registration, status, usage, and command endpoints.
//!
//! All per-device endpoints authenticate with the device's own bearer token:
//! `Authorization: Bearer bw_...`. Dashboard user accounts are an external
//! collaborator; the token is the only principal the data plane knows.
//!
//! | Method | Path                         | Auth   | Description                    |
//! |--------|------------------------------|--------|--------------------------------|
//! | POST   | `/api/register`              | No     | Register a device, issue token |
//! | GET    | `/api/status`                | No     | Tunnel registry snapshot       |
//! | GET    | `/api/usage`                 | Bearer | Monthly bandwidth usage        |
//! | GET    | `/api/devices/{id}`          | Bearer | Device snapshot + live metrics |
//! | POST   | `/api/devices/{id}/exec`     | Bearer | Run a shell command remotely   |
//! | POST   | `/api/devices/{id}/reboot`   | Bearer | Fire-and-forget reboot         |
//! | POST   | `/api/devices/{id}/tunnel`   | Bearer | Toggle request forwarding      |

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::server::tunnel::TunnelError;
use crate::store::{format_bytes, Device};
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

fn unix_secs(t: std::time::SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({"success": false, "error": message})))
}

/// Resolve the `Authorization: Bearer` token to a device.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Device, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "Missing or invalid Authorization header",
            )
        })?;

    state
        .store
        .lookup_by_token(token)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Invalid token"))
}

/// As [`authenticate`], additionally requiring the token to belong to the
/// device named in the path.
fn authenticate_for(
    state: &AppState,
    headers: &HeaderMap,
    device_id: &str,
) -> Result<Device, ApiError> {
    let device = authenticate(state, headers)?;
    if device.id != device_id {
        return Err(api_error(StatusCode::NOT_FOUND, "Device not found"));
    }
    Ok(device)
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub subdomain: String,
}

/// `POST /api/register` — create a device. The raw token appears in this
/// response and nowhere else.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.subdomain.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "subdomain is required"));
    }

    let (device, token) = state
        .store
        .create_device(&req.subdomain)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e))?;

    info!(subdomain = %device.subdomain, "Device registered");

    let domain = &state.config.server.base_domain;
    Ok(Json(json!({
        "success": true,
        "token": token,
        "subdomain": device.subdomain,
        "url": format!("https://{}.{domain}", device.subdomain),
    })))
}

/// `GET /api/status` — registry snapshot.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tunnels": state.registry.stats(),
    }))
}

/// `GET /api/usage` — monthly bandwidth for the authenticated device.
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let device = authenticate(&state, &headers)?;
    let usage = state.store.monthly_usage(&device.id);
    let limit = state.store.bandwidth_limit(&device.id);
    let total = usage.total();

    #[allow(clippy::cast_precision_loss)]
    let percent_used = total as f64 / limit as f64 * 100.0;

    Ok(Json(json!({
        "subdomain": device.subdomain,
        "tier": device.tier,
        "month": usage.month,
        "bytes_in": usage.bytes_in,
        "bytes_out": usage.bytes_out,
        "bytes_total": total,
        "limit": limit,
        "limit_human": format_bytes(limit),
        "used_human": format_bytes(total),
        "percent_used": percent_used,
    })))
}

/// `GET /api/devices/{id}` — device snapshot, with the tunnel's last metrics
/// report when the device is online.
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate_for(&state, &headers, &device_id)?;
    // Re-read for the current online flag rather than the token snapshot.
    let device = state
        .store
        .lookup_by_id(&device_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Device not found"))?;

    let usage = state.store.monthly_usage(&device.id);
    let domain = &state.config.server.base_domain;
    let mut resp = json!({
        "id": device.id,
        "subdomain": device.subdomain,
        "url": format!("https://{}.{domain}", device.subdomain),
        "tier": device.tier,
        "is_online": device.online,
        "tunnel_enabled": device.tunnel_enabled,
        "created_at": unix_secs(device.created_at),
        "bytes_in": usage.bytes_in,
        "bytes_out": usage.bytes_out,
        "bytes_total": usage.total(),
        "limit": state.store.bandwidth_limit(&device.id),
    });
    if let Some(last_seen) = device.last_seen_at {
        resp["last_seen_at"] = json!(unix_secs(last_seen));
    }

    if device.online {
        if let Some(tunnel) = state.registry.get(&device.subdomain) {
            if let Some((metrics, _at)) = tunnel.metrics() {
                resp["metrics"] = serde_json::to_value(metrics).expect("metrics serializes");
            }
        }
    }

    Ok(Json(resp))
}

#[derive(Deserialize)]
pub struct ExecRequest {
    pub shell: String,
    #[serde(default)]
    pub dry_run: bool,
}

/// `POST /api/devices/{id}/exec` — run a shell command on the device and wait
/// for the correlated result.
pub async fn exec(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ExecRequest>,
) -> Result<Json<Value>, ApiError> {
    let device = authenticate_for(&state, &headers, &device_id)?;
    if req.shell.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "shell is required"));
    }

    let tunnel = state
        .registry
        .get(&device.subdomain)
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Device is offline"))?;

    match tunnel.exec(req.shell, req.dry_run).await {
        Ok(reply) => Ok(Json(json!({
            "exit_code": reply.exit_code,
            "output": String::from_utf8_lossy(&reply.output),
            "error": reply.error,
        }))),
        Err(TunnelError::Timeout) => Err(api_error(
            StatusCode::GATEWAY_TIMEOUT,
            "Device did not respond in time",
        )),
        Err(e) => Err(api_error(StatusCode::BAD_GATEWAY, &e.to_string())),
    }
}

/// `POST /api/devices/{id}/reboot` — fire-and-forget reboot.
pub async fn reboot(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let device = authenticate_for(&state, &headers, &device_id)?;

    let tunnel = state
        .registry
        .get(&device.subdomain)
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Device is offline"))?;

    tunnel
        .reboot()
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, &e.to_string()))?;

    info!(subdomain = %device.subdomain, "Reboot command sent");
    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize)]
pub struct TunnelToggleRequest {
    pub enabled: bool,
}

/// `POST /api/devices/{id}/tunnel` — enable or disable public forwarding.
///
/// Live tunnels snapshot the flag at auth time, so a change applies from the
/// device's next connection.
pub async fn set_tunnel_enabled(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TunnelToggleRequest>,
) -> Result<Json<Value>, ApiError> {
    authenticate_for(&state, &headers, &device_id)?;
    state.store.set_tunnel_enabled(&device_id, req.enabled);
    info!(device = %&device_id[..8.min(device_id.len())], enabled = req.enabled, "Tunnel forwarding toggled");
    Ok(Json(json!({"success": true})))
}
