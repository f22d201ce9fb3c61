//! HTTP handlers for the control API.
//!
//! Every handler answers JSON. Failures carry `success: false`, the error
//! message and its kind, with a status code chosen by kind.

use crate::components::ComponentSpec;
use crate::error::{PanelError, Result};
use crate::panel::Panel;
use crate::pins::{gpio_map, PeripheralMode, PinId, PinMode};
use crate::web::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::InvalidPin(_)
            | PanelError::UnsupportedMode { .. }
            | PanelError::InvalidArgument(_)
            | PanelError::UnknownComponent(_)
            | PanelError::Config(_)
            | PanelError::Json(_) => StatusCode::BAD_REQUEST,
            PanelError::OwnershipConflict { .. } => StatusCode::CONFLICT,
            PanelError::ComponentNotFound(_) => StatusCode::NOT_FOUND,
            PanelError::HardwareFailure(_)
            | PanelError::ComponentFailure { .. }
            | PanelError::WebServer(_)
            | PanelError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult = Result<Json<Value>>;

/// Accepts `true`/`false` as well as `1`/`0`.
fn level(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(PanelError::invalid_argument("state must be 0 or 1")),
        },
        _ => Err(PanelError::invalid_argument("state must be a boolean or 0/1")),
    }
}

/// Body of `GET /api/pins`, also pushed to WebSocket clients.
pub async fn pins_body(panel: &Panel) -> Value {
    let snapshot = panel.sample();
    json!({
        "timestamp": snapshot.timestamp,
        "pins": snapshot.pins,
        "gpio_map": gpio_map(),
        "clock_enabled": panel.clock_enabled().await,
        "backend": panel.registry().backend_name(),
    })
}

pub async fn get_pins(State(state): State<AppState>) -> Json<Value> {
    Json(pins_body(&state.panel).await)
}

#[derive(Debug, Deserialize)]
pub struct SetPinRequest {
    state: Value,
}

pub async fn set_pin(
    State(state): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<SetPinRequest>,
) -> ApiResult {
    let pin = PinId::new(pin)?;
    let high = level(&body.state)?;
    state.panel.set_state(pin, high).await?;
    Ok(Json(json!({"success": true, "pin": pin, "state": high})))
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    mode: String,
}

pub async fn set_mode(
    State(state): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<ModeRequest>,
) -> ApiResult {
    let pin = PinId::new(pin)?;
    let mode: PinMode = body.mode.parse()?;
    state.panel.set_mode(pin, mode).await?;
    let record = state.panel.registry().record(pin);
    Ok(Json(json!({"success": true, "pin": pin, "mode": mode, "state": record.state})))
}

#[derive(Debug, Deserialize)]
pub struct FlashRequest {
    enabled: bool,
    /// Period in milliseconds
    speed: Option<u64>,
}

pub async fn set_flash(
    State(state): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<FlashRequest>,
) -> ApiResult {
    let pin = PinId::new(pin)?;
    if body.enabled {
        let period = body.speed.map(Duration::from_millis);
        state.panel.start_flash(pin, period).await?;
    } else {
        state.panel.stop_flash(pin).await;
    }
    let record = state.panel.registry().record(pin);
    Ok(Json(json!({
        "success": true,
        "pin": pin,
        "flashing": record.flashing,
        "speed": record.flash_period_ms,
    })))
}

pub async fn read_pin(State(state): State<AppState>, Path(pin): Path<u8>) -> ApiResult {
    let pin = PinId::new(pin)?;
    let high = state.panel.read_pin(pin)?;
    Ok(Json(json!({"success": true, "pin": pin, "state": high})))
}

pub async fn set_peripheral(
    State(state): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<ModeRequest>,
) -> ApiResult {
    let pin = PinId::new(pin)?;
    let mode: PeripheralMode = body.mode.parse()?;
    let moved = state.panel.set_peripheral(pin, mode).await?;
    Ok(Json(json!({"success": true, "pin": pin, "mode": mode, "pins": moved})))
}

pub async fn reset_all(State(state): State<AppState>) -> ApiResult {
    state.panel.reset_all().await?;
    Ok(Json(json!({"success": true})))
}

pub async fn get_clock(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"enabled": state.panel.clock_enabled().await}))
}

#[derive(Debug, Deserialize)]
pub struct ClockRequest {
    enabled: bool,
}

pub async fn set_clock(State(state): State<AppState>, Json(body): Json<ClockRequest>) -> ApiResult {
    if body.enabled {
        state.panel.enable_clock().await?;
    } else {
        state.panel.disable_clock().await;
    }
    Ok(Json(json!({"success": true, "enabled": state.panel.clock_enabled().await})))
}

pub async fn component_types(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"types": state.panel.component_types()}))
}

pub async fn list_components(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"components": state.panel.components().await}))
}

pub async fn assign_component(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let spec: ComponentSpec = serde_json::from_value(body)?;
    let metadata = state.panel.assign_component(spec).await?;
    Ok(Json(json!({"success": true, "component": metadata})))
}

pub async fn get_component(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let metadata = state.panel.component(&name).await?;
    Ok(Json(json!({"success": true, "component": metadata})))
}

pub async fn remove_component(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.panel.remove_component(&name).await?;
    Ok(Json(json!({"success": true, "name": name})))
}

pub async fn component_data(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let reading = state.panel.component_data(&name).await?;
    Ok(Json(json!({"success": true, "name": name, "data": reading})))
}

pub async fn write_component(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    state.panel.write_component(&name, body).await?;
    Ok(Json(json!({"success": true, "name": name})))
}

pub async fn test_component(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let passed = state.panel.test_component(&name).await?;
    Ok(Json(json!({"success": true, "name": name, "passed": passed})))
}

pub async fn save_layout(State(state): State<AppState>) -> ApiResult {
    let path = &state.config.layout_path;
    let layout = state.panel.save_layout(path).await?;
    Ok(Json(json!({"success": true, "path": path, "layout": layout})))
}

pub async fn load_layout(State(state): State<AppState>) -> ApiResult {
    let path = &state.config.layout_path;
    let report = state.panel.load_layout(path).await?;
    Ok(Json(json!({"success": report.is_clean(), "path": path, "report": report})))
}

pub async fn version(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.panel.registry().backend_name(),
    }))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "pinboard",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.panel.registry().backend_name(),
        "websocket_clients": state.clients.read().await.len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Serve `index.html` from the configured static directory.
pub async fn serve_index(State(state): State<AppState>) -> std::result::Result<Html<String>, StatusCode> {
    let Some(dir) = &state.config.static_path else {
        return Ok(Html(DEFAULT_INDEX_HTML.to_string()));
    };
    let path = std::path::Path::new(dir).join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Html(content)),
        Err(e) => {
            error!("Failed to read {}: {}", path.display(), e);
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Built-in panel page used when no static directory is configured.
pub async fn default_index() -> Html<&'static str> {
    Html(DEFAULT_INDEX_HTML)
}

const DEFAULT_INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>pinboard</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #1e2228;
            color: #e6e6e6;
            margin: 0;
            padding: 20px;
        }
        h1 { margin: 0 0 4px 0; }
        .sub { opacity: 0.7; margin-bottom: 20px; }
        .bar { margin-bottom: 16px; }
        .bar button { margin-right: 8px; }
        .header {
            display: grid;
            grid-template-columns: repeat(2, minmax(240px, 320px));
            gap: 6px;
        }
        .pin {
            display: flex;
            justify-content: space-between;
            align-items: center;
            background: #2b3038;
            border-radius: 6px;
            padding: 6px 10px;
        }
        .pin .num { font-weight: bold; width: 28px; }
        .pin .label { flex: 1; }
        .pin.high { background: #2f6b3a; }
        .pin.flash { outline: 2px solid #d9a400; }
        .pin.periph { background: #3b3563; }
        .pin .owner { font-size: 0.8em; opacity: 0.7; margin-right: 6px; }
        button {
            background: #444c58;
            color: inherit;
            border: none;
            border-radius: 4px;
            padding: 3px 8px;
            cursor: pointer;
        }
        #error { color: #ff6b6b; min-height: 1.2em; }
    </style>
</head>
<body>
    <h1>pinboard</h1>
    <div class="sub">Raspberry Pi GPIO control panel · <span id="backend"></span></div>
    <div class="bar">
        <button onclick="post('/api/reset', {})">Reset all</button>
        <button id="clock" onclick="toggleClock()">Clock</button>
    </div>
    <div id="error"></div>
    <div class="header" id="header"></div>
    <script>
        let clockOn = false;

        async function post(url, body) {
            const res = await fetch(url, {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify(body)
            });
            const data = await res.json();
            document.getElementById('error').textContent = data.success === false ? data.error : '';
            refresh();
            return data;
        }

        function toggleClock() {
            post('/api/clock', {enabled: !clockOn});
        }

        function render(data) {
            clockOn = data.clock_enabled;
            document.getElementById('backend').textContent = data.backend;
            document.getElementById('clock').textContent = clockOn ? 'Clock off' : 'Clock on';
            const header = document.getElementById('header');
            header.innerHTML = '';
            Object.values(data.pins).forEach(p => {
                const el = document.createElement('div');
                el.className = 'pin' + (p.state ? ' high' : '') + (p.flashing ? ' flash' : '') +
                    (p.peripheral_mode !== 'GPIO' ? ' periph' : '');
                const owner = p.owner ? p.owner.kind + (p.owner.name ? ':' + p.owner.name : '') : '';
                el.innerHTML = `<span class="num">${p.pin}</span>` +
                    `<span class="label">${p.label} · ${p.peripheral_mode === 'GPIO' ? p.mode : p.peripheral_mode}</span>` +
                    `<span class="owner">${owner}</span>`;
                if (p.peripheral_mode === 'GPIO') {
                    const toggle = document.createElement('button');
                    toggle.textContent = p.state ? 'HIGH' : 'LOW';
                    toggle.onclick = () => post(`/api/pin/${p.pin}/set`, {state: !p.state});
                    const flash = document.createElement('button');
                    flash.textContent = p.flashing ? 'stop' : 'flash';
                    flash.onclick = () => post(`/api/pin/${p.pin}/flash`, {enabled: !p.flashing});
                    el.appendChild(toggle);
                    el.appendChild(flash);
                }
                header.appendChild(el);
            });
        }

        function refresh() {
            fetch('/api/pins')
                .then(res => res.json())
                .then(render)
                .catch(error => console.error('Failed to fetch pins:', error));
        }

        refresh();
        setInterval(refresh, 1000);
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert!(level(&json!(true)).unwrap());
        assert!(!level(&json!(0)).unwrap());
        assert!(level(&json!(1)).unwrap());
        assert!(level(&json!(2)).is_err());
        assert!(level(&json!("high")).is_err());
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (PanelError::InvalidPin(4), StatusCode::BAD_REQUEST),
            (PanelError::ownership_conflict(7, "clock"), StatusCode::CONFLICT),
            (PanelError::ComponentNotFound("x".into()), StatusCode::NOT_FOUND),
            (PanelError::hardware_failure("gone"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
