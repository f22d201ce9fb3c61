//! HTTP control surface: REST endpoints, WebSocket snapshot push and the
//! built-in panel page.

pub mod config;
pub mod handlers;
pub mod router;
pub mod websocket;

// Re-export commonly used items
pub use config::WebConfig;
pub use router::create_app;

use crate::error::{PanelError, Result};
use crate::panel::Panel;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::info;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub panel: Arc<Panel>,
    pub config: Arc<WebConfig>,
    /// Serialized snapshots pushed to WebSocket clients
    pub snapshots: broadcast::Sender<String>,
    pub clients: Arc<RwLock<HashMap<String, websocket::Client>>>,
    /// One permit per allowed WebSocket connection
    pub connections: Arc<Semaphore>,
}

impl AppState {
    pub fn new(panel: Arc<Panel>, config: WebConfig) -> Self {
        let (snapshots, _) = broadcast::channel(16);
        let connections = Arc::new(Semaphore::new(config.max_websocket_connections));
        Self {
            panel,
            config: Arc::new(config),
            snapshots,
            clients: Arc::new(RwLock::new(HashMap::new())),
            connections,
        }
    }

    /// Reserve a WebSocket connection slot.
    ///
    /// The slot is held until the permit is dropped, so a client counts
    /// against the limit from the moment its upgrade is accepted.
    pub fn reserve_connection(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.connections).try_acquire_owned().ok()
    }
}

/// Serve the control panel until `shutdown` resolves.
///
/// The panel itself is left running; callers shut it down once this
/// returns.
pub async fn start_web_server(
    config: WebConfig,
    panel: Arc<Panel>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = config
        .bind_address()
        .parse::<SocketAddr>()
        .map_err(|e| PanelError::config_error(format!("Invalid bind address: {}", e)))?;

    let state = AppState::new(panel, config);
    let publisher = websocket::spawn_publisher(
        Arc::clone(&state.panel),
        state.snapshots.clone(),
        Duration::from_millis(state.config.snapshot_interval_ms),
    );
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PanelError::web_server_error(format!("Failed to bind to address: {}", e)))?;

    info!("Starting pinboard web server on http://{}", addr);
    info!("Panel available at http://{}/", addr);
    info!("API endpoint: http://{}/api/pins", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PanelError::web_server_error(format!("Server error: {}", e)));

    publisher.abort();
    info!("Web server stopped");
    served
}
