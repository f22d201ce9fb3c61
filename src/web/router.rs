//! Web application router and middleware setup.

use crate::web::handlers;
use crate::web::websocket;
use crate::web::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Create the axum application with every route and middleware layer.
pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let api = Router::new()
        .route("/api/pins", get(handlers::get_pins))
        .route("/api/pin/:pin/set", post(handlers::set_pin))
        .route("/api/pin/:pin/mode", post(handlers::set_mode))
        .route("/api/pin/:pin/flash", post(handlers::set_flash))
        .route("/api/pin/:pin/read", get(handlers::read_pin))
        .route("/api/pin/:pin/peripheral", post(handlers::set_peripheral))
        .route("/api/reset", post(handlers::reset_all))
        .route("/api/clock", get(handlers::get_clock).post(handlers::set_clock))
        .route("/api/components/types", get(handlers::component_types))
        .route(
            "/api/components",
            get(handlers::list_components).post(handlers::assign_component),
        )
        .route(
            "/api/components/:name",
            get(handlers::get_component).delete(handlers::remove_component),
        )
        .route("/api/components/:name/data", get(handlers::component_data))
        .route("/api/components/:name/write", post(handlers::write_component))
        .route("/api/components/:name/test", post(handlers::test_component))
        .route("/api/config/save", post(handlers::save_layout))
        .route("/api/config/load", post(handlers::load_layout))
        .route("/api/version", get(handlers::version))
        .route("/api/health", get(handlers::health_check))
        .route("/ws", get(websocket::websocket_handler));

    let mut app = match &config.static_path {
        Some(static_path) if PathBuf::from(static_path).exists() => {
            let static_path = PathBuf::from(static_path);
            info!("Serving static files from: {:?}", static_path);
            let app = api.nest_service("/static", ServeDir::new(&static_path));
            if static_path.join("index.html").exists() {
                app.route("/", get(handlers::serve_index))
            } else {
                app.route("/", get(handlers::default_index))
            }
        }
        Some(static_path) => {
            warn!(
                "Static path {:?} does not exist, serving default index",
                static_path
            );
            api.route("/", get(handlers::default_index))
        }
        None => api.route("/", get(handlers::default_index)),
    };

    if config.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{NoopSwitch, SimulatedHardware};
    use crate::panel::{Panel, PanelSettings};
    use crate::pins::PinRegistry;
    use crate::web::WebConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = PinRegistry::new(Box::new(SimulatedHardware::new()), Arc::new(NoopSwitch));
        let panel = Arc::new(Panel::new(registry, PanelSettings::default()));
        create_app(AppState::new(panel, WebConfig::default()))
    }

    #[tokio::test]
    async fn test_index_and_health() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = app()
            .oneshot(Request::get("/api/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
