use crate::{
    handlers::{diagnostics, health_check, list_rooms, metrics, ready_check, room_details, session_details},
    routes::auth_middleware::auth_middleware,
    websocket::websocket_handler,
    ws::hub::CollabHub,
};
use axum::{http::HeaderValue, middleware, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Create API routes
pub fn create_api_routes(hub: Arc<CollabHub>) -> Router {
    let protected = Router::<Arc<CollabHub>>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/rooms", get(list_rooms))
        .route("/v1/rooms/:form_id", get(room_details))
        .route("/v1/sessions/:user_id", get(session_details))
        .route_layer(middleware::from_fn_with_state(hub.clone(), auth_middleware)); // Applies to all routes added above

    Router::<Arc<CollabHub>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/metrics", get(metrics))
        // The socket authenticates itself before the upgrade
        .route("/v1/ws", get(websocket_handler))
        .merge(protected)
        .with_state(hub)
}

/// The full application: API routes, the socket endpoint, CORS and tracing
pub fn create_app(hub: Arc<CollabHub>) -> Router {
    let cors = cors_layer(&hub.config().cors_origin_list());

    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(hub.clone())
        .nest("/api", create_api_routes(hub))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}
