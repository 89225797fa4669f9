use crate::{
    handlers, // Import handlers module
    AppState,
};
use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Creates the Axum router and associates routes with handlers.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/memes", get(handlers::list_memes).post(handlers::upload_meme))
        .route("/memes/{id}", get(handlers::get_meme))
        .route("/memes/{id}/comments", get(handlers::list_comments))
        .route("/users/{username}/memes", get(handlers::list_user_memes))
        .route("/me/memes", get(handlers::list_own_memes))
        .route("/templates", get(handlers::list_templates))
        .route("/resources/images/{id}", get(handlers::get_image))
        .route("/resources/templates/{id}", get(handlers::get_template_image))
        // Middleware Layers
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
