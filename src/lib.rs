pub mod config;
pub mod error;
pub mod presence;
pub mod status;

use axum::{extract::FromRef, http::Method, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};

use presence::Presence;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub presence: Presence,
}

impl AppState {
    pub fn new(presence: Presence) -> Self {
        Self { presence }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/", get(status::index))
        .route("/health", get(status::health))
        .merge(presence::router())
        .fallback(status::not_found)
        .with_state(state)
        .layer(cors)
}
