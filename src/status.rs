use axum::{debug_handler, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::presence::Presence;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub users: usize,
}

#[debug_handler]
pub async fn index() -> impl IntoResponse {
    "presence server is running"
}

#[debug_handler(state = crate::AppState)]
pub async fn health(State(presence): State<Presence>) -> Json<Health> {
    Json(Health {
        status: "ok",
        users: presence.online_users(),
    })
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
