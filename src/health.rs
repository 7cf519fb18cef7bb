use std::sync::Arc;

use axum::{debug_handler, extract::State, routing::get, Json, Router};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{config::Config, rooms::ConnectionRegistry, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/stats", get(stats))
}

#[derive(Serialize)]
struct About {
    name: String,
    version: String,
}

#[debug_handler(state = AppState)]
async fn root(State(config): State<Arc<Config>>) -> Json<About> {
    Json(About {
        name: config.app_name.clone(),
        version: config.app_version.clone(),
    })
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    name: String,
    version: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

#[debug_handler(state = AppState)]
async fn health(State(config): State<Arc<Config>>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        name: config.app_name.clone(),
        version: config.app_version.clone(),
        timestamp: OffsetDateTime::now_utc(),
    })
}

#[derive(Serialize)]
struct Stats {
    active_connections: usize,
    active_rooms: usize,
}

#[debug_handler(state = AppState)]
async fn stats(State(registry): State<Arc<ConnectionRegistry>>) -> Json<Stats> {
    Json(Stats {
        active_connections: registry.total_connections(),
        active_rooms: registry.room_count(),
    })
}
