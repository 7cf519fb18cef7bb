pub mod analytics;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod health;
pub mod moderation;
pub mod rooms;

mod appresult;

use std::sync::Arc;

use axum::{extract::FromRef, http::HeaderValue, Router};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

pub use appresult::{AppError, AppResult};

use auth::Auth;
use clock::{Clock, SystemClock};
use config::Config;
use db::PersistenceStore;
use moderation::{AbuseTracker, ToxicityClassifier};
use rooms::{BroadcastRouter, ConnectionRegistry};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn PersistenceStore>,
    pub auth: Auth,
    pub classifier: Arc<dyn ToxicityClassifier>,
    pub abuse: Arc<AbuseTracker>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<BroadcastRouter>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn PersistenceStore>,
        auth: Auth,
        classifier: Arc<dyn ToxicityClassifier>,
    ) -> AppState {
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&store)));
        AppState {
            abuse: Arc::new(AbuseTracker::with_store(config.mute_policy, Arc::clone(&store))),
            router: Arc::new(BroadcastRouter::new(Arc::clone(&registry))),
            config: Arc::new(config),
            store,
            auth,
            classifier,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> AppState {
        self.clock = clock;
        self
    }
}

pub fn app(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(rooms::ws_router())
        .nest("/chat", rooms::router())
        .nest("/analytics", analytics::router())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
