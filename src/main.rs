use std::sync::Arc;

use anyhow::Context;
use chatguard::{
    app,
    auth::Auth,
    config::Config,
    db::SqliteStore,
    moderation::{DisabledClassifier, HttpClassifier, ToxicityClassifier},
    AppState,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    let default_filter = if config.debug {
        "chatguard=debug,tower_http=debug"
    } else {
        "chatguard=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?,
    );

    let classifier: Arc<dyn ToxicityClassifier> = match &config.classifier_url {
        Some(url) => {
            tracing::info!(url = %url, "using toxicity classifier");
            Arc::new(HttpClassifier::new(url.as_str())?)
        }
        None => {
            tracing::warn!("CLASSIFIER_URL not set, every message will be scored as safe");
            Arc::new(DisabledClassifier)
        }
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    tracing::info!(
        name = %config.app_name,
        version = %config.app_version,
        addr = %listener.local_addr()?,
        "starting",
    );

    let state = AppState::new(config, store.clone(), Auth(store), classifier);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
