use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realm_api::config::Config;
use realm_api::db::kv::{KeyValueStore, MemoryStore};
use realm_api::db::redis_store::RedisStore;
use realm_api::gateway::{Hub, HubHandle};
use realm_api::AppState;

const HUB_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the in-memory token store sweeps expired keys.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // A missing .env is fine; variables may come from the environment.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    if let Err(reason) = config.validate() {
        tracing::error!(%reason, "invalid configuration");
        std::process::exit(1);
    }
    let port = config.port;

    let kv: Arc<dyn KeyValueStore> = match config.redis_url.as_deref() {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!("token store: redis");
                Arc::new(store)
            }
            Err(err) => {
                tracing::error!(%err, "failed to connect to redis");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory token store");
            let store = Arc::new(MemoryStore::new());
            spawn_purge_loop(Arc::clone(&store));
            store
        }
    };

    let (hub, hub_task) = Hub::spawn();
    let state = AppState::new(config, kv, hub.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(realm_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "realm-api listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await
    {
        tracing::error!(%err, "server error");
    }

    // Covers a server error exit, where the signal never fired.
    hub.shutdown();
    match tokio::time::timeout(HUB_DRAIN_TIMEOUT, hub_task).await {
        Ok(Err(err)) => tracing::error!(%err, "gateway hub task failed"),
        Err(_) => tracing::warn!("gateway hub did not stop in time"),
        Ok(Ok(())) => {}
    }
    tracing::info!("realm-api stopped");
}

/// Waits for ctrl-c, then stops the hub so open sockets get a close frame
/// instead of holding the server open.
async fn shutdown_signal(hub: HubHandle) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutdown signal received");
    hub.shutdown();
}

/// Expired keys in the in-memory store are otherwise only dropped when read.
fn spawn_purge_loop(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "purged expired token store keys");
            }
        }
    });
}
