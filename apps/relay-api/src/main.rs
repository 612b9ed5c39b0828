use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::hub::registry::HubHandle;
use relay_api::hub::{presence, server, subscriber};
use relay_api::jobs::{self, JobContext};
use relay_api::push::{ExpoPushClient, PushProvider};
use relay_api::storage::{MemoryObjectStore, ObjectStore};
use relay_api::store::{CoordStore, RedisStore};
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let db = relay_api::db::pool::connect(&config.database_url).await;

    let store: Arc<dyn CoordStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .expect("failed to connect to redis"),
    );

    // In-memory object store for Phase 1. Replace with the S3 client when
    // media cleanup moves off the media service.
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());

    let push: Arc<dyn PushProvider> =
        Arc::new(ExpoPushClient::new(config.expo_access_token.clone()));

    tracing::info!(instance_id = %config.instance_id, "relay-api configured");

    // Sweep presence left behind by a previous run under this instance id.
    match presence::reconcile_instance(&*store, &config.instance_id).await {
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "presence reconciliation failed"),
    }

    let cancel = CancellationToken::new();

    let (subs_tx, subs_rx) = mpsc::unbounded_channel();
    let hub = HubHandle::spawn(subs_tx);

    {
        let store = store.clone();
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = subscriber::run(store, hub, subs_rx, cancel).await {
                tracing::error!(error = %err, "broker subscriber exited");
            }
        });
    }

    tokio::spawn(presence::heartbeat_loop(
        store.clone(),
        hub.clone(),
        config.instance_id.clone(),
        cancel.clone(),
    ));

    let ctx = JobContext {
        db: db.clone(),
        store: store.clone(),
        objects: objects.clone(),
        push: push.clone(),
        instance_id: config.instance_id.clone(),
    };
    jobs::scheduler::spawn_all(ctx, jobs::registry(), &cancel);

    let state = AppState {
        db,
        store,
        objects,
        push,
        hub,
        config: Arc::new(config),
    };

    let app = Router::new()
        .merge(server::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        })
        .await
        .expect("server error");
}
