//! Shared fixtures for database-backed tests.
//!
//! These suites need a reachable Postgres. `DATABASE_URL` (or the
//! `TEST_DATABASE_URL` override) is read from the environment or the crate's
//! `.env`; when neither is set the tests skip. Point it at a disposable
//! database — the helpers create the tables they need.

use std::sync::Arc;

use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use tokio::sync::mpsc;

use relay_api::config::Config;
use relay_api::db::pool::DbPool;
use relay_api::error::Error;
use relay_api::hub::registry::HubHandle;
use relay_api::jobs::JobContext;
use relay_api::push::ExpoPushClient;
use relay_api::storage::{MemoryObjectStore, ObjectStore};
use relay_api::store::CoordStore;
use relay_api::AppState;

// The advisory lock serializes concurrent test binaries racing the
// `IF NOT EXISTS` creations.
const SCHEMA: &str = r#"
BEGIN;
SELECT pg_advisory_xact_lock(874421);
CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    avatar_key TEXT,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    muted BOOLEAN NOT NULL DEFAULT FALSE,
    joined_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (group_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    message_type INTEGER NOT NULL,
    msg_nonce TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    envelopes JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS device_keys (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    last_seen_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS push_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS push_receipts (
    ticket_id TEXT PRIMARY KEY,
    push_token TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS group_reservations (
    group_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
COMMIT;
"#;

/// Connect to the test database, or `None` when no URL is configured.
pub async fn test_pool() -> Option<DbPool> {
    dotenvy::from_path(format!("{}/.env", env!("CARGO_MANIFEST_DIR"))).ok();
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    let pool = Pool::builder(manager)
        .max_size(4)
        .build()
        .expect("pool builder");

    let mut conn = pool.get().await.expect("test database unreachable");
    conn.batch_execute(SCHEMA).await.expect("schema setup");

    Some(pool)
}

pub fn job_context(
    db: DbPool,
    store: Arc<dyn CoordStore>,
    objects: Arc<dyn ObjectStore>,
) -> JobContext {
    JobContext {
        db,
        store,
        objects,
        push: Arc::new(ExpoPushClient::new(None)),
        instance_id: "ins_test".to_string(),
    }
}

pub fn app_state(db: DbPool, store: Arc<dyn CoordStore>) -> AppState {
    // No subscriber task here; drain its control channel.
    let (subs_tx, mut subs_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while subs_rx.recv().await.is_some() {} });

    AppState {
        db,
        store,
        objects: Arc::new(MemoryObjectStore::new()),
        push: Arc::new(ExpoPushClient::new(None)),
        hub: HubHandle::spawn(subs_tx),
        config: Arc::new(Config {
            database_url: String::new(),
            redis_url: String::new(),
            auth_secret: "db-suite-secret".to_string(),
            instance_id: "ins_test".to_string(),
            port: 0,
            expo_access_token: None,
        }),
    }
}

/// Object storage that refuses every delete.
pub struct BrokenObjectStore;

#[async_trait::async_trait]
impl ObjectStore for BrokenObjectStore {
    async fn delete_prefix(&self, _prefix: &str) -> Result<usize, Error> {
        Err(Error::Store("object storage unavailable".to_string()))
    }
}
