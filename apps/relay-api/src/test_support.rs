//! Unit-test helpers.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::hub::registry::HubHandle;
use crate::push::ExpoPushClient;
use crate::storage::MemoryObjectStore;
use crate::store::MemoryStore;
use crate::AppState;

/// Build an [`AppState`] over an in-memory store. The database pool is lazy
/// and points nowhere; tests that reach it must not.
pub fn test_state_with_store(store: MemoryStore) -> AppState {
    let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<
        diesel_async::AsyncPgConnection,
    >::new("postgres://unused/unused");
    let db = diesel_async::pooled_connection::deadpool::Pool::builder(manager)
        .max_size(1)
        .build()
        .expect("pool builder");

    let (subs_tx, mut subs_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while subs_rx.recv().await.is_some() {} });

    AppState {
        db,
        store: Arc::new(store),
        objects: Arc::new(MemoryObjectStore::new()),
        push: Arc::new(ExpoPushClient::new(None)),
        hub: HubHandle::spawn(subs_tx),
        config: Arc::new(Config {
            database_url: "postgres://unused/unused".to_string(),
            redis_url: "redis://unused".to_string(),
            auth_secret: "test-secret".to_string(),
            instance_id: "ins_test".to_string(),
            port: 0,
            expo_access_token: None,
        }),
    }
}
