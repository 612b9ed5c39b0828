pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod jobs;
pub mod models;
pub mod push;
pub mod storage;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use config::Config;
use db::pool::DbPool;
use hub::registry::HubHandle;
use push::PushProvider;
use storage::ObjectStore;
use store::CoordStore;

/// Shared application state available to connection handlers and jobs.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub store: Arc<dyn CoordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub push: Arc<dyn PushProvider>,
    pub hub: HubHandle,
    pub config: Arc<Config>,
}
