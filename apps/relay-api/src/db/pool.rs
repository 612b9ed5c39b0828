use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncPgConnection>;

/// Pool ceiling. Connection work here is bursty (message inserts, job
/// batches) rather than request-per-connection, so this stays small.
const MAX_CONNECTIONS: usize = 16;

/// Build the async Postgres pool. Connections are established lazily on
/// first checkout.
pub async fn connect(database_url: &str) -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_CONNECTIONS)
        .build()
        .expect("failed to build connection pool");

    tracing::info!(max_size = MAX_CONNECTIONS, "database pool created");

    pool
}
