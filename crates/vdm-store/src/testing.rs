use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::pool::migrate;

/// In-memory pool with the vdm schema applied. Test use only.
///
/// Capped at one connection: an in-memory SQLite database is private to the
/// connection that opened it, so a second pooled connection would see an
/// empty schema.
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
