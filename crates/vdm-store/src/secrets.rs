use sqlx::SqlitePool;

use crate::error::{Result, StoreError};

/// Administrator passwords for machines whose backend cannot report them.
///
/// The private-cloud backend sets the password through bootstrap user data
/// and persists it here; its credential lookups read this table.
#[derive(Clone)]
pub struct SecretStore {
    pool: SqlitePool,
}

impl SecretStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, machine_id: &str, password: &str) -> Result<()> {
        sqlx::query("INSERT INTO machine_secrets (id, password) VALUES (?, ?)")
            .bind(machine_id)
            .bind(password)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn password(&self, machine_id: &str) -> Result<Option<String>> {
        let password: Option<String> =
            sqlx::query_scalar("SELECT password FROM machine_secrets WHERE id = ?")
                .bind(machine_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(password)
    }

    /// Missing row is an error, same rule as assignment removal.
    pub async fn remove(&self, machine_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM machine_secrets WHERE id = ?")
            .bind(machine_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "machine_secrets",
                machine_id: machine_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_pool;

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let store = SecretStore::new(create_test_pool().await);
        store.insert("srv-1", "W1nter-Dr4gon+").await.unwrap();
        assert_eq!(
            store.password("srv-1").await.unwrap().as_deref(),
            Some("W1nter-Dr4gon+")
        );
        store.remove("srv-1").await.unwrap();
        assert!(store.password("srv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_error() {
        let store = SecretStore::new(create_test_pool().await);
        let err = store.remove("srv-404").await.unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { .. }));
    }
}
