use sqlx::SqlitePool;
use sqlx::error::ErrorKind;

use crate::error::{Result, StoreError};

/// One row of the `assignments` table: the persistent mapping from machine
/// id to an optional owning user. A null user means "free / pooled".
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Assignment {
    pub machine_id: String,
    pub user_id: Option<String>,
}

/// Repository over the assignment record.
///
/// All ownership mutations go through the conditional-update discipline:
/// rows are never read and then blindly written.
#[derive(Clone)]
pub struct AssignmentStore {
    pool: SqlitePool,
}

impl AssignmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Machine currently assigned to `user_id`, if any.
    pub async fn find_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT machine_id FROM assignments WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    /// Atomically claim one free machine for `user_id`.
    ///
    /// The update is a single conditional statement: it selects a candidate
    /// free row and flips its user from null to `user_id` in one go, so two
    /// concurrent claimants can never both win the same row. `None` means no
    /// free row existed at statement time (including the case where another
    /// claimant just took the last one).
    #[tracing::instrument(skip(self))]
    pub async fn claim_free(&self, user_id: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE assignments SET user_id = ?
            WHERE user_id IS NULL
              AND machine_id = (
                  SELECT machine_id FROM assignments
                  WHERE user_id IS NULL
                  ORDER BY machine_id
                  LIMIT 1
              )
            RETURNING machine_id
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(machine_id) = &id {
            tracing::debug!(machine_id, user_id, "claimed free machine");
        }
        Ok(id)
    }

    /// Record a freshly created machine as free / pooled.
    pub async fn insert_free(&self, machine_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO assignments (machine_id) VALUES (?)")
            .bind(machine_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(d) if matches!(d.kind(), ErrorKind::UniqueViolation) => {
                    StoreError::Duplicate(machine_id.to_string())
                }
                _ => StoreError::Sqlx(e),
            })?;
        Ok(())
    }

    /// Delete a machine's assignment row. Missing row is an error: the
    /// caller believed the machine was tracked and it was not.
    pub async fn remove(&self, machine_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM assignments WHERE machine_id = ?")
            .bind(machine_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "assignments",
                machine_id: machine_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn get(&self, machine_id: &str) -> Result<Option<Assignment>> {
        let row = sqlx::query_as::<_, Assignment>(
            "SELECT machine_id, user_id FROM assignments WHERE machine_id = ?",
        )
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list(&self) -> Result<Vec<Assignment>> {
        let rows = sqlx::query_as::<_, Assignment>(
            "SELECT machine_id, user_id FROM assignments ORDER BY machine_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// True iff no assignment row currently has a null user.
    pub async fn pool_empty(&self) -> Result<bool> {
        let free: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM assignments WHERE user_id IS NULL LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(free.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_pool;

    #[tokio::test]
    async fn test_insert_and_claim() {
        let store = AssignmentStore::new(create_test_pool().await);
        store.insert_free("srv-1").await.unwrap();
        assert!(!store.pool_empty().await.unwrap());

        let claimed = store.claim_free("alice").await.unwrap();
        assert_eq!(claimed.as_deref(), Some("srv-1"));
        assert!(store.pool_empty().await.unwrap());
        assert_eq!(
            store.find_for_user("alice").await.unwrap().as_deref(),
            Some("srv-1")
        );
    }

    #[tokio::test]
    async fn test_claim_on_empty_pool_returns_none() {
        let store = AssignmentStore::new(create_test_pool().await);
        assert!(store.claim_free("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_free_row_two_claimants_one_winner() {
        let store = AssignmentStore::new(create_test_pool().await);
        store.insert_free("srv-1").await.unwrap();

        let (a, b) = tokio::join!(store.claim_free("alice"), store.claim_free("bob"));
        let wins = [a.unwrap(), b.unwrap()];
        assert_eq!(wins.iter().filter(|w| w.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = AssignmentStore::new(create_test_pool().await);
        store.insert_free("srv-1").await.unwrap();
        let err = store.insert_free("srv-1").await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_remove_missing_row_is_error() {
        let store = AssignmentStore::new(create_test_pool().await);
        let err = store.remove("srv-404").await.unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_clears_lookup() {
        let store = AssignmentStore::new(create_test_pool().await);
        store.insert_free("srv-1").await.unwrap();
        store.remove("srv-1").await.unwrap();
        assert!(store.get("srv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_assigned_rows() {
        let store = AssignmentStore::new(create_test_pool().await);
        store.insert_free("srv-1").await.unwrap();
        store.insert_free("srv-2").await.unwrap();
        store.claim_free("alice").await.unwrap();

        let second = store.claim_free("bob").await.unwrap().unwrap();
        let third = store.claim_free("carol").await.unwrap();
        assert_ne!(
            Some(second.as_str()),
            store.find_for_user("alice").await.unwrap().as_deref()
        );
        assert!(third.is_none());
    }
}
