use sqlx::SqlitePool;

use crate::error::{Result, StoreError};

/// A pre-registered machine for the static backend: no control plane, just
/// an address, an in-guest agent port, and fixed administrator credentials.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StaticMachine {
    pub id: String,
    pub name: String,
    pub address: String,
    pub agent_port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct StaticMachineStore {
    pool: SqlitePool,
}

impl StaticMachineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, machine: &StaticMachine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO static_machines (id, name, address, agent_port, username, password)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&machine.id)
        .bind(&machine.name)
        .bind(&machine.address)
        .bind(machine.agent_port)
        .bind(&machine.username)
        .bind(&machine.password)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, machine_id: &str) -> Result<Option<StaticMachine>> {
        let row = sqlx::query_as::<_, StaticMachine>(
            "SELECT id, name, address, agent_port, username, password FROM static_machines WHERE id = ?",
        )
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list(&self) -> Result<Vec<StaticMachine>> {
        let rows = sqlx::query_as::<_, StaticMachine>(
            "SELECT id, name, address, agent_port, username, password FROM static_machines ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn remove(&self, machine_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM static_machines WHERE id = ?")
            .bind(machine_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: "static_machines",
                machine_id: machine_id.to_string(),
            });
        }
        Ok(())
    }
}
