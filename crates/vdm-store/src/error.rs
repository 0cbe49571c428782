use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A row keyed by machine id was expected and absent. Deleting an
    /// assignment/secret/registry row that does not exist is always this
    /// error, never a silent no-op — it implies backend/store drift.
    #[error("no {table} row for machine {machine_id}")]
    RowNotFound {
        table: &'static str,
        machine_id: String,
    },

    /// A machine id was inserted twice. The assignment table holds each
    /// machine id at most once.
    #[error("machine {0} is already recorded")]
    Duplicate(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
