//! Static adapter: no backend control plane at all.
//!
//! Machines are pre-registered rows with fixed addresses and credentials.
//! The only live signal is the in-guest agent, probed over HTTP; power
//! operations are accepted and ignored since nobody can act on them.

use std::net::IpAddr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use vdm_core::{Credentials, MachineAttributes, MachineStatus, MachineType, VmError};
use vdm_store::{AssignmentStore, StaticMachine, StaticMachineStore};

use crate::drivers::store_err;
use crate::{Machine, VmFleet};

/// The single machine class a static registry can offer.
const STATIC_TYPE: &str = "preregistered";

pub struct RegistryFleet {
    http: reqwest::Client,
    statics: StaticMachineStore,
    assignments: AssignmentStore,
}

impl RegistryFleet {
    pub fn open(pool: SqlitePool) -> Result<Self, VmError> {
        Ok(Self {
            http: crate::drivers::http_client()?,
            statics: StaticMachineStore::new(pool.clone()),
            assignments: AssignmentStore::new(pool),
        })
    }

    fn handle(&self, row: StaticMachine) -> Box<dyn Machine> {
        Box::new(RegistryMachine {
            http: self.http.clone(),
            row,
            statics: self.statics.clone(),
            assignments: self.assignments.clone(),
        })
    }

    fn static_type() -> MachineType {
        MachineType {
            id: STATIC_TYPE.to_string(),
            image: STATIC_TYPE.to_string(),
            flavor: STATIC_TYPE.to_string(),
        }
    }
}

#[async_trait]
impl VmFleet for RegistryFleet {
    async fn machines(&self) -> Result<Vec<Box<dyn Machine>>, VmError> {
        let rows = self.statics.list().await.map_err(store_err)?;
        Ok(rows.into_iter().map(|row| self.handle(row)).collect())
    }

    async fn machine(&self, id: &str) -> Result<Box<dyn Machine>, VmError> {
        match self.statics.get(id).await.map_err(store_err)? {
            Some(row) => Ok(self.handle(row)),
            None => Err(VmError::NotFound(id.to_string())),
        }
    }

    async fn create(&self, _attr: MachineAttributes) -> Result<Box<dyn Machine>, VmError> {
        Err(VmError::Unsupported("create"))
    }

    async fn types(&self) -> Result<Vec<MachineType>, VmError> {
        Ok(vec![Self::static_type()])
    }

    async fn machine_type(&self, id: &str) -> Result<MachineType, VmError> {
        if id == STATIC_TYPE {
            Ok(Self::static_type())
        } else {
            Err(VmError::TypeNotFound(id.to_string()))
        }
    }
}

pub struct RegistryMachine {
    http: reqwest::Client,
    row: StaticMachine,
    statics: StaticMachineStore,
    assignments: AssignmentStore,
}

#[async_trait]
impl Machine for RegistryMachine {
    fn id(&self) -> &str {
        &self.row.id
    }

    fn platform(&self) -> &str {
        "unknown"
    }

    async fn name(&self) -> Result<String, VmError> {
        Ok(self.row.name.clone())
    }

    /// Probe the in-guest agent. A failed probe is an observation failure
    /// (`Unknown`), not an error: the machine may simply still be booting.
    async fn status(&self) -> Result<MachineStatus, VmError> {
        let url = format!(
            "http://{}:{}/health",
            self.row.address, self.row.agent_port
        );
        let resp = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(machine_id = %self.row.id, status = %resp.status(), "agent probe rejected");
                return Ok(MachineStatus::Unknown);
            }
            Err(err) => {
                warn!(machine_id = %self.row.id, error = %err, "agent probe failed");
                return Ok(MachineStatus::Unknown);
            }
        };

        let body = resp.text().await.unwrap_or_default();
        if body.contains("running") {
            Ok(MachineStatus::Up)
        } else {
            Ok(MachineStatus::Down)
        }
    }

    async fn ip(&self) -> Result<Option<IpAddr>, VmError> {
        Ok(self.row.address.parse().ok())
    }

    async fn credentials(&self) -> Result<Credentials, VmError> {
        Ok(Credentials {
            username: self.row.username.clone(),
            password: self.row.password.clone(),
        })
    }

    /// Nobody can power a pre-registered machine on remotely; accepted as a
    /// no-op so the broker's Down handling stays uniform.
    async fn start(&self) -> Result<(), VmError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), VmError> {
        Ok(())
    }

    async fn terminate(&self) -> Result<(), VmError> {
        self.statics.remove(&self.row.id).await.map_err(store_err)?;
        self.assignments
            .remove(&self.row.id)
            .await
            .map_err(store_err)
    }
}
