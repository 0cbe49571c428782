// vdm-vms: the Driver Capability Layer.
// One trait pair abstracts "a fleet of machines" over interchangeable
// backends; each adapter normalizes its native state vocabulary and failure
// modes so the broker never branches on backend identity.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use vdm_core::config::DriverConfig;
use vdm_core::{Credentials, MachineAttributes, MachineStatus, MachineType, VmError};
use vdm_store::AssignmentStore;

pub mod drivers;

use drivers::compute::ComputeFleet;
use drivers::mock::MockFleet;
use drivers::registry::RegistryFleet;
use drivers::stack::StackFleet;

/// A fleet of machines under one backend account/tenant/static registry.
///
/// Handles are safe for concurrent use: every operation re-fetches live
/// state and carries no per-call mutable state.
#[async_trait]
pub trait VmFleet: Send + Sync {
    /// All machines not in a terminated state known to the backend.
    async fn machines(&self) -> Result<Vec<Box<dyn Machine>>, VmError>;

    /// Resolve one handle, re-fetching live state (never a cached snapshot).
    async fn machine(&self, id: &str) -> Result<Box<dyn Machine>, VmError>;

    /// Provision a new instance. A failed call must not leave a dangling
    /// billable resource the adapter cannot clean up.
    async fn create(&self, attr: MachineAttributes) -> Result<Box<dyn Machine>, VmError>;

    /// Hardware/image classes this backend offers.
    async fn types(&self) -> Result<Vec<MachineType>, VmError>;

    async fn machine_type(&self, id: &str) -> Result<MachineType, VmError>;
}

/// Handle to one VM instance, owned by exactly one driver.
#[async_trait]
pub trait Machine: Send + Sync {
    fn id(&self) -> &str;

    fn platform(&self) -> &str;

    async fn name(&self) -> Result<String, VmError>;

    /// Current observation of the lifecycle state. `Up` is only reported
    /// when the machine is genuinely usable: native running state,
    /// retrievable administrator credentials, healthy backend health signal.
    async fn status(&self) -> Result<MachineStatus, VmError>;

    /// Public address; absent while booting.
    async fn ip(&self) -> Result<Option<IpAddr>, VmError>;

    async fn credentials(&self) -> Result<Credentials, VmError>;

    /// Idempotent: repeated starts on an already-starting machine succeed.
    async fn start(&self) -> Result<(), VmError>;

    async fn stop(&self) -> Result<(), VmError>;

    /// Irreversible. Also deletes the machine's assignment record row (and
    /// any backend-local secret/registry row); a missing row is an error,
    /// reported after the backend-side termination has been issued.
    async fn terminate(&self) -> Result<(), VmError>;
}

/// Build the one active driver for this deployment.
///
/// Selection happens here, at configuration time; no network calls are made
/// beyond what is needed to construct the handle (authentication is lazy).
pub fn open(config: &DriverConfig, pool: SqlitePool) -> Result<Arc<dyn VmFleet>, VmError> {
    tracing::info!(driver = config.kind(), "opening VM driver");
    let fleet: Arc<dyn VmFleet> = match config {
        DriverConfig::Compute(c) => Arc::new(ComputeFleet::open(c, pool)?),
        DriverConfig::Stack(c) => Arc::new(StackFleet::open(c, pool)?),
        DriverConfig::Registry => Arc::new(RegistryFleet::open(pool)?),
        DriverConfig::Mock => Arc::new(MockFleet::new(AssignmentStore::new(pool))),
    };
    Ok(fleet)
}
