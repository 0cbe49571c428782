use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use vdm_core::config::BrokerConfig;
use vdm_core::{MachineAttributes, MachineStatus, VmError};
use vdm_store::{AssignmentStore, StoreError};
use vdm_vms::{Machine, VmFleet};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("allocation failed: no machine available after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("allocation failed: machine {machine_id} did not come up within {timeout_secs}s")]
    BootTimeout {
        machine_id: String,
        timeout_secs: u64,
    },

    #[error("allocation failed: machine {0} was terminated while waiting for it")]
    MachineTerminated(String),

    #[error("allocation failed: {0}")]
    Store(#[from] StoreError),

    #[error("allocation failed: {0}")]
    Vm(#[from] VmError),
}

/// Finds or creates the machine for a user, keeps the warm pool topped up.
///
/// Holds no state of its own beyond the store and driver handles, so it is
/// cheap to clone and safe to call from any number of concurrent tasks.
#[derive(Clone)]
pub struct Broker {
    assignments: AssignmentStore,
    fleet: Arc<dyn VmFleet>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(assignments: AssignmentStore, fleet: Arc<dyn VmFleet>, config: BrokerConfig) -> Self {
        Self {
            assignments,
            fleet,
            config,
        }
    }

    /// Resolve the machine owned by `user_id`, allocating one from the pool
    /// (growing it if needed) on first contact, and block until it is `Up`.
    ///
    /// This occupies the calling task for the whole boot duration; invoke it
    /// from a worker, not from a request handler that must stay responsive.
    #[tracing::instrument(skip(self))]
    pub async fn get_machine(&self, user_id: &str) -> Result<Box<dyn Machine>, BrokerError> {
        for attempt in 1..=self.config.max_attempts {
            if let Some(machine_id) = self.assignments.find_for_user(user_id).await? {
                let machine = self.fleet.machine(&machine_id).await?;
                return self.wait_until_up(machine).await;
            }

            // A `None` here covers both "pool empty" and "another caller
            // just took the last free row" — either way the claim is
            // re-attempted after growth, never treated as a hard failure.
            if let Some(machine_id) = self.assignments.claim_free(user_id).await? {
                info!(machine_id, user_id, "allocated pooled machine");
                self.spawn_topup();
                let machine = self.fleet.machine(&machine_id).await?;
                return self.wait_until_up(machine).await;
            }

            if attempt == self.config.max_attempts {
                break;
            }
            warn!(
                attempt,
                burst = self.config.pool_burst,
                "pool exhausted, growing"
            );
            self.upgrade_pool(self.config.pool_burst).await?;
        }

        Err(BrokerError::Exhausted {
            attempts: self.config.max_attempts,
        })
    }

    /// Create `count` machines and record each as free.
    ///
    /// A machine created but not recorded would be billable and invisible;
    /// when the free-row insert fails the fresh machine is terminated again
    /// before the error is surfaced.
    #[tracing::instrument(skip(self))]
    pub async fn upgrade_pool(&self, count: u32) -> Result<(), BrokerError> {
        for _ in 0..count {
            let machine = self.fleet.create(self.default_attributes()).await?;
            if let Err(err) = self.assignments.insert_free(machine.id()).await {
                warn!(
                    machine_id = machine.id(),
                    error = %err,
                    "free-row insert failed, terminating orphan"
                );
                if let Err(rollback) = machine.terminate().await {
                    // The assignment row never existed, so the terminate is
                    // expected to report exactly that.
                    warn!(
                        machine_id = machine.id(),
                        error = %rollback,
                        "orphan rollback"
                    );
                }
                return Err(err.into());
            }
            info!(machine_id = machine.id(), "added machine to pool");
        }
        Ok(())
    }

    /// True iff no assignment record currently has a null user.
    pub async fn pool_empty(&self) -> Result<bool, BrokerError> {
        Ok(self.assignments.pool_empty().await?)
    }

    /// Replenish the slot a successful claim just consumed, off the
    /// caller's path.
    fn spawn_topup(&self) {
        let broker = self.clone();
        tokio::spawn(async move {
            if let Err(err) = broker.upgrade_pool(1).await {
                warn!(error = %err, "async pool top-up failed");
            }
        });
    }

    /// Poll until the machine reports `Up`, starting it on every `Down`
    /// observation, bounded by the boot deadline.
    async fn wait_until_up(
        &self,
        machine: Box<dyn Machine>,
    ) -> Result<Box<dyn Machine>, BrokerError> {
        let deadline = Instant::now() + self.config.boot_timeout();
        loop {
            match machine.status().await {
                Ok(MachineStatus::Up) => return Ok(machine),
                Ok(MachineStatus::Down) => {
                    // Idempotent on the driver side; a second start while
                    // the machine is already coming up must not error.
                    machine.start().await?;
                }
                Ok(MachineStatus::Terminated) => {
                    return Err(BrokerError::MachineTerminated(machine.id().to_string()));
                }
                Ok(_) => {}
                Err(VmError::Auth(msg)) => return Err(BrokerError::Vm(VmError::Auth(msg))),
                // Transient observation failures ride the polling loop.
                Err(err) => {
                    warn!(
                        machine_id = machine.id(),
                        error = %err,
                        "status poll failed, retrying"
                    );
                }
            }

            if Instant::now() >= deadline {
                return Err(BrokerError::BootTimeout {
                    machine_id: machine.id().to_string(),
                    timeout_secs: self.config.boot_timeout_secs,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    fn default_attributes(&self) -> MachineAttributes {
        let suffix = names::Generator::default()
            .next()
            .unwrap_or_else(|| "machine".to_string());
        MachineAttributes {
            machine_type: None,
            name: format!("{}-{}", self.config.machine_name_prefix, suffix),
            username: self.config.admin_username.clone(),
            // Empty asks the driver to pick one; see the driver contract.
            password: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use vdm_store::testing::create_test_pool;
    use vdm_vms::drivers::mock::{MockFleet, MockMachineState};

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            pool_burst: 2,
            max_attempts: 3,
            boot_timeout_secs: 5,
            poll_interval_ms: 1,
            ..BrokerConfig::default()
        }
    }

    async fn harness() -> (Broker, Arc<MockFleet>, AssignmentStore) {
        harness_with(MockFleet::new).await
    }

    async fn harness_with(
        make_fleet: impl FnOnce(AssignmentStore) -> MockFleet,
    ) -> (Broker, Arc<MockFleet>, AssignmentStore) {
        let assignments = AssignmentStore::new(create_test_pool().await);
        let fleet = Arc::new(make_fleet(assignments.clone()));
        let broker = Broker::new(assignments.clone(), fleet.clone(), test_config());
        (broker, fleet, assignments)
    }

    fn up_state() -> MockMachineState {
        MockMachineState {
            status: MachineStatus::Up,
            polls: 2,
            ..Default::default()
        }
    }

    async fn wait_for_topups(fleet: &MockFleet, at_least: u32) {
        for _ in 0..500 {
            if fleet.created_count() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "expected at least {at_least} machines created, saw {}",
            fleet.created_count()
        );
    }

    #[tokio::test]
    async fn test_empty_pool_grows_then_allocates() {
        let (broker, fleet, assignments) = harness().await;

        let machine = broker.get_machine("alice").await.unwrap();
        assert_eq!(machine.status().await.unwrap(), MachineStatus::Up);
        assert!(fleet.created_count() >= broker.config.pool_burst);
        assert_eq!(
            assignments.find_for_user("alice").await.unwrap().as_deref(),
            Some(machine.id())
        );
    }

    #[tokio::test]
    async fn test_existing_assignment_short_circuits_the_pool() {
        let (broker, fleet, assignments) = harness().await;
        fleet.register("m-owned", up_state());
        assignments.insert_free("m-owned").await.unwrap();
        assignments.claim_free("alice").await.unwrap();

        let machine = broker.get_machine("alice").await.unwrap();
        assert_eq!(machine.id(), "m-owned");
        // No claim happened, so no growth or top-up was triggered.
        assert_eq!(fleet.created_count(), 0);
    }

    #[tokio::test]
    async fn test_two_racers_one_free_machine() {
        let (broker, fleet, assignments) = harness().await;
        fleet.register("m-free", MockMachineState::default());
        assignments.insert_free("m-free").await.unwrap();

        let (a, b) = tokio::join!(broker.get_machine("alice"), broker.get_machine("bob"));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_ne!(a.id(), b.id(), "two users share one machine");
        let alice = assignments.find_for_user("alice").await.unwrap().unwrap();
        let bob = assignments.find_for_user("bob").await.unwrap().unwrap();
        assert_ne!(alice, bob);
        assert!(alice == "m-free" || bob == "m-free");
    }

    #[tokio::test]
    async fn test_at_most_one_owner_under_contention() {
        let (broker, fleet, assignments) = harness().await;
        for id in ["m-a", "m-b"] {
            fleet.register(id, MockMachineState::default());
            assignments.insert_free(id).await.unwrap();
        }

        let users = ["u1", "u2", "u3", "u4"];
        let (r1, r2, r3, r4) = tokio::join!(
            broker.get_machine("u1"),
            broker.get_machine("u2"),
            broker.get_machine("u3"),
            broker.get_machine("u4"),
        );
        for result in [&r1, &r2, &r3, &r4] {
            assert!(result.is_ok());
        }

        let mut owned: Vec<String> = Vec::new();
        for user in users {
            owned.push(assignments.find_for_user(user).await.unwrap().unwrap());
        }
        owned.sort();
        let before = owned.len();
        owned.dedup();
        assert_eq!(before, owned.len(), "a machine has two owners");
    }

    #[tokio::test]
    async fn test_down_machine_is_started_and_awaited() {
        let (broker, fleet, assignments) = harness().await;
        fleet.register(
            "m-down",
            MockMachineState {
                status: MachineStatus::Down,
                ..Default::default()
            },
        );
        assignments.insert_free("m-down").await.unwrap();
        assignments.claim_free("alice").await.unwrap();

        let machine = broker.get_machine("alice").await.unwrap();
        assert_eq!(machine.id(), "m-down");
        assert_eq!(machine.status().await.unwrap(), MachineStatus::Up);
    }

    #[tokio::test]
    async fn test_claim_triggers_async_topup() {
        let (broker, fleet, assignments) = harness().await;
        fleet.register("m-free", up_state());
        assignments.insert_free("m-free").await.unwrap();

        broker.get_machine("alice").await.unwrap();
        wait_for_topups(&fleet, 1).await;
        assert!(!broker.pool_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_replenishment_keeps_pace_with_allocations() {
        let (broker, fleet, _assignments) = harness().await;

        for user in ["u1", "u2", "u3"] {
            broker.get_machine(user).await.unwrap();
        }
        // Each first-time allocation consumed one machine and owes the pool
        // one top-up beyond whatever burst growth created.
        wait_for_topups(&fleet, 3).await;
    }

    #[tokio::test]
    async fn test_allocation_attempts_are_bounded() {
        let assignments = AssignmentStore::new(create_test_pool().await);
        let fleet = Arc::new(MockFleet::new(assignments.clone()));
        let config = BrokerConfig {
            max_attempts: 1,
            poll_interval_ms: 1,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(assignments, fleet.clone(), config);

        let err = broker.get_machine("alice").await.unwrap_err();
        assert!(matches!(err, BrokerError::Exhausted { attempts: 1 }));
        // The bound was hit before any growth was attempted.
        assert_eq!(fleet.created_count(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces_to_caller() {
        let (broker, fleet, _assignments) = harness().await;
        fleet.set_fail_create(true);

        let err = broker.get_machine("alice").await.unwrap_err();
        assert!(matches!(err, BrokerError::Vm(VmError::Backend(_))));
    }

    #[tokio::test]
    async fn test_boot_timeout_bounds_the_wait() {
        let assignments = AssignmentStore::new(create_test_pool().await);
        let fleet = Arc::new(MockFleet::new(assignments.clone()).with_boot_polls(1_000_000));
        let config = BrokerConfig {
            boot_timeout_secs: 0,
            poll_interval_ms: 1,
            ..test_config()
        };
        let broker = Broker::new(assignments, fleet, config);

        let err = broker.get_machine("alice").await.unwrap_err();
        assert!(matches!(err, BrokerError::BootTimeout { .. }));
    }

    #[tokio::test]
    async fn test_machine_up_implies_credentials() {
        let (broker, _fleet, _assignments) =
            harness_with(|a| MockFleet::new(a).with_boot_polls(1).with_creds_after(3)).await;

        let machine = broker.get_machine("alice").await.unwrap();
        assert_eq!(machine.status().await.unwrap(), MachineStatus::Up);
        machine
            .credentials()
            .await
            .expect("an Up machine must have retrievable credentials");
    }

    #[tokio::test]
    async fn test_upgrade_pool_rolls_back_orphans() {
        let (broker, fleet, assignments) = harness().await;
        // Collide with the first id the fleet will hand out.
        assignments.insert_free("m-0001").await.unwrap();
        assignments.claim_free("squatter").await.unwrap();

        let err = broker.upgrade_pool(1).await.unwrap_err();
        assert!(matches!(err, BrokerError::Store(StoreError::Duplicate(_))));
        // The orphan was terminated, not leaked.
        let machine = fleet.machine("m-0001").await.unwrap();
        assert_eq!(machine.status().await.unwrap(), MachineStatus::Terminated);
    }

    #[tokio::test]
    async fn test_pool_empty_reflects_free_rows() {
        let (broker, _fleet, assignments) = harness().await;
        assert!(broker.pool_empty().await.unwrap());
        assignments.insert_free("m-1").await.unwrap();
        assert!(!broker.pool_empty().await.unwrap());
        assignments.claim_free("alice").await.unwrap();
        assert!(broker.pool_empty().await.unwrap());
    }
}
