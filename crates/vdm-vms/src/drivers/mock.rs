//! In-process scripted fleet.
//!
//! Boot progress is driven by status observations: a booting machine comes
//! up after a configured number of polls, and its administrator password
//! becomes available after a (possibly later) poll count, which exercises
//! the "running but not ready" window real backends have.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use vdm_core::machine::DEFAULT_ADMIN_USERNAME;
use vdm_core::{Credentials, MachineAttributes, MachineStatus, MachineType, VmError};
use vdm_store::AssignmentStore;

use crate::drivers::store_err;
use crate::{Machine, VmFleet};

#[derive(Debug, Clone)]
pub struct MockMachineState {
    pub name: String,
    pub status: MachineStatus,
    pub polls: u32,
    pub polls_until_up: u32,
    pub creds_after_polls: u32,
    pub password: String,
    pub ip: Option<IpAddr>,
}

impl Default for MockMachineState {
    fn default() -> Self {
        Self {
            name: "mock-desktop".to_string(),
            status: MachineStatus::Booting,
            polls: 0,
            polls_until_up: 2,
            creds_after_polls: 2,
            password: "mock-secret".to_string(),
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }
}

pub struct MockFleet {
    machines: Arc<Mutex<HashMap<String, MockMachineState>>>,
    assignments: AssignmentStore,
    polls_until_up: u32,
    creds_after_polls: u32,
    next_id: AtomicU32,
    created: AtomicU32,
    fail_create: AtomicBool,
}

impl MockFleet {
    pub fn new(assignments: AssignmentStore) -> Self {
        Self {
            machines: Arc::new(Mutex::new(HashMap::new())),
            assignments,
            polls_until_up: 2,
            creds_after_polls: 2,
            next_id: AtomicU32::new(1),
            created: AtomicU32::new(0),
            fail_create: AtomicBool::new(false),
        }
    }

    /// Status observations a fresh machine needs before it reports running.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.polls_until_up = polls;
        self
    }

    /// Status observations before the administrator password exists. Set
    /// this past the boot poll count to open a "running but not ready"
    /// window.
    pub fn with_creds_after(mut self, polls: u32) -> Self {
        self.creds_after_polls = polls;
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Total machines this fleet has been asked to create.
    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Pre-seed a machine in a given state.
    pub fn register(&self, id: &str, state: MockMachineState) {
        self.machines
            .lock()
            .unwrap()
            .insert(id.to_string(), state);
    }

    fn handle(&self, id: String) -> Box<dyn Machine> {
        Box::new(MockMachine {
            id,
            machines: Arc::clone(&self.machines),
            assignments: self.assignments.clone(),
        })
    }
}

#[async_trait]
impl VmFleet for MockFleet {
    async fn machines(&self) -> Result<Vec<Box<dyn Machine>>, VmError> {
        let ids: Vec<String> = self
            .machines
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.status != MachineStatus::Terminated)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    async fn machine(&self, id: &str) -> Result<Box<dyn Machine>, VmError> {
        if !self.machines.lock().unwrap().contains_key(id) {
            return Err(VmError::NotFound(id.to_string()));
        }
        Ok(self.handle(id.to_string()))
    }

    async fn create(&self, attr: MachineAttributes) -> Result<Box<dyn Machine>, VmError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(VmError::Backend("mock create failure".to_string()));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("m-{seq:04}");
        let state = MockMachineState {
            name: if attr.name.is_empty() {
                format!("mock-{seq:04}")
            } else {
                attr.name
            },
            polls_until_up: self.polls_until_up,
            creds_after_polls: self.creds_after_polls,
            password: if attr.password.is_empty() {
                "mock-secret".to_string()
            } else {
                attr.password
            },
            ..Default::default()
        };
        self.machines.lock().unwrap().insert(id.clone(), state);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle(id))
    }

    async fn types(&self) -> Result<Vec<MachineType>, VmError> {
        Ok(vec![MachineType {
            id: "mock".to_string(),
            image: "mock".to_string(),
            flavor: "mock".to_string(),
        }])
    }

    async fn machine_type(&self, id: &str) -> Result<MachineType, VmError> {
        if id == "mock" {
            Ok(MachineType {
                id: "mock".to_string(),
                image: "mock".to_string(),
                flavor: "mock".to_string(),
            })
        } else {
            Err(VmError::TypeNotFound(id.to_string()))
        }
    }
}

pub struct MockMachine {
    id: String,
    machines: Arc<Mutex<HashMap<String, MockMachineState>>>,
    assignments: AssignmentStore,
}

impl MockMachine {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MockMachineState) -> T,
    ) -> Result<T, VmError> {
        let mut map = self.machines.lock().unwrap();
        let state = map
            .get_mut(&self.id)
            .ok_or_else(|| VmError::NotFound(self.id.clone()))?;
        Ok(f(state))
    }
}

#[async_trait]
impl Machine for MockMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn platform(&self) -> &str {
        "mock"
    }

    async fn name(&self) -> Result<String, VmError> {
        self.with_state(|s| s.name.clone())
    }

    async fn status(&self) -> Result<MachineStatus, VmError> {
        self.with_state(|s| {
            match s.status {
                MachineStatus::Booting => {
                    s.polls += 1;
                    // Up requires both the simulated boot and the password.
                    if s.polls >= s.polls_until_up && s.polls >= s.creds_after_polls {
                        s.status = MachineStatus::Up;
                    }
                    s.status
                }
                MachineStatus::Stopping => {
                    s.status = MachineStatus::Down;
                    MachineStatus::Stopping
                }
                other => other,
            }
        })
    }

    async fn ip(&self) -> Result<Option<IpAddr>, VmError> {
        self.with_state(|s| {
            if s.status == MachineStatus::Up {
                s.ip
            } else {
                None
            }
        })
    }

    async fn credentials(&self) -> Result<Credentials, VmError> {
        self.with_state(|s| {
            if s.polls >= s.creds_after_polls {
                Ok(Credentials {
                    username: DEFAULT_ADMIN_USERNAME.to_string(),
                    password: s.password.clone(),
                })
            } else {
                Err(VmError::CredentialsPending)
            }
        })?
    }

    async fn start(&self) -> Result<(), VmError> {
        self.with_state(|s| match s.status {
            MachineStatus::Down => {
                s.status = MachineStatus::Booting;
                s.polls = 0;
                Ok(())
            }
            MachineStatus::Terminated => {
                Err(VmError::Backend("machine is terminated".to_string()))
            }
            // Repeated starts while booting (or already up) succeed.
            _ => Ok(()),
        })?
    }

    async fn stop(&self) -> Result<(), VmError> {
        self.with_state(|s| match s.status {
            MachineStatus::Up | MachineStatus::Booting => {
                s.status = MachineStatus::Stopping;
                Ok(())
            }
            MachineStatus::Terminated => {
                Err(VmError::Backend("machine is terminated".to_string()))
            }
            _ => Ok(()),
        })?
    }

    async fn terminate(&self) -> Result<(), VmError> {
        self.with_state(|s| s.status = MachineStatus::Terminated)?;
        self.assignments.remove(&self.id).await.map_err(store_err)
    }
}
