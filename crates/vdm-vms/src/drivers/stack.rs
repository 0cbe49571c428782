//! Private-cloud adapter.
//!
//! The control plane wants a fresh password login per call (token + tenant
//! id), reports machines through a servers API with a `vm_state`/`task_state`
//! pair, and cannot report administrator passwords at all — the desired
//! password is injected through bootstrap user data and persisted in the
//! local `machine_secrets` table, which is also where the credential gate
//! reads from. Creating a machine launches a background provisioning task
//! whose output is multicast to the service log.

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::warn;

use vdm_core::config::StackConfig;
use vdm_core::machine::DEFAULT_ADMIN_USERNAME;
use vdm_core::{Credentials, MachineAttributes, MachineStatus, MachineType, VmError};
use vdm_provision::{Provisioner, TracingSink};
use vdm_store::{AssignmentStore, SecretStore};

use crate::drivers::{bootstrap_script, generate_password, store_err};
use crate::{Machine, VmFleet};

/// Keypair name registered with the private cloud out of band.
const KEY_NAME: &str = "vdm-key";

pub struct StackFleet {
    api: Arc<StackApi>,
    image: String,
    secrets: SecretStore,
    assignments: AssignmentStore,
}

pub(crate) struct StackApi {
    http: reqwest::Client,
    endpoint: String,
    tenant: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
    tenant: TokenTenant,
}

#[derive(Debug, Deserialize)]
struct TokenTenant {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<ServerDetail>,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: ServerDetail,
}

#[derive(Debug, Deserialize)]
struct ServerDetail {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "OS-EXT-STS:vm_state")]
    vm_state: String,
    #[serde(default, rename = "OS-EXT-STS:task_state")]
    task_state: Option<String>,
    #[serde(default)]
    addresses: HashMap<String, Vec<AddressEntry>>,
}

#[derive(Debug, Deserialize)]
struct AddressEntry {
    addr: String,
    #[serde(default, rename = "OS-EXT-IPS:type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlavorsResponse {
    flavors: Vec<Flavor>,
}

#[derive(Debug, Deserialize)]
struct Flavor {
    name: String,
    links: Vec<FlavorLink>,
}

#[derive(Debug, Deserialize)]
struct FlavorLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct CreatedServerResponse {
    server: CreatedServer,
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
}

impl StackApi {
    /// Authenticate and return (token, tenant id). The backend hands out
    /// short-lived tokens, so every operation logs in fresh.
    async fn login(&self) -> Result<(String, String), VmError> {
        let body = json!({
            "auth": {
                "tenantName": self.tenant,
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                },
            },
        });
        let resp = self
            .http
            .post(format!("http://{}:5000/v2.0/tokens", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(VmError::backend)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                Err(VmError::Auth("invalid tenant credentials".to_string()))
            }
            s if !s.is_success() => Err(VmError::Backend(format!("login failed: HTTP {s}"))),
            _ => {
                let body: TokenResponse = resp.json().await.map_err(VmError::backend)?;
                Ok((body.access.token.id, body.access.token.tenant.id))
            }
        }
    }

    fn compute_url(&self, tenant_id: &str, path: &str) -> String {
        format!("http://{}:8774/v2/{}/{}", self.endpoint, tenant_id, path)
    }

    async fn server(&self, id: &str) -> Result<ServerDetail, VmError> {
        let (token, tenant_id) = self.login().await?;
        let resp = self
            .http
            .get(self.compute_url(&tenant_id, &format!("servers/{id}")))
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(VmError::backend)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(VmError::NotFound(id.to_string())),
            s if !s.is_success() => Err(VmError::Backend(format!("server {id}: HTTP {s}"))),
            _ => {
                let body: ServerResponse = resp.json().await.map_err(VmError::backend)?;
                Ok(body.server)
            }
        }
    }

    /// POST an action document against one server.
    async fn action(&self, id: &str, body: serde_json::Value) -> Result<(), VmError> {
        let (token, tenant_id) = self.login().await?;
        let resp = self
            .http
            .post(self.compute_url(&tenant_id, &format!("servers/{id}/action")))
            .header("X-Auth-Token", token)
            .json(&body)
            .send()
            .await
            .map_err(VmError::backend)?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(VmError::Backend(format!(
                "server action on {id}: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

impl StackFleet {
    pub fn open(config: &StackConfig, pool: SqlitePool) -> Result<Self, VmError> {
        let api = StackApi {
            http: crate::drivers::http_client()?,
            endpoint: config.endpoint.clone(),
            tenant: config.tenant.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        Ok(Self {
            api: Arc::new(api),
            image: config.image.clone(),
            secrets: SecretStore::new(pool.clone()),
            assignments: AssignmentStore::new(pool),
        })
    }

    fn handle(&self, detail: ServerDetail) -> Box<dyn Machine> {
        Box::new(StackMachine {
            api: Arc::clone(&self.api),
            id: detail.id,
            name: detail.name,
            secrets: self.secrets.clone(),
            assignments: self.assignments.clone(),
        })
    }

    /// Hand the opaque bootstrap transcript to a background task so any
    /// number of observers can follow it without blocking the create call.
    fn launch_provision_task(&self, machine_id: &str, script: String) {
        let id = machine_id.to_string();
        let task = Provisioner::new(Box::new(move |out| {
            let _ = writeln!(out, "handing off bootstrap for {id}");
            for line in script.lines() {
                let _ = writeln!(out, "{line}");
            }
            let _ = writeln!(out, "bootstrap hand-off complete");
        }));
        task.add_output(Box::new(TracingSink::new(machine_id)));
        if let Err(err) = task.run() {
            warn!(machine_id, error = %err, "provision task did not start");
        }
    }
}

#[async_trait]
impl VmFleet for StackFleet {
    async fn machines(&self) -> Result<Vec<Box<dyn Machine>>, VmError> {
        let (token, tenant_id) = self.api.login().await?;
        let resp = self
            .api
            .http
            .get(self.api.compute_url(&tenant_id, "servers/detail"))
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(VmError::backend)?;
        if !resp.status().is_success() {
            return Err(VmError::Backend(format!(
                "server listing: HTTP {}",
                resp.status()
            )));
        }
        let body: ServersResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body.servers.into_iter().map(|s| self.handle(s)).collect())
    }

    async fn machine(&self, id: &str) -> Result<Box<dyn Machine>, VmError> {
        let detail = self.api.server(id).await?;
        Ok(self.handle(detail))
    }

    #[tracing::instrument(skip_all, fields(name = %attr.name))]
    async fn create(&self, attr: MachineAttributes) -> Result<Box<dyn Machine>, VmError> {
        let machine_type = match attr.machine_type {
            Some(t) => t,
            // No class requested: fall back to the first advertised flavor
            // with the configured base image.
            None => self
                .types()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| VmError::Backend("backend advertises no flavors".to_string()))?,
        };

        let password = if attr.password.is_empty() {
            generate_password()
        } else {
            attr.password.clone()
        };
        let script = bootstrap_script(Some(&password));

        let (token, tenant_id) = self.api.login().await?;
        let body = json!({
            "server": {
                "imageRef": machine_type.image,
                "flavorRef": machine_type.flavor,
                "name": attr.name,
                "key_name": KEY_NAME,
                "user_data": BASE64.encode(&script),
            },
        });
        let resp = self
            .api
            .http
            .post(self.api.compute_url(&tenant_id, "servers"))
            .header("X-Auth-Token", token)
            .json(&body)
            .send()
            .await
            .map_err(VmError::backend)?;
        if !resp.status().is_success() {
            return Err(VmError::Backend(format!(
                "server create: HTTP {}",
                resp.status()
            )));
        }
        let created: CreatedServerResponse = resp.json().await.map_err(VmError::backend)?;
        let id = created.server.id;

        // Billable from here. Without its secret row the machine can never
        // pass the readiness gate, so roll it back instead of leaking it.
        if let Err(err) = self.secrets.insert(&id, &password).await {
            warn!(machine_id = %id, error = %err, "secret insert failed, rolling back server");
            if let Err(rollback) = self.delete_server(&id).await {
                warn!(machine_id = %id, error = %rollback, "rollback terminate failed");
            }
            return Err(store_err(err));
        }

        let machine = self.machine(&id).await?;
        self.launch_provision_task(&id, script);
        Ok(machine)
    }

    async fn types(&self) -> Result<Vec<MachineType>, VmError> {
        let (token, tenant_id) = self.api.login().await?;
        let resp = self
            .api
            .http
            .get(self.api.compute_url(&tenant_id, "flavors"))
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(VmError::backend)?;
        if !resp.status().is_success() {
            return Err(VmError::Backend(format!(
                "flavor listing: HTTP {}",
                resp.status()
            )));
        }
        let body: FlavorsResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body
            .flavors
            .into_iter()
            .filter(|f| !f.links.is_empty())
            .map(|f| MachineType {
                id: f.name,
                image: self.image.clone(),
                flavor: f.links[0].href.clone(),
            })
            .collect())
    }

    async fn machine_type(&self, id: &str) -> Result<MachineType, VmError> {
        self.types()
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| VmError::TypeNotFound(id.to_string()))
    }
}

impl StackFleet {
    async fn delete_server(&self, id: &str) -> Result<(), VmError> {
        let (token, tenant_id) = self.api.login().await?;
        let resp = self
            .api
            .http
            .delete(self.api.compute_url(&tenant_id, &format!("servers/{id}")))
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(VmError::backend)?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(VmError::Backend(format!(
                "server delete {id}: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

pub struct StackMachine {
    api: Arc<StackApi>,
    id: String,
    name: String,
    secrets: SecretStore,
    assignments: AssignmentStore,
}

/// `vm_state` is the settled state, `task_state` the transition in flight.
fn map_server_status(
    vm_state: &str,
    task_state: Option<&str>,
    creds_ready: bool,
) -> MachineStatus {
    match vm_state {
        "active" => match task_state {
            Some("powering-off") => MachineStatus::Stopping,
            Some("deleting") => MachineStatus::Terminated,
            _ if !creds_ready => MachineStatus::Booting,
            _ => MachineStatus::Up,
        },
        "stopped" => match task_state {
            Some("powering-on") => MachineStatus::Booting,
            _ => MachineStatus::Down,
        },
        "building" => MachineStatus::Booting,
        _ => MachineStatus::Unknown,
    }
}

fn floating_ip(addresses: &HashMap<String, Vec<AddressEntry>>) -> Option<IpAddr> {
    addresses
        .values()
        .flatten()
        .find(|a| a.kind.as_deref() == Some("floating"))
        .and_then(|a| a.addr.parse().ok())
}

#[async_trait]
impl Machine for StackMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn platform(&self) -> &str {
        "unknown"
    }

    async fn name(&self) -> Result<String, VmError> {
        Ok(self.name.clone())
    }

    async fn status(&self) -> Result<MachineStatus, VmError> {
        let detail = self.api.server(&self.id).await?;
        let creds_ready = matches!(
            self.secrets.password(&self.id).await.map_err(store_err)?,
            Some(ref p) if !p.is_empty()
        );
        Ok(map_server_status(
            &detail.vm_state,
            detail.task_state.as_deref(),
            creds_ready,
        ))
    }

    async fn ip(&self) -> Result<Option<IpAddr>, VmError> {
        let detail = self.api.server(&self.id).await?;
        Ok(floating_ip(&detail.addresses))
    }

    async fn credentials(&self) -> Result<Credentials, VmError> {
        match self.secrets.password(&self.id).await.map_err(store_err)? {
            Some(password) if !password.is_empty() => Ok(Credentials {
                username: DEFAULT_ADMIN_USERNAME.to_string(),
                password,
            }),
            _ => Err(VmError::CredentialsPending),
        }
    }

    async fn start(&self) -> Result<(), VmError> {
        self.api.action(&self.id, json!({ "os-start": null })).await
    }

    async fn stop(&self) -> Result<(), VmError> {
        self.api.action(&self.id, json!({ "os-stop": null })).await
    }

    async fn terminate(&self) -> Result<(), VmError> {
        let (token, tenant_id) = self.api.login().await?;
        let resp = self
            .api
            .http
            .delete(self.api.compute_url(&tenant_id, &format!("servers/{}", self.id)))
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(VmError::backend)?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(VmError::Backend(format!(
                "server delete {}: HTTP {}",
                self.id,
                resp.status()
            )));
        }

        self.secrets.remove(&self.id).await.map_err(store_err)?;
        self.assignments.remove(&self.id).await.map_err(store_err)
    }
}
