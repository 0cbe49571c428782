//! Public-cloud compute adapter.
//!
//! Talks to a region-scoped JSON control plane with header credentials. The
//! backend's native state vocabulary ("pending", "running", ...) and its
//! separate health summary are folded into the common status model here; a
//! "running" instance whose administrator password is not yet generated or
//! whose health summary is still initializing is reported as `Booting`.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use vdm_core::config::ComputeConfig;
use vdm_core::machine::DEFAULT_ADMIN_USERNAME;
use vdm_core::{Credentials, MachineAttributes, MachineStatus, MachineType, VmError};
use vdm_store::AssignmentStore;

use crate::drivers::{bootstrap_script, store_err};
use crate::{Machine, VmFleet};

pub struct ComputeFleet {
    api: Arc<ComputeApi>,
    image: String,
    flavor: String,
    key_name: String,
    key_path: String,
    assignments: AssignmentStore,
}

pub(crate) struct ComputeApi {
    http: reqwest::Client,
    base: String,
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    id: String,
    #[serde(default)]
    name: String,
    state: String,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    health: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    instance: InstanceInfo,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    instances: Vec<InstanceInfo>,
}

#[derive(Debug, Deserialize)]
struct FlavorsResponse {
    flavors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PasswordResponse {
    #[serde(default)]
    password_data: String,
}

#[derive(Debug, Deserialize)]
struct KeypairResponse {
    key_material: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    image: &'a str,
    flavor: &'a str,
    name: &'a str,
    key_name: &'a str,
    user_data: String,
}

impl ComputeApi {
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, VmError> {
        let mut req = self
            .http
            .request(method, format!("{}/{}", self.base, path))
            .header("X-Access-Key", &self.access_key)
            .header("X-Secret-Key", &self.secret_key);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(VmError::backend)?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(VmError::Auth(format!(
                "compute API rejected credentials ({})",
                resp.status()
            ))),
            StatusCode::NOT_FOUND => Err(VmError::NotFound(path.to_string())),
            s => Err(VmError::Backend(format!("compute API {path}: HTTP {s}"))),
        }
    }

    async fn instance(&self, id: &str) -> Result<InstanceInfo, VmError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("instances/{id}"), None)
            .await
            .map_err(|e| match e {
                VmError::NotFound(_) => VmError::NotFound(id.to_string()),
                other => other,
            })?;
        let body: InstanceResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body.instance)
    }

    async fn password_data(&self, id: &str) -> Result<String, VmError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("instances/{id}/password"), None)
            .await?;
        let body: PasswordResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body.password_data)
    }
}

impl ComputeFleet {
    /// Build a handle scoped to one region/account. No network calls here;
    /// credentials are checked on first use.
    pub fn open(config: &ComputeConfig, pool: SqlitePool) -> Result<Self, VmError> {
        let api = ComputeApi {
            http: crate::drivers::http_client()?,
            base: format!(
                "{}/v1/{}",
                config.endpoint.trim_end_matches('/'),
                config.region
            ),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        };
        Ok(Self {
            api: Arc::new(api),
            image: config.image.clone(),
            flavor: config.flavor.clone(),
            key_name: config.key_name.clone(),
            key_path: config.key_path.clone(),
            assignments: AssignmentStore::new(pool),
        })
    }

    fn handle(&self, info: InstanceInfo) -> Box<dyn Machine> {
        Box::new(ComputeMachine {
            api: Arc::clone(&self.api),
            id: info.id,
            platform: info.platform.unwrap_or_else(|| "unknown".to_string()),
            assignments: self.assignments.clone(),
        })
    }

    fn default_type(&self) -> MachineType {
        MachineType {
            id: self.flavor.clone(),
            image: self.image.clone(),
            flavor: self.flavor.clone(),
        }
    }

    /// Make sure the named keypair exists, persisting fresh key material at
    /// the configured path. The backend refuses a duplicate name, so a
    /// failed create is retried once after deleting the stale remote key —
    /// the same recovery the control plane documents for lost material.
    async fn ensure_keypair(&self) -> Result<(), VmError> {
        if Path::new(&self.key_path).exists() {
            return Ok(());
        }

        let path = format!("keypairs/{}", self.key_name);
        let created = match self.api.request(reqwest::Method::POST, &path, None).await {
            Ok(resp) => resp,
            Err(_) => {
                self.api
                    .request(reqwest::Method::DELETE, &path, None)
                    .await?;
                self.api.request(reqwest::Method::POST, &path, None).await?
            }
        };
        let body: KeypairResponse = created.json().await.map_err(VmError::backend)?;
        std::fs::write(&self.key_path, body.key_material).map_err(VmError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl VmFleet for ComputeFleet {
    async fn machines(&self) -> Result<Vec<Box<dyn Machine>>, VmError> {
        let resp = self.api.request(reqwest::Method::GET, "instances", None).await?;
        let body: ListResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body
            .instances
            .into_iter()
            .filter(|i| i.state != "terminated")
            .map(|i| self.handle(i))
            .collect())
    }

    async fn machine(&self, id: &str) -> Result<Box<dyn Machine>, VmError> {
        let info = self.api.instance(id).await?;
        Ok(self.handle(info))
    }

    #[tracing::instrument(skip_all, fields(name = %attr.name))]
    async fn create(&self, attr: MachineAttributes) -> Result<Box<dyn Machine>, VmError> {
        let machine_type = attr.machine_type.unwrap_or_else(|| self.default_type());

        self.ensure_keypair().await?;

        let request = CreateRequest {
            image: &machine_type.image,
            flavor: &machine_type.flavor,
            name: &attr.name,
            key_name: &self.key_name,
            user_data: BASE64.encode(bootstrap_script(None)),
        };
        let resp = self
            .api
            .request(
                reqwest::Method::POST,
                "instances",
                Some(serde_json::to_value(&request).map_err(VmError::backend)?),
            )
            .await?;
        let body: InstanceResponse = resp.json().await.map_err(VmError::backend)?;
        let id = body.instance.id;

        // The instance is billable from here on. If the fresh handle cannot
        // be resolved, tear it down rather than leak it.
        match self.machine(&id).await {
            Ok(machine) => Ok(machine),
            Err(err) => {
                warn!(machine_id = %id, error = %err, "rolling back unresolvable instance");
                if let Err(rollback) = self
                    .api
                    .request(reqwest::Method::DELETE, &format!("instances/{id}"), None)
                    .await
                {
                    warn!(machine_id = %id, error = %rollback, "rollback terminate failed");
                }
                Err(err)
            }
        }
    }

    async fn types(&self) -> Result<Vec<MachineType>, VmError> {
        let resp = self.api.request(reqwest::Method::GET, "flavors", None).await?;
        let body: FlavorsResponse = resp.json().await.map_err(VmError::backend)?;
        Ok(body
            .flavors
            .into_iter()
            .map(|flavor| MachineType {
                id: flavor.clone(),
                image: self.image.clone(),
                flavor,
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

pub struct ComputeMachine {
    api: Arc<ComputeApi>,
    id: String,
    platform: String,
    assignments: AssignmentStore,
}

/// Translate the backend's native vocabulary into the common model.
///
/// `creds_available` and `health` only matter for the "running" state: a
/// running instance is `Up` only once both gates pass.
fn map_instance_status(
    state: &str,
    health: Option<&str>,
    creds_available: bool,
) -> MachineStatus {
    match state {
        "pending" => MachineStatus::Booting,
        "running" => {
            if !creds_available {
                return MachineStatus::Booting;
            }
            match health {
                Some("ok") | None => MachineStatus::Up,
                Some(_) => MachineStatus::Booting,
            }
        }
        "shutting-down" | "stopped" => MachineStatus::Down,
        "stopping" => MachineStatus::Stopping,
        "terminated" => MachineStatus::Terminated,
        _ => MachineStatus::Unknown,
    }
}

#[async_trait]
impl Machine for ComputeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    async fn name(&self) -> Result<String, VmError> {
        let info = self.api.instance(&self.id).await?;
        Ok(info.name)
    }

    async fn status(&self) -> Result<MachineStatus, VmError> {
        let info = self.api.instance(&self.id).await?;
        let creds_available = if info.state == "running" {
            match self.credentials().await {
                Ok(_) => true,
                Err(VmError::CredentialsPending) => false,
                Err(other) => return Err(other),
            }
        } else {
            false
        };
        Ok(map_instance_status(
            &info.state,
            info.health.as_deref(),
            creds_available,
        ))
    }

    async fn ip(&self) -> Result<Option<IpAddr>, VmError> {
        let info = self.api.instance(&self.id).await?;
        Ok(info.public_ip.and_then(|ip| ip.parse().ok()))
    }

    async fn credentials(&self) -> Result<Credentials, VmError> {
        let password = self.api.password_data(&self.id).await?;
        if password.is_empty() {
            return Err(VmError::CredentialsPending);
        }
        Ok(Credentials {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            password,
        })
    }

    async fn start(&self) -> Result<(), VmError> {
        self.api
            .request(
                reqwest::Method::POST,
                &format!("instances/{}/start", self.id),
                None,
            )
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), VmError> {
        self.api
            .request(
                reqwest::Method::POST,
                &format!("instances/{}/stop", self.id),
                None,
            )
            .await?;
        Ok(())
    }

    async fn terminate(&self) -> Result<(), VmError> {
        self.api
            .request(
                reqwest::Method::DELETE,
                &format!("instances/{}", self.id),
                None,
            )
            .await?;
        self.assignments.remove(&self.id).await.map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_maps_to_booting() {
        assert_eq!(
            map_instance_status("pending", None, false),
            MachineStatus::Booting
        );
    }

    #[test]
    fn test_running_without_credentials_is_booting() {
        assert_eq!(
            map_instance_status("running", Some("ok"), false),
            MachineStatus::Booting
        );
    }

    #[test]
    fn test_running_with_initializing_health_is_booting() {
        assert_eq!(
            map_instance_status("running", Some("initializing"), true),
            MachineStatus::Booting
        );
    }

    #[test]
    fn test_running_ready_is_up() {
        assert_eq!(
            map_instance_status("running", Some("ok"), true),
            MachineStatus::Up
        );
    }

    #[test]
    fn test_stop_states() {
        assert_eq!(
            map_instance_status("stopping", None, false),
            MachineStatus::Stopping
        );
        assert_eq!(
            map_instance_status("stopped", None, false),
            MachineStatus::Down
        );
        assert_eq!(
            map_instance_status("shutting-down", None, false),
            MachineStatus::Down
        );
    }

    #[test]
    fn test_terminated_and_unrecognized() {
        assert_eq!(
            map_instance_status("terminated", None, false),
            MachineStatus::Terminated
        );
        assert_eq!(
            map_instance_status("rebooting-into-the-sea", None, false),
            MachineStatus::Unknown
        );
    }
}
