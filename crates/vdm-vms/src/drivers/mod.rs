use rand::Rng;
use rand::distributions::Alphanumeric;

use vdm_core::VmError;
use vdm_store::StoreError;

pub mod compute;
pub mod mock;
pub mod registry;
pub mod stack;

/// Agent port opened by the bootstrap script inside every guest.
pub const AGENT_PORT: u16 = 9090;

/// Shared HTTP client for backend control planes and agent probes.
pub(crate) fn http_client() -> Result<reqwest::Client, VmError> {
    reqwest::Client::builder()
        .user_agent(concat!("vdm/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(VmError::backend)
}

/// Map store failures into the driver taxonomy. Missing rows become
/// `RecordMissing` (backend/store drift); everything else is a backend
/// error from the broker's point of view.
pub(crate) fn store_err(err: StoreError) -> VmError {
    match err {
        StoreError::RowNotFound { .. } => VmError::RecordMissing(err.to_string()),
        other => VmError::Backend(other.to_string()),
    }
}

/// The opaque agent-install payload handed to a new guest as user data.
///
/// When `admin_password` is given the script also resets the administrator
/// account before installing the agent (backends whose images boot with a
/// blank password).
pub(crate) fn bootstrap_script(admin_password: Option<&str>) -> String {
    let mut script = String::from("<powershell>\n");
    if let Some(password) = admin_password {
        script.push_str(&format!(
            "$admin = [adsi]\"WinNT://$(hostname)/Administrator\"\n$admin.changePassword(\"\", \"{password}\")\n"
        ));
    }
    script.push_str(&format!(
        "Invoke-WebRequest https://get.vdm.example.com/desktop-agent.exe -OutFile C:\\desktop-agent.exe\n\
         C:\\desktop-agent.exe install\n\
         New-NetFirewallRule -Protocol TCP -LocalPort {AGENT_PORT} -Direction Inbound -Action Allow -DisplayName VDM-AGENT\n\
         </powershell>\n"
    ));
    script
}

/// Random 16-char alphanumeric administrator password for machines whose
/// requested password was left empty.
pub(crate) fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_script_embeds_password_reset_only_on_request() {
        let with = bootstrap_script(Some("s3cret"));
        assert!(with.contains("changePassword"));
        assert!(with.contains("s3cret"));

        let without = bootstrap_script(None);
        assert!(!without.contains("changePassword"));
        assert!(without.contains("desktop-agent.exe"));
    }

    #[test]
    fn test_generated_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.len(), 16);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pw, generate_password());
    }

    #[test]
    fn test_store_err_maps_missing_row_to_record_missing() {
        let err = store_err(StoreError::RowNotFound {
            table: "assignments",
            machine_id: "srv-1".to_string(),
        });
        assert!(matches!(err, VmError::RecordMissing(_)));
    }
}
