use serde::{Deserialize, Serialize};

/// Observed lifecycle state of a machine.
///
/// Every backend reports its own native state vocabulary; adapters translate
/// into this common model. `Up` is the sole readiness gate: a machine is `Up`
/// only when the backend reports it running, its administrator credentials
/// are retrievable, and any finer backend health signal is healthy. A machine
/// that is running but not yet ready must be reported as `Booting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Booting,
    Up,
    Down,
    Stopping,
    Terminated,
    /// Observation failure or unrecognized native state. Never a transition
    /// target — only returned to the caller of a status query.
    Unknown,
}

impl MachineStatus {
    /// Terminated machines accept no further operations.
    pub fn is_terminal(self) -> bool {
        self == MachineStatus::Terminated
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Booting => write!(f, "booting"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Stopping => write!(f, "stopping"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(MachineStatus::Booting.to_string(), "booting");
        assert_eq!(MachineStatus::Up.to_string(), "up");
        assert_eq!(MachineStatus::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_only_terminated_is_terminal() {
        assert!(MachineStatus::Terminated.is_terminal());
        for status in [
            MachineStatus::Booting,
            MachineStatus::Up,
            MachineStatus::Down,
            MachineStatus::Stopping,
            MachineStatus::Unknown,
        ] {
            assert!(!status.is_terminal(), "{} should not be terminal", status);
        }
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let json = serde_json::to_string(&MachineStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
        let parsed: MachineStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, MachineStatus::Stopping);
    }
}
