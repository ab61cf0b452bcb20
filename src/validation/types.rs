use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the TCP reachability probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCheck {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl NetworkCheck {
    pub fn success(&self) -> bool {
        self.reachable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshPermissions {
    pub can_read_home: bool,
    pub can_write_home: bool,
    pub can_create_directories: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshValidation {
    pub can_connect: bool,
    pub can_execute_commands: bool,
    pub shell_type: Option<String>,
    pub home_directory: Option<String>,
    pub permissions: SshPermissions,
    pub errors: Vec<String>,
}

impl SshValidation {
    pub fn success(&self) -> bool {
        self.can_connect && self.can_execute_commands
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SftpValidation {
    pub can_connect: bool,
    pub can_list_files: bool,
    pub can_create_directories: bool,
    pub errors: Vec<String>,
}

impl SftpValidation {
    pub fn success(&self) -> bool {
        self.can_connect && self.can_list_files && self.can_create_directories
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlurmValidation {
    pub module_system_available: bool,
    pub slurm_available: bool,
    pub can_submit_jobs: bool,
    pub can_query_jobs: bool,
    pub available_partitions: Vec<String>,
    pub errors: Vec<String>,
}

impl SlurmValidation {
    pub fn success(&self) -> bool {
        self.slurm_available && self.can_query_jobs
    }
}

/// Aggregate of all four validation layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullValidationResult {
    pub network: NetworkCheck,
    pub ssh: SshValidation,
    pub sftp: SftpValidation,
    pub slurm: SlurmValidation,
    pub overall_success: bool,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Layer result that can stand in for a probe that crashed
pub(crate) trait LayerOutcome: Sized {
    fn probe_failed(message: String) -> Self;
}

impl LayerOutcome for NetworkCheck {
    fn probe_failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Default::default()
        }
    }
}

impl LayerOutcome for SshValidation {
    fn probe_failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

impl LayerOutcome for SftpValidation {
    fn probe_failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}

impl LayerOutcome for SlurmValidation {
    fn probe_failed(message: String) -> Self {
        Self {
            errors: vec![message],
            ..Default::default()
        }
    }
}
