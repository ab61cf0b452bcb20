//! Environment constants and path utilities for the NAMDRunner connection core.
//!
//! This module centralizes the remote directory layout, the probe commands the
//! validators send to the login node, and the local paths used for
//! configuration and session persistence.

/// Local application directory name (hidden directory like .git, .ssh)
pub const APP_DIR_NAME: &str = ".namdrunner";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "namdrunner.toml";

/// Persisted session file name
pub const SESSION_FILE_NAME: &str = "session.json";

/// Remote workspace layout on the cluster
pub mod remote {
    /// Root under which every user's base directory lives
    pub const PROJECTS_ROOT: &str = "/projects";

    /// Job root directory name inside the user's base directory
    pub const JOBS_DIR_NAME: &str = "namdrunner_jobs";

    pub const LOGS_DIR_NAME: &str = "logs";
    pub const INPUTS_DIR_NAME: &str = "inputs";
    pub const OUTPUTS_DIR_NAME: &str = "outputs";
    pub const SCRATCH_DIR_NAME: &str = "scratch";

    /// Job metadata file name
    pub const JOB_CONFIG_FILE_NAME: &str = "job.json";

    /// SLURM batch script file name
    pub const SLURM_SCRIPT_FILE_NAME: &str = "job.slurm";

    pub const STDOUT_LOG_FILE_NAME: &str = "job.out";
    pub const STDERR_LOG_FILE_NAME: &str = "job.err";
    pub const SLURM_LOG_FILE_NAME: &str = "slurm.log";

    /// Fallback used when a job id sanitizes to nothing
    pub const UNNAMED_JOB_ID: &str = "unnamed";
}

/// Commands sent to the login node by the validators and workspace manager
pub mod probes {
    pub const ECHO_TEST: &str = "echo \"test\"";
    pub const PWD: &str = "pwd";
    pub const SHELL_IDENTITY: &str = "echo $0";
    pub const HOME_READABLE: &str = "test -r \"$HOME\"";
    pub const HOME_WRITABLE: &str = "test -w \"$HOME\"";
    pub const HOME_MKDIR: &str =
        "mkdir -p \"$HOME/.namdrunner_probe\" && rmdir \"$HOME/.namdrunner_probe\"";
    pub const MODULE_VERSION: &str = "module --version";
    pub const SINFO_VERSION: &str = "sinfo --version";
    pub const SINFO_PARTITIONS: &str = "sinfo -h -o \"%P\"";
    pub const SBATCH_LOCATE: &str = "command -v sbatch";

    /// Directory name prefix for the SFTP directory-creation smoke test
    pub const SFTP_PROBE_DIR_PREFIX: &str = ".namdrunner_sftp_probe";
}

/// Test-related constants
pub mod test {
    pub const TEST_HOST: &str = "login.cluster.test";
    pub const TEST_USER: &str = "alice";
    pub const TEST_HOME: &str = "/home/alice";
}

use std::path::{Path, PathBuf};

/// Build the local application directory path inside a home directory
pub fn user_app_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_app_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build the default persisted session file path
pub fn user_session_file_path(home_dir: &Path) -> PathBuf {
    user_app_dir_path(home_dir).join(SESSION_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Home directory from `HOME` (or `USERPROFILE` on Windows)
pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
