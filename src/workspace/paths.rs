//! Remote path resolution for the per-user job workspace.
//!
//! Pure functions, no I/O. Every remote command that touches a path is built
//! from these helpers and checked with [`validate_path`] / [`is_path_allowed`]
//! before it leaves the client.

use crate::env::remote;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static INVALID_JOB_ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("valid regex"));

static REPEATED_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("valid regex"));

static JOB_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"/{}/([^/]+)(?:/|$)", remote::JOBS_DIR_NAME)).expect("valid regex")
});

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

/// Every path that belongs to one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    pub job_dir: String,
    pub logs_dir: String,
    pub inputs_dir: String,
    pub outputs_dir: String,
    pub scratch_dir: String,
    pub config_file: String,
    pub slurm_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFiles {
    pub stdout: String,
    pub stderr: String,
    pub slurm: String,
}

/// [`JobPaths`] plus the log file locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedJobPaths {
    #[serde(flatten)]
    pub paths: JobPaths,
    pub log_files: LogFiles,
}

/// `/projects/{user}`
pub fn user_base_directory(user: &str) -> String {
    format!("{}/{}", remote::PROJECTS_ROOT, user)
}

/// `/projects/{user}/namdrunner_jobs`
pub fn jobs_root_directory(user: &str) -> String {
    format!("{}/{}", user_base_directory(user), remote::JOBS_DIR_NAME)
}

/// `/projects/{user}/namdrunner_jobs/{job_id}`
pub fn job_directory(user: &str, job_id: &str) -> String {
    format!("{}/{}", jobs_root_directory(user), job_id)
}

pub fn job_paths(user: &str, job_id: &str) -> JobPaths {
    let job_dir = job_directory(user, job_id);
    JobPaths {
        logs_dir: format!("{}/{}", job_dir, remote::LOGS_DIR_NAME),
        inputs_dir: format!("{}/{}", job_dir, remote::INPUTS_DIR_NAME),
        outputs_dir: format!("{}/{}", job_dir, remote::OUTPUTS_DIR_NAME),
        scratch_dir: format!("{}/{}", job_dir, remote::SCRATCH_DIR_NAME),
        config_file: format!("{}/{}", job_dir, remote::JOB_CONFIG_FILE_NAME),
        slurm_script: format!("{}/{}", job_dir, remote::SLURM_SCRIPT_FILE_NAME),
        job_dir,
    }
}

pub fn extended_job_paths(user: &str, job_id: &str) -> ExtendedJobPaths {
    let paths = job_paths(user, job_id);
    let log_files = LogFiles {
        stdout: format!("{}/{}", paths.logs_dir, remote::STDOUT_LOG_FILE_NAME),
        stderr: format!("{}/{}", paths.logs_dir, remote::STDERR_LOG_FILE_NAME),
        slurm: format!("{}/{}", paths.logs_dir, remote::SLURM_LOG_FILE_NAME),
    };
    ExtendedJobPaths { paths, log_files }
}

/// Absolute, no `..` segment, no `//`
pub fn validate_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.contains("//")
        && !path.contains('\0')
        && !path.split('/').any(|segment| segment == "..")
}

/// Map a user-supplied job id onto `[A-Za-z0-9_-]`
///
/// Invalid characters become `_`, runs of `_` collapse, and leading/trailing
/// `_` are trimmed. An empty result becomes `"unnamed"`. Idempotent.
pub fn sanitize_job_id(raw: &str) -> String {
    let replaced = INVALID_JOB_ID_CHARS.replace_all(raw, "_");
    let collapsed = REPEATED_UNDERSCORES.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_');

    if trimmed.is_empty() {
        remote::UNNAMED_JOB_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Job id from a path shaped like `.../namdrunner_jobs/{id}[/...]`
pub fn extract_job_id_from_path(path: &str) -> Option<String> {
    JOB_PATH
        .captures(path)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
        .filter(|id| id != "." && id != "..")
}

/// Login names accepted when building paths
pub fn is_valid_username(user: &str) -> bool {
    USERNAME.is_match(user) && user != "." && user != ".."
}

/// True iff `path` is `/projects/{user}` or lies beneath it
pub fn is_path_allowed(path: &str, user: &str) -> bool {
    if !is_valid_username(user) || !validate_path(path) {
        return false;
    }
    let base = user_base_directory(user);
    path == base
        || path
            .strip_prefix(base.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
