use super::paths::{self, JobPaths};
use crate::connection::ConnectionError;
use crate::connection::errors::{
    COMMAND_TIMEOUT, DELETE_FAILED, DIRECTORY_ACCESS_FAILED, DIRECTORY_CREATE_FAILED,
    INVALID_PATH, INVALID_USERNAME, LIST_FAILED, NOT_CONNECTED, PATH_NOT_ALLOWED,
};
use crate::connection::types::ErrorContext;
use crate::remote::{CommandOutput, RemoteFileInfo, SftpConnection, SshConnection, quote};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Directories touched by [`WorkspaceManager::setup_user_workspace`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSetup {
    pub base_path: String,
    pub namdrunner_path: String,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub cleaned_jobs: Vec<String>,
    /// `(job id, reason)` for every deletion that failed
    pub failed_jobs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePermissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Sizes as reported by `df -h`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpace {
    pub total: String,
    pub used: String,
    pub available: String,
    pub use_percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceValidation {
    pub valid: bool,
    pub base_path: String,
    pub namdrunner_path: String,
    pub permissions: WorkspacePermissions,
    pub disk_space: Option<DiskSpace>,
    pub issues: Vec<String>,
}

/// Provisions and maintains `/projects/{user}/namdrunner_jobs`
///
/// Every path is built with [`paths`] and checked before a command that
/// modifies it is sent. Remote calls go through the injected ports, which are
/// expected to serialize against the single login session.
pub struct WorkspaceManager {
    ssh: Arc<dyn SshConnection>,
    sftp: Arc<dyn SftpConnection>,
    command_timeout: std::time::Duration,
}

impl WorkspaceManager {
    pub fn new(ssh: Arc<dyn SshConnection>, sftp: Arc<dyn SftpConnection>) -> Self {
        Self {
            ssh,
            sftp,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Make sure the base directory is reachable and the job root exists
    pub async fn setup_user_workspace(&self, user: &str) -> Result<WorkspaceSetup, ConnectionError> {
        require_valid_user(user)?;
        let base_path = paths::user_base_directory(user);
        let namdrunner_path = paths::jobs_root_directory(user);
        let mut setup = WorkspaceSetup {
            base_path: base_path.clone(),
            namdrunner_path: namdrunner_path.clone(),
            created: Vec::new(),
            existed: Vec::new(),
        };

        let base_exists = self.sftp.exists(&base_path).await.map_err(|e| {
            warn!("Cannot access {}: {}", base_path, e);
            ConnectionError::from_template(&DIRECTORY_ACCESS_FAILED)
                .with_message(format!("Cannot access {}: {}", base_path, e.message()))
                .with_context(ErrorContext::operation("setup_user_workspace").with_path(&base_path))
        })?;

        if base_exists {
            setup.existed.push(base_path.clone());
        } else if self.ensure_directory_exists(&base_path).await? {
            setup.created.push(base_path.clone());
        } else {
            setup.existed.push(base_path.clone());
        }

        if self.ensure_directory_exists(&namdrunner_path).await? {
            setup.created.push(namdrunner_path.clone());
        } else {
            setup.existed.push(namdrunner_path.clone());
        }

        info!(
            "Workspace ready for {} (created: {}, existed: {})",
            user,
            setup.created.len(),
            setup.existed.len()
        );
        Ok(setup)
    }

    /// `true` if the directory had to be created, `false` if it was already there
    pub async fn ensure_directory_exists(&self, path: &str) -> Result<bool, ConnectionError> {
        if !paths::validate_path(path) {
            return Err(ConnectionError::from_template(&INVALID_PATH).with_detail(path));
        }

        match self.sftp.create_directory(path).await {
            Ok(creation) => {
                if creation.created {
                    info!("Created remote directory {}", path);
                } else {
                    debug!("Remote directory {} already exists", path);
                }
                Ok(creation.created)
            }
            Err(e) if e.is(&NOT_CONNECTED) => Err(e),
            Err(e) => Err(ConnectionError::from_template(&DIRECTORY_CREATE_FAILED)
                .with_detail(format!("{}: {}", path, e.message()))
                .with_context(ErrorContext::operation("ensure_directory_exists").with_path(path))),
        }
    }

    pub fn job_directory(&self, user: &str, job_id: &str) -> String {
        paths::job_directory(user, job_id)
    }

    pub fn job_paths(&self, user: &str, job_id: &str) -> JobPaths {
        paths::job_paths(user, job_id)
    }

    /// Names of the job directories under the job root
    pub async fn list_jobs(&self, user: &str) -> Result<Vec<String>, ConnectionError> {
        let mut jobs: Vec<String> = self
            .job_entries(user)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        jobs.sort();
        Ok(jobs)
    }

    /// Job directories whose modification time is older than `max_age_days`
    pub async fn stale_jobs(
        &self,
        user: &str,
        max_age_days: u32,
    ) -> Result<Vec<RemoteFileInfo>, ConnectionError> {
        let cutoff = cutoff(Utc::now(), max_age_days);
        Ok(self
            .job_entries(user)
            .await?
            .into_iter()
            .filter(|entry| entry.modified < cutoff)
            .collect())
    }

    /// `rm -rf` the job directory after checking it lies inside the user's workspace
    pub async fn delete_job_directory(&self, user: &str, job_id: &str) -> Result<(), ConnectionError> {
        require_valid_user(user)?;
        if job_id.is_empty() || job_id.contains('/') || job_id == "." || job_id == ".." {
            return Err(ConnectionError::from_template(&INVALID_PATH)
                .with_detail(format!("invalid job id {:?}", job_id)));
        }

        let path = paths::job_directory(user, job_id);
        if !paths::is_path_allowed(&path, user) {
            return Err(ConnectionError::from_template(&PATH_NOT_ALLOWED)
                .with_detail(&path)
                .with_context(ErrorContext::operation("delete_job_directory").with_path(&path)));
        }

        let output = self
            .ssh
            .execute_command(&format!("rm -rf {}", quote(&path)), Some(self.command_timeout))
            .await?;

        if output.timed_out {
            return Err(ConnectionError::from_template(&COMMAND_TIMEOUT)
                .with_detail(format!("rm -rf {}", path))
                .with_context(ErrorContext::operation("delete_job_directory").with_path(&path)));
        }
        if output.exit_code != 0 {
            warn!("Failed to delete {}: {}", path, output.stderr.trim());
            return Err(ConnectionError::from_template(&DELETE_FAILED)
                .with_detail(format!(
                    "{} (exit code {}): {}",
                    path,
                    output.exit_code,
                    output.stderr.trim()
                ))
                .with_context(ErrorContext::operation("delete_job_directory").with_path(&path)));
        }

        info!("Deleted job directory {}", path);
        Ok(())
    }

    /// Delete every job directory older than `max_age_days`
    ///
    /// A listing failure fails the call; a failed deletion is counted and the
    /// remaining directories are still processed.
    pub async fn cleanup_old_jobs(
        &self,
        user: &str,
        max_age_days: u32,
    ) -> Result<CleanupReport, ConnectionError> {
        let entries = self.job_entries(user).await?;
        let cutoff = cutoff(Utc::now(), max_age_days);
        let mut report = CleanupReport {
            scanned: entries.len(),
            ..Default::default()
        };

        for entry in entries.into_iter().filter(|entry| entry.modified < cutoff) {
            match self.delete_job_directory(user, &entry.name).await {
                Ok(()) => {
                    report.cleaned += 1;
                    report.cleaned_jobs.push(entry.name);
                }
                Err(e) => {
                    warn!("Skipping job {} during cleanup: {}", entry.name, e);
                    report.failed += 1;
                    report.failed_jobs.push((entry.name, e.message().to_string()));
                }
            }
        }

        info!(
            "Cleanup for {}: scanned {}, cleaned {}, failed {}",
            user, report.scanned, report.cleaned, report.failed
        );
        Ok(report)
    }

    /// Diagnose the workspace without modifying it
    ///
    /// Only an invalid user name is an error; everything else that fails is
    /// reported through `issues`.
    pub async fn validate_directory_structure(
        &self,
        user: &str,
    ) -> Result<WorkspaceValidation, ConnectionError> {
        require_valid_user(user)?;
        let base_path = paths::user_base_directory(user);
        let namdrunner_path = paths::jobs_root_directory(user);
        let mut issues = Vec::new();

        let base_ok = self
            .directory_present(&base_path, "Base directory", &mut issues)
            .await;
        let jobs_ok = base_ok
            && self
                .directory_present(&namdrunner_path, "Job directory", &mut issues)
                .await;

        let checked = if jobs_ok { &namdrunner_path } else { &base_path };
        let permissions = if base_ok {
            WorkspacePermissions {
                readable: self.test_flag("r", checked).await,
                writable: self.test_flag("w", checked).await,
                executable: self.test_flag("x", checked).await,
            }
        } else {
            WorkspacePermissions::default()
        };
        if base_ok {
            for (granted, what) in [
                (permissions.readable, "readable"),
                (permissions.writable, "writable"),
                (permissions.executable, "searchable"),
            ] {
                if !granted {
                    issues.push(format!("{} is not {}", checked, what));
                }
            }
        }

        let disk_space = match self
            .ssh
            .execute_command(&format!("df -h {}", quote(&base_path)), Some(self.command_timeout))
            .await
        {
            Ok(output) if output.success() => {
                let parsed = parse_df_output(&output.stdout);
                if parsed.is_none() {
                    warn!("Unrecognized df output for {}", base_path);
                }
                parsed
            }
            Ok(output) => {
                debug!("df failed for {}: {}", base_path, output.stderr.trim());
                None
            }
            Err(e) => {
                debug!("df failed for {}: {}", base_path, e);
                None
            }
        };

        let valid = issues.is_empty();
        Ok(WorkspaceValidation {
            valid,
            base_path,
            namdrunner_path,
            permissions,
            disk_space,
            issues,
        })
    }

    async fn job_entries(&self, user: &str) -> Result<Vec<RemoteFileInfo>, ConnectionError> {
        require_valid_user(user)?;
        let root = paths::jobs_root_directory(user);
        let listing = self.sftp.list_files(&root).await.map_err(|e| {
            if e.is(&NOT_CONNECTED) {
                e
            } else {
                ConnectionError::from_template(&LIST_FAILED)
                    .with_detail(format!("{}: {}", root, e.message()))
                    .with_context(ErrorContext::operation("list_jobs").with_path(&root))
            }
        })?;

        Ok(listing
            .files
            .into_iter()
            .filter(|entry| entry.is_directory)
            .collect())
    }

    async fn directory_present(&self, path: &str, label: &str, issues: &mut Vec<String>) -> bool {
        match self.sftp.exists(path).await {
            Ok(true) => true,
            Ok(false) => {
                issues.push(format!("{} {} does not exist", label, path));
                false
            }
            Err(e) => {
                issues.push(format!("Cannot access {}: {}", path, e.message()));
                false
            }
        }
    }

    async fn test_flag(&self, flag: &str, path: &str) -> bool {
        self.ssh
            .execute_command(
                &format!("test -{} {}", flag, quote(path)),
                Some(self.command_timeout),
            )
            .await
            .is_ok_and(|output: CommandOutput| output.success())
    }
}

fn require_valid_user(user: &str) -> Result<(), ConnectionError> {
    if paths::is_valid_username(user) {
        Ok(())
    } else {
        Err(ConnectionError::from_template(&INVALID_USERNAME).with_detail(format!("{:?}", user)))
    }
}

/// Oldest modification time still kept; ages beyond chrono's range keep everything
fn cutoff(now: DateTime<Utc>, max_age_days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(max_age_days))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse the data row of `df -h` output
///
/// Handles long filesystem names that `df` wraps onto their own line. Returns
/// `None` for anything that does not look like a df table.
pub fn parse_df_output(output: &str) -> Option<DiskSpace> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next()?;
    if !header.trim_start().starts_with("Filesystem") {
        return None;
    }

    let tokens: Vec<&str> = lines.flat_map(str::split_whitespace).collect();
    if tokens.len() < 6 {
        return None;
    }

    let (total, used, available, percent) = (tokens[1], tokens[2], tokens[3], tokens[4]);
    let looks_like_size =
        |value: &str| value.chars().next().is_some_and(|c| c.is_ascii_digit());
    if !(looks_like_size(total) && looks_like_size(used) && looks_like_size(available)) {
        return None;
    }
    let percent = percent.strip_suffix('%')?;

    Some(DiskSpace {
        total: total.to_string(),
        used: used.to_string(),
        available: available.to_string(),
        use_percent: percent.parse().ok(),
    })
}
