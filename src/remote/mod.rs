//! # Remote Capability Ports
//!
//! The connection core never speaks SSH itself. It orchestrates calls against
//! two small capability traits that an adapter implements:
//!
//! - **[`SshConnection`]**: connect/disconnect and command execution on the login node
//! - **[`SftpConnection`]**: directory listing, creation, existence checks and transfers
//!
//! Two implementations ship with the crate:
//!
//! - **[`OpenSshSession`]**: drives the system `ssh`/`scp` binaries over a
//!   ControlMaster socket, serializing every command against the single session
//! - **[`FakeCluster`]**: in-memory login node with a directory tree, scripted
//!   command output and injectable failures, used throughout the tests
//!
//! Every port method returns `Result<_, ConnectionError>`; adapters classify
//! their raw failures with [`crate::connection::errors::classify`].

use crate::connection::ConnectionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// In-memory login node for tests and demos.
pub mod fake;

/// System OpenSSH client adapter.
pub mod openssh;

pub use fake::FakeCluster;
pub use openssh::{OpenSshConfig, OpenSshSession};

/// Login target and secret for one connection attempt
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            password: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    /// Exit code 0 and no timeout
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SshStatus {
    pub connected: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub permissions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListing {
    pub files: Vec<RemoteFileInfo>,
    pub total_count: usize,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCreation {
    pub path: String,
    pub created: bool,
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub bytes: u64,
}

/// Command execution and session lifecycle on the login node
#[async_trait]
pub trait SshConnection: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectionError>;

    async fn disconnect(&self) -> Result<(), ConnectionError>;

    /// Run `command` through the remote login shell
    ///
    /// A command that exceeds `timeout` is reported through
    /// [`CommandOutput::timed_out`], not as an `Err`.
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectionError>;

    /// Round-trip check that the session still works
    async fn validate_connection(&self) -> bool;

    fn status(&self) -> SshStatus;

    fn is_connected(&self) -> bool;
}

/// File-level access to the login node
#[async_trait]
pub trait SftpConnection: Send + Sync {
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferResult, ConnectionError>;

    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferResult, ConnectionError>;

    async fn list_files(&self, path: &str) -> Result<FileListing, ConnectionError>;

    /// Create `path` (and missing parents); reports whether it already existed
    async fn create_directory(&self, path: &str) -> Result<DirectoryCreation, ConnectionError>;

    async fn delete_file(&self, path: &str) -> Result<(), ConnectionError>;

    /// True iff `path` is a known file or directory
    async fn exists(&self, path: &str) -> Result<bool, ConnectionError>;

    async fn file_info(&self, path: &str) -> Result<RemoteFileInfo, ConnectionError>;
}

/// Shell-quote a remote path for use in a command line
pub fn quote(path: &str) -> String {
    shell_escape::unix::escape(path.into()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("login.cluster", "alice").with_password("hunter2");
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_quote_leaves_plain_paths_alone() {
        assert_eq!(quote("/projects/alice/namdrunner_jobs"), "/projects/alice/namdrunner_jobs");
        assert_eq!(quote("/tmp/with space"), "'/tmp/with space'");
    }
}
