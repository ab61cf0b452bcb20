//! System OpenSSH client adapter.
//!
//! Runs commands through the local `ssh` binary using a ControlMaster socket,
//! so the first `connect` authenticates once and every later command reuses
//! that single multiplexed login. File operations are expressed as POSIX
//! commands over the same session; transfers use `scp` with the same socket.

use super::{
    CommandOutput, Credentials, DirectoryCreation, FileListing, RemoteFileInfo, SftpConnection,
    SshConnection, SshStatus, TransferResult, quote,
};
use crate::connection::errors::{self, ConnectionError, classify};
use crate::connection::types::ErrorContext;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// `ssh` exits with 255 when the transport itself failed
const SSH_TRANSPORT_FAILURE: i32 = 255;

const LIST_FORMAT: &str = "'%y\\t%s\\t%T@\\t%m\\t%f\\n'";
const STAT_FORMAT: &str = "'%F\t%s\t%Y\t%a\t%n'";

#[derive(Debug, Clone)]
pub struct OpenSshConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Directory holding the ControlMaster socket
    pub control_dir: PathBuf,
    /// Seconds the master connection lingers after the last command
    pub control_persist_secs: u64,
    pub extra_options: Vec<String>,
}

impl Default for OpenSshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            control_dir: std::env::temp_dir(),
            control_persist_secs: 600,
            extra_options: Vec::new(),
        }
    }
}

/// [`SshConnection`] + [`SftpConnection`] on top of the system `ssh`/`scp`
pub struct OpenSshSession {
    config: OpenSshConfig,
    ssh_program: PathBuf,
    scp_program: PathBuf,
    target: Mutex<Option<Credentials>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    connected: AtomicBool,
    // One command at a time against the login node
    exec_lock: tokio::sync::Mutex<()>,
}

impl OpenSshSession {
    pub fn new(config: OpenSshConfig) -> Result<Self, ConnectionError> {
        let ssh_program = which::which("ssh").map_err(|e| {
            ConnectionError::from_template(&errors::INVALID_CONFIG)
                .with_message(format!("OpenSSH client not found: {}", e))
                .with_suggestion("Install the OpenSSH client and make sure `ssh` is on PATH")
        })?;
        let scp_program = which::which("scp").unwrap_or_else(|_| PathBuf::from("scp"));

        Ok(Self {
            config,
            ssh_program,
            scp_program,
            target: Mutex::new(None),
            connected_since: Mutex::new(None),
            connected: AtomicBool::new(false),
            exec_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn target(&self) -> Result<Credentials, ConnectionError> {
        lock(&self.target)
            .clone()
            .ok_or_else(|| ConnectionError::from_template(&errors::NOT_CONNECTED))
    }

    fn control_path(&self) -> PathBuf {
        self.config.control_dir.join("namdrunner-cm-%r@%h:%p")
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path().display()),
            "-o".to_string(),
            format!("ControlPersist={}", self.config.control_persist_secs),
        ];
        options.extend(self.config.extra_options.iter().cloned());
        options
    }

    fn ssh_args(&self, target: &Credentials, remote_command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(format!("{}@{}", target.username, target.host));
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    /// Spawn a local process and capture its output, killing it on timeout
    async fn run_local(
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ConnectionError> {
        let start = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result.map_err(|e| {
                ConnectionError::from_template(&errors::INVALID_CONFIG)
                    .with_message(format!("Failed to spawn {}: {}", program.display(), e))
            })?,
            Err(_) => {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: format!("timed out after {:?}", timeout),
                    exit_code: -1,
                    duration: start.elapsed(),
                    timed_out: true,
                });
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
            timed_out: false,
        })
    }

    /// Run a remote command whose non-zero exit is an error
    async fn run_checked(
        &self,
        command: &str,
        operation: &str,
        path: &str,
    ) -> Result<CommandOutput, ConnectionError> {
        let output = self.execute_command(command, None).await?;
        if output.success() {
            return Ok(output);
        }
        Err(failure(&output, operation, path))
    }

    async fn transfer(
        &self,
        source: String,
        destination: String,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferResult, ConnectionError> {
        let target = self.target()?;
        let mut args = self.common_options();
        args.push("-P".to_string());
        args.push(target.port.to_string());
        args.push(source);
        args.push(destination);

        let output = {
            let _guard = self.exec_lock.lock().await;
            Self::run_local(&self.scp_program, &args, self.config.command_timeout).await?
        };
        if !output.success() {
            return Err(failure(&output, "transfer", remote_path));
        }

        let bytes = tokio::fs::metadata(local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(TransferResult {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            bytes,
        })
    }

    fn remote_spec(target: &Credentials, remote_path: &str) -> String {
        format!("{}@{}:{}", target.username, target.host, quote(remote_path))
    }
}

#[async_trait]
impl SshConnection for OpenSshSession {
    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectionError> {
        info!(
            "Opening SSH session to {}@{}:{}",
            credentials.username, credentials.host, credentials.port
        );

        let args = self.ssh_args(credentials, "true");
        let output = {
            let _guard = self.exec_lock.lock().await;
            Self::run_local(&self.ssh_program, &args, self.config.connect_timeout).await?
        };

        if output.timed_out {
            return Err(ConnectionError::from_template(&errors::CONNECTION_TIMEOUT)
                .with_context(ErrorContext::operation("connect").with_host(&credentials.host)));
        }
        if !output.success() {
            let mut error = ConnectionError::from_raw(&output.stderr)
                .with_context(ErrorContext::operation("connect").with_host(&credentials.host));
            if credentials.password.is_some() && classify(&output.stderr).code == "AUTH_FAILED" {
                error = error.with_suggestion(
                    "Password logins need an interactive ssh session; load a key into ssh-agent",
                );
            }
            return Err(error);
        }

        *lock(&self.target) = Some(credentials.clone());
        *lock(&self.connected_since) = Some(Utc::now());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let target = lock(&self.target).take();
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.connected_since) = None;

        if let Some(target) = target {
            let mut args = vec![
                "-o".to_string(),
                format!("ControlPath={}", self.control_path().display()),
                "-O".to_string(),
                "exit".to_string(),
            ];
            args.push(format!("{}@{}", target.username, target.host));

            let _guard = self.exec_lock.lock().await;
            match Self::run_local(&self.ssh_program, &args, self.config.connect_timeout).await {
                Ok(output) if output.success() => debug!("Closed SSH control master"),
                Ok(output) => debug!("Control master already gone: {}", output.stderr.trim()),
                Err(e) => warn!("Failed to stop SSH control master: {}", e),
            }
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::from_template(&errors::NOT_CONNECTED));
        }
        let target = self.target()?;
        let args = self.ssh_args(&target, command);
        let timeout = timeout.unwrap_or(self.config.command_timeout);

        debug!("Executing remote command: {}", command);
        let output = {
            let _guard = self.exec_lock.lock().await;
            Self::run_local(&self.ssh_program, &args, timeout).await?
        };

        if output.exit_code == SSH_TRANSPORT_FAILURE {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ConnectionError::from_raw(&output.stderr)
                .with_context(ErrorContext::operation("execute_command").with_host(&target.host)));
        }
        Ok(output)
    }

    async fn validate_connection(&self) -> bool {
        matches!(
            self.execute_command("true", Some(self.config.connect_timeout)).await,
            Ok(output) if output.success()
        )
    }

    fn status(&self) -> SshStatus {
        let target = lock(&self.target).clone();
        SshStatus {
            connected: self.is_connected(),
            host: target.as_ref().map(|t| t.host.clone()),
            username: target.map(|t| t.username),
            connected_since: *lock(&self.connected_since),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SftpConnection for OpenSshSession {
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferResult, ConnectionError> {
        let target = self.target()?;
        self.transfer(
            local_path.display().to_string(),
            Self::remote_spec(&target, remote_path),
            local_path,
            remote_path,
        )
        .await
    }

    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferResult, ConnectionError> {
        let target = self.target()?;
        self.transfer(
            Self::remote_spec(&target, remote_path),
            local_path.display().to_string(),
            local_path,
            remote_path,
        )
        .await
    }

    async fn list_files(&self, path: &str) -> Result<FileListing, ConnectionError> {
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -printf {}",
            quote(path),
            LIST_FORMAT
        );
        let output = self.run_checked(&command, "list_files", path).await?;

        let files: Vec<RemoteFileInfo> = output
            .stdout
            .lines()
            .filter_map(|line| parse_find_line(path, line))
            .collect();

        Ok(FileListing {
            total_count: files.len(),
            files,
            path: path.to_string(),
        })
    }

    async fn create_directory(&self, path: &str) -> Result<DirectoryCreation, ConnectionError> {
        let probe = self
            .execute_command(&format!("test -d {}", quote(path)), None)
            .await?;
        if probe.success() {
            return Ok(DirectoryCreation {
                path: path.to_string(),
                created: false,
                existed: true,
            });
        }

        self.run_checked(&format!("mkdir -p {}", quote(path)), "create_directory", path)
            .await?;
        Ok(DirectoryCreation {
            path: path.to_string(),
            created: true,
            existed: false,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<(), ConnectionError> {
        let quoted = quote(path);
        // Empty directories go through rmdir so a populated tree is never removed here
        let command = format!(
            "if [ -d {0} ]; then rmdir {0}; else rm -f {0}; fi",
            quoted
        );
        self.run_checked(&command, "delete_file", path)
            .await
            .map(|_| ())
    }

    async fn exists(&self, path: &str) -> Result<bool, ConnectionError> {
        let output = self
            .execute_command(&format!("test -e {}", quote(path)), None)
            .await?;
        match output.exit_code {
            0 => Ok(true),
            1 if !output.timed_out => Ok(false),
            _ => Err(failure(&output, "exists", path)),
        }
    }

    async fn file_info(&self, path: &str) -> Result<RemoteFileInfo, ConnectionError> {
        let command = format!("stat -c {} {}", STAT_FORMAT, quote(path));
        let output = self.run_checked(&command, "file_info", path).await?;

        output
            .stdout
            .lines()
            .next()
            .and_then(parse_stat_line)
            .ok_or_else(|| {
                ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                    .with_detail(format!("Unexpected stat output for {}", path))
            })
    }
}

fn failure(output: &CommandOutput, operation: &str, path: &str) -> ConnectionError {
    let context = ErrorContext::operation(operation).with_path(path);
    if output.timed_out {
        return ConnectionError::from_template(&errors::COMMAND_TIMEOUT).with_context(context);
    }
    let template = match classify(&output.stderr) {
        template if template.code == errors::UNKNOWN_ERROR.code => &errors::FILE_OPERATION_FAILED,
        template => template,
    };
    ConnectionError::from_template(template)
        .with_detail(output.stderr.trim())
        .with_context(context)
}

fn epoch_to_utc(seconds: f64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds.trunc() as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `%y\t%s\t%T@\t%m\t%f` from `find -printf`
fn parse_find_line(parent: &str, line: &str) -> Option<RemoteFileInfo> {
    let mut fields = line.splitn(5, '\t');
    let kind = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    let modified = fields.next()?.parse::<f64>().ok()?;
    let permissions = fields.next()?.to_string();
    let name = fields.next()?.to_string();

    Some(RemoteFileInfo {
        path: format!("{}/{}", parent.trim_end_matches('/'), name),
        name,
        is_directory: kind == "d",
        size,
        modified: epoch_to_utc(modified),
        permissions,
    })
}

/// `%F\t%s\t%Y\t%a\t%n` from `stat -c`
fn parse_stat_line(line: &str) -> Option<RemoteFileInfo> {
    let mut fields = line.splitn(5, '\t');
    let kind = fields.next()?;
    let size = fields.next()?.parse().ok()?;
    let modified = fields.next()?.parse::<f64>().ok()?;
    let permissions = fields.next()?.to_string();
    let path = fields.next()?.to_string();

    Some(RemoteFileInfo {
        name: path.rsplit('/').next().unwrap_or(&path).to_string(),
        path,
        is_directory: kind == "directory",
        size,
        modified: epoch_to_utc(modified),
        permissions,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
