use super::types::{
    FullValidationResult, LayerOutcome, NetworkCheck, SftpValidation, SlurmValidation,
    SshValidation,
};
use crate::connection::ConnectionError;
use crate::connection::errors::{
    CONNECTION_TIMEOUT, NETWORK_UNREACHABLE, NOT_CONNECTED, PROBE_PANICKED, panic_message,
};
use crate::env::probes;
use crate::remote::{CommandOutput, Credentials, SftpConnection, SshConnection};
use crate::workspace::paths;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Host name fragments that are never probed
const BAD_HOST_MARKERS: &[&str] = &["unreachable", "invalid"];

pub const UNREACHABLE_HOST_MESSAGE: &str = "Host is unreachable";
pub const SSH_NOT_CONNECTED_MESSAGE: &str = "SSH connection is not established";
pub const SLURM_REQUIRES_SSH_MESSAGE: &str = "SSH connection required for SLURM validation";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Answers whether a TCP endpoint accepts connections
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Round-trip latency of a successful connect
    async fn probe(&self, host: &str, port: u16) -> Result<Duration, ConnectionError>;
}

/// Real TCP connect with a timeout per resolved address
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> Result<Duration, ConnectionError> {
        let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
            ConnectionError::from_template(&NETWORK_UNREACHABLE)
                .with_detail(format!("Could not resolve hostname {}: {}", host, e))
        })?;

        let mut timed_out = false;
        for addr in addrs {
            let started = Instant::now();
            match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => return Ok(started.elapsed()),
                Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
                Err(_) => timed_out = true,
            }
        }

        if timed_out {
            Err(ConnectionError::from_template(&CONNECTION_TIMEOUT)
                .with_detail(format!("{}:{}", host, port)))
        } else {
            Err(ConnectionError::from_template(&NETWORK_UNREACHABLE)
                .with_detail(format!("{}:{}", host, port)))
        }
    }
}

/// Layered network → SSH → SFTP → SLURM diagnosis
///
/// None of the checks return errors or panic across this boundary; each layer
/// reports its own `errors` so a caller can render partial results.
#[derive(Clone)]
pub struct ConnectivityValidator {
    probe: Arc<dyn NetworkProbe>,
    command_timeout: Duration,
}

impl ConnectivityValidator {
    pub fn new(probe: Arc<dyn NetworkProbe>) -> Self {
        Self {
            probe,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub async fn test_basic_connectivity(&self, target: &Credentials) -> NetworkCheck {
        let host = target.host.trim();
        if host.is_empty() {
            return NetworkCheck {
                error: Some("Host is not configured".to_string()),
                ..Default::default()
            };
        }

        let lower = host.to_ascii_lowercase();
        if BAD_HOST_MARKERS.iter().any(|marker| lower.contains(marker)) {
            debug!("Skipping probe for known-bad host {}", host);
            return NetworkCheck {
                error: Some(UNREACHABLE_HOST_MESSAGE.to_string()),
                ..Default::default()
            };
        }

        match self.probe.probe(host, target.port).await {
            Ok(latency) => NetworkCheck {
                reachable: true,
                latency_ms: Some(latency.as_millis() as u64),
                error: None,
            },
            Err(e) => {
                warn!("Network check for {}:{} failed: {}", host, target.port, e);
                NetworkCheck {
                    error: Some(e.message().to_string()),
                    ..Default::default()
                }
            }
        }
    }

    pub async fn validate_ssh_access(&self, ssh: &dyn SshConnection) -> SshValidation {
        let mut result = SshValidation::default();

        if !ssh.is_connected() {
            result.errors.push(SSH_NOT_CONNECTED_MESSAGE.to_string());
            return result;
        }
        result.can_connect = true;

        match self.run(ssh, probes::ECHO_TEST).await {
            Ok(output) if output.stdout.contains("test") => result.can_execute_commands = true,
            Ok(output) => result
                .errors
                .push(format!("Command execution failed: {}", describe(&output))),
            Err(e) => result
                .errors
                .push(format!("Command execution failed: {}", e.message())),
        }

        match self.run(ssh, probes::PWD).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                result.home_directory = Some(output.stdout.trim().to_string());
            }
            Ok(output) => result
                .errors
                .push(format!("Could not determine home directory: {}", describe(&output))),
            Err(e) => result
                .errors
                .push(format!("Could not determine home directory: {}", e.message())),
        }

        match self.run(ssh, probes::SHELL_IDENTITY).await {
            Ok(output) if output.success() => result.shell_type = shell_name(&output.stdout),
            Ok(output) => result
                .errors
                .push(format!("Could not determine shell: {}", describe(&output))),
            Err(e) => result
                .errors
                .push(format!("Could not determine shell: {}", e.message())),
        }

        result.permissions.can_read_home =
            self.check(ssh, probes::HOME_READABLE, "Home directory is not readable", &mut result.errors)
                .await;
        result.permissions.can_write_home =
            self.check(ssh, probes::HOME_WRITABLE, "Home directory is not writable", &mut result.errors)
                .await;
        result.permissions.can_create_directories = self
            .check(
                ssh,
                probes::HOME_MKDIR,
                "Cannot create directories in home directory",
                &mut result.errors,
            )
            .await;

        debug!(
            "SSH validation: execute={} shell={:?} errors={}",
            result.can_execute_commands,
            result.shell_type,
            result.errors.len()
        );
        result
    }

    /// List `probe_root` and create/remove a scratch directory beneath it
    pub async fn validate_sftp_access(
        &self,
        sftp: &dyn SftpConnection,
        probe_root: &str,
    ) -> SftpValidation {
        let mut result = SftpValidation::default();

        match sftp.list_files(probe_root).await {
            Ok(_) => {
                result.can_connect = true;
                result.can_list_files = true;
            }
            Err(e) if e.is(&NOT_CONNECTED) => {
                result.errors.push("SFTP connection is not established".to_string());
                return result;
            }
            Err(e) => {
                result.can_connect = true;
                result
                    .errors
                    .push(format!("Cannot list files via SFTP: {}", e.message()));
            }
        }

        let scratch = format!(
            "{}/{}_{}",
            probe_root.trim_end_matches('/'),
            probes::SFTP_PROBE_DIR_PREFIX,
            uuid::Uuid::new_v4().simple()
        );
        match sftp.create_directory(&scratch).await {
            Ok(_) => {
                result.can_create_directories = true;
                if let Err(e) = sftp.delete_file(&scratch).await {
                    warn!("Could not remove SFTP probe directory {}: {}", scratch, e);
                }
            }
            Err(e) => result
                .errors
                .push(format!("Cannot create directories via SFTP: {}", e.message())),
        }

        debug!(
            "SFTP validation: list={} create={}",
            result.can_list_files, result.can_create_directories
        );
        result
    }

    pub async fn test_slurm_access(&self, ssh: &dyn SshConnection) -> SlurmValidation {
        let mut result = SlurmValidation::default();

        if !ssh.is_connected() {
            result.errors.push(SLURM_REQUIRES_SSH_MESSAGE.to_string());
            return result;
        }

        result.module_system_available = self
            .check(
                ssh,
                probes::MODULE_VERSION,
                "Module system is not available",
                &mut result.errors,
            )
            .await;
        result.slurm_available = self
            .check(
                ssh,
                probes::SINFO_VERSION,
                "SLURM commands are not available",
                &mut result.errors,
            )
            .await;

        match self.run(ssh, probes::SINFO_PARTITIONS).await {
            Ok(output) if output.success() => {
                result.can_query_jobs = true;
                result.available_partitions = parse_partitions(&output.stdout);
            }
            Ok(output) => result
                .errors
                .push(format!("Cannot list SLURM partitions: {}", describe(&output))),
            Err(e) => result
                .errors
                .push(format!("Cannot list SLURM partitions: {}", e.message())),
        }

        let sbatch_found = self
            .check(
                ssh,
                probes::SBATCH_LOCATE,
                "sbatch is not on the PATH",
                &mut result.errors,
            )
            .await;
        result.can_submit_jobs =
            result.slurm_available && sbatch_found && !result.available_partitions.is_empty();

        debug!(
            "SLURM validation: available={} partitions={:?}",
            result.slurm_available, result.available_partitions
        );
        result
    }

    /// Run every layer and aggregate a diagnosis
    ///
    /// SFTP checks run against the home directory reported by the SSH layer,
    /// falling back to `/projects/{user}`.
    pub async fn run_full_validation(
        &self,
        target: &Credentials,
        ssh: &dyn SshConnection,
        sftp: &dyn SftpConnection,
    ) -> FullValidationResult {
        let network = guarded("network", self.test_basic_connectivity(target)).await;
        let ssh_result = guarded("ssh", self.validate_ssh_access(ssh)).await;

        let probe_root = ssh_result
            .home_directory
            .clone()
            .unwrap_or_else(|| paths::user_base_directory(&target.username));
        let sftp_result = guarded("sftp", self.validate_sftp_access(sftp, &probe_root)).await;
        let slurm = guarded("slurm", self.test_slurm_access(ssh)).await;

        let overall_success =
            network.success() && ssh_result.success() && sftp_result.success() && slurm.success();
        let recommendations = recommendations(&network, &ssh_result, &sftp_result, &slurm);

        if overall_success {
            debug!("Full validation of {} passed", target.host);
        } else {
            warn!(
                "Full validation of {} failed with {} recommendation(s)",
                target.host,
                recommendations.len()
            );
        }

        FullValidationResult {
            network,
            ssh: ssh_result,
            sftp: sftp_result,
            slurm,
            overall_success,
            recommendations,
            timestamp: Utc::now(),
        }
    }

    /// Connected and able to run a trivial command
    pub async fn quick_health_check(&self, ssh: &dyn SshConnection) -> bool {
        let check = async {
            ssh.is_connected()
                && self
                    .run(ssh, probes::ECHO_TEST)
                    .await
                    .is_ok_and(|output| output.success())
        };
        AssertUnwindSafe(check).catch_unwind().await.unwrap_or(false)
    }

    pub async fn check_slurm_access(&self, ssh: &dyn SshConnection) -> bool {
        AssertUnwindSafe(self.test_slurm_access(ssh))
            .catch_unwind()
            .await
            .is_ok_and(|slurm| slurm.slurm_available)
    }

    pub async fn can_submit_jobs(&self, ssh: &dyn SshConnection) -> bool {
        AssertUnwindSafe(self.test_slurm_access(ssh))
            .catch_unwind()
            .await
            .is_ok_and(|slurm| slurm.can_submit_jobs)
    }

    async fn run(
        &self,
        ssh: &dyn SshConnection,
        command: &str,
    ) -> Result<CommandOutput, ConnectionError> {
        ssh.execute_command(command, Some(self.command_timeout)).await
    }

    /// Exit status 0 of `command`; otherwise records `failure` in `errors`
    async fn check(
        &self,
        ssh: &dyn SshConnection,
        command: &str,
        failure: &str,
        errors: &mut Vec<String>,
    ) -> bool {
        match self.run(ssh, command).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                errors.push(format!("{}: {}", failure, describe(&output)));
                false
            }
            Err(e) => {
                errors.push(format!("{}: {}", failure, e.message()));
                false
            }
        }
    }
}

impl Default for ConnectivityValidator {
    fn default() -> Self {
        Self::new(Arc::new(TcpProbe::default()))
    }
}

/// Await one layer, turning a panic into a failed layer result
async fn guarded<T, F>(layer: &str, check: F) -> T
where
    T: LayerOutcome,
    F: Future<Output = T>,
{
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let error = ConnectionError::from_template(&PROBE_PANICKED)
                .with_detail(format!("{} check: {}", layer, panic_message(payload.as_ref())));
            warn!("{}", error);
            T::probe_failed(error.message().to_string())
        }
    }
}

fn recommendations(
    network: &NetworkCheck,
    ssh: &SshValidation,
    sftp: &SftpValidation,
    slurm: &SlurmValidation,
) -> Vec<String> {
    let mut recommendations = Vec::new();
    let mut add = |text: &str| {
        if !recommendations.iter().any(|existing| existing == text) {
            recommendations.push(text.to_string());
        }
    };

    if !network.reachable {
        add("Check network connectivity to the cluster");
        add("Verify the cluster hostname and port");
    }
    if !ssh.can_connect {
        add("Verify SSH service is running on the cluster");
    } else {
        if !ssh.can_execute_commands {
            add("Check that your login shell starts without errors");
        }
        if !ssh.permissions.can_write_home || !ssh.permissions.can_create_directories {
            add("Check write permissions on your home directory");
        }
    }
    if ssh.can_connect && (!sftp.can_list_files || !sftp.can_create_directories) {
        add("Verify SFTP access is enabled for your account");
    }
    if ssh.can_connect {
        if !slurm.module_system_available {
            add("Check that the module system is available on the login node");
        }
        if !slurm.slurm_available {
            add("Verify SLURM commands are available on the login node");
        } else if slurm.available_partitions.is_empty() {
            add("No SLURM partitions are visible; contact the cluster administrators");
        }
    }

    recommendations
}

/// `-bash` or `/bin/zsh` → `bash` / `zsh`
fn shell_name(raw: &str) -> Option<String> {
    let name = raw.trim().trim_start_matches('-');
    let name = name.rsplit('/').next().unwrap_or(name);
    (!name.is_empty()).then(|| name.to_string())
}

/// Partition names, one per line; the default partition carries a trailing `*`
fn parse_partitions(stdout: &str) -> Vec<String> {
    let mut partitions: Vec<String> = Vec::new();
    for line in stdout.lines() {
        let name = line.trim().trim_end_matches('*');
        if !name.is_empty() && !partitions.iter().any(|p| p == name) {
            partitions.push(name.to_string());
        }
    }
    partitions
}

fn describe(output: &CommandOutput) -> String {
    if output.timed_out {
        "timed out".to_string()
    } else if output.stderr.trim().is_empty() {
        format!("exit code {}", output.exit_code)
    } else {
        format!("exit code {} ({})", output.exit_code, output.stderr.trim())
    }
}
