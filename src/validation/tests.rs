use crate::env::{probes, test as fixtures};
use crate::remote::{CommandOutput, Credentials, FakeCluster};
use crate::validation::connectivity::{SLURM_REQUIRES_SSH_MESSAGE, UNREACHABLE_HOST_MESSAGE};
use crate::validation::*;
use std::sync::Arc;

fn validator_for(cluster: &Arc<FakeCluster>) -> ConnectivityValidator {
    ConnectivityValidator::new(cluster.clone())
}

fn target() -> Credentials {
    Credentials::new(fixtures::TEST_HOST, fixtures::TEST_USER)
}

#[tokio::test]
async fn test_basic_connectivity_reachable() {
    let cluster = Arc::new(FakeCluster::connected());
    let check = validator_for(&cluster).test_basic_connectivity(&target()).await;

    assert!(check.reachable);
    assert!(check.latency_ms.is_some());
    assert_eq!(check.error, None);
}

#[tokio::test]
async fn test_basic_connectivity_bad_host_markers() {
    let cluster = Arc::new(FakeCluster::connected());
    let validator = validator_for(&cluster);

    for host in ["unreachable.cluster.edu", "invalid-host", "INVALID.example"] {
        let check = validator
            .test_basic_connectivity(&Credentials::new(host, "alice"))
            .await;
        assert!(!check.reachable, "{}", host);
        assert_eq!(check.error.as_deref(), Some(UNREACHABLE_HOST_MESSAGE));
    }
}

#[tokio::test]
async fn test_basic_connectivity_probe_failure() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.set_unreachable(true);

    let check = validator_for(&cluster).test_basic_connectivity(&target()).await;
    assert!(!check.reachable);
    assert!(check.error.unwrap().contains("Cannot reach the cluster login node"));
}

#[tokio::test]
async fn test_ssh_validation_short_circuits_when_disconnected() {
    let cluster = Arc::new(FakeCluster::new());
    let result = validator_for(&cluster)
        .validate_ssh_access(cluster.as_ref())
        .await;

    assert!(!result.can_connect);
    assert!(!result.can_execute_commands);
    assert_eq!(result.errors.len(), 1);
    assert!(cluster.executed_commands().is_empty());
}

#[tokio::test]
async fn test_ssh_validation_derives_shell_and_home() {
    let cluster = Arc::new(FakeCluster::connected());
    let result = validator_for(&cluster)
        .validate_ssh_access(cluster.as_ref())
        .await;

    assert!(result.success());
    assert_eq!(result.shell_type.as_deref(), Some("bash"));
    assert_eq!(result.home_directory.as_deref(), Some(fixtures::TEST_HOME));
    assert!(result.permissions.can_read_home);
    assert!(result.permissions.can_write_home);
    assert!(result.permissions.can_create_directories);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
}

#[tokio::test]
async fn test_ssh_validation_tolerates_single_command_failure() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.respond(probes::PWD, CommandOutput::failed(1, "pwd: error"));
    cluster.respond(probes::HOME_WRITABLE, CommandOutput::failed(1, ""));

    let result = validator_for(&cluster)
        .validate_ssh_access(cluster.as_ref())
        .await;

    assert!(result.can_execute_commands);
    assert_eq!(result.home_directory, None);
    assert_eq!(result.shell_type.as_deref(), Some("bash"));
    assert!(!result.permissions.can_write_home);
    assert!(result.permissions.can_read_home);
    assert_eq!(result.errors.len(), 2);
}

#[tokio::test]
async fn test_sftp_validation_success_cleans_up_probe_directory() {
    let cluster = Arc::new(FakeCluster::connected());
    let result = validator_for(&cluster)
        .validate_sftp_access(cluster.as_ref(), fixtures::TEST_HOME)
        .await;

    assert!(result.success(), "{:?}", result.errors);
    let listing = crate::remote::SftpConnection::list_files(cluster.as_ref(), fixtures::TEST_HOME)
        .await
        .unwrap();
    assert_eq!(listing.total_count, 0);
}

#[tokio::test]
async fn test_sftp_validation_degrades_per_flag() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.fail_list(fixtures::TEST_HOME);
    cluster.make_read_only(fixtures::TEST_HOME);

    let result = validator_for(&cluster)
        .validate_sftp_access(cluster.as_ref(), fixtures::TEST_HOME)
        .await;

    assert!(result.can_connect);
    assert!(!result.can_list_files);
    assert!(!result.can_create_directories);
    assert!(result.errors[0].starts_with("Cannot list files via SFTP"));
    assert!(result.errors[1].starts_with("Cannot create directories via SFTP"));
}

#[tokio::test]
async fn test_slurm_requires_ssh() {
    let cluster = Arc::new(FakeCluster::new());
    let result = validator_for(&cluster).test_slurm_access(cluster.as_ref()).await;

    assert!(!result.slurm_available);
    assert_eq!(result.errors, vec![SLURM_REQUIRES_SSH_MESSAGE.to_string()]);
}

#[tokio::test]
async fn test_slurm_probe_reports_partitions() {
    let cluster = Arc::new(FakeCluster::connected());
    let result = validator_for(&cluster).test_slurm_access(cluster.as_ref()).await;

    assert!(result.module_system_available);
    assert!(result.slurm_available);
    assert!(result.can_query_jobs);
    assert!(result.can_submit_jobs);
    assert_eq!(
        result.available_partitions,
        vec!["amilan", "amilan-ucb", "atesting"]
    );
}

#[tokio::test]
async fn test_slurm_missing_commands() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.respond(
        probes::SINFO_VERSION,
        CommandOutput::failed(127, "bash: sinfo: command not found"),
    );
    cluster.respond(probes::SINFO_PARTITIONS, CommandOutput::failed(127, ""));

    let validator = validator_for(&cluster);
    let result = validator.test_slurm_access(cluster.as_ref()).await;

    assert!(!result.slurm_available);
    assert!(!result.can_submit_jobs);
    assert!(result.available_partitions.is_empty());
    assert!(!validator.check_slurm_access(cluster.as_ref()).await);
    assert!(!validator.can_submit_jobs(cluster.as_ref()).await);
}

#[tokio::test]
async fn test_full_validation_success() {
    let cluster = Arc::new(FakeCluster::connected());
    let result = validator_for(&cluster)
        .run_full_validation(&target(), cluster.as_ref(), cluster.as_ref())
        .await;

    assert!(result.overall_success);
    assert!(result.recommendations.is_empty(), "{:?}", result.recommendations);
}

#[tokio::test]
async fn test_full_validation_unreachable_host() {
    let cluster = Arc::new(FakeCluster::connected());
    let result = validator_for(&cluster)
        .run_full_validation(
            &Credentials::new("unreachable.cluster.edu", "alice"),
            cluster.as_ref(),
            cluster.as_ref(),
        )
        .await;

    assert!(!result.overall_success);
    assert!(
        result
            .recommendations
            .contains(&"Check network connectivity to the cluster".to_string())
    );
}

#[tokio::test]
async fn test_full_validation_disconnected_ssh() {
    let cluster = Arc::new(FakeCluster::new());
    let result = validator_for(&cluster)
        .run_full_validation(&target(), cluster.as_ref(), cluster.as_ref())
        .await;

    assert!(!result.overall_success);
    assert!(result.network.reachable);
    assert!(!result.ssh.can_connect);
    assert!(!result.sftp.can_connect);
    assert!(
        result
            .recommendations
            .contains(&"Verify SSH service is running on the cluster".to_string())
    );
}

#[tokio::test]
async fn test_full_validation_isolates_panicking_probe() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.panic_on(probes::SINFO_VERSION);

    let result = validator_for(&cluster)
        .run_full_validation(&target(), cluster.as_ref(), cluster.as_ref())
        .await;

    assert!(!result.overall_success);
    assert!(result.ssh.success());
    assert!(!result.slurm.slurm_available);
    assert!(result.slurm.errors[0].contains("Validation probe failed unexpectedly"));
}

#[tokio::test]
async fn test_quick_checks_swallow_failures() {
    let cluster = Arc::new(FakeCluster::connected());
    let validator = validator_for(&cluster);
    assert!(validator.quick_health_check(cluster.as_ref()).await);
    assert!(validator.check_slurm_access(cluster.as_ref()).await);
    assert!(validator.can_submit_jobs(cluster.as_ref()).await);

    cluster.panic_on(probes::ECHO_TEST);
    cluster.panic_on(probes::MODULE_VERSION);
    assert!(!validator.quick_health_check(cluster.as_ref()).await);
    assert!(!validator.check_slurm_access(cluster.as_ref()).await);

    let offline = Arc::new(FakeCluster::new());
    assert!(!validator.quick_health_check(offline.as_ref()).await);
}
