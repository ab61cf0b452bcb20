use crate::connection::errors::{
    DELETE_FAILED, DIRECTORY_ACCESS_FAILED, DIRECTORY_CREATE_FAILED, INVALID_PATH,
    INVALID_USERNAME, LIST_FAILED,
};
use crate::remote::{CommandOutput, FakeCluster};
use crate::workspace::*;
use chrono::{Duration, Utc};
use std::sync::Arc;

const USER: &str = "alice";
const BASE: &str = "/projects/alice";
const JOBS: &str = "/projects/alice/namdrunner_jobs";

fn manager_for(cluster: &Arc<FakeCluster>) -> WorkspaceManager {
    WorkspaceManager::new(cluster.clone(), cluster.clone())
}

/// Two jobs: one touched two days ago, one just now
fn cluster_with_aged_jobs() -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.add_directory_modified(
        &format!("{}/old_job", JOBS),
        Utc::now() - Duration::days(2),
    );
    cluster.add_file(&format!("{}/old_job/job.json", JOBS), "{}");
    cluster.add_directory(&format!("{}/new_job", JOBS));
    cluster
}

#[tokio::test]
async fn test_setup_creates_missing_directories() {
    let cluster = Arc::new(FakeCluster::connected());
    let setup = manager_for(&cluster).setup_user_workspace(USER).await.unwrap();

    assert_eq!(setup.base_path, BASE);
    assert_eq!(setup.namdrunner_path, JOBS);
    assert_eq!(setup.created, vec![BASE.to_string(), JOBS.to_string()]);
    assert!(setup.existed.is_empty());
    assert!(cluster.has_directory(JOBS));
}

#[tokio::test]
async fn test_setup_is_idempotent() {
    let cluster = Arc::new(FakeCluster::connected());
    let manager = manager_for(&cluster);
    manager.setup_user_workspace(USER).await.unwrap();

    let second = manager.setup_user_workspace(USER).await.unwrap();
    assert!(second.created.is_empty());
    assert_eq!(second.existed, vec![BASE.to_string(), JOBS.to_string()]);
}

#[tokio::test]
async fn test_setup_fails_when_base_cannot_be_checked() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.fail_exists(BASE);

    let error = manager_for(&cluster)
        .setup_user_workspace(USER)
        .await
        .unwrap_err();

    assert!(error.is(&DIRECTORY_ACCESS_FAILED));
    assert!(error.message().starts_with("Cannot access /projects/alice"));
    assert!(!cluster.has_directory(JOBS));
}

#[tokio::test]
async fn test_setup_fails_when_job_root_cannot_be_created() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.add_directory(BASE);
    cluster.fail_create(JOBS);

    let error = manager_for(&cluster)
        .setup_user_workspace(USER)
        .await
        .unwrap_err();
    assert!(error.is(&DIRECTORY_CREATE_FAILED));
}

#[tokio::test]
async fn test_setup_rejects_bad_username() {
    let cluster = Arc::new(FakeCluster::connected());
    let error = manager_for(&cluster)
        .setup_user_workspace("../bob")
        .await
        .unwrap_err();
    assert!(error.is(&INVALID_USERNAME));
}

#[tokio::test]
async fn test_ensure_directory_exists_reports_creation() {
    let cluster = Arc::new(FakeCluster::connected());
    let manager = manager_for(&cluster);

    assert!(manager.ensure_directory_exists(JOBS).await.unwrap());
    assert!(!manager.ensure_directory_exists(JOBS).await.unwrap());

    let error = manager
        .ensure_directory_exists("/projects/alice/../bob")
        .await
        .unwrap_err();
    assert!(error.is(&INVALID_PATH));
}

#[tokio::test]
async fn test_delegates_path_building() {
    let cluster = Arc::new(FakeCluster::connected());
    let manager = manager_for(&cluster);

    assert_eq!(manager.job_directory(USER, "j1"), format!("{}/j1", JOBS));
    assert_eq!(manager.job_paths(USER, "j1"), paths::job_paths(USER, "j1"));
}

#[tokio::test]
async fn test_list_jobs_returns_directories_only() {
    let cluster = cluster_with_aged_jobs();
    cluster.add_file(&format!("{}/README", JOBS), "notes");

    let jobs = manager_for(&cluster).list_jobs(USER).await.unwrap();
    assert_eq!(jobs, vec!["new_job".to_string(), "old_job".to_string()]);
}

#[tokio::test]
async fn test_list_jobs_propagates_listing_failure() {
    let cluster = cluster_with_aged_jobs();
    cluster.fail_list(JOBS);

    let error = manager_for(&cluster).list_jobs(USER).await.unwrap_err();
    assert!(error.is(&LIST_FAILED));
}

#[tokio::test]
async fn test_delete_job_directory() {
    let cluster = cluster_with_aged_jobs();
    let manager = manager_for(&cluster);

    manager.delete_job_directory(USER, "old_job").await.unwrap();

    assert!(!cluster.has_path(&format!("{}/old_job", JOBS)));
    assert!(!cluster.has_path(&format!("{}/old_job/job.json", JOBS)));
    assert!(
        cluster
            .executed_commands()
            .contains(&format!("rm -rf {}/old_job", JOBS))
    );
}

#[tokio::test]
async fn test_delete_job_directory_reports_stderr() {
    let cluster = cluster_with_aged_jobs();
    cluster.fail_remove(&format!("{}/old_job", JOBS));

    let error = manager_for(&cluster)
        .delete_job_directory(USER, "old_job")
        .await
        .unwrap_err();

    assert!(error.is(&DELETE_FAILED));
    assert!(error.message().contains("Permission denied"));
}

#[tokio::test]
async fn test_delete_job_directory_rejects_escaping_ids() {
    let cluster = cluster_with_aged_jobs();
    let manager = manager_for(&cluster);

    for job_id in ["", "..", ".", "../../bob", "a/b"] {
        assert!(
            manager.delete_job_directory(USER, job_id).await.is_err(),
            "{:?}",
            job_id
        );
    }
    assert!(cluster.executed_commands().is_empty());
    assert!(cluster.has_directory(JOBS));
}

#[tokio::test]
async fn test_cleanup_old_jobs_by_age() {
    let cluster = cluster_with_aged_jobs();
    let manager = manager_for(&cluster);

    let report = manager.cleanup_old_jobs(USER, 5).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.cleaned, 0);

    let report = manager.cleanup_old_jobs(USER, 1).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.cleaned_jobs, vec!["old_job".to_string()]);
    assert!(!cluster.has_path(&format!("{}/old_job", JOBS)));
    assert!(cluster.has_directory(&format!("{}/new_job", JOBS)));
}

#[tokio::test]
async fn test_cleanup_tolerates_item_failures() {
    let cluster = cluster_with_aged_jobs();
    let stale = Utc::now() - Duration::days(10);
    cluster.add_directory_modified(&format!("{}/stuck_job", JOBS), stale);
    cluster.add_directory_modified(&format!("{}/older_job", JOBS), stale);
    cluster.fail_remove(&format!("{}/stuck_job", JOBS));

    let report = manager_for(&cluster).cleanup_old_jobs(USER, 1).await.unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.cleaned, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_jobs[0].0, "stuck_job");
    assert!(cluster.has_directory(&format!("{}/stuck_job", JOBS)));
}

#[tokio::test]
async fn test_cleanup_fails_when_listing_fails() {
    let cluster = cluster_with_aged_jobs();
    cluster.fail_list(JOBS);

    assert!(manager_for(&cluster).cleanup_old_jobs(USER, 1).await.is_err());
    assert!(cluster.has_path(&format!("{}/old_job", JOBS)));
}

#[tokio::test]
async fn test_stale_jobs_does_not_delete() {
    let cluster = cluster_with_aged_jobs();
    let stale = manager_for(&cluster).stale_jobs(USER, 1).await.unwrap();

    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].name, "old_job");
    assert!(cluster.has_path(&format!("{}/old_job", JOBS)));
}

#[tokio::test]
async fn test_out_of_range_age_keeps_every_job() {
    let cluster = cluster_with_aged_jobs();
    let manager = manager_for(&cluster);

    assert!(manager.stale_jobs(USER, 100_000_000).await.unwrap().is_empty());

    let report = manager.cleanup_old_jobs(USER, u32::MAX).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.cleaned, 0);
    assert!(cluster.has_path(&format!("{}/old_job", JOBS)));
    assert!(!cluster.executed_commands().iter().any(|c| c.starts_with("rm -rf")));
}

#[tokio::test]
async fn test_validate_directory_structure_healthy() {
    let cluster = cluster_with_aged_jobs();
    let validation = manager_for(&cluster)
        .validate_directory_structure(USER)
        .await
        .unwrap();

    assert!(validation.valid, "{:?}", validation.issues);
    assert_eq!(validation.base_path, BASE);
    assert_eq!(validation.namdrunner_path, JOBS);
    assert!(validation.permissions.readable);
    assert!(validation.permissions.writable);
    assert!(validation.permissions.executable);

    let disk = validation.disk_space.unwrap();
    assert_eq!(disk.total, "100T");
    assert_eq!(disk.used, "60T");
    assert_eq!(disk.available, "40T");
    assert_eq!(disk.use_percent, Some(60));
}

#[tokio::test]
async fn test_validate_directory_structure_with_malformed_df() {
    let cluster = cluster_with_aged_jobs();
    cluster.set_df_output("df: unexpected garbage\n\u{0}\u{1}");

    let validation = manager_for(&cluster)
        .validate_directory_structure(USER)
        .await
        .unwrap();

    assert_eq!(validation.disk_space, None);
    assert!(validation.valid);
}

#[tokio::test]
async fn test_validate_directory_structure_collects_issues() {
    let cluster = Arc::new(FakeCluster::connected());
    cluster.fail_exists(BASE);
    cluster.respond(
        &format!("df -h {}", BASE),
        CommandOutput::failed(1, "df: /projects/alice: No such file or directory"),
    );

    let validation = manager_for(&cluster)
        .validate_directory_structure(USER)
        .await
        .unwrap();

    assert!(!validation.valid);
    assert_eq!(validation.disk_space, None);
    assert!(validation.issues[0].starts_with("Cannot access /projects/alice"));
    assert_eq!(validation.permissions, WorkspacePermissions::default());
}

#[tokio::test]
async fn test_validate_reports_read_only_workspace() {
    let cluster = cluster_with_aged_jobs();
    cluster.make_read_only(JOBS);

    let validation = manager_for(&cluster)
        .validate_directory_structure(USER)
        .await
        .unwrap();

    assert!(!validation.valid);
    assert!(!validation.permissions.writable);
    assert!(validation.permissions.readable);
    assert_eq!(validation.issues.len(), 1);
}

#[test]
fn test_parse_df_output_variants() {
    let wrapped = "Filesystem            Size  Used Avail Use% Mounted on\n\
                   very-long-server-name:/export/projects\n\
                   \x20                     2.0P  1.5P  512T  75% /projects\n";
    let disk = parse_df_output(wrapped).unwrap();
    assert_eq!(disk.total, "2.0P");
    assert_eq!(disk.use_percent, Some(75));

    assert_eq!(parse_df_output(""), None);
    assert_eq!(parse_df_output("Filesystem Size Used Avail Use% Mounted on\n"), None);
    assert_eq!(parse_df_output("Filesystem\nfoo bar baz qux quux corge\n"), None);
}
