use anyhow::{Context, bail};
use namdrunner_connect::cli::{
    AppConfig, Args, CleanupConfig, ConfigDiscovery, ExecutionMode, GlobalOptions,
};
use namdrunner_connect::env;
use namdrunner_connect::remote::OpenSshSession;
use namdrunner_connect::session::{FileSessionStore, SessionManager};
use namdrunner_connect::validation::{ConnectivityValidator, FullValidationResult, TcpProbe};
use namdrunner_connect::workspace::paths;
use namdrunner_connect::{ConnectionController, RetryPolicy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let global = args.global();

    // Initialize logging
    let default_filter = if global.verbose {
        "namdrunner_connect=debug"
    } else {
        "namdrunner_connect=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let mut config = ConfigDiscovery::load(global.config_override.as_deref())?;
    config.apply_overrides(global.host.as_deref(), global.user.as_deref(), global.port);

    match mode {
        ExecutionMode::ShowConfig => show_config(&config),
        ExecutionMode::Paths { job_id } => show_paths(&config, &job_id, &global),
        ExecutionMode::SessionShow => show_session(&config, &global).await,
        ExecutionMode::SessionClear => {
            session_manager(&config)?.clear_session().await?;
            println!("Session cleared");
            Ok(())
        }
        remote_mode => {
            config
                .validate()
                .context("Configuration is incomplete for remote operations")?;
            let controller = build_controller(&config)?;
            let outcome = run_remote(&controller, &config, remote_mode, &global).await;

            if let Err(e) = &outcome {
                error!("{:#}", e);
            }
            outcome
        }
    }
}

fn session_manager(config: &AppConfig) -> anyhow::Result<Arc<SessionManager>> {
    let session_file = config
        .session_file()
        .context("Could not determine the session file location; set session.session_file")?;
    let store = Arc::new(FileSessionStore::new(session_file));
    Ok(Arc::new(SessionManager::new(
        store,
        None,
        config.session.clone(),
    )))
}

fn build_controller(config: &AppConfig) -> anyhow::Result<ConnectionController> {
    let app_dir = env::home_dir()
        .map(|home| env::user_app_dir_path(&home))
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create {:?}", app_dir))?;

    let link = Arc::new(OpenSshSession::new(config.cluster.openssh_config(&app_dir))?);
    let probe = Arc::new(TcpProbe::new(Duration::from_secs(
        config.cluster.connect_timeout_secs,
    )));
    let validator = ConnectivityValidator::new(probe)
        .with_command_timeout(config.cluster.command_timeout());

    Ok(
        ConnectionController::new(link.clone(), link, session_manager(config)?)
            .with_validator(validator)
            .with_retry_policy(RetryPolicy::new(config.retry.clone())),
    )
}

async fn run_remote(
    controller: &ConnectionController,
    config: &AppConfig,
    mode: ExecutionMode,
    global: &GlobalOptions,
) -> anyhow::Result<()> {
    let credentials = config.cluster.credentials();

    if mode == ExecutionMode::Validate {
        // Validation reports every layer even when the login fails
        if let Err(e) = controller.connect_with_retry(&credentials).await {
            warn!("Login failed, validation will report the failing layers: {}", e);
        }
        let result = controller.validate(&credentials).await;
        controller.disconnect().await?;
        print_validation(&result, global.json)?;
        if !result.overall_success {
            bail!("Validation failed");
        }
        return Ok(());
    }

    controller.connect_with_retry(&credentials).await?;
    let keep_session = mode == ExecutionMode::Connect;
    let result = run_connected(controller, config, mode, global).await;

    if keep_session && result.is_ok() {
        // The session stays persisted for the next invocation
        controller.sessions().cancel_session_refresh();
        return result;
    }

    match controller.disconnect().await {
        Ok(()) => result,
        Err(e) if result.is_err() => {
            warn!("Disconnect after a failed operation also failed: {}", e);
            result
        }
        Err(e) => Err(e.into()),
    }
}

/// Per-mode work once the link is up; the caller owns disconnecting
async fn run_connected(
    controller: &ConnectionController,
    config: &AppConfig,
    mode: ExecutionMode,
    global: &GlobalOptions,
) -> anyhow::Result<()> {
    let credentials = config.cluster.credentials();
    let user = credentials.username.clone();
    let workspace = controller
        .workspace()
        .with_command_timeout(config.cluster.command_timeout());

    match mode {
        ExecutionMode::Connect => {
            let setup = workspace.setup_user_workspace(&user).await?;
            let status = controller.status().await;
            if global.json {
                print_json(&serde_json::json!({ "workspace": setup, "status": status }))?;
            } else {
                println!("Connected to {} as {}", credentials.host, user);
                println!("  Workspace: {}", setup.namdrunner_path);
                if !setup.created.is_empty() {
                    println!("  Created:   {}", setup.created.join(", "));
                }
                println!(
                    "  Session valid for {} more minutes",
                    status.session.time_until_expiry_seconds / 60
                );
            }
        }
        ExecutionMode::ListJobs => {
            let jobs = workspace.list_jobs(&user).await?;
            if global.json {
                print_json(&jobs)?;
            } else if jobs.is_empty() {
                println!("No jobs in {}", paths::jobs_root_directory(&user));
            } else {
                for job in &jobs {
                    println!("{}", job);
                }
            }
        }
        ExecutionMode::Cleanup(CleanupConfig {
            max_age_days,
            dry_run,
        }) => {
            let max_age = max_age_days.unwrap_or(config.workspace.cleanup_max_age_days);
            if dry_run {
                let stale = workspace.stale_jobs(&user, max_age).await?;
                let names: Vec<&str> = stale.iter().map(|entry| entry.name.as_str()).collect();
                if global.json {
                    print_json(&names)?;
                } else {
                    println!("{} job(s) older than {} days:", names.len(), max_age);
                    for name in names {
                        println!("  {}", name);
                    }
                }
            } else {
                let report = workspace.cleanup_old_jobs(&user, max_age).await?;
                if global.json {
                    print_json(&report)?;
                } else {
                    println!(
                        "Scanned {}, removed {}, failed {}",
                        report.scanned, report.cleaned, report.failed
                    );
                    for (job, reason) in &report.failed_jobs {
                        println!("  ✗ {}: {}", job, reason);
                    }
                }
            }
        }
        ExecutionMode::CheckWorkspace => {
            let check = workspace.validate_directory_structure(&user).await?;
            if global.json {
                print_json(&check)?;
            } else {
                println!(
                    "Workspace {}: {}",
                    check.namdrunner_path,
                    if check.valid { "✓ OK" } else { "✗ PROBLEMS" }
                );
                if let Some(disk) = &check.disk_space {
                    println!(
                        "  Disk: {} used of {}, {} available",
                        disk.used, disk.total, disk.available
                    );
                }
                for issue in &check.issues {
                    println!("  - {}", issue);
                }
            }
        }
        other => bail!("Unsupported remote mode: {:?}", other),
    }
    Ok(())
}

fn show_config(config: &AppConfig) -> anyhow::Result<()> {
    ConfigDiscovery::show_discovery_info();
    println!();
    println!("Effective configuration:");
    println!("{}", config.to_toml_string()?);
    Ok(())
}

fn show_paths(config: &AppConfig, job_id: &str, global: &GlobalOptions) -> anyhow::Result<()> {
    let user = &config.cluster.username;
    if !paths::is_valid_username(user) {
        bail!("A valid username is required; set cluster.username or pass --user");
    }
    let job_paths = paths::extended_job_paths(user, job_id);

    if global.json {
        return print_json(&job_paths);
    }
    let p = &job_paths.paths;
    println!("Job directory: {}", p.job_dir);
    println!("  inputs:   {}", p.inputs_dir);
    println!("  outputs:  {}", p.outputs_dir);
    println!("  scratch:  {}", p.scratch_dir);
    println!("  logs:     {}", p.logs_dir);
    println!("  config:   {}", p.config_file);
    println!("  script:   {}", p.slurm_script);
    println!("  stdout:   {}", job_paths.log_files.stdout);
    println!("  stderr:   {}", job_paths.log_files.stderr);
    Ok(())
}

async fn show_session(config: &AppConfig, global: &GlobalOptions) -> anyhow::Result<()> {
    let sessions = session_manager(config)?;
    let diagnostics = sessions.session_diagnostics().await;

    if global.json {
        return print_json(&diagnostics);
    }
    match (&diagnostics.host, &diagnostics.username) {
        (Some(host), Some(user)) => {
            println!("Session: {}@{}", user, host);
            if let Some(connected_at) = diagnostics.connected_at {
                println!("  Connected at: {}", connected_at.to_rfc3339());
            }
            if diagnostics.is_valid {
                println!(
                    "  Valid for {} more minutes{}",
                    diagnostics.time_until_expiry_seconds / 60,
                    if diagnostics.expiring_soon {
                        " (expiring soon)"
                    } else {
                        ""
                    }
                );
            } else {
                println!("  Expired");
            }
        }
        _ => println!("No persisted session"),
    }
    info!("Session file: {:?}", config.session_file());
    Ok(())
}

fn print_validation(result: &FullValidationResult, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(result);
    }

    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    println!("Validation at {}", result.timestamp.to_rfc3339());
    println!("  {} Network", mark(result.network.reachable));
    println!("  {} SSH", mark(result.ssh.success()));
    println!("  {} SFTP", mark(result.sftp.success()));
    println!("  {} SLURM", mark(result.slurm.success()));
    if !result.slurm.available_partitions.is_empty() {
        println!(
            "    partitions: {}",
            result.slurm.available_partitions.join(", ")
        );
    }
    if !result.recommendations.is_empty() {
        println!();
        println!("Recommendations:");
        for recommendation in &result.recommendations {
            println!("  - {}", recommendation);
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
