//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `validate`: Run the layered connectivity validation
//! - `connect`: Connect, set up the remote workspace and print the status
//! - `paths`: Print the remote paths of a job (no I/O)
//! - `list-jobs`: List job directories in the remote workspace
//! - `cleanup`: Remove job directories older than a cutoff
//! - `check-workspace`: Check workspace layout, permissions and disk space
//! - `session`: Show or clear the persisted session
//! - `show-config`: Show configuration discovery information

use crate::workspace::paths;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    Validate,
    Connect,
    Paths { job_id: String },
    ListJobs,
    Cleanup(CleanupConfig),
    CheckWorkspace,
    SessionShow,
    SessionClear,
    ShowConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupConfig {
    /// Falls back to `workspace.cleanup_max_age_days` when unset
    pub max_age_days: Option<u32>,
    pub dry_run: bool,
}

/// Settings shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config_override: Option<PathBuf>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub verbose: bool,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "namdrunner-connect")]
#[command(author = "NAMDRunner Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connect to an HPC login node, validate access and manage the remote job workspace")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Login node hostname
    #[arg(long = "host", global = true)]
    pub host: Option<String>,
    /// Cluster username
    #[arg(short = 'u', long = "user", global = true)]
    pub user: Option<String>,
    /// SSH port
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    /// Print machine-readable JSON
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run network, SSH, SFTP and SLURM validation
    Validate,
    /// Connect and prepare the remote workspace
    Connect,
    /// Print the remote paths of a job
    Paths {
        /// Job identifier (sanitized before use)
        job_id: String,
    },
    /// List job directories
    ListJobs,
    /// Remove old job directories
    Cleanup {
        /// Age cutoff in days
        #[arg(long = "max-age-days")]
        max_age_days: Option<u32>,
        /// Only report what would be removed
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Check workspace layout, permissions and disk space
    CheckWorkspace,
    /// Inspect or clear the persisted session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show configuration discovery information
    ShowConfig,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum SessionAction {
    /// Print the persisted session and its remaining validity
    Show,
    /// Remove the persisted session
    Clear,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn global(&self) -> GlobalOptions {
        GlobalOptions {
            config_override: self.config.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            verbose: self.verbose,
            json: self.json,
        }
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Validate) => Ok(ExecutionMode::Validate),
            Some(Commands::Connect) => Ok(ExecutionMode::Connect),
            Some(Commands::Paths { job_id }) => {
                if job_id.trim().is_empty() {
                    return Err("Job id must not be empty".to_string());
                }
                Ok(ExecutionMode::Paths {
                    job_id: paths::sanitize_job_id(job_id),
                })
            }
            Some(Commands::ListJobs) => Ok(ExecutionMode::ListJobs),
            Some(Commands::Cleanup {
                max_age_days,
                dry_run,
            }) => Ok(ExecutionMode::Cleanup(CleanupConfig {
                max_age_days: *max_age_days,
                dry_run: *dry_run,
            })),
            Some(Commands::CheckWorkspace) => Ok(ExecutionMode::CheckWorkspace),
            Some(Commands::Session { action }) => Ok(match action {
                SessionAction::Show => ExecutionMode::SessionShow,
                SessionAction::Clear => ExecutionMode::SessionClear,
            }),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'namdrunner-connect --help' to see available commands."
                    .to_string(),
            ),
        }
    }

    /// Whether the mode talks to the cluster
    pub fn needs_connection(mode: &ExecutionMode) -> bool {
        !matches!(
            mode,
            ExecutionMode::Paths { .. }
                | ExecutionMode::SessionShow
                | ExecutionMode::SessionClear
                | ExecutionMode::ShowConfig
        )
    }
}
