//! # NAMDRunner Connect
//!
//! Connection and session lifecycle core for an HPC desktop client. It
//! establishes, validates, persists and tears down a session against a
//! cluster login node, and manages the per-user job workspace under
//! `/projects/{user}/namdrunner_jobs` over that session.
//!
//! ## Architecture Overview
//!
//! - **[`connection`]**: connection state machine, error model, retry policy
//!   and the [`ConnectionController`] that ties everything together
//! - **[`session`]**: session persistence, validity window and periodic renewal
//! - **[`validation`]**: layered network → SSH → SFTP → SLURM validation
//! - **[`workspace`]**: remote path resolution and job directory lifecycle
//! - **[`remote`]**: SSH/SFTP capability ports, the OpenSSH adapter and an
//!   in-memory fake cluster
//!
//! The core never speaks the SSH protocol itself. Every component is
//! constructed with the ports it needs; nothing is process-global.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use namdrunner_connect::remote::{Credentials, OpenSshConfig, OpenSshSession};
//! use namdrunner_connect::session::{FileSessionStore, SessionConfig, SessionManager};
//! use namdrunner_connect::ConnectionController;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = Arc::new(OpenSshSession::new(OpenSshConfig::default())?);
//!     let store = Arc::new(FileSessionStore::new("/tmp/session.json"));
//!     let sessions = Arc::new(SessionManager::new(store, None, SessionConfig::default()));
//!     let controller = ConnectionController::new(link.clone(), link, sessions);
//!
//!     let session = controller
//!         .connect_with_retry(&Credentials::new("login.rc.example.edu", "alice"))
//!         .await?;
//!     println!("Connected at {}", session.connected_at);
//!
//!     let setup = controller.workspace().setup_user_workspace("alice").await?;
//!     println!("Jobs live in {}", setup.namdrunner_path);
//!
//!     controller.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Connection state, errors, retry and orchestration.
///
/// The state machine is the single authority over the connection state;
/// every transition is validated against a fixed table and recorded.
pub mod connection;

/// Session persistence and renewal.
pub mod session;

/// Layered connectivity validation.
pub mod validation;

/// Remote path resolution and job directory lifecycle.
pub mod workspace;

/// SSH/SFTP capability ports and their implementations.
pub mod remote;

/// Environment constants and path utilities.
///
/// Centralizes the remote directory layout, probe commands and local
/// configuration paths.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use connection::{
    ConnectionController, ConnectionError, ConnectionState, ConnectionStateMachine,
    ConnectionStatus, ErrorCategory, RetryConfig, RetryPolicy,
};
pub use remote::{Credentials, SftpConnection, SshConnection};
pub use session::{SessionConfig, SessionInfo, SessionManager};
pub use validation::{ConnectivityValidator, FullValidationResult};
pub use workspace::WorkspaceManager;
