//! # Connection Lifecycle
//!
//! Everything that decides whether this client is connected to the cluster:
//!
//! - **[`ConnectionStateMachine`]**: the Disconnected/Connecting/Connected/Expired
//!   lifecycle with its legal-transition table, retry accounting and observers
//! - **[`errors`]**: the fixed catalogue every [`ConnectionError`] is built from
//! - **[`RetryPolicy`]**: per-category backoff bounded by the machine's retry ceiling
//! - **[`ConnectionController`]**: connect/disconnect/health orchestration that
//!   keeps the state machine and the persisted session consistent
//!
//! ## Usage
//!
//! ```rust,no_run
//! use namdrunner_connect::connection::ConnectionController;
//! use namdrunner_connect::remote::{Credentials, FakeCluster};
//! use namdrunner_connect::session::{MemorySessionStore, SessionConfig, SessionManager};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), namdrunner_connect::connection::ConnectionError> {
//! let cluster = Arc::new(FakeCluster::new());
//! let sessions = Arc::new(SessionManager::new(
//!     Arc::new(MemorySessionStore::new()),
//!     None,
//!     SessionConfig::default(),
//! ));
//! let controller = ConnectionController::new(cluster.clone(), cluster, sessions);
//!
//! controller
//!     .connect(&Credentials::new("login.cluster.edu", "alice"))
//!     .await?;
//! controller.require_connected()?;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod errors;
pub mod retry;
pub mod state_machine;
pub mod types;

#[cfg(test)]
mod tests;

pub use controller::{ConnectionController, ConnectionStatus};
pub use errors::ConnectionError;
pub use retry::{RetryConfig, RetryPolicy};
pub use state_machine::{
    ConnectionStateMachine, StateMachineDiagnostics, Subscription, SubscriptionId,
};
pub use types::{ConnectionState, ErrorCategory, ErrorContext, StateTransition};
