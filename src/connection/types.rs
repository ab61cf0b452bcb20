use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the single login-node connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Expired,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Expired,
    ];

    /// States reachable from `self` through a protocol-driven transition
    pub fn valid_targets(self) -> &'static [ConnectionState] {
        match self {
            ConnectionState::Disconnected => &[ConnectionState::Connecting],
            ConnectionState::Connecting => {
                &[ConnectionState::Connected, ConnectionState::Disconnected]
            }
            ConnectionState::Connected => &[ConnectionState::Disconnected, ConnectionState::Expired],
            ConnectionState::Expired => {
                &[ConnectionState::Connecting, ConnectionState::Disconnected]
            }
        }
    }

    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        self.valid_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Expired => "Expired",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one transition attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub success: bool,
}

/// Failure classes surfaced by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Network,
    Authentication,
    Timeout,
    Permission,
    Configuration,
    Validation,
    FileOperation,
    Unknown,
}

impl ErrorCategory {
    /// Only transient transport failures are worth retrying
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "Network",
            ErrorCategory::Authentication => "Authentication",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Permission => "Permission",
            ErrorCategory::Configuration => "Configuration",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::FileOperation => "FileOperation",
            ErrorCategory::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error happened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub attempt: Option<u32>,
}

impl ErrorContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}
