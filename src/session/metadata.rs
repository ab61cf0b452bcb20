use crate::connection::ConnectionError;
use crate::connection::errors::SESSION_INVALID;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Format version written alongside every persisted session
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Tolerated clock skew for `connected_at` when saving
pub const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// The authenticated login this client currently holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub host: String,
    pub username: String,
    pub connected_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Session starting now
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self::started_at(host, username, Utc::now())
    }

    pub fn started_at(
        host: impl Into<String>,
        username: impl Into<String>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            connected_at,
        }
    }

    /// Time elapsed since `connected_at`, never negative
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.connected_at).max(Duration::zero())
    }

    /// Structural check applied before a session is persisted
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::from_template(&SESSION_INVALID).with_detail("host is empty"));
        }
        if self.username.trim().is_empty() {
            return Err(
                ConnectionError::from_template(&SESSION_INVALID).with_detail("username is empty")
            );
        }
        if self.connected_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(ConnectionError::from_template(&SESSION_INVALID)
                .with_detail("connection time is in the future"));
        }
        Ok(())
    }
}

/// On-disk envelope for a [`SessionInfo`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub session: SessionInfo,
}

impl PersistedSession {
    pub fn wrap(session: SessionInfo) -> Self {
        Self {
            format_version: SESSION_FORMAT_VERSION,
            saved_at: Utc::now(),
            session,
        }
    }
}

/// Point-in-time view of the session manager
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub has_session: bool,
    pub is_valid: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub time_until_expiry_seconds: i64,
    pub expiring_soon: bool,
    pub refresh_scheduled: bool,
    pub validity_window_seconds: i64,
}
