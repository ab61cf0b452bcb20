//! Typed errors for the connection core.
//!
//! Every [`ConnectionError`] starts from one of the fixed [`ErrorTemplate`]s
//! below so that codes, categories and remediation hints stay consistent
//! wherever the failure is reported. Raw failures coming back from an adapter
//! (ssh stderr, spawn errors) go through [`classify`] first.

use super::types::{ErrorCategory, ErrorContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed message/suggestion catalogue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorTemplate {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub message: &'static str,
    pub suggestions: &'static [&'static str],
}

macro_rules! template {
    ($name:ident, $category:ident, $message:expr, [$($suggestion:expr),* $(,)?]) => {
        pub const $name: ErrorTemplate = ErrorTemplate {
            code: stringify!($name),
            category: ErrorCategory::$category,
            message: $message,
            suggestions: &[$($suggestion),*],
        };
    };
}

template!(NETWORK_UNREACHABLE, Network, "Cannot reach the cluster login node", [
    "Check network connectivity to the cluster",
    "Verify the hostname and port are correct",
    "Connect to the institution VPN if the cluster requires it",
]);
template!(CONNECTION_TIMEOUT, Timeout, "Connection to the cluster timed out", [
    "Check network connectivity to the cluster",
    "Retry in a few moments; the login node may be under heavy load",
]);
template!(COMMAND_TIMEOUT, Timeout, "Remote command timed out", [
    "Retry the operation",
    "Increase cluster.command_timeout_secs in the configuration",
]);
template!(AUTH_FAILED, Authentication, "Authentication failed", [
    "Check your username and password",
    "Verify your SSH key is loaded in the agent",
]);
template!(PERMISSION_DENIED, Permission, "Permission denied", [
    "Verify you have access to the requested directory",
    "Contact the cluster administrators if the problem persists",
]);
template!(INVALID_CONFIG, Configuration, "Invalid connection configuration", [
    "Check the cluster section of the configuration file",
]);
template!(INVALID_TRANSITION, Validation, "Invalid connection state transition", []);
template!(VALIDATION_FAILED, Validation, "Validation failed", []);
template!(INVALID_PATH, Validation, "Invalid remote path", [
    "Remote paths must be absolute and must not contain '..' or '//'",
]);
template!(PATH_NOT_ALLOWED, Permission, "Path is outside the user's workspace", [
    "Only paths under /projects/<user> may be modified",
]);
template!(INVALID_USERNAME, Validation, "Invalid username", [
    "Usernames may only contain letters, digits, '.', '_' and '-'",
]);
template!(SESSION_EXPIRED, Authentication, "Session has expired", [
    "Reconnect to the cluster to start a new session",
]);
template!(SESSION_INVALID, Validation, "Session information is incomplete", [
    "Host, username and connection time are required",
]);
template!(SESSION_CORRUPTED, Validation, "Persisted session could not be read", [
    "Reconnect to the cluster; the stale session record was discarded",
]);
template!(SESSION_STORE_FAILED, FileOperation, "Could not persist session", [
    "Check that the local application directory is writable",
]);
template!(NO_ACTIVE_SESSION, Validation, "No active session to refresh", [
    "Connect to the cluster first",
]);
template!(NO_REFRESH_CALLBACK, Configuration, "No refresh callback configured", []);
template!(REFRESH_FAILED, Authentication, "Session refresh failed", [
    "Reconnect to the cluster",
]);
template!(NOT_CONNECTED, Network, "Not connected to the cluster", [
    "Connect to the cluster before running remote operations",
]);
template!(ALREADY_CONNECTED, Validation, "Already connected to the cluster", [
    "Disconnect first to connect with different credentials",
]);
template!(DIRECTORY_ACCESS_FAILED, FileOperation, "Cannot access directory", [
    "Verify that /projects/<user> exists and is accessible",
]);
template!(DIRECTORY_CREATE_FAILED, FileOperation, "Failed to create directory", [
    "Check write permissions on the parent directory",
]);
template!(LIST_FAILED, FileOperation, "Failed to list directory", []);
template!(DELETE_FAILED, FileOperation, "Failed to delete directory", []);
template!(FILE_OPERATION_FAILED, FileOperation, "File operation failed", []);
template!(PROBE_PANICKED, Unknown, "Validation probe failed unexpectedly", [
    "Retry the validation; report the problem if it persists",
]);
template!(UNKNOWN_ERROR, Unknown, "An unexpected error occurred", []);

/// Error surfaced across the core boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ConnectionError {
    category: ErrorCategory,
    code: String,
    message: String,
    retryable: bool,
    suggestions: Vec<String>,
    timestamp: DateTime<Utc>,
    context: Option<ErrorContext>,
}

impl ConnectionError {
    pub fn from_template(template: &ErrorTemplate) -> Self {
        Self {
            category: template.category,
            code: template.code.to_string(),
            message: template.message.to_string(),
            retryable: template.category.is_retryable(),
            suggestions: template.suggestions.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now(),
            context: None,
        }
    }

    /// Classify a raw adapter failure and keep its text as detail
    pub fn from_raw(raw: &str) -> Self {
        Self::from_template(classify(raw)).with_detail(raw.trim())
    }

    /// Replace the template message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Append detail to the template message
    pub fn with_detail(mut self, detail: impl AsRef<str>) -> Self {
        let detail = detail.as_ref();
        if !detail.is_empty() {
            self.message = format!("{}: {}", self.message, detail);
        }
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Tag the attempt number, keeping any existing context
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        let context = self.context.take().unwrap_or_default();
        self.context = Some(context.with_attempt(attempt));
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }

    pub fn is(&self, template: &ErrorTemplate) -> bool {
        self.code == template.code
    }
}

/// Map a raw failure message to the closest template
pub fn classify(raw: &str) -> &'static ErrorTemplate {
    let lower = raw.to_ascii_lowercase();

    if lower.contains("permission denied (publickey")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
    {
        &AUTH_FAILED
    } else if lower.contains("timed out") || lower.contains("timeout") {
        &CONNECTION_TIMEOUT
    } else if lower.contains("could not resolve hostname")
        || lower.contains("no route to host")
        || lower.contains("connection refused")
        || lower.contains("network is unreachable")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
    {
        &NETWORK_UNREACHABLE
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        &PERMISSION_DENIED
    } else if lower.contains("no such file") || lower.contains("not a directory") {
        &FILE_OPERATION_FAILED
    } else {
        &UNKNOWN_ERROR
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
