use super::errors::{
    ALREADY_CONNECTED, INVALID_CONFIG, INVALID_TRANSITION, INVALID_USERNAME, NETWORK_UNREACHABLE,
    NOT_CONNECTED,
};
use super::retry::RetryPolicy;
use super::state_machine::{ConnectionStateMachine, StateMachineDiagnostics};
use super::types::ErrorCategory;
use super::{ConnectionError, ConnectionState};
use crate::remote::{Credentials, SftpConnection, SshConnection, SshStatus};
use crate::session::{SessionDiagnostics, SessionInfo, SessionManager};
use crate::validation::{ConnectivityValidator, FullValidationResult};
use crate::workspace::{WorkspaceManager, paths};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub ssh: SshStatus,
    pub session: SessionDiagnostics,
    pub machine: StateMachineDiagnostics,
}

/// Connect/disconnect orchestration over the state machine, session manager
/// and capability ports
///
/// A session record is persisted before the machine enters `Connected` and
/// cleared whenever it leaves it, so `Connected` always has a valid session
/// and `Disconnected`/`Expired` never do.
pub struct ConnectionController {
    state: Arc<ConnectionStateMachine>,
    sessions: Arc<SessionManager>,
    ssh: Arc<dyn SshConnection>,
    sftp: Arc<dyn SftpConnection>,
    validator: ConnectivityValidator,
    retry: RetryPolicy,
}

impl ConnectionController {
    pub fn new(
        ssh: Arc<dyn SshConnection>,
        sftp: Arc<dyn SftpConnection>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            state: Arc::new(ConnectionStateMachine::new()),
            sessions,
            ssh,
            sftp,
            validator: ConnectivityValidator::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_validator(mut self, validator: ConnectivityValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn workspace(&self) -> WorkspaceManager {
        WorkspaceManager::new(Arc::clone(&self.ssh), Arc::clone(&self.sftp))
    }

    /// Open the login session and persist it
    pub async fn connect(&self, credentials: &Credentials) -> Result<SessionInfo, ConnectionError> {
        match self.state.current_state() {
            ConnectionState::Connected => {
                return Err(ConnectionError::from_template(&ALREADY_CONNECTED));
            }
            ConnectionState::Connecting => {
                return Err(ConnectionError::from_template(&INVALID_TRANSITION)
                    .with_detail("a connection attempt is already in progress"));
            }
            ConnectionState::Disconnected | ConnectionState::Expired => {}
        }
        check_credentials(credentials)?;

        self.state.transition_to(
            ConnectionState::Connecting,
            Some(&format!("connecting to {}@{}", credentials.username, credentials.host)),
        )?;

        match self.establish(credentials).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("Connection to {} failed: {}", credentials.host, e);
                self.state.set_last_error(e.clone());
                if let Err(transition) = self
                    .state
                    .transition_to(ConnectionState::Disconnected, Some(e.code()))
                {
                    debug!("State already moved on after failed connect: {}", transition);
                }
                Err(e)
            }
        }
    }

    /// [`Self::connect`] under the retry policy
    pub async fn connect_with_retry(
        &self,
        credentials: &Credentials,
    ) -> Result<SessionInfo, ConnectionError> {
        self.retry
            .execute_with_retry(&self.state, |attempt| {
                debug!("Connection attempt {} to {}", attempt, credentials.host);
                self.connect(credentials).boxed()
            })
            .await
    }

    /// Close the session; safe to call in any state
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.sessions.cancel_session_refresh();
        let cleared = self.sessions.clear_session().await;

        if self.ssh.is_connected()
            && let Err(e) = self.ssh.disconnect().await
        {
            warn!("SSH disconnect reported an error: {}", e);
        }

        if self.state.current_state() != ConnectionState::Disconnected {
            self.state
                .transition_to(ConnectionState::Disconnected, Some("user disconnect"))?;
        }
        cleared
    }

    /// Reconcile the state machine with the link and the session record
    ///
    /// A dropped SSH link forces `Disconnected`; a missing or expired session
    /// moves to `Expired`. Returns the resulting state.
    pub async fn check_health(&self) -> Result<ConnectionState, ConnectionError> {
        if self.state.current_state() != ConnectionState::Connected {
            return Ok(self.state.current_state());
        }

        if !self.ssh.is_connected() || !self.ssh.validate_connection().await {
            self.drop_session().await;
            self.state
                .force_state(ConnectionState::Disconnected, Some("SSH link lost"));
            self.state.set_last_error(
                ConnectionError::from_template(&NETWORK_UNREACHABLE)
                    .with_detail("connection to the login node was lost"),
            );
            return Ok(ConnectionState::Disconnected);
        }

        match self.sessions.load_session().await {
            Ok(Some(_)) => Ok(ConnectionState::Connected),
            Ok(None) | Err(_) => {
                info!("Session is no longer valid, marking connection expired");
                self.drop_session().await;
                if let Err(e) = self.ssh.disconnect().await {
                    warn!("SSH disconnect after expiry failed: {}", e);
                }
                self.state
                    .transition_to(ConnectionState::Expired, Some("session expired"))?;
                Ok(ConnectionState::Expired)
            }
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state.current_state(),
            ssh: self.ssh.status(),
            session: self.sessions.session_diagnostics().await,
            machine: self.state.diagnostics(),
        }
    }

    /// The persisted, still valid session without changing state
    pub async fn restore_session(&self) -> Result<Option<SessionInfo>, ConnectionError> {
        self.sessions.load_session().await
    }

    /// Full layered validation against this controller's ports
    pub async fn validate(&self, target: &Credentials) -> FullValidationResult {
        self.validator
            .run_full_validation(target, self.ssh.as_ref(), self.sftp.as_ref())
            .await
    }

    /// Fails with `NOT_CONNECTED` unless the machine is `Connected`
    pub fn require_connected(&self) -> Result<(), ConnectionError> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::from_template(&NOT_CONNECTED)
                .with_detail(format!("current state is {}", self.state.current_state())))
        }
    }

    async fn establish(&self, credentials: &Credentials) -> Result<SessionInfo, ConnectionError> {
        let network = self.validator.test_basic_connectivity(credentials).await;
        if !network.reachable {
            return Err(ConnectionError::from_template(&NETWORK_UNREACHABLE)
                .with_detail(network.error.unwrap_or_default()));
        }

        self.ssh.connect(credentials).await.map_err(|e| {
            if credentials.password.is_some() && e.category() == ErrorCategory::Authentication {
                e.with_suggestion("Password login is not used; load an SSH key into your agent")
            } else {
                e
            }
        })?;

        let session = SessionInfo::new(&credentials.host, &credentials.username);
        if let Err(e) = self.sessions.save_session(&session).await {
            self.close_link().await;
            return Err(e);
        }

        if let Err(e) = self
            .state
            .transition_to(ConnectionState::Connected, Some("authenticated"))
        {
            self.drop_session().await;
            self.close_link().await;
            return Err(e);
        }

        if self.sessions.has_refresh_callback() {
            let interval = self.sessions.config().refresh_interval();
            if let Err(e) = self.sessions.schedule_session_refresh(interval) {
                warn!("Session refresh not scheduled: {}", e);
            }
        }

        info!("Connected to {} as {}", credentials.host, credentials.username);
        Ok(session)
    }

    async fn drop_session(&self) {
        self.sessions.cancel_session_refresh();
        if let Err(e) = self.sessions.clear_session().await {
            warn!("Failed to clear session: {}", e);
        }
    }

    async fn close_link(&self) {
        if let Err(e) = self.ssh.disconnect().await {
            debug!("SSH disconnect during cleanup failed: {}", e);
        }
    }
}

fn check_credentials(credentials: &Credentials) -> Result<(), ConnectionError> {
    if credentials.host.trim().is_empty() {
        return Err(ConnectionError::from_template(&INVALID_CONFIG).with_detail("host is empty"));
    }
    if credentials.port == 0 {
        return Err(ConnectionError::from_template(&INVALID_CONFIG).with_detail("port is 0"));
    }
    if !paths::is_valid_username(&credentials.username) {
        return Err(ConnectionError::from_template(&INVALID_USERNAME)
            .with_detail(format!("{:?}", credentials.username)));
    }
    Ok(())
}
