use crate::connection::ConnectionError;
use crate::connection::errors::{
    INVALID_CONFIG, NO_ACTIVE_SESSION, NO_REFRESH_CALLBACK, REFRESH_FAILED, SESSION_CORRUPTED,
    SESSION_EXPIRED, panic_message,
};
use crate::session::metadata::{SessionDiagnostics, SessionInfo};
use crate::session::persistence::SessionStore;
use chrono::{Duration, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// Produces a renewed session from the current one
pub type RefreshCallback =
    Arc<dyn Fn(SessionInfo) -> BoxFuture<'static, anyhow::Result<SessionInfo>> + Send + Sync>;

/// Session lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// A session at least this old is expired
    pub validity_hours: u32,
    /// Lead time before expiry at which `is_expiring_soon` turns true
    pub expiry_warning_minutes: u32,
    pub refresh_interval_minutes: u32,
    /// Overrides `~/.namdrunner/session.json`
    pub session_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validity_hours: 4,
            expiry_warning_minutes: 30,
            refresh_interval_minutes: 60,
            session_file: None,
        }
    }
}

impl SessionConfig {
    pub fn validity_window(&self) -> Duration {
        Duration::hours(i64::from(self.validity_hours))
    }

    pub fn expiry_warning(&self) -> Duration {
        Duration::minutes(i64::from(self.expiry_warning_minutes))
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.refresh_interval_minutes) * 60)
    }
}

struct RefreshTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct SessionInner {
    store: Arc<dyn SessionStore>,
    refresh_callback: Option<RefreshCallback>,
    config: SessionConfig,
    // Serializes refreshes between the timer and explicit callers
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SessionInner {
    fn is_valid(&self, session: &SessionInfo) -> bool {
        !session.host.trim().is_empty()
            && !session.username.trim().is_empty()
            && session.age(Utc::now()) < self.config.validity_window()
    }

    async fn refresh(&self) -> Result<SessionInfo, ConnectionError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self
            .store
            .load()
            .await?
            .ok_or_else(|| ConnectionError::from_template(&NO_ACTIVE_SESSION))?;

        let callback = self
            .refresh_callback
            .clone()
            .ok_or_else(|| ConnectionError::from_template(&NO_REFRESH_CALLBACK))?;

        debug!("Refreshing session for {}@{}", current.username, current.host);
        let outcome = AssertUnwindSafe(async move { callback(current).await })
            .catch_unwind()
            .await;

        let renewed = match outcome {
            Ok(Ok(renewed)) => renewed,
            Ok(Err(e)) => {
                warn!("Session refresh callback failed: {}", e);
                return Err(
                    ConnectionError::from_template(&REFRESH_FAILED).with_detail(e.to_string())
                );
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Session refresh callback panicked: {}", message);
                return Err(ConnectionError::from_template(&REFRESH_FAILED).with_detail(message));
            }
        };

        renewed.validate(Utc::now())?;
        self.store.save(&renewed).await?;
        info!("Session refreshed for {}@{}", renewed.username, renewed.host);
        Ok(renewed)
    }
}

/// Persists, validates and renews the login session
///
/// At most one renewal timer exists at a time. Scheduling again replaces the
/// previous timer, and [`SessionManager::dispose`] (also run on drop) cancels
/// it; both are safe to call repeatedly.
pub struct SessionManager {
    inner: Arc<SessionInner>,
    refresh_task: Mutex<Option<RefreshTask>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        refresh_callback: Option<RefreshCallback>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                refresh_callback,
                config,
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn has_refresh_callback(&self) -> bool {
        self.inner.refresh_callback.is_some()
    }

    /// Validate and persist `session`, replacing any previous record
    pub async fn save_session(&self, session: &SessionInfo) -> Result<(), ConnectionError> {
        session.validate(Utc::now())?;
        self.inner.store.save(session).await?;
        info!("Session saved for {}@{}", session.username, session.host);
        Ok(())
    }

    /// The persisted session, if any
    ///
    /// A record older than the validity window is cleared and reported as
    /// `SESSION_EXPIRED`; an unreadable record is cleared and reported as
    /// `SESSION_CORRUPTED`.
    pub async fn load_session(&self) -> Result<Option<SessionInfo>, ConnectionError> {
        let session = match self.inner.store.load().await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(e) if e.is(&SESSION_CORRUPTED) => {
                self.discard_record().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !self.inner.is_valid(&session) {
            let age = session.age(Utc::now());
            info!(
                "Persisted session for {}@{} expired ({} minutes old)",
                session.username,
                session.host,
                age.num_minutes()
            );
            self.discard_record().await;
            return Err(ConnectionError::from_template(&SESSION_EXPIRED).with_detail(format!(
                "session is {} minutes old, limit is {} hours",
                age.num_minutes(),
                self.inner.config.validity_hours
            )));
        }

        Ok(Some(session))
    }

    pub fn is_session_valid(&self, session: Option<&SessionInfo>) -> bool {
        session.is_some_and(|session| self.inner.is_valid(session))
    }

    pub async fn clear_session(&self) -> Result<(), ConnectionError> {
        self.inner.store.clear().await?;
        info!("Session cleared");
        Ok(())
    }

    /// Renew the persisted session through the refresh callback
    pub async fn refresh_session(&self) -> Result<SessionInfo, ConnectionError> {
        self.inner.refresh().await
    }

    /// Start (or restart) the periodic renewal timer
    ///
    /// The first renewal fires one `interval` from now. Must be called from
    /// within a tokio runtime.
    pub fn schedule_session_refresh(
        &self,
        interval: std::time::Duration,
    ) -> Result<(), ConnectionError> {
        if interval.is_zero() {
            return Err(ConnectionError::from_template(&INVALID_CONFIG)
                .with_detail("refresh interval must be greater than zero"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ConnectionError::from_template(&INVALID_CONFIG).with_detail(e.to_string())
        })?;

        let (cancel, mut cancelled) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.refresh().await {
                            warn!("Scheduled session refresh failed: {}", e);
                        }
                    }
                }
            }
            debug!("Session refresh timer stopped");
        });

        if let Some(previous) = self.lock_task().replace(RefreshTask { cancel, handle }) {
            let _ = previous.cancel.send(());
            debug!("Replaced existing session refresh timer");
        }
        info!("Session refresh scheduled every {}s", interval.as_secs());
        Ok(())
    }

    /// Stop the renewal timer. Returns false if none was running.
    pub fn cancel_session_refresh(&self) -> bool {
        match self.lock_task().take() {
            Some(task) => {
                let _ = task.cancel.send(());
                info!("Session refresh cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_refresh_scheduled(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Age of the persisted session; `None` when there is none
    pub async fn session_age(&self) -> Option<Duration> {
        let session = self.peek().await?;
        Some(session.age(Utc::now()))
    }

    /// Remaining validity; zero when there is no (valid) session
    pub async fn time_until_expiry(&self) -> Duration {
        match self.session_age().await {
            Some(age) => (self.inner.config.validity_window() - age).max(Duration::zero()),
            None => Duration::zero(),
        }
    }

    /// True within the warning lead time of the validity boundary
    pub async fn is_expiring_soon(&self) -> bool {
        match self.peek().await {
            Some(session) if self.inner.is_valid(&session) => {
                self.time_until_expiry().await <= self.inner.config.expiry_warning()
            }
            _ => false,
        }
    }

    pub async fn session_diagnostics(&self) -> SessionDiagnostics {
        let session = self.peek().await;
        let now = Utc::now();
        let window = self.inner.config.validity_window();
        let age = session.as_ref().map(|s| s.age(now));
        let remaining = age
            .map(|age| (window - age).max(Duration::zero()))
            .unwrap_or_else(Duration::zero);
        let is_valid = session.as_ref().is_some_and(|s| self.inner.is_valid(s));

        SessionDiagnostics {
            has_session: session.is_some(),
            is_valid,
            host: session.as_ref().map(|s| s.host.clone()),
            username: session.as_ref().map(|s| s.username.clone()),
            connected_at: session.as_ref().map(|s| s.connected_at),
            age_seconds: age.map(|age| age.num_seconds()),
            time_until_expiry_seconds: remaining.num_seconds(),
            expiring_soon: is_valid && remaining <= self.inner.config.expiry_warning(),
            refresh_scheduled: self.is_refresh_scheduled(),
            validity_window_seconds: window.num_seconds(),
        }
    }

    /// Cancel the renewal timer; idempotent
    pub fn dispose(&self) {
        if self.cancel_session_refresh() {
            debug!("Session manager disposed");
        }
    }

    /// Raw record without expiry handling
    async fn peek(&self) -> Option<SessionInfo> {
        match self.inner.store.load().await {
            Ok(session) => session,
            Err(e) => {
                debug!("Session record unavailable: {}", e);
                None
            }
        }
    }

    async fn discard_record(&self) {
        if let Err(e) = self.inner.store.clear().await {
            warn!("Failed to discard stale session record: {}", e);
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<RefreshTask>> {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
