use crate::connection::ConnectionError;
use crate::connection::errors::{SESSION_CORRUPTED, SESSION_STORE_FAILED};
use crate::session::metadata::{PersistedSession, SESSION_FORMAT_VERSION, SessionInfo};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Durable slot holding at most one session
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nothing is stored
    async fn load(&self) -> Result<Option<SessionInfo>, ConnectionError>;

    async fn save(&self, session: &SessionInfo) -> Result<(), ConnectionError>;

    /// Removing an absent record is not an error
    async fn clear(&self) -> Result<(), ConnectionError>;
}

/// JSON file store, written via temp file + rename
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.namdrunner/session.json`
    pub fn user_default() -> Option<Self> {
        crate::env::home_dir().map(|home| Self::new(crate::env::user_session_file_path(&home)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn store_error(&self, action: &str, e: std::io::Error) -> ConnectionError {
        ConnectionError::from_template(&SESSION_STORE_FAILED).with_detail(format!(
            "{} {}: {}",
            action,
            self.path.display(),
            e
        ))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<SessionInfo>, ConnectionError> {
        let bytes = match async_fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.store_error("Failed to read", e)),
        };

        let persisted: PersistedSession = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Session file {} is unreadable: {}", self.path.display(), e);
            ConnectionError::from_template(&SESSION_CORRUPTED).with_detail(e.to_string())
        })?;

        if persisted.format_version != SESSION_FORMAT_VERSION {
            return Err(ConnectionError::from_template(&SESSION_CORRUPTED).with_detail(format!(
                "unsupported format version {}",
                persisted.format_version
            )));
        }

        debug!("Loaded session record from {}", self.path.display());
        Ok(Some(persisted.session))
    }

    async fn save(&self, session: &SessionInfo) -> Result<(), ConnectionError> {
        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|e| self.store_error("Failed to create directory for", e))?;
        }

        let json = serde_json::to_vec_pretty(&PersistedSession::wrap(session.clone()))
            .map_err(|e| ConnectionError::from_template(&SESSION_STORE_FAILED).with_detail(e.to_string()))?;

        let temp_path = self.temp_path();
        let mut file = async_fs::File::create(&temp_path)
            .await
            .map_err(|e| self.store_error("Failed to write", e))?;
        file.write_all(&json)
            .await
            .map_err(|e| self.store_error("Failed to write", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.store_error("Failed to sync", e))?;
        drop(file);

        async_fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.store_error("Failed to replace", e))?;

        debug!("Persisted session record to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<(), ConnectionError> {
        match async_fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.store_error("Failed to remove", e)),
        }
    }
}

/// Process-local store, used by tests and one-shot commands
#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<SessionInfo>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: SessionInfo) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<SessionInfo>, ConnectionError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, session: &SessionInfo) -> Result<(), ConnectionError> {
        *self.slot.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), ConnectionError> {
        self.slot.lock().await.take();
        Ok(())
    }
}
