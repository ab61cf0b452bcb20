use super::{
    CommandOutput, Credentials, DirectoryCreation, FileListing, RemoteFileInfo, SftpConnection,
    SshConnection, SshStatus, TransferResult,
};
use crate::connection::errors::{self, ConnectionError};
use crate::env::{probes, test as fixtures};
use crate::validation::NetworkProbe;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_DF_OUTPUT: &str = "Filesystem      Size  Used Avail Use% Mounted on\n\
                                 nfs:/projects   100T   60T   40T  60% /projects\n";

#[derive(Debug, Clone)]
struct FakeEntry {
    is_directory: bool,
    modified: DateTime<Utc>,
    content: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    connected: bool,
    host: Option<String>,
    username: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    home: String,
    df_output: String,
    entries: BTreeMap<String, FakeEntry>,
    responses: HashMap<String, CommandOutput>,
    panic_commands: HashSet<String>,
    connect_error: Option<ConnectionError>,
    unreachable: bool,
    fail_exists: HashSet<String>,
    fail_create: HashSet<String>,
    fail_list: HashSet<String>,
    fail_remove: HashSet<String>,
    read_only: HashSet<String>,
    executed: Vec<String>,
}

/// In-memory login node implementing both capability ports
///
/// Starts with `/projects` and the test user's home directory, answers the
/// standard probe commands, and interprets the handful of shell commands the
/// workspace manager sends (`test -X`, `rm -rf`, `df -h`). Anything else
/// answers with exit code 127 unless scripted through [`FakeCluster::respond`].
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let home = fixtures::TEST_HOME.to_string();
        let mut state = FakeState {
            home: home.clone(),
            df_output: DEFAULT_DF_OUTPUT.to_string(),
            ..Default::default()
        };

        for (command, output) in [
            (probes::ECHO_TEST, CommandOutput::ok("test\n")),
            (probes::PWD, CommandOutput::ok(format!("{}\n", home))),
            (probes::SHELL_IDENTITY, CommandOutput::ok("-bash\n")),
            (probes::HOME_READABLE, CommandOutput::ok("")),
            (probes::HOME_WRITABLE, CommandOutput::ok("")),
            (probes::HOME_MKDIR, CommandOutput::ok("")),
            (
                probes::MODULE_VERSION,
                CommandOutput {
                    stderr: "Modules based on Lua: Version 8.7.32\n".to_string(),
                    ..CommandOutput::ok("")
                },
            ),
            (probes::SINFO_VERSION, CommandOutput::ok("slurm 23.02.7\n")),
            (probes::SBATCH_LOCATE, CommandOutput::ok("/usr/bin/sbatch\n")),
            (
                probes::SINFO_PARTITIONS,
                CommandOutput::ok("amilan\namilan-ucb\natesting\n"),
            ),
        ] {
            state.responses.insert(command.to_string(), output);
        }

        let cluster = Self {
            state: Mutex::new(state),
        };
        cluster.add_directory("/projects");
        cluster.add_directory(&home);
        cluster
    }

    /// A fake already connected as the test user
    pub fn connected() -> Self {
        let cluster = Self::new();
        {
            let mut state = cluster.lock();
            state.connected = true;
            state.host = Some(fixtures::TEST_HOST.to_string());
            state.username = Some(fixtures::TEST_USER.to_string());
            state.connected_since = Some(Utc::now());
        }
        cluster
    }

    /// Simulate the link going up or silently dropping
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn add_directory(&self, path: &str) {
        self.add_directory_modified(path, Utc::now());
    }

    /// Add a directory (and missing parents) with a fixed modification time
    pub fn add_directory_modified(&self, path: &str, modified: DateTime<Utc>) {
        let mut state = self.lock();
        insert_parents(&mut state.entries, path);
        state.entries.insert(
            path.to_string(),
            FakeEntry {
                is_directory: true,
                modified,
                content: Vec::new(),
            },
        );
    }

    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        insert_parents(&mut state.entries, path);
        state.entries.insert(
            path.to_string(),
            FakeEntry {
                is_directory: false,
                modified: Utc::now(),
                content: content.into(),
            },
        );
    }

    /// Script the output of an exact command line
    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.lock().responses.insert(command.to_string(), output);
    }

    /// Make an exact command line panic, as a crashing probe would
    pub fn panic_on(&self, command: &str) {
        self.lock().panic_commands.insert(command.to_string());
    }

    pub fn set_df_output(&self, output: impl Into<String>) {
        self.lock().df_output = output.into();
    }

    pub fn fail_connect_with(&self, error: ConnectionError) {
        self.lock().connect_error = Some(error);
    }

    pub fn clear_connect_failure(&self) {
        self.lock().connect_error = None;
    }

    /// Make the TCP reachability probe fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_exists(&self, path: &str) {
        self.lock().fail_exists.insert(path.to_string());
    }

    pub fn fail_create(&self, path: &str) {
        self.lock().fail_create.insert(path.to_string());
    }

    pub fn fail_list(&self, path: &str) {
        self.lock().fail_list.insert(path.to_string());
    }

    pub fn fail_remove(&self, path: &str) {
        self.lock().fail_remove.insert(path.to_string());
    }

    pub fn make_read_only(&self, path: &str) {
        self.lock().read_only.insert(path.to_string());
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.lock()
            .entries
            .get(path)
            .is_some_and(|entry| entry.is_directory)
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.lock().entries.contains_key(path)
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_connected(state: &FakeState) -> Result<(), ConnectionError> {
        if state.connected {
            Ok(())
        } else {
            Err(ConnectionError::from_template(&errors::NOT_CONNECTED))
        }
    }

    fn interpret(state: &mut FakeState, command: &str) -> CommandOutput {
        if let Some(target) = command.strip_prefix("rm -rf ") {
            let path = unquote(target);
            if state.fail_remove.contains(&path) {
                return CommandOutput::failed(
                    1,
                    format!("rm: cannot remove '{}': Permission denied\n", path),
                );
            }
            remove_tree(&mut state.entries, &path);
            return CommandOutput::ok("");
        }

        if let Some(rest) = command.strip_prefix("test -")
            && let Some((flag, target)) = rest.split_once(' ')
        {
            let path = unquote(target);
            let entry = state.entries.get(&path);
            let holds = match flag {
                "e" | "r" => entry.is_some(),
                "d" | "x" => entry.is_some_and(|e| e.is_directory),
                "w" => entry.is_some() && !state.read_only.contains(&path),
                _ => false,
            };
            return if holds {
                CommandOutput::ok("")
            } else {
                CommandOutput::failed(1, "")
            };
        }

        if command.starts_with("df -h") {
            return CommandOutput::ok(state.df_output.clone());
        }

        CommandOutput::failed(127, format!("bash: {}: command not found\n", command))
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnection for FakeCluster {
    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }
        state.connected = true;
        state.host = Some(credentials.host.clone());
        state.username = Some(credentials.username.clone());
        state.connected_since = Some(Utc::now());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        state.connected = false;
        state.connected_since = None;
        Ok(())
    }

    async fn execute_command(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, ConnectionError> {
        let mut state = self.lock();
        Self::require_connected(&state)?;
        state.executed.push(command.to_string());

        if state.panic_commands.contains(command) {
            drop(state);
            panic!("simulated crash while running `{}`", command);
        }

        if let Some(output) = state.responses.get(command) {
            return Ok(output.clone());
        }

        Ok(Self::interpret(&mut state, command))
    }

    async fn validate_connection(&self) -> bool {
        self.lock().connected
    }

    fn status(&self) -> SshStatus {
        let state = self.lock();
        SshStatus {
            connected: state.connected,
            host: state.host.clone(),
            username: state.username.clone(),
            connected_since: state.connected_since,
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[async_trait]
impl NetworkProbe for FakeCluster {
    async fn probe(&self, host: &str, port: u16) -> Result<Duration, ConnectionError> {
        if self.lock().unreachable {
            return Err(ConnectionError::from_template(&errors::NETWORK_UNREACHABLE)
                .with_detail(format!("{}:{}", host, port)));
        }
        Ok(Duration::from_millis(1))
    }
}

#[async_trait]
impl SftpConnection for FakeCluster {
    async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferResult, ConnectionError> {
        Self::require_connected(&self.lock())?;
        let content = tokio::fs::read(local_path).await.map_err(|e| {
            ConnectionError::from_template(&errors::FILE_OPERATION_FAILED).with_detail(e.to_string())
        })?;
        let bytes = content.len() as u64;
        self.add_file(remote_path, content);

        Ok(TransferResult {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            bytes,
        })
    }

    async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<TransferResult, ConnectionError> {
        let content = {
            let state = self.lock();
            Self::require_connected(&state)?;
            match state.entries.get(remote_path) {
                Some(entry) if !entry.is_directory => entry.content.clone(),
                _ => {
                    return Err(ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                        .with_detail(format!("No such file: {}", remote_path)));
                }
            }
        };

        tokio::fs::write(local_path, &content).await.map_err(|e| {
            ConnectionError::from_template(&errors::FILE_OPERATION_FAILED).with_detail(e.to_string())
        })?;

        Ok(TransferResult {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            bytes: content.len() as u64,
        })
    }

    async fn list_files(&self, path: &str) -> Result<FileListing, ConnectionError> {
        let state = self.lock();
        Self::require_connected(&state)?;

        if state.fail_list.contains(path) {
            return Err(
                ConnectionError::from_template(&errors::PERMISSION_DENIED).with_detail(path)
            );
        }
        if !state.entries.get(path).is_some_and(|e| e.is_directory) {
            return Err(ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                .with_detail(format!("No such directory: {}", path)));
        }

        let files: Vec<RemoteFileInfo> = state
            .entries
            .iter()
            .filter(|(entry_path, _)| parent_of(entry_path) == Some(path))
            .map(|(entry_path, entry)| to_info(entry_path, entry))
            .collect();

        Ok(FileListing {
            total_count: files.len(),
            files,
            path: path.to_string(),
        })
    }

    async fn create_directory(&self, path: &str) -> Result<DirectoryCreation, ConnectionError> {
        let mut state = self.lock();
        Self::require_connected(&state)?;

        let parent_read_only = parent_of(path).is_some_and(|parent| state.read_only.contains(parent));
        if state.fail_create.contains(path) || parent_read_only {
            return Err(ConnectionError::from_template(&errors::PERMISSION_DENIED)
                .with_detail(format!("mkdir {}", path)));
        }

        if let Some(entry) = state.entries.get(path) {
            if entry.is_directory {
                return Ok(DirectoryCreation {
                    path: path.to_string(),
                    created: false,
                    existed: true,
                });
            }
            return Err(ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                .with_detail(format!("Not a directory: {}", path)));
        }

        insert_parents(&mut state.entries, path);
        state.entries.insert(
            path.to_string(),
            FakeEntry {
                is_directory: true,
                modified: Utc::now(),
                content: Vec::new(),
            },
        );

        Ok(DirectoryCreation {
            path: path.to_string(),
            created: true,
            existed: false,
        })
    }

    async fn delete_file(&self, path: &str) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        Self::require_connected(&state)?;

        if state.fail_remove.contains(path) {
            return Err(
                ConnectionError::from_template(&errors::PERMISSION_DENIED).with_detail(path)
            );
        }
        let removable = state
            .entries
            .get(path)
            .map(|entry| !entry.is_directory || !has_children(&state.entries, path));
        match removable {
            Some(true) => {
                state.entries.remove(path);
                Ok(())
            }
            Some(false) => Err(ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                .with_detail(format!("Directory not empty: {}", path))),
            None => Err(ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                .with_detail(format!("No such file: {}", path))),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, ConnectionError> {
        let state = self.lock();
        Self::require_connected(&state)?;

        if state.fail_exists.contains(path) {
            return Err(ConnectionError::from_template(&errors::PERMISSION_DENIED)
                .with_detail(format!("stat {}", path)));
        }
        Ok(state.entries.contains_key(path))
    }

    async fn file_info(&self, path: &str) -> Result<RemoteFileInfo, ConnectionError> {
        let state = self.lock();
        Self::require_connected(&state)?;

        state
            .entries
            .get(path)
            .map(|entry| to_info(path, entry))
            .ok_or_else(|| {
                ConnectionError::from_template(&errors::FILE_OPERATION_FAILED)
                    .with_detail(format!("No such file: {}", path))
            })
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

fn insert_parents(entries: &mut BTreeMap<String, FakeEntry>, path: &str) {
    let mut current = parent_of(path);
    while let Some(parent) = current {
        entries.entry(parent.to_string()).or_insert_with(|| FakeEntry {
            is_directory: true,
            modified: Utc::now(),
            content: Vec::new(),
        });
        current = parent_of(parent);
    }
}

fn has_children(entries: &BTreeMap<String, FakeEntry>, path: &str) -> bool {
    let prefix = format!("{}/", path);
    entries.keys().any(|key| key.starts_with(&prefix))
}

fn remove_tree(entries: &mut BTreeMap<String, FakeEntry>, path: &str) {
    let prefix = format!("{}/", path);
    entries.retain(|key, _| key != path && !key.starts_with(&prefix));
}

fn to_info(path: &str, entry: &FakeEntry) -> RemoteFileInfo {
    RemoteFileInfo {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        is_directory: entry.is_directory,
        size: entry.content.len() as u64,
        modified: entry.modified,
        permissions: if entry.is_directory { "755" } else { "644" }.to_string(),
    }
}

/// Undo `shell_escape` quoting for the simple paths the core sends
fn unquote(argument: &str) -> String {
    let argument = argument.trim();
    match argument
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
    {
        Some(inner) => inner.replace("'\\''", "'"),
        None => argument.to_string(),
    }
}
