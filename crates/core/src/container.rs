//! Command execution inside an already-running container.
//!
//! [`ContainerRuntime`] is the seam to the container engine; [`DockerCli`]
//! implements it by driving the `docker` CLI against the configured socket.
//! [`ContainerExecutor`] layers the availability checks and output sinks on
//! top of any runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code reported when the runtime cannot tell how the command ended.
pub const UNKNOWN_EXIT_CODE: i64 = 1;

const CONFIG_PLACEHOLDER: &str = "{config}";
const STATUS_RUNNING: &str = "running";
const READ_CHUNK_SIZE: usize = 8192;
const EXEC_CHANNEL_CAPACITY: usize = 64;
/// Bytes of `docker exec` stderr kept for classifying its exit status.
const STDERR_TAIL_LIMIT: usize = 4096;
/// `docker` exits with this when the daemon or transport failed.
const DOCKER_EXIT_DAEMON_ERROR: i64 = 125;
const DOCKER_EXIT_CANNOT_INVOKE: i64 = 126;
const DOCKER_EXIT_NOT_FOUND: i64 = 127;
const DOCKER_EXEC_ERROR_PREFIXES: [&str; 2] =
    ["OCI runtime exec failed", "Error response from daemon"];

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker socket is not mounted")]
    SocketUnavailable,
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container {container} is not running (status: {status})")]
    ContainerNotRunning { container: String, status: String },
    #[error("{0}")]
    Transport(String),
    #[error("failed to create exec session: {0}")]
    ExecCreate(String),
    #[error("invalid run command: {0}")]
    InvalidCommand(String),
    #[error("failed to write exec output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: String,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }
}

/// One command invocation inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSession {
    pub id: String,
    pub container: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl ExecChunk {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Stdout(bytes) | Self::Stderr(bytes) => bytes,
        }
    }
}

/// Arrival-ordered, finite sequence of output chunks from one exec session.
#[derive(Debug)]
pub struct ExecStream {
    rx: mpsc::Receiver<ExecChunk>,
}

impl ExecStream {
    pub fn new(rx: mpsc::Receiver<ExecChunk>) -> Self {
        Self { rx }
    }

    /// `None` once every producer has finished.
    pub async fn next(&mut self) -> Option<ExecChunk> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, container: &str) -> Result<ContainerState, ContainerError>;

    async fn create_exec(
        &self,
        container: &str,
        argv: &[String],
    ) -> Result<ExecSession, ContainerError>;

    async fn start_exec(&self, session: &ExecSession) -> Result<ExecStream, ContainerError>;

    /// Exit code of a finished session, if the runtime reported one.
    async fn inspect_exec(&self, session: &ExecSession) -> Result<Option<i64>, ContainerError>;

    /// Tears down a session whose output will not be consumed.
    async fn abort_exec(&self, _session: &ExecSession) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    socket_path: PathBuf,
}

impl ContainerExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, socket_path: PathBuf) -> Self {
        Self {
            runtime,
            socket_path,
        }
    }

    pub fn socket_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Reachability report; never fails.
    pub async fn check_available(&self, container: &str) -> Availability {
        if !self.socket_available() {
            return Availability {
                ok: false,
                reason: Some("Docker socket not mounted".to_string()),
            };
        }

        let reason = match self.runtime.inspect(container).await {
            Ok(state) if state.is_running() => None,
            Ok(state) => Some(format!("Container status: {}", state.status)),
            Err(ContainerError::ContainerNotFound(_)) => Some("Container not found".to_string()),
            Err(err) => Some(err.to_string()),
        };

        Availability {
            ok: reason.is_none(),
            reason,
        }
    }

    /// Runs `argv` in `container`, writing and flushing every chunk to `sink`
    /// as it arrives. Returns the exit code.
    pub async fn exec_streaming<W>(
        &self,
        container: &str,
        argv: &[String],
        sink: &mut W,
    ) -> Result<i64, ContainerError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (session, mut stream) = self.open_session(container, argv).await?;

        if let Err(err) = copy_to_sink(&mut stream, sink).await {
            warn!(exec_id = %session.id, error = %err, "Output sink failed; aborting exec");
            self.runtime.abort_exec(&session).await;
            return Err(err.into());
        }

        self.finish_session(&session).await
    }

    /// Same as [`Self::exec_streaming`] but buffers output in memory. Meant for
    /// short auxiliary commands.
    pub async fn exec_capture(
        &self,
        container: &str,
        argv: &[String],
    ) -> Result<(i64, String), ContainerError> {
        let (session, mut stream) = self.open_session(container, argv).await?;

        let mut captured = Vec::new();
        while let Some(chunk) = stream.next().await {
            captured.extend_from_slice(chunk.bytes());
        }

        let exit_code = self.finish_session(&session).await?;
        Ok((exit_code, String::from_utf8_lossy(&captured).into_owned()))
    }

    async fn open_session(
        &self,
        container: &str,
        argv: &[String],
    ) -> Result<(ExecSession, ExecStream), ContainerError> {
        if !self.socket_available() {
            return Err(ContainerError::SocketUnavailable);
        }

        let state = self.runtime.inspect(container).await?;
        if !state.is_running() {
            return Err(ContainerError::ContainerNotRunning {
                container: container.to_string(),
                status: state.status,
            });
        }

        let session = self.runtime.create_exec(container, argv).await?;
        info!(
            exec_id = %session.id,
            container,
            command = %argv.join(" "),
            "Starting exec session"
        );
        let stream = self.runtime.start_exec(&session).await?;
        Ok((session, stream))
    }

    async fn finish_session(&self, session: &ExecSession) -> Result<i64, ContainerError> {
        let exit_code = self.runtime.inspect_exec(session).await?;
        if exit_code.is_none() {
            warn!(
                exec_id = %session.id,
                "Runtime reported no exit code; treating exec as failed"
            );
        }
        Ok(exit_code.unwrap_or(UNKNOWN_EXIT_CODE))
    }
}

async fn copy_to_sink<W>(stream: &mut ExecStream, sink: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(chunk) = stream.next().await {
        sink.write_all(chunk.bytes()).await?;
        sink.flush().await?;
    }
    Ok(())
}

/// Builds the argv for one run from the configured template.
///
/// The template is split shell-style first, then a `{config}` placeholder is
/// replaced with the raw path inside each token, so quoting around the
/// placeholder is optional. Without a placeholder `-c <path>` is appended
/// unless the template already passes `-c`/`--config`.
pub fn build_command(template: &str, config_path: &Path) -> Result<Vec<String>, ContainerError> {
    let config = config_path.to_string_lossy();
    let mut tokens = split_command(template)?;

    let argv = if tokens.iter().any(|token| token.contains(CONFIG_PLACEHOLDER)) {
        tokens
            .into_iter()
            .map(|token| token.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    } else {
        if !tokens.iter().any(|token| token == "-c" || token == "--config") {
            tokens.push("-c".to_string());
            tokens.push(config.into_owned());
        }
        tokens
    };

    if argv.is_empty() {
        return Err(ContainerError::InvalidCommand(
            "command template is empty".to_string(),
        ));
    }
    Ok(argv)
}

fn split_command(command: &str) -> Result<Vec<String>, ContainerError> {
    shlex::split(command).ok_or_else(|| {
        ContainerError::InvalidCommand(format!("unbalanced quoting in '{command}'"))
    })
}

/// [`ContainerRuntime`] backed by the `docker` command-line client.
///
/// `docker exec` creates and starts the session in one step, so creation
/// failures only show up in its exit status. [`Self::inspect_exec`] tells
/// those apart from the command's own exit code using the stderr tail.
pub struct DockerCli {
    binary: PathBuf,
    socket_path: PathBuf,
    processes: Mutex<HashMap<String, ExecProcess>>,
}

struct ExecProcess {
    child: Child,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
}

impl DockerCli {
    pub fn new(socket_path: PathBuf) -> Self {
        Self::with_binary(PathBuf::from("docker"), socket_path)
    }

    pub fn with_binary(binary: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            binary,
            socket_path,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env(
            "DOCKER_HOST",
            format!("unix://{}", self.socket_path.display()),
        )
        .stdin(Stdio::null());
        cmd
    }

    fn take_process(&self, exec_id: &str) -> Option<ExecProcess> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(exec_id)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, container: &str) -> Result<ContainerState, ContainerError> {
        let output = self
            .command()
            .args(["inspect", "--type", "container", "--format", "{{.State.Status}}"])
            .arg(container)
            .output()
            .await
            .map_err(|err| ContainerError::Transport(format!("failed to invoke docker: {err}")))?;

        if output.status.success() {
            return Ok(ContainerState {
                status: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such object") || stderr.contains("No such container") {
            Err(ContainerError::ContainerNotFound(container.to_string()))
        } else {
            Err(ContainerError::Transport(stderr))
        }
    }

    async fn create_exec(
        &self,
        container: &str,
        argv: &[String],
    ) -> Result<ExecSession, ContainerError> {
        if argv.is_empty() {
            return Err(ContainerError::ExecCreate("command is empty".to_string()));
        }

        Ok(ExecSession {
            id: Uuid::new_v4().to_string(),
            container: container.to_string(),
            argv: argv.to_vec(),
        })
    }

    async fn start_exec(&self, session: &ExecSession) -> Result<ExecStream, ContainerError> {
        let mut child = self
            .command()
            .arg("exec")
            .arg(&session.container)
            .args(&session.argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ContainerError::ExecCreate(format!("failed to spawn docker exec: {err}")))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(EXEC_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, tx.clone(), ExecChunk::Stdout, None, &session.id);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(
                stderr,
                tx,
                ExecChunk::Stderr,
                Some(stderr_tail.clone()),
                &session.id,
            );
        }

        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.id.clone(), ExecProcess { child, stderr_tail });
        Ok(ExecStream::new(rx))
    }

    async fn inspect_exec(&self, session: &ExecSession) -> Result<Option<i64>, ContainerError> {
        let Some(mut process) = self.take_process(&session.id) else {
            return Err(ContainerError::Transport(format!(
                "unknown exec session: {}",
                session.id
            )));
        };

        let status = process
            .child
            .wait()
            .await
            .map_err(|err| ContainerError::Transport(format!("failed to await docker exec: {err}")))?;
        debug!(exec_id = %session.id, ?status, "Exec session finished");

        let stderr = last_stderr_line(&process.stderr_tail);
        classify_docker_exit(status.code().map(i64::from), &stderr)
    }

    async fn abort_exec(&self, session: &ExecSession) {
        let Some(mut process) = self.take_process(&session.id) else {
            return;
        };
        if let Err(err) = process.child.start_kill() {
            debug!(exec_id = %session.id, error = %err, "docker exec already exited");
        }
        if let Err(err) = process.child.wait().await {
            warn!(exec_id = %session.id, error = %err, "Failed to reap aborted docker exec");
        }
    }
}

/// Separates `docker` failures from the exit code of the command it ran.
fn classify_docker_exit(code: Option<i64>, stderr: &str) -> Result<Option<i64>, ContainerError> {
    match code {
        Some(DOCKER_EXIT_DAEMON_ERROR) => Err(ContainerError::Transport(if stderr.is_empty() {
            format!("docker exec failed with exit code {DOCKER_EXIT_DAEMON_ERROR}")
        } else {
            stderr.to_string()
        })),
        Some(DOCKER_EXIT_CANNOT_INVOKE | DOCKER_EXIT_NOT_FOUND)
            if DOCKER_EXEC_ERROR_PREFIXES
                .iter()
                .any(|prefix| stderr.starts_with(prefix)) =>
        {
            Err(ContainerError::ExecCreate(stderr.to_string()))
        }
        other => Ok(other),
    }
}

fn last_stderr_line(tail: &Mutex<Vec<u8>>) -> String {
    let tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let text = String::from_utf8_lossy(&tail);
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string();
    line
}

fn pump_output<R>(
    mut reader: R,
    tx: mpsc::Sender<ExecChunk>,
    tag: fn(Vec<u8>) -> ExecChunk,
    tail: Option<Arc<Mutex<Vec<u8>>>>,
    exec_id: &str,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let exec_id = exec_id.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(tail) = &tail {
                        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        tail.extend_from_slice(&buf[..n]);
                        let excess = tail.len().saturating_sub(STDERR_TAIL_LIMIT);
                        tail.drain(..excess);
                    }
                    if tx.send(tag(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(exec_id = %exec_id, error = %err, "Failed to read exec output");
                    break;
                }
            }
        }
    });
}
