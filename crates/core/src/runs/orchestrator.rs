use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{RunCompletion, RunError, RunRecord, RunStatus, RunStore};
use crate::config::{self, AppConfig};
use crate::config_registry::ActiveConfigResolver;
use crate::container::{build_command, ContainerExecutor};
use crate::lease::{self, RunLease};
use crate::log_reader::{self, LogTail};

const LOG_FILE_PATTERN: &str = "ui-run-%Y%m%d-%H%M%S.log";
const FAILURE_NOTE_PREFIX: &str = "[kometa-ui]";
const INTERRUPTED_REASON: &str =
    "run was still marked running when the service started; its process outcome is unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub lease_path: PathBuf,
    pub log_dir: PathBuf,
    pub container_name: String,
    pub run_cmd: String,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Self {
        Self {
            lease_path: config::lease_path(data_dir),
            log_dir: config.paths.log_dir.clone(),
            container_name: config.docker.container_name.clone(),
            run_cmd: config.docker.run_cmd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestLog {
    pub file: String,
    pub tail: LogTail,
}

/// Coordinates lease, store, and executor into the run lifecycle.
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: RunStore,
    executor: ContainerExecutor,
    resolver: Arc<dyn ActiveConfigResolver>,
    settings: RunSettings,
}

struct RunOutcome {
    status: RunStatus,
    exit_code: Option<i64>,
    error: Option<String>,
}

impl RunOutcome {
    fn exited(exit_code: i64) -> Self {
        Self {
            status: RunStatus::from_exit_code(exit_code),
            exit_code: Some(exit_code),
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code: None,
            error: Some(message),
        }
    }
}

impl RunOrchestrator {
    pub fn new(
        store: RunStore,
        executor: ContainerExecutor,
        resolver: Arc<dyn ActiveConfigResolver>,
        settings: RunSettings,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                executor,
                resolver,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    pub fn executor(&self) -> &ContainerExecutor {
        &self.inner.executor
    }

    pub fn resolver(&self) -> &dyn ActiveConfigResolver {
        self.inner.resolver.as_ref()
    }

    /// True while some run holds the lease.
    pub fn run_in_progress(&self) -> bool {
        lease::exists(&self.inner.settings.lease_path)
    }

    /// Starts a run in the background and returns its id without waiting for
    /// the tool to finish.
    pub fn start(&self, trigger: &str) -> Result<String, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let Some(lease) = RunLease::try_acquire(&self.inner.settings.lease_path, &run_id)? else {
            return Err(RunError::Conflict);
        };

        let started = Local::now();
        let started_at = started.timestamp();
        let log_file = log_file_name(&started);

        // Dropping `lease` on these early returns frees it for the next start.
        self.inner
            .store
            .insert(&run_id, started_at, trigger, &log_file)?;

        let config_path = match self.inner.resolver.active_config_path() {
            Ok(path) => path,
            Err(err) => {
                let err = err.context("failed to resolve active config");
                self.finalize(&run_id, started_at, RunOutcome::failed(format!("{err:#}")));
                return Err(err.into());
            }
        };

        info!(
            run_id = %run_id,
            trigger,
            log_file = %log_file,
            config_path = %config_path.display(),
            "Run started"
        );

        let orchestrator = self.clone();
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(lease, task_run_id, started_at, log_file, config_path)
                .await;
        });

        Ok(run_id)
    }

    async fn execute(
        &self,
        lease: RunLease,
        run_id: String,
        started_at: i64,
        log_file: String,
        config_path: PathBuf,
    ) {
        let log_path = self.inner.settings.log_dir.join(&log_file);

        let streaming = {
            let orchestrator = self.clone();
            let log_path = log_path.clone();
            tokio::spawn(async move { orchestrator.stream_to_log(&log_path, &config_path).await })
        };

        let outcome = match streaming.await {
            Ok(Ok(exit_code)) => RunOutcome::exited(exit_code),
            Ok(Err(err)) => self.record_failure(&run_id, &log_path, err.to_string()).await,
            Err(join_err) => {
                let message = format!("run task aborted: {join_err}");
                self.record_failure(&run_id, &log_path, message).await
            }
        };

        let status = outcome.status;
        let exit_code = outcome.exit_code;
        self.finalize(&run_id, started_at, outcome);

        if let Err(err) = lease.release() {
            error!(
                run_id = %run_id,
                error = %err,
                "Failed to release run lease; future runs stay blocked until it is removed"
            );
        }

        info!(run_id = %run_id, ?status, ?exit_code, "Run finished");
    }

    async fn stream_to_log(&self, log_path: &Path, config_path: &Path) -> Result<i64, RunError> {
        let settings = &self.inner.settings;
        let argv = build_command(&settings.run_cmd, config_path)?;

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;

        let exit_code = self
            .inner
            .executor
            .exec_streaming(&settings.container_name, &argv, &mut log)
            .await?;
        Ok(exit_code)
    }

    async fn record_failure(&self, run_id: &str, log_path: &Path, message: String) -> RunOutcome {
        error!(run_id = %run_id, error = %message, "Run failed before the tool reported an exit code");
        if let Err(err) = append_failure_note(log_path, &message).await {
            warn!(
                run_id = %run_id,
                log_path = %log_path.display(),
                error = %err,
                "Failed to append failure note to run log"
            );
        }
        RunOutcome::failed(message)
    }

    fn finalize(&self, run_id: &str, started_at: i64, outcome: RunOutcome) {
        let finished_at = Utc::now().timestamp();
        let completion = RunCompletion {
            finished_at,
            status: outcome.status,
            duration_sec: (finished_at - started_at).max(0),
            exit_code: outcome.exit_code,
            error: outcome.error,
        };

        if let Err(err) = self.inner.store.update(run_id, &completion) {
            error!(run_id = %run_id, error = ?err, "Failed to persist terminal run state");
        }
    }

    pub fn get_status(&self, run_id: &str) -> Result<RunRecord, RunError> {
        self.inner
            .store
            .get(run_id)?
            .ok_or_else(|| RunError::NotFound(format!("Run not found: {run_id}")))
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, RunError> {
        Ok(self.inner.store.list()?)
    }

    pub fn get_logs(&self, run_id: &str, tail: i64) -> Result<LogTail, RunError> {
        let path = self.run_log_location(run_id)?;
        log_reader::extract_tail(&path, tail).map_err(|err| not_found_or_io(err, "Log file not found"))
    }

    /// Path of an existing log file for `run_id`.
    pub fn download_log(&self, run_id: &str) -> Result<PathBuf, RunError> {
        let path = self.run_log_location(run_id)?;
        if !path.is_file() {
            return Err(RunError::NotFound("Log file not found".to_string()));
        }
        Ok(path)
    }

    pub fn latest_log(&self, tail: i64) -> Result<LatestLog, RunError> {
        let path = self.latest_log_path()?;
        let tail = log_reader::extract_tail(&path, tail)
            .map_err(|err| not_found_or_io(err, "No logs found"))?;
        Ok(LatestLog {
            file: file_name_of(&path),
            tail,
        })
    }

    pub fn latest_log_path(&self) -> Result<PathBuf, RunError> {
        log_reader::find_latest(&self.inner.settings.log_dir)
            .ok_or_else(|| RunError::NotFound("No logs found".to_string()))
    }

    fn run_log_location(&self, run_id: &str) -> Result<PathBuf, RunError> {
        let run = self.get_status(run_id)?;
        let log_file = run
            .log_file
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| RunError::NotFound("Log file not available".to_string()))?;
        Ok(self.inner.settings.log_dir.join(log_file))
    }

    /// Fails runs left RUNNING by a previous process and clears its lease.
    ///
    /// Background tasks never outlive the process, so nothing can still finish
    /// those runs.
    pub fn reconcile_on_startup(&self) -> Result<usize, RunError> {
        let lease_path = &self.inner.settings.lease_path;
        let stale_owner = lease::owner(lease_path);

        let now = Utc::now().timestamp();
        let reconciled = self.inner.store.mark_interrupted(now, INTERRUPTED_REASON)?;

        if lease::exists(lease_path) {
            lease::release(lease_path)?;
            warn!(
                lease_path = %lease_path.display(),
                stale_owner = stale_owner.as_deref().unwrap_or("<unknown>"),
                "Removed run lease left by a previous process"
            );
        }

        if reconciled > 0 {
            warn!(reconciled, "Marked interrupted runs as failed");
        }
        Ok(reconciled)
    }
}

/// Log file name for a run started at `started`.
pub fn log_file_name(started: &DateTime<Local>) -> String {
    started.format(LOG_FILE_PATTERN).to_string()
}

async fn append_failure_note(log_path: &Path, message: &str) -> io::Result<()> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    log.write_all(format!("\n{FAILURE_NOTE_PREFIX} {message}\n").as_bytes())
        .await?;
    log.flush().await
}

fn not_found_or_io(err: io::Error, not_found_message: &str) -> RunError {
    if err.kind() == io::ErrorKind::NotFound {
        RunError::NotFound(not_found_message.to_string())
    } else {
        RunError::Io(err)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
