use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "app.db";
const LEASE_FILE_NAME: &str = "run.lock";
const REGISTRY_FILE_NAME: &str = "config_registry.json";
const SERVICE_LOG_DIR_NAME: &str = "service-logs";
const ENV_DATA_DIR: &str = "KOMETA_UI_DATA_DIR";

pub const DEFAULT_TAIL_LINES: i64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub docker: DockerConfig,
    pub runs: RunsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding one log file per run.
    pub log_dir: PathBuf,
    /// Config handed to the tool when the registry has no active entry.
    pub config_file: PathBuf,
    /// Root that registry entries are resolved against.
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    pub allow_socket: bool,
    pub container_name: String,
    /// Command template; `{config}` is replaced with the active config path.
    pub run_cmd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunsConfig {
    pub default_tail: i64,
    /// Fail runs still marked running and remove the lease at startup.
    /// Only safe when no other instance shares the data directory, since a
    /// live run owned by that instance would be failed too.
    pub reconcile_on_startup: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            docker: DockerConfig::default(),
            runs: RunsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6161,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/logs"),
            config_file: PathBuf::from("/config/config.yml"),
            config_dir: PathBuf::from("/config"),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            allow_socket: false,
            container_name: "kometa".to_string(),
            run_cmd: "python kometa.py -c /config/config.yml".to_string(),
        }
    }
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            default_tail: DEFAULT_TAIL_LINES,
            reconcile_on_startup: false,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Refuses a mounted runtime socket unless it was explicitly allowed.
    pub fn validate(&self) -> Result<()> {
        if self.docker.socket_path.exists() && !self.docker.allow_socket {
            bail!(
                "docker socket mounted at {} but docker.allow_socket is not enabled; \
                 set it to true to continue",
                self.docker.socket_path.display()
            );
        }
        if self.docker.container_name.trim().is_empty() {
            bail!("docker.container_name must not be empty");
        }
        Ok(())
    }

    /// Anchors relative paths in `[paths]` at the data directory.
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        let paths = &mut self.paths;
        paths.log_dir = resolve_relative_to(data_dir, &paths.log_dir);
        paths.config_dir = resolve_relative_to(data_dir, &paths.config_dir);
        paths.config_file = resolve_relative_to(data_dir, &paths.config_file);
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. KOMETA_UI_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

pub fn lease_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LEASE_FILE_NAME)
}

pub fn registry_path(data_dir: &Path) -> PathBuf {
    data_dir.join(REGISTRY_FILE_NAME)
}

pub fn service_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SERVICE_LOG_DIR_NAME)
}

/// Creates the data directory and writes a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
