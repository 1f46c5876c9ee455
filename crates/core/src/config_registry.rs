//! Resolution of the tool config that a run should use.
//!
//! The registry is a small JSON document (`config_registry.json` in the data
//! directory) naming the configs known under the config root and which one is
//! active. Editing it belongs to the config-management surface; this module
//! only reads it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Supplies the config path handed to the tool at run start.
pub trait ActiveConfigResolver: Send + Sync {
    fn active_config_path(&self) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRegistry {
    #[serde(default)]
    pub active: Option<String>,
    #[serde(default)]
    pub configs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfigResolver {
    registry_path: PathBuf,
    config_dir: PathBuf,
    default_config: PathBuf,
}

impl RegistryConfigResolver {
    pub fn new(registry_path: PathBuf, config_dir: PathBuf, default_config: PathBuf) -> Self {
        Self {
            registry_path,
            config_dir,
            default_config,
        }
    }

    /// Unreadable or malformed registries count as empty.
    pub fn load(&self) -> ConfigRegistry {
        let raw = match fs::read_to_string(&self.registry_path) {
            Ok(raw) => raw,
            Err(_) => return ConfigRegistry::default(),
        };

        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(
                registry_path = %self.registry_path.display(),
                error = %err,
                "Ignoring malformed config registry"
            );
            ConfigRegistry::default()
        })
    }
}

impl ActiveConfigResolver for RegistryConfigResolver {
    fn active_config_path(&self) -> Result<PathBuf> {
        let registry = self.load();

        let active = registry
            .active
            .iter()
            .chain(registry.configs.iter())
            .find_map(|entry| match normalize_rel_path(entry) {
                Ok(normalized) => Some(normalized),
                Err(err) => {
                    warn!(entry = %entry, error = %err, "Skipping invalid config registry entry");
                    None
                }
            });

        match active {
            Some(rel_path) => Ok(self.config_dir.join(rel_path)),
            None => Ok(self.default_config.clone()),
        }
    }
}

/// Fixed path resolver, handy for the CLI and tests.
#[derive(Debug, Clone)]
pub struct StaticConfigResolver(pub PathBuf);

impl ActiveConfigResolver for StaticConfigResolver {
    fn active_config_path(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Lexically normalizes a path relative to the config root, rejecting empty,
/// absolute, and root-escaping inputs.
pub fn normalize_rel_path(rel_path: &str) -> Result<PathBuf> {
    let trimmed = rel_path.trim();
    if trimmed.is_empty() {
        bail!("path is required");
    }

    let candidate = Path::new(trimmed);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    bail!("path escapes config root: {trimmed}");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path must be relative: {trimmed}");
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        bail!("path does not name a file: {trimmed}");
    }
    Ok(normalized)
}

pub fn save_registry(path: &Path, registry: &ConfigRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create registry directory: {}", parent.display()))?;
    }
    let encoded =
        serde_json::to_string_pretty(registry).context("failed to serialize config registry")?;
    fs::write(path, encoded)
        .with_context(|| format!("failed to write config registry: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(temp: &Path) -> RegistryConfigResolver {
        RegistryConfigResolver::new(
            temp.join("config_registry.json"),
            PathBuf::from("/config"),
            PathBuf::from("/config/config.yml"),
        )
    }

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(
            normalize_rel_path("./libraries/../movies.yml").expect("normalize"),
            PathBuf::from("movies.yml")
        );
        assert_eq!(
            normalize_rel_path(" nested/tv.yml ").expect("normalize"),
            PathBuf::from("nested/tv.yml")
        );
    }

    #[test]
    fn normalize_rejects_unsafe_paths() {
        assert!(normalize_rel_path("").is_err());
        assert!(normalize_rel_path("/etc/passwd").is_err());
        assert!(normalize_rel_path("../outside.yml").is_err());
        assert!(normalize_rel_path("a/../../outside.yml").is_err());
        assert!(normalize_rel_path(".").is_err());
    }

    #[test]
    fn missing_registry_falls_back_to_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = resolver(temp.path()).active_config_path().expect("resolve");
        assert_eq!(path, PathBuf::from("/config/config.yml"));
    }

    #[test]
    fn active_entry_resolves_under_config_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolver = resolver(temp.path());
        save_registry(
            &temp.path().join("config_registry.json"),
            &ConfigRegistry {
                active: Some("prod/config.yml".to_string()),
                configs: vec!["config.yml".to_string(), "prod/config.yml".to_string()],
            },
        )
        .expect("save");

        assert_eq!(
            resolver.active_config_path().expect("resolve"),
            PathBuf::from("/config/prod/config.yml")
        );
    }

    #[test]
    fn invalid_active_entry_falls_back_to_first_valid_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolver = resolver(temp.path());
        save_registry(
            &temp.path().join("config_registry.json"),
            &ConfigRegistry {
                active: Some("../escape.yml".to_string()),
                configs: vec!["/abs.yml".to_string(), "second.yml".to_string()],
            },
        )
        .expect("save");

        assert_eq!(
            resolver.active_config_path().expect("resolve"),
            PathBuf::from("/config/second.yml")
        );
    }

    #[test]
    fn malformed_registry_is_treated_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("config_registry.json"), "{not json").expect("write");

        let resolver = resolver(temp.path());
        assert_eq!(resolver.load(), ConfigRegistry::default());
        assert_eq!(
            resolver.active_config_path().expect("resolve"),
            PathBuf::from("/config/config.yml")
        );
    }
}
