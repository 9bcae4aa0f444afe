//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file,
//! provides functionality to load and parse it, and implements the only
//! mutation the supervisor supports: appending a new service entry.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "devrack.toml";
pub const DEFAULT_BRANCH: &str = "main";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Supervisor-wide settings.
    #[serde(default)]
    pub settings: Settings,
    /// Extra classifier rules, checked before the built-in table.
    #[serde(default, rename = "hint")]
    pub hints: Vec<HintRuleConfig>,
    /// Services in file order.
    #[serde(default, rename = "service", alias = "package")]
    pub services: Vec<ServiceConfig>,
}

/// The `[settings]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Directory holding one checkout per service, relative to the config file.
    pub packages_dir: Option<String>,
    /// Interval between health probes in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Timeout of a single health probe in milliseconds.
    pub poll_timeout_ms: Option<u64>,
    /// Time to wait after SIGTERM before force-killing (ms).
    pub stop_grace_ms: Option<u64>,
    /// How long a process must stay up before it counts as alive (ms).
    pub settle_ms: Option<u64>,
    /// Maximum number of output lines kept per service.
    pub max_lines: Option<usize>,
    /// Whether to run `npm install` for fresh Node checkouts (default: true).
    pub auto_install: Option<bool>,
    /// Directory for the supervisor log and per-service output logs.
    pub log_dir: Option<String>,
}

/// A single configured service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique name, also the checkout directory name.
    pub name: String,
    /// Clone URL, local path or `owner/repo` shorthand.
    pub repo: String,
    /// Branch to clone and pull.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Shell command that starts the service.
    #[serde(default)]
    pub start_command: String,
    /// Health URL; enables polling when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A user-supplied classifier rule (`[[hint]]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HintRuleConfig {
    pub id: String,
    /// Regular expression matched case-insensitively against each log line.
    pub pattern: String,
    pub text: String,
    /// Suggested command template; may use `{port}` and `{command}`.
    pub command: Option<String>,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate_services(&config.services)?;
    Ok(config)
}

/// Rejects duplicate or unusable service names.
pub fn validate_services(services: &[ServiceConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for service in services {
        validate_service(service)?;
        if !seen.insert(service.name.as_str()) {
            bail!("duplicate service name: {}", service.name);
        }
    }
    Ok(())
}

/// Checks a single entry; the name doubles as a directory name.
pub fn validate_service(service: &ServiceConfig) -> Result<()> {
    let name = service.name.trim();
    if name.is_empty() {
        bail!("service name must not be empty");
    }
    if name != service.name
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        bail!("invalid service name {:?}", service.name);
    }
    if service.repo.trim().is_empty() {
        bail!("service {} has no repo", service.name);
    }
    Ok(())
}

/// Persistence seam for the service list.
pub trait ConfigStore: Send + Sync {
    /// Reads the full configuration.
    fn load(&self) -> Result<Config>;
    /// Durably appends one service, leaving existing content untouched.
    fn append(&self, service: &ServiceConfig) -> Result<()>;
}

/// [`ConfigStore`] backed by a TOML file on disk.
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
}

#[derive(Serialize)]
struct ServiceTables<'a> {
    service: Vec<&'a ServiceConfig>,
}

#[derive(Serialize)]
struct PackageTables<'a> {
    package: Vec<&'a ServiceConfig>,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative paths in the config resolve against.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    // Older files use `[[package]]`; keep appending under whichever key is in use
    // so the file never carries both.
    fn render_entry(&self, existing: &str, service: &ServiceConfig) -> Result<String> {
        let uses_package_key = toml::from_str::<toml::Table>(existing)
            .map(|table| table.contains_key("package") && !table.contains_key("service"))
            .unwrap_or(false);
        let rendered = if uses_package_key {
            toml::to_string(&PackageTables {
                package: vec![service],
            })
        } else {
            toml::to_string(&ServiceTables {
                service: vec![service],
            })
        };
        rendered.with_context(|| format!("failed to serialize service {}", service.name))
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<Config> {
        load_config(&self.path)
    }

    fn append(&self, service: &ServiceConfig) -> Result<()> {
        validate_service(service)?;
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file {}", self.path.display()))
            }
        };
        let entry = self.render_entry(&existing, service)?;
        let mut chunk = String::new();
        if !existing.is_empty() {
            if !existing.ends_with('\n') {
                chunk.push('\n');
            }
            chunk.push('\n');
        }
        chunk.push_str(&entry);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open config file {}", self.path.display()))?;
        file.write_all(chunk.as_bytes())
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync config file {}", self.path.display()))?;
        Ok(())
    }
}
