//! Repository sync.
//!
//! Makes sure a service's checkout exists under the packages directory before
//! it starts: fresh checkouts are cloned, existing ones are fast-forwarded, and
//! Node projects get their dependencies installed once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::SyncError;
use crate::output::sanitize_text;

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// A repo reference turned into something `git clone` accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepo {
    pub clone_url: String,
    /// Name to use when the user did not pick one.
    pub suggested_name: String,
}

/// Turns the `repo` field of a service into a clone URL.
pub trait RepoResolver: Send + Sync {
    fn resolve(&self, repo: &str) -> Result<ResolvedRepo, SyncError>;
}

/// Resolves `owner/repo` to GitHub; URLs and local paths pass through.
#[derive(Debug, Clone)]
pub struct GithubResolver {
    base_dir: PathBuf,
}

impl GithubResolver {
    /// Relative local paths are taken relative to `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

const URL_PREFIXES: &[&str] = &["https://", "http://", "ssh://", "git@", "file://"];

impl RepoResolver for GithubResolver {
    fn resolve(&self, repo: &str) -> Result<ResolvedRepo, SyncError> {
        let repo = repo.trim();
        if repo.is_empty() {
            return Err(SyncError::UnresolvedRepo(repo.to_string()));
        }
        if URL_PREFIXES.iter().any(|prefix| repo.starts_with(prefix)) {
            return Ok(ResolvedRepo {
                clone_url: repo.to_string(),
                suggested_name: suggested_name(repo),
            });
        }
        if is_local_path(repo) {
            let path = self.base_dir.join(repo);
            return Ok(ResolvedRepo {
                clone_url: path.to_string_lossy().into_owned(),
                suggested_name: suggested_name(repo),
            });
        }
        let shorthand = repo.strip_prefix("github.com/").unwrap_or(repo);
        if is_github_shorthand(shorthand) {
            let shorthand = shorthand.trim_end_matches(".git");
            return Ok(ResolvedRepo {
                clone_url: format!("https://github.com/{}.git", shorthand),
                suggested_name: suggested_name(shorthand),
            });
        }
        Err(SyncError::UnresolvedRepo(repo.to_string()))
    }
}

fn is_local_path(repo: &str) -> bool {
    repo.starts_with('/')
        || repo.starts_with("./")
        || repo.starts_with("../")
        || repo.starts_with('~')
        || Path::new(repo).is_absolute()
}

fn is_github_shorthand(repo: &str) -> bool {
    let mut parts = repo.split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(owner) && valid(name)
}

fn suggested_name(repo: &str) -> String {
    repo.trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(repo)
        .trim_end_matches(".git")
        .to_string()
}

/// Clones, updates and installs service checkouts.
pub struct RepoSync {
    packages_dir: PathBuf,
    auto_install: bool,
    resolver: Arc<dyn RepoResolver>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoSync {
    pub fn new(packages_dir: PathBuf, auto_install: bool, resolver: Arc<dyn RepoResolver>) -> Self {
        Self {
            packages_dir,
            auto_install,
            resolver,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Checkout directory of a service.
    pub fn service_dir(&self, name: &str) -> PathBuf {
        self.packages_dir.join(name)
    }

    /// Brings the checkout of `service` into place and returns its directory.
    ///
    /// Syncs of the same service are serialized. Dropping the future aborts
    /// the running git/npm step.
    pub async fn ensure(&self, service: &ServiceConfig) -> Result<PathBuf, SyncError> {
        let lock = self.lock_for(&service.name);
        let _held = lock.lock().await;

        let dir = self.service_dir(&service.name);
        if dir.exists() {
            self.pull(service, &dir).await;
        } else {
            self.clone_into(service, &dir).await?;
        }
        if self.auto_install {
            install_dependencies(&dir).await?;
        }
        Ok(dir)
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn clone_into(&self, service: &ServiceConfig, dir: &Path) -> Result<(), SyncError> {
        let resolved = self.resolver.resolve(&service.repo)?;
        tokio::fs::create_dir_all(&self.packages_dir)
            .await
            .map_err(|source| SyncError::Io {
                path: self.packages_dir.clone(),
                source,
            })?;

        // Clone next to the target and move it in place once complete, so an
        // aborted clone never looks like a checkout.
        let staging = self.packages_dir.join(format!(".{}.partial", service.name));
        if staging.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }

        info!(service = %service.name, url = %resolved.clone_url, branch = %service.branch, "cloning");
        let mut cmd = git();
        cmd.arg("clone")
            .args(["--depth", "1", "--branch", &service.branch])
            .arg(&resolved.clone_url)
            .arg(&staging);
        if let Err(cause) = run_step(cmd, CLONE_TIMEOUT).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(SyncError::CloneFailed(cause));
        }
        tokio::fs::rename(&staging, dir)
            .await
            .map_err(|source| SyncError::Io {
                path: dir.to_path_buf(),
                source,
            })
    }

    async fn pull(&self, service: &ServiceConfig, dir: &Path) {
        let mut cmd = git();
        cmd.current_dir(dir)
            .args(["pull", "--ff-only", "origin", &service.branch]);
        match run_step(cmd, PULL_TIMEOUT).await {
            Ok(()) => info!(service = %service.name, "checkout updated"),
            Err(cause) => {
                warn!(service = %service.name, %cause, "update failed, using existing checkout")
            }
        }
    }
}

async fn install_dependencies(dir: &Path) -> Result<(), SyncError> {
    if !dir.join("package.json").is_file() || dir.join("node_modules").exists() {
        return Ok(());
    }
    info!(dir = %dir.display(), "installing dependencies");
    let mut cmd = Command::new(if cfg!(windows) { "npm.cmd" } else { "npm" });
    cmd.current_dir(dir).arg("install");
    run_step(cmd, INSTALL_TIMEOUT)
        .await
        .map_err(SyncError::InstallFailed)
}

fn git() -> Command {
    let mut cmd = Command::new("git");
    // Never block on a credential prompt nobody can answer.
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

// Runs one step to completion, returning a printable cause on failure.
async fn run_step(mut cmd: Command, limit: Duration) -> Result<(), String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|err| err.to_string())?;
    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
        Ok(Err(err)) => Err(err.to_string()),
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(failure_cause(&output)),
    }
}

fn failure_cause(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<String> = stderr
        .lines()
        .map(sanitize_text)
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return match output.status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by a signal".to_string(),
        };
    }
    let skip = lines.len().saturating_sub(3);
    lines[skip..].join("\n").trim().to_string()
}
