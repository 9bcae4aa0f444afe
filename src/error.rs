//! Error taxonomy for the supervisor core.
//!
//! Everything here is captured at the service level and rendered as a state
//! plus a hint; none of these errors is allowed to take the supervisor down.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to bring a service's source tree into place.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The repo reference is neither a URL, a local path nor `owner/repo`.
    #[error("cannot resolve repository {0:?} (expected a URL, a path or owner/repo)")]
    UnresolvedRepo(String),
    /// `git clone` exited nonzero, timed out or could not be spawned.
    #[error("clone failed: {0}")]
    CloneFailed(String),
    /// The dependency install step failed.
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("failed to prepare packages directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to spawn the start command.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("working directory {0} does not exist")]
    MissingDir(PathBuf),
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by supervisor operations to the presentation layer.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("invalid service: {0}")]
    InvalidService(String),
    #[error("service {0} already exists")]
    DuplicateService(String),
    /// Adding is only allowed while every service is off.
    #[error("cannot add a service while services are active: {}", .active.join(", "))]
    ConfigMutationRejected { active: Vec<String> },
    #[error("service {0} is no longer accepting commands")]
    ServiceGone(String),
    #[error("failed to persist config: {0:#}")]
    Store(anyhow::Error),
}
