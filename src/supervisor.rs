//! The supervisor owns every service actor and the config store.
//!
//! Reads (snapshots, start, stop) share the registry lock; adding a service
//! takes it exclusively, so nobody ever sees a half-registered entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::classifier::Classifier;
use crate::config::{validate_service, Config, ConfigStore, ServiceConfig, Settings};
use crate::counters::ActivityCounters;
use crate::error::SupervisorError;
use crate::poller;
use crate::service::{ServiceContext, ServiceHandle, ServiceSnapshot};
use crate::state::ServiceState;
use crate::sync::{GithubResolver, RepoSync};

const DEFAULT_PACKAGES_DIR: &str = "packages";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 4_000;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_SETTLE_MS: u64 = 1_500;
const DEFAULT_MAX_LINES: usize = 500;

/// Runtime settings resolved from the `[settings]` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub packages_dir: PathBuf,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub stop_grace: Duration,
    pub settle: Duration,
    pub max_lines: usize,
    pub auto_install: bool,
    /// Per-service output logs are written here when set.
    pub log_dir: Option<PathBuf>,
}

impl SupervisorSettings {
    /// Applies defaults; relative paths resolve against `base_dir`.
    pub fn resolve(settings: &Settings, base_dir: &Path) -> Self {
        let packages_dir = settings
            .packages_dir
            .as_deref()
            .unwrap_or(DEFAULT_PACKAGES_DIR);
        Self {
            packages_dir: base_dir.join(packages_dir),
            poll_interval: Duration::from_millis(
                settings
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
                    .max(1),
            ),
            poll_timeout: Duration::from_millis(
                settings.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
            stop_grace: Duration::from_millis(
                settings.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
            ),
            settle: Duration::from_millis(settings.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
            max_lines: settings.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1),
            auto_install: settings.auto_install.unwrap_or(true),
            log_dir: settings.log_dir.as_deref().map(|dir| base_dir.join(dir)),
        }
    }
}

struct ServiceEntry {
    handle: ServiceHandle,
    task: JoinHandle<()>,
}

/// Owns the services, in config order.
pub struct Supervisor {
    registry: RwLock<Vec<ServiceEntry>>,
    store: Arc<dyn ConfigStore>,
    ctx: Arc<ServiceContext>,
}

impl Supervisor {
    /// Spawns one actor per configured service. Must run inside a tokio runtime.
    pub fn new(
        config: &Config,
        store: Arc<dyn ConfigStore>,
        settings: SupervisorSettings,
        base_dir: &Path,
    ) -> Result<Self> {
        let classifier =
            Classifier::with_rules(&config.hints).context("failed to build hint rules")?;
        let http = poller::build_client(settings.poll_timeout)
            .context("failed to build HTTP client")?;
        let sync = RepoSync::new(
            settings.packages_dir.clone(),
            settings.auto_install,
            Arc::new(GithubResolver::new(base_dir)),
        );
        let ctx = Arc::new(ServiceContext {
            sync: Arc::new(sync),
            classifier: Arc::new(classifier),
            http,
            poll_interval: settings.poll_interval,
            stop_grace: settings.stop_grace,
            settle: settings.settle,
            max_lines: settings.max_lines,
            log_dir: settings.log_dir.clone(),
        });
        let entries = config
            .services
            .iter()
            .cloned()
            .map(|service| spawn_entry(service, &ctx))
            .collect();
        Ok(Self {
            registry: RwLock::new(entries),
            store,
            ctx,
        })
    }

    /// Starts one service. Starting an active service is a no-op.
    ///
    /// The registry stays read-locked until the actor has applied the start,
    /// so `add` cannot slip in between.
    pub async fn start(&self, name: &str) -> Result<ServiceState, SupervisorError> {
        let registry = self.registry.read().await;
        find_handle(&registry, name)?.start().await
    }

    /// Stops one service and waits for it to be Off.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.handle(name).await?.stop().await
    }

    pub async fn restart(&self, name: &str) -> Result<ServiceState, SupervisorError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Starts every Off or Error service concurrently.
    ///
    /// Each service reports on its own; one failing never holds back another.
    pub async fn start_all(&self) -> Vec<(String, Result<ServiceState, SupervisorError>)> {
        let registry = self.registry.read().await;
        let mut set = JoinSet::new();
        let startable = registry
            .iter()
            .filter(|entry| entry.handle.state().can_start())
            .map(|entry| entry.handle.clone());
        for (index, handle) in startable.enumerate() {
            set.spawn(async move {
                let result = handle.start().await;
                (index, handle.name().to_string(), result)
            });
        }
        let results = collect_ordered(set).await;
        drop(registry);
        results
    }

    /// Stops every service concurrently.
    pub async fn stop_all(&self) -> Vec<(String, Result<(), SupervisorError>)> {
        let handles = self.handles().await;
        let mut set = JoinSet::new();
        for (index, handle) in handles.into_iter().enumerate() {
            set.spawn(async move {
                let result = handle.stop().await;
                (index, handle.name().to_string(), result)
            });
        }
        collect_ordered(set).await
    }

    /// Appends a service to the config and starts tracking it (Off).
    ///
    /// Only allowed while every service is Off or Error.
    pub async fn add(&self, service: ServiceConfig) -> Result<(), SupervisorError> {
        validate_service(&service)
            .map_err(|err| SupervisorError::InvalidService(err.to_string()))?;

        let mut registry = self.registry.write().await;
        if registry.iter().any(|entry| entry.handle.name() == service.name) {
            return Err(SupervisorError::DuplicateService(service.name));
        }
        let active: Vec<String> = registry
            .iter()
            .filter(|entry| entry.handle.state().is_active())
            .map(|entry| entry.handle.name().to_string())
            .collect();
        if !active.is_empty() {
            return Err(SupervisorError::ConfigMutationRejected { active });
        }

        self.store.append(&service).map_err(SupervisorError::Store)?;
        info!(service = %service.name, repo = %service.repo, "service added");
        registry.push(spawn_entry(service, &self.ctx));
        Ok(())
    }

    /// Snapshots of every service, in config order.
    pub async fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let registry = self.registry.read().await;
        registry.iter().map(|entry| entry.handle.snapshot()).collect()
    }

    pub async fn counters(&self, name: &str) -> Option<Arc<ActivityCounters>> {
        let registry = self.registry.read().await;
        registry
            .iter()
            .find(|entry| entry.handle.name() == name)
            .map(|entry| Arc::clone(entry.handle.counters()))
    }

    /// Stops every service and ends all service tasks.
    pub async fn shutdown(&self) {
        let entries: Vec<ServiceEntry> = {
            let mut registry = self.registry.write().await;
            registry.drain(..).collect()
        };
        info!(services = entries.len(), "shutting down");
        let mut set = JoinSet::new();
        for entry in entries {
            set.spawn(async move {
                entry.handle.shutdown().await;
                drop(entry.handle);
                if let Err(err) = entry.task.await {
                    warn!(error = %err, "service task ended abnormally");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    async fn handle(&self, name: &str) -> Result<ServiceHandle, SupervisorError> {
        let registry = self.registry.read().await;
        find_handle(&registry, name).cloned()
    }

    async fn handles(&self) -> Vec<ServiceHandle> {
        let registry = self.registry.read().await;
        registry.iter().map(|entry| entry.handle.clone()).collect()
    }
}

fn find_handle<'a>(
    registry: &'a [ServiceEntry],
    name: &str,
) -> Result<&'a ServiceHandle, SupervisorError> {
    registry
        .iter()
        .find(|entry| entry.handle.name() == name)
        .map(|entry| &entry.handle)
        .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
}

fn spawn_entry(service: ServiceConfig, ctx: &Arc<ServiceContext>) -> ServiceEntry {
    let (handle, task) = ServiceHandle::spawn(service, Arc::clone(ctx));
    ServiceEntry { handle, task }
}

async fn collect_ordered<T: 'static>(
    mut set: JoinSet<(usize, String, T)>,
) -> Vec<(String, T)> {
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "service command task failed"),
        }
    }
    results.sort_by_key(|(index, _, _)| *index);
    results
        .into_iter()
        .map(|(_, name, result)| (name, result))
        .collect()
}
