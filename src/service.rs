//! The per-service actor.
//!
//! Each configured service gets one task that exclusively owns its runtime:
//! the state machine, the process handle, the poll loop and the sync step.
//! Commands and events arrive on channels and are applied in arrival order;
//! every change is published as an immutable [`ServiceSnapshot`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{url_port, Classifier, Hint};
use crate::config::ServiceConfig;
use crate::counters::ActivityCounters;
use crate::error::{SupervisorError, SyncError};
use crate::launcher::{self, ExitReport, ProcessEvent, ProcessHandle};
use crate::output::LogLine;
use crate::poller::{self, PollResult};
use crate::state::{FailureKind, MachineEvent, MachineSettings, ServiceState, StateMachine};
use crate::sync::RepoSync;

const PROCESS_EVENT_BUFFER: usize = 256;
const POLL_RESULT_BUFFER: usize = 8;
// Output lines applied per wakeup before a snapshot goes out.
const OUTPUT_BATCH: usize = 64;

/// Read-only view of one service handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub url: Option<String>,
    pub hint: Option<Hint>,
    /// A URL is configured and the service is answering.
    pub can_open: bool,
    pub exit_code: Option<i32>,
    pub detail: String,
    /// Shared between snapshots until the output changes.
    pub log_tail: Arc<Vec<LogLine>>,
}

impl ServiceSnapshot {
    fn initial(config: &ServiceConfig) -> Self {
        Self {
            name: config.name.clone(),
            state: ServiceState::Off,
            url: config.url.clone(),
            hint: None,
            can_open: false,
            exit_code: None,
            detail: String::new(),
            log_tail: Arc::default(),
        }
    }

    // Field-wise equality that compares the tail by identity.
    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.log_tail, &other.log_tail)
            && self.state == other.state
            && self.hint == other.hint
            && self.can_open == other.can_open
            && self.exit_code == other.exit_code
            && self.detail == other.detail
            && self.url == other.url
            && self.name == other.name
    }
}

/// Everything a service actor shares with its siblings.
pub struct ServiceContext {
    pub sync: Arc<RepoSync>,
    pub classifier: Arc<Classifier>,
    pub http: reqwest::Client,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub settle: Duration,
    pub max_lines: usize,
    /// Where per-service output logs go, if anywhere.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug)]
enum ServiceCommand {
    Start(oneshot::Sender<ServiceState>),
    Stop(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a service actor.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    name: String,
    cmd_tx: mpsc::Sender<ServiceCommand>,
    snapshot_rx: watch::Receiver<ServiceSnapshot>,
    counters: Arc<ActivityCounters>,
}

impl ServiceHandle {
    /// Spawns the actor for `config`. The service starts Off.
    ///
    /// The returned task ends after [`ServiceHandle::shutdown`] or once every
    /// handle is dropped.
    pub fn spawn(config: ServiceConfig, ctx: Arc<ServiceContext>) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let initial = ServiceSnapshot::initial(&config);
        let tail_snapshot = Arc::clone(&initial.log_tail);
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let counters = ActivityCounters::new();
        let machine = StateMachine::new(
            MachineSettings {
                has_url: config.url.is_some(),
                url_port: config.url.as_deref().and_then(url_port),
                command: config.start_command.clone(),
                stale_after: ctx.poll_interval * 2,
                max_lines: ctx.max_lines,
            },
            Arc::clone(&ctx.classifier),
        );
        let actor = ServiceActor {
            config: config.clone(),
            ctx,
            machine,
            counters: Arc::clone(&counters),
            snapshot_tx,
            published: ServiceState::Off,
            tail_revision: 0,
            tail_snapshot,
            sync_task: None,
            process: None,
            process_rx: None,
            poll: None,
            poll_rx: None,
            settle_at: None,
            stale_check_at: None,
            pending_stops: Vec::new(),
            shutdown_reply: None,
            shutting_down: false,
            output_log: None,
        };
        let task = tokio::spawn(actor.run(cmd_rx));
        let handle = Self {
            name: config.name.clone(),
            cmd_tx,
            snapshot_rx,
            counters,
        };
        (handle, task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests a start. Returns the state once the request was applied;
    /// the start itself continues in the background.
    pub async fn start(&self) -> Result<ServiceState, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::Start(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Stops the service and waits until it is Off.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::Stop(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn state(&self) -> ServiceState {
        self.snapshot_rx.borrow().state
    }

    pub fn counters(&self) -> &Arc<ActivityCounters> {
        &self.counters
    }

    /// Stops the service and ends the actor. Later commands fail with
    /// [`SupervisorError::ServiceGone`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ServiceCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: ServiceCommand) -> Result<(), SupervisorError> {
        self.cmd_tx.send(cmd).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> SupervisorError {
        SupervisorError::ServiceGone(self.name.clone())
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ServiceActor {
    config: ServiceConfig,
    ctx: Arc<ServiceContext>,
    machine: StateMachine,
    counters: Arc<ActivityCounters>,
    snapshot_tx: watch::Sender<ServiceSnapshot>,
    published: ServiceState,
    tail_revision: u64,
    tail_snapshot: Arc<Vec<LogLine>>,
    sync_task: Option<JoinHandle<Result<PathBuf, SyncError>>>,
    process: Option<ProcessHandle>,
    process_rx: Option<mpsc::Receiver<ProcessEvent>>,
    poll: Option<PollTask>,
    poll_rx: Option<mpsc::Receiver<PollResult>>,
    settle_at: Option<Instant>,
    stale_check_at: Option<Instant>,
    pending_stops: Vec<oneshot::Sender<()>>,
    shutdown_reply: Option<oneshot::Sender<()>>,
    shutting_down: bool,
    output_log: Option<File>,
}

impl ServiceActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ServiceCommand>) {
        debug!(service = %self.config.name, "service task started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if !self.shutting_down => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => self.begin_shutdown(None).await,
                },
                synced = join_opt(&mut self.sync_task) => {
                    self.sync_task = None;
                    self.on_synced(synced);
                }
                event = recv_opt(&mut self.process_rx) => match event {
                    Some(event) => self.on_process_event(event).await,
                    None => self.process_rx = None,
                },
                result = recv_opt(&mut self.poll_rx) => match result {
                    Some(result) => self.apply(MachineEvent::Polled(result)),
                    None => self.poll_rx = None,
                },
                _ = sleep_opt(self.settle_at) => {
                    self.settle_at = None;
                    self.apply(MachineEvent::AliveConfirmed);
                }
                _ = sleep_opt(self.stale_check_at) => {
                    self.stale_check_at = None;
                    self.machine.refresh(Instant::now());
                }
            }
            self.publish();
            if self.shutting_down && self.is_quiet() {
                break;
            }
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        debug!(service = %self.config.name, "service task finished");
    }

    async fn on_command(&mut self, cmd: ServiceCommand) {
        match cmd {
            ServiceCommand::Start(reply) => {
                self.start();
                // Published before the reply; add reads the published state.
                self.publish();
                let _ = reply.send(self.machine.state());
            }
            ServiceCommand::Stop(reply) => self.stop(reply).await,
            ServiceCommand::Shutdown(reply) => self.begin_shutdown(Some(reply)).await,
        }
    }

    fn start(&mut self) {
        if !self.machine.state().can_start() || self.process.is_some() {
            debug!(service = %self.config.name, state = %self.machine.state(), "start ignored");
            return;
        }
        info!(service = %self.config.name, "starting");
        self.apply(MachineEvent::StartRequested);
        let sync = Arc::clone(&self.ctx.sync);
        let config = self.config.clone();
        self.sync_task = Some(tokio::spawn(async move { sync.ensure(&config).await }));
    }

    fn on_synced(&mut self, synced: Result<Result<PathBuf, SyncError>, tokio::task::JoinError>) {
        let dir = match synced {
            Ok(Ok(dir)) => dir,
            Ok(Err(err)) => {
                warn!(service = %self.config.name, error = %err, "sync failed");
                self.apply(MachineEvent::Failed {
                    kind: FailureKind::Sync,
                    cause: err.to_string(),
                });
                return;
            }
            Err(err) => {
                warn!(service = %self.config.name, error = %err, "sync task failed");
                self.apply(MachineEvent::Failed {
                    kind: FailureKind::Sync,
                    cause: err.to_string(),
                });
                return;
            }
        };

        let (tx, rx) = mpsc::channel(PROCESS_EVENT_BUFFER);
        match launcher::start(&dir, &self.config.start_command, tx, &self.counters) {
            Ok(handle) => {
                info!(service = %self.config.name, pid = ?handle.pid(), "launched");
                self.process = Some(handle);
                self.process_rx = Some(rx);
                self.settle_at = Some(Instant::now() + self.ctx.settle);
                self.apply(MachineEvent::Spawned);
                self.start_polling();
            }
            Err(err) => {
                warn!(service = %self.config.name, error = %err, "launch failed");
                self.apply(MachineEvent::Failed {
                    kind: FailureKind::Launch,
                    cause: err.to_string(),
                });
            }
        }
    }

    async fn on_process_event(&mut self, event: ProcessEvent) {
        let line = match event {
            ProcessEvent::Output(line) => line,
            ProcessEvent::Exited(report) => return self.on_exited(report).await,
        };
        self.on_output(line).await;
        // Drain what is already queued so a chatty process does not trigger
        // one snapshot per line.
        for _ in 0..OUTPUT_BATCH {
            let next = match self.process_rx.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(next)) => next,
                _ => return,
            };
            match next {
                ProcessEvent::Output(line) => self.on_output(line).await,
                ProcessEvent::Exited(report) => return self.on_exited(report).await,
            }
        }
    }

    async fn on_exited(&mut self, report: ExitReport) {
        self.process = None;
        self.process_rx = None;
        self.settle_at = None;
        self.stop_polling().await;
        if let Some(mut file) = self.output_log.take() {
            let _ = file.flush().await;
        }
        if report.requested {
            info!(service = %self.config.name, code = ?report.code, "stopped");
        } else {
            warn!(service = %self.config.name, code = ?report.code, "exited unexpectedly");
        }
        self.apply(MachineEvent::Exited(report));
        if !self.pending_stops.is_empty() {
            self.apply(MachineEvent::Stopped);
            self.publish();
            for reply in self.pending_stops.drain(..) {
                let _ = reply.send(());
            }
        }
    }

    async fn on_output(&mut self, line: LogLine) {
        if let Some(file) = self.output_log.as_mut() {
            let mut text = line.text.clone();
            text.push('\n');
            if let Err(err) = file.write_all(text.as_bytes()).await {
                warn!(service = %self.config.name, error = %err, "output log disabled");
                self.output_log = None;
            }
        }
        self.apply(MachineEvent::Output(line));
    }

    async fn stop(&mut self, reply: oneshot::Sender<()>) {
        if let Some(task) = self.sync_task.take() {
            info!(service = %self.config.name, "start aborted");
            task.abort();
        }
        match self.process.as_mut() {
            Some(process) => {
                process.request_stop(self.ctx.stop_grace);
                self.settle_at = None;
                self.stop_polling().await;
                self.pending_stops.push(reply);
            }
            None => {
                self.apply(MachineEvent::Stopped);
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    async fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.shutting_down = true;
        self.shutdown_reply = reply;
        let (tx, _rx) = oneshot::channel();
        self.stop(tx).await;
    }

    fn is_quiet(&self) -> bool {
        self.process.is_none() && self.sync_task.is_none()
    }

    fn start_polling(&mut self) {
        let Some(url) = self.config.url.clone() else {
            return;
        };
        let (tx, rx) = mpsc::channel(POLL_RESULT_BUFFER);
        let cancel = CancellationToken::new();
        let handle = poller::spawn_poll_loop(
            self.ctx.http.clone(),
            url,
            self.ctx.poll_interval,
            tx,
            cancel.clone(),
            &self.counters,
        );
        self.poll = Some(PollTask { cancel, handle });
        self.poll_rx = Some(rx);
    }

    async fn stop_polling(&mut self) {
        self.poll_rx = None;
        self.stale_check_at = None;
        if let Some(poll) = self.poll.take() {
            poll.cancel.cancel();
            if let Err(err) = poll.handle.await {
                warn!(service = %self.config.name, error = %err, "poll task ended abnormally");
            }
        }
    }

    fn apply(&mut self, event: MachineEvent) {
        let starting = matches!(event, MachineEvent::StartRequested);
        self.machine.apply(event, Instant::now());
        self.stale_check_at = self
            .machine
            .poll_expires_at()
            .map(|at| at + Duration::from_millis(1));
        if starting {
            self.output_log = self.open_output_log();
        }
    }

    fn open_output_log(&self) -> Option<File> {
        let dir = self.ctx.log_dir.as_ref()?;
        let path = dir.join(format!("{}.log", self.config.name));
        let file = std::fs::create_dir_all(dir).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
        });
        match file {
            Ok(file) => Some(File::from_std(file)),
            Err(err) => {
                warn!(service = %self.config.name, path = %path.display(), error = %err, "cannot open output log");
                None
            }
        }
    }

    fn publish(&mut self) {
        let state = self.machine.state();
        if state != self.published {
            info!(service = %self.config.name, from = %self.published, to = %state, "state changed");
            self.published = state;
        }
        let tail = self.machine.tail();
        if tail.revision() != self.tail_revision {
            self.tail_revision = tail.revision();
            self.tail_snapshot = Arc::new(tail.iter().cloned().collect());
        }
        let snapshot = ServiceSnapshot {
            name: self.config.name.clone(),
            state,
            url: self.config.url.clone(),
            hint: self.machine.hint().cloned(),
            can_open: self.config.url.is_some()
                && matches!(state, ServiceState::Running | ServiceState::Errors),
            exit_code: self.machine.exit_code(),
            detail: self.machine.detail(),
            log_tail: Arc::clone(&self.tail_snapshot),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if current.same_as(&snapshot) {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_opt<T>(
    task: &mut Option<JoinHandle<T>>,
) -> Result<T, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
