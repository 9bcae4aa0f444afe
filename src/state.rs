//! Service lifecycle state.
//!
//! [`StateMachine`] folds process, poll and output events into one of five
//! observable [`ServiceState`]s. The state is never stored on its own: it is
//! derived from the recorded facts every time it is read, so replaying the
//! same events always lands on the same state.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::classifier::{ClassifyContext, Classifier, Hint};
use crate::launcher::ExitReport;
use crate::output::{LogLine, LogTail};
use crate::poller::{PollResult, PollVerdict, Unreachable};

/// The observable state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceState {
    /// Not running and nothing pending.
    Off,
    /// Preparing source, launching, or waiting for the service to answer.
    Starting,
    /// Alive and healthy.
    Running,
    /// Alive but answering with server errors or timing out.
    Errors,
    /// Exited on its own, or could not be prepared or launched.
    Error,
}

impl ServiceState {
    pub fn label(self) -> &'static str {
        match self {
            ServiceState::Off => "off",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Errors => "errors",
            ServiceState::Error => "error",
        }
    }

    /// Whether the service holds (or is about to hold) a live process.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::Errors
        )
    }

    pub fn can_start(self) -> bool {
        matches!(self, ServiceState::Off | ServiceState::Error)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where the service's process is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessPhase {
    /// No process and no start pending.
    Idle,
    /// Start accepted; source sync or spawn in progress.
    Preparing,
    /// The process is live. `confirmed` once it survived the settle window.
    Alive { confirmed: bool },
    /// The process is gone.
    Exited(ExitReport),
    /// Sync or launch failed before a process existed.
    Failed,
}

/// Which step of a start failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Sync,
    Launch,
}

/// Inputs to the state machine, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    StartRequested,
    Spawned,
    AliveConfirmed,
    Output(LogLine),
    Exited(ExitReport),
    Failed { kind: FailureKind, cause: String },
    Polled(PollResult),
    Stopped,
}

/// Static facts about the service the machine needs to interpret events.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Whether a health URL is configured.
    pub has_url: bool,
    /// Port of the health URL, for templates and the port-mismatch hint.
    pub url_port: Option<u16>,
    /// The start command, for templates.
    pub command: String,
    /// Poll results older than this count as absent.
    pub stale_after: Duration,
    pub max_lines: usize,
}

/// Per-service state machine.
#[derive(Debug, Clone)]
pub struct StateMachine {
    settings: MachineSettings,
    classifier: Arc<Classifier>,
    phase: ProcessPhase,
    tail: LogTail,
    last_hint: Option<Hint>,
    last_poll: Option<PollResult>,
    failure: Option<String>,
    last_exit: Option<ExitReport>,
    state: ServiceState,
}

impl StateMachine {
    pub fn new(settings: MachineSettings, classifier: Arc<Classifier>) -> Self {
        let tail = LogTail::new(settings.max_lines);
        Self {
            settings,
            classifier,
            phase: ProcessPhase::Idle,
            tail,
            last_hint: None,
            last_poll: None,
            failure: None,
            last_exit: None,
            state: ServiceState::Off,
        }
    }

    /// Applies one event and returns the resulting state.
    pub fn apply(&mut self, event: MachineEvent, now: Instant) -> ServiceState {
        match event {
            MachineEvent::StartRequested => {
                if self.state.can_start() {
                    self.phase = ProcessPhase::Preparing;
                    self.tail.clear();
                    self.last_hint = None;
                    self.last_poll = None;
                    self.failure = None;
                    self.last_exit = None;
                }
            }
            MachineEvent::Spawned => {
                if self.phase == ProcessPhase::Preparing {
                    self.phase = ProcessPhase::Alive { confirmed: false };
                }
            }
            MachineEvent::AliveConfirmed => {
                if let ProcessPhase::Alive { confirmed } = &mut self.phase {
                    *confirmed = true;
                }
            }
            MachineEvent::Output(line) => {
                self.tail.push(line);
            }
            MachineEvent::Exited(report) => {
                if matches!(self.phase, ProcessPhase::Alive { .. }) {
                    self.phase = ProcessPhase::Exited(report);
                    self.last_exit = Some(report);
                    self.last_poll = None;
                    self.last_hint = if report.requested {
                        None
                    } else {
                        self.classifier.classify(&self.tail, self.context())
                    };
                }
            }
            MachineEvent::Failed { kind, cause } => {
                if self.phase == ProcessPhase::Preparing {
                    self.phase = ProcessPhase::Failed;
                    self.last_hint = Some(self.failure_hint(kind, &cause));
                    self.failure = Some(cause);
                }
            }
            MachineEvent::Polled(result) => {
                if matches!(self.phase, ProcessPhase::Alive { .. }) {
                    self.last_hint = self.poll_hint(&result.verdict);
                    self.last_poll = Some(result);
                }
            }
            MachineEvent::Stopped => {
                self.phase = ProcessPhase::Idle;
                self.last_poll = None;
                self.last_hint = None;
                self.failure = None;
            }
        }
        self.refresh(now)
    }

    /// Re-derives the state at `now`; poll results can go stale without any
    /// new event arriving.
    pub fn refresh(&mut self, now: Instant) -> ServiceState {
        self.state = derive_state(
            &self.phase,
            self.settings.has_url,
            self.fresh_poll(now),
        );
        self.state
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    #[cfg(test)]
    pub fn phase(&self) -> &ProcessPhase {
        &self.phase
    }

    pub fn hint(&self) -> Option<&Hint> {
        self.last_hint.as_ref()
    }

    pub fn tail(&self) -> &LogTail {
        &self.tail
    }

    pub fn last_poll(&self) -> Option<&PollResult> {
        self.last_poll.as_ref()
    }

    /// When the current poll result stops counting.
    pub fn poll_expires_at(&self) -> Option<Instant> {
        self.last_poll
            .as_ref()
            .map(|poll| poll.at + self.settings.stale_after)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.last_exit.and_then(|report| report.code)
    }

    /// One-line description of what the service is doing.
    pub fn detail(&self) -> String {
        match &self.phase {
            ProcessPhase::Idle => match self.last_exit {
                Some(_) => "stopped".to_string(),
                None => String::new(),
            },
            ProcessPhase::Preparing => "preparing source".to_string(),
            ProcessPhase::Alive { confirmed } => match &self.last_poll {
                Some(poll) => poll.verdict.to_string(),
                None if self.settings.has_url => "waiting for first health check".to_string(),
                None if *confirmed => "alive".to_string(),
                None => "launched".to_string(),
            },
            ProcessPhase::Exited(report) => match (report.requested, report.code) {
                (true, _) => "stopped".to_string(),
                (false, Some(code)) => format!("exited with code {}", code),
                (false, None) => "terminated by a signal".to_string(),
            },
            ProcessPhase::Failed => self.failure.clone().unwrap_or_default(),
        }
    }

    fn fresh_poll(&self, now: Instant) -> Option<&PollVerdict> {
        self.last_poll
            .as_ref()
            .filter(|poll| poll.is_fresh(now, self.settings.stale_after))
            .map(|poll| &poll.verdict)
    }

    fn context(&self) -> ClassifyContext<'_> {
        ClassifyContext {
            port: self.settings.url_port,
            command: &self.settings.command,
        }
    }

    fn poll_hint(&self, verdict: &PollVerdict) -> Option<Hint> {
        if let Some(hint) = self.classifier.classify(&self.tail, self.context()) {
            return Some(hint);
        }
        if let (PollVerdict::Unreachable { .. }, Some(port)) = (verdict, self.settings.url_port) {
            if let Some(hint) = self.classifier.port_mismatch(&self.tail, port) {
                return Some(hint);
            }
        }
        // Verdicts that make the service Errors always carry some hint.
        let errors = matches!(
            verdict,
            PollVerdict::Unhealthy { .. }
                | PollVerdict::Unreachable {
                    cause: Unreachable::TimedOut
                }
        );
        errors.then(|| {
            Hint::new(
                "responding-with-errors",
                "The service is responding with errors. Check the log for details.",
            )
        })
    }

    fn failure_hint(&self, kind: FailureKind, cause: &str) -> Hint {
        if let Some(hint) = self.classifier.classify_text(cause, self.context()) {
            return hint;
        }
        match kind {
            FailureKind::Sync => Hint::new(
                "sync-failed",
                format!("Could not fetch the source: {}", cause),
            ),
            FailureKind::Launch => {
                Hint::new("launch-failed", format!("Could not launch: {}", cause))
            }
        }
    }
}

/// Computes the state from the recorded facts.
pub fn derive_state(
    phase: &ProcessPhase,
    has_url: bool,
    fresh_poll: Option<&PollVerdict>,
) -> ServiceState {
    match phase {
        ProcessPhase::Idle => ServiceState::Off,
        ProcessPhase::Preparing => ServiceState::Starting,
        ProcessPhase::Failed => ServiceState::Error,
        ProcessPhase::Exited(report) if report.requested => ServiceState::Off,
        ProcessPhase::Exited(_) => ServiceState::Error,
        ProcessPhase::Alive { confirmed } if !has_url => {
            if *confirmed {
                ServiceState::Running
            } else {
                ServiceState::Starting
            }
        }
        ProcessPhase::Alive { .. } => match fresh_poll {
            None => ServiceState::Starting,
            Some(PollVerdict::Healthy { .. }) => ServiceState::Running,
            Some(PollVerdict::Unhealthy { .. }) => ServiceState::Errors,
            Some(PollVerdict::Unreachable {
                cause: Unreachable::TimedOut,
            }) => ServiceState::Errors,
            Some(PollVerdict::Unreachable { .. }) => ServiceState::Starting,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StreamKind;

    fn machine(has_url: bool) -> StateMachine {
        StateMachine::new(
            MachineSettings {
                has_url,
                url_port: has_url.then_some(3000),
                command: "npm run dev".into(),
                stale_after: Duration::from_secs(10),
                max_lines: 50,
            },
            Arc::new(Classifier::builtin()),
        )
    }

    fn out(text: &str) -> MachineEvent {
        MachineEvent::Output(LogLine {
            text: text.into(),
            stream: StreamKind::Stderr,
        })
    }

    fn poll(verdict: PollVerdict, at: Instant) -> MachineEvent {
        MachineEvent::Polled(PollResult { at, verdict })
    }

    fn exited(code: i32, requested: bool) -> MachineEvent {
        MachineEvent::Exited(ExitReport {
            code: Some(code),
            requested,
        })
    }

    #[test]
    fn no_url_lifecycle_follows_liveness() {
        let now = Instant::now();
        let mut m = machine(false);
        assert_eq!(m.state(), ServiceState::Off);
        assert_eq!(m.apply(MachineEvent::StartRequested, now), ServiceState::Starting);
        assert_eq!(m.apply(MachineEvent::Spawned, now), ServiceState::Starting);
        assert_eq!(m.apply(MachineEvent::AliveConfirmed, now), ServiceState::Running);
        assert_eq!(m.apply(exited(0, true), now), ServiceState::Off);
        assert_eq!(m.apply(MachineEvent::Stopped, now), ServiceState::Off);
    }

    #[test]
    fn unrequested_exit_is_an_error_even_with_code_zero() {
        let now = Instant::now();
        let mut m = machine(false);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        assert_eq!(m.apply(exited(0, false), now), ServiceState::Error);
        assert!(m.hint().is_none());
        assert_eq!(m.exit_code(), Some(0));
        assert_eq!(m.detail(), "exited with code 0");
    }

    #[test]
    fn crash_is_classified_from_the_tail() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("Error: listen EADDRINUSE: address already in use :::3000"), now);
        assert_eq!(m.apply(exited(1, false), now), ServiceState::Error);
        let hint = m.hint().unwrap();
        assert_eq!(hint.id, "port-in-use");
        assert_eq!(hint.command.as_deref(), Some("lsof -ti tcp:3000 | xargs kill"));
    }

    #[test]
    fn poll_verdicts_drive_the_state() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        assert_eq!(m.apply(MachineEvent::Spawned, now), ServiceState::Starting);
        // Settle confirmation alone does not make a URL service running.
        assert_eq!(m.apply(MachineEvent::AliveConfirmed, now), ServiceState::Starting);

        let refused = PollVerdict::Unreachable {
            cause: Unreachable::Refused,
        };
        assert_eq!(m.apply(poll(refused, now), now), ServiceState::Starting);
        assert_eq!(
            m.apply(poll(PollVerdict::Healthy { status: 200 }, now), now),
            ServiceState::Running
        );
        assert_eq!(
            m.apply(poll(PollVerdict::Unhealthy { status: 503 }, now), now),
            ServiceState::Errors
        );
        let timed_out = PollVerdict::Unreachable {
            cause: Unreachable::TimedOut,
        };
        assert_eq!(m.apply(poll(timed_out, now), now), ServiceState::Errors);
        let not_found = PollVerdict::Unreachable {
            cause: Unreachable::Status(404),
        };
        assert_eq!(m.apply(poll(not_found, now), now), ServiceState::Starting);
    }

    #[test]
    fn erroring_service_gets_a_generic_hint_when_no_rule_matches() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("GET / 500"), now);

        m.apply(poll(PollVerdict::Unhealthy { status: 500 }, now), now);
        assert_eq!(m.state(), ServiceState::Errors);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("responding-with-errors"));

        let timed_out = PollVerdict::Unreachable {
            cause: Unreachable::TimedOut,
        };
        m.apply(poll(timed_out, now), now);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("responding-with-errors"));

        m.apply(poll(PollVerdict::Healthy { status: 200 }, now), now);
        assert_eq!(m.state(), ServiceState::Running);
        assert!(m.hint().is_none());

        // A matching rule wins over the generic text.
        m.apply(out("Error: Cannot find module 'express'"), now);
        m.apply(poll(PollVerdict::Unhealthy { status: 503 }, now), now);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("module-missing"));
    }

    #[test]
    fn polls_are_ignored_unless_alive() {
        let now = Instant::now();
        let mut m = machine(true);
        let healthy = poll(PollVerdict::Healthy { status: 200 }, now);
        assert_eq!(m.apply(healthy.clone(), now), ServiceState::Off);
        m.apply(MachineEvent::StartRequested, now);
        assert_eq!(m.apply(healthy, now), ServiceState::Starting);
        assert!(m.last_poll().is_none());
    }

    #[test]
    fn stale_polls_count_as_absent() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(poll(PollVerdict::Healthy { status: 200 }, now), now);
        assert_eq!(m.refresh(now + Duration::from_secs(10)), ServiceState::Running);
        assert_eq!(m.refresh(now + Duration::from_secs(11)), ServiceState::Starting);
        assert_eq!(m.poll_expires_at(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn healthy_poll_still_surfaces_log_hint() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("Error: listen EADDRINUSE :::3000"), now);
        let state = m.apply(poll(PollVerdict::Healthy { status: 200 }, now), now);
        assert_eq!(state, ServiceState::Running);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("port-in-use"));
    }

    #[test]
    fn unreachable_poll_reports_port_mismatch() {
        let now = Instant::now();
        let mut m = machine(true);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("ready - started server on http://localhost:5173"), now);
        let refused = PollVerdict::Unreachable {
            cause: Unreachable::Refused,
        };
        m.apply(poll(refused, now), now);
        let hint = m.hint().unwrap();
        assert_eq!(hint.id, "port-mismatch");
        assert!(hint.text.contains(":5173"));
        assert!(hint.text.contains(":3000"));
    }

    #[test]
    fn failures_produce_hints() {
        let now = Instant::now();
        let mut m = machine(false);
        m.apply(MachineEvent::StartRequested, now);
        let state = m.apply(
            MachineEvent::Failed {
                kind: FailureKind::Sync,
                cause: "fatal: repository not found".into(),
            },
            now,
        );
        assert_eq!(state, ServiceState::Error);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("sync-failed"));
        assert_eq!(m.detail(), "fatal: repository not found");

        m.apply(MachineEvent::StartRequested, now);
        m.apply(
            MachineEvent::Failed {
                kind: FailureKind::Launch,
                cause: "sh: 1: vite: command not found".into(),
            },
            now,
        );
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("command-not-found"));
    }

    #[test]
    fn stop_on_off_service_is_a_no_op() {
        let now = Instant::now();
        let mut m = machine(true);
        assert_eq!(m.apply(MachineEvent::Stopped, now), ServiceState::Off);
        assert_eq!(m.apply(MachineEvent::Stopped, now), ServiceState::Off);
        assert_eq!(m.phase(), &ProcessPhase::Idle);
    }

    #[test]
    fn stop_during_preparation_returns_to_off() {
        let now = Instant::now();
        let mut m = machine(false);
        m.apply(MachineEvent::StartRequested, now);
        assert_eq!(m.apply(MachineEvent::Stopped, now), ServiceState::Off);
        // A late failure from the aborted sync is dropped.
        let state = m.apply(
            MachineEvent::Failed {
                kind: FailureKind::Sync,
                cause: "aborted".into(),
            },
            now,
        );
        assert_eq!(state, ServiceState::Off);
    }

    #[test]
    fn restart_clears_previous_run() {
        let now = Instant::now();
        let mut m = machine(false);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("Cannot find module 'express'"), now);
        m.apply(exited(1, false), now);
        assert_eq!(m.hint().map(|h| h.id.as_str()), Some("module-missing"));

        assert_eq!(m.apply(MachineEvent::StartRequested, now), ServiceState::Starting);
        assert!(m.hint().is_none());
        assert!(m.tail().is_empty());
        assert_eq!(m.exit_code(), None);
    }

    #[test]
    fn start_is_ignored_while_active() {
        let now = Instant::now();
        let mut m = machine(false);
        m.apply(MachineEvent::StartRequested, now);
        m.apply(MachineEvent::Spawned, now);
        m.apply(out("line"), now);
        m.apply(MachineEvent::StartRequested, now);
        assert_eq!(m.phase(), &ProcessPhase::Alive { confirmed: false });
        assert_eq!(m.tail().len(), 1);
    }

    #[test]
    fn replaying_events_is_deterministic() {
        let t0 = Instant::now();
        let events = vec![
            (MachineEvent::StartRequested, t0),
            (MachineEvent::Spawned, t0),
            (out("compiling..."), t0 + Duration::from_millis(10)),
            (
                poll(
                    PollVerdict::Unreachable {
                        cause: Unreachable::Refused,
                    },
                    t0 + Duration::from_millis(20),
                ),
                t0 + Duration::from_millis(20),
            ),
            (out("JavaScript heap out of memory"), t0 + Duration::from_millis(30)),
            (
                poll(PollVerdict::Unhealthy { status: 500 }, t0 + Duration::from_millis(40)),
                t0 + Duration::from_millis(40),
            ),
        ];

        let run = || {
            let mut m = machine(true);
            let mut last = ServiceState::Off;
            for (event, at) in events.clone() {
                last = m.apply(event, at);
            }
            (last, m.hint().cloned(), m.detail())
        };

        let first = run();
        assert_eq!(first, run());
        assert_eq!(first.0, ServiceState::Errors);
        assert_eq!(
            first.1.and_then(|h| h.command),
            Some("NODE_OPTIONS=--max-old-space-size=4096 npm run dev".to_string())
        );
    }
}
