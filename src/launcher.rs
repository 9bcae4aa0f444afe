//! Process launching and termination.
//!
//! A service's start command runs through the platform shell in its own process
//! group. Combined stdout/stderr is pushed line by line onto the caller's
//! channel, followed by exactly one [`ProcessEvent::Exited`] that says whether
//! the exit was asked for.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::counters::{ActivityCounters, ActivityGuard};
use crate::error::LaunchError;
use crate::output::{sanitize_text, LogLine, StreamKind};

/// How long to wait for buffered output after the child exits. Grandchildren
/// can keep the pipes open indefinitely.
const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
/// Longer lines (or output that never ends a line) are split at this size.
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Events pushed by a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of combined stdout/stderr.
    Output(LogLine),
    /// The process is gone; always the last event of a run.
    Exited(ExitReport),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the exit followed a stop request.
    pub requested: bool,
}

#[derive(Debug, Clone, Copy)]
enum ProcessSignal {
    SigTerm,
    SigKill,
}

/// Owner-side handle of a launched process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Asks for a graceful stop without waiting for it.
    ///
    /// Returns `false` if the process already exited or a stop was already
    /// requested.
    pub fn request_stop(&mut self, grace: Duration) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.stop_tx.take() {
            Some(tx) => tx.send(grace).is_ok(),
            None => false,
        }
    }

    /// Stops the process (SIGTERM, wait `grace`, then kill) and waits for it.
    ///
    /// Stopping an exited process returns its recorded report.
    #[cfg(test)]
    pub async fn stop(&mut self, grace: Duration) -> ExitReport {
        self.request_stop(grace);
        self.wait().await
    }

    /// Waits for the process to exit.
    #[cfg(test)]
    pub async fn wait(&mut self) -> ExitReport {
        match self.exit_rx.wait_for(Option::is_some).await {
            Ok(report) => (*report).unwrap_or(ExitReport {
                code: None,
                requested: false,
            }),
            // The monitor is gone without reporting; the runtime is shutting down.
            Err(_) => ExitReport {
                code: None,
                requested: self.stop_tx.is_none(),
            },
        }
    }
}

/// Spawns `command` through the shell in `working_dir`.
///
/// Output and the final exit event go to `events`. The process counts as live
/// in `counters` until its exit has been observed.
pub fn start(
    working_dir: &Path,
    command: &str,
    events: mpsc::Sender<ProcessEvent>,
    counters: &Arc<ActivityCounters>,
) -> Result<ProcessHandle, LaunchError> {
    if !working_dir.is_dir() {
        return Err(LaunchError::MissingDir(working_dir.to_path_buf()));
    }

    let mut cmd = shell_command(command);
    cmd.current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let guard = counters.track_process();
    let pid = child.id();
    debug!(?pid, command, dir = %working_dir.display(), "spawned");

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(StreamKind::Stdout, stdout, events.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(StreamKind::Stderr, stderr, events.clone())));
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(monitor(child, pid, readers, stop_rx, exit_tx, events, guard));

    Ok(ProcessHandle {
        pid,
        stop_tx: Some(stop_tx),
        exit_rx,
    })
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    StopRequested(Duration),
}

async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    mut readers: Vec<JoinHandle<()>>,
    mut stop_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    events: mpsc::Sender<ProcessEvent>,
    guard: ActivityGuard,
) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        Ok(grace) = &mut stop_rx => Outcome::StopRequested(grace),
    };
    let report = match outcome {
        Outcome::Exited(status) => ExitReport {
            code: exit_code(status, pid),
            requested: false,
        },
        Outcome::StopRequested(grace) => terminate(&mut child, pid, grace).await,
    };
    drop(child);
    drop(guard);

    let flush = async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, flush).await.is_err() {
        debug!(?pid, "output still open after exit, detaching readers");
    }
    for reader in &readers {
        reader.abort();
    }

    exit_tx.send_replace(Some(report));
    let _ = events.send(ProcessEvent::Exited(report)).await;
}

fn exit_code(status: std::io::Result<ExitStatus>, pid: Option<u32>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(?pid, error = %err, "failed to wait for process");
            None
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> ExitReport {
    if let Some(pid) = pid {
        send_os_signal(pid, ProcessSignal::SigTerm);
    }
    let status = match wait_for_exit(child, grace).await {
        Some(status) => Ok(status),
        None => {
            debug!(?pid, "grace period elapsed, killing");
            if let Some(pid) = pid {
                send_os_signal(pid, ProcessSignal::SigKill);
            }
            let _ = child.kill().await;
            child.wait().await
        }
    };
    ExitReport {
        code: exit_code(status, pid),
        requested: true,
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM; CTRL_BREAK is the closest console signal. The kill
    // stage falls through to `Child::kill`.
    if let ProcessSignal::SigTerm = signal {
        unsafe {
            let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
        }
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    if timeout.is_zero() {
        return None;
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(_)) | Err(_) => None,
    }
}

async fn read_stream<R>(stream: StreamKind, reader: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let text = sanitize_text(raw.trim_end_matches(['\n', '\r']));
                if tx
                    .send(ProcessEvent::Output(LogLine { text, stream }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(rx: &mut mpsc::Receiver<ProcessEvent>) -> (Vec<String>, ExitReport) {
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Output(line) => lines.push(line.text),
                ProcessEvent::Exited(report) => return (lines, report),
            }
        }
        panic!("channel closed without exit event");
    }

    #[tokio::test]
    async fn captures_combined_output_and_unrequested_exit() {
        let dir = tempfile::tempdir().unwrap();
        let counters = ActivityCounters::new();
        let (tx, mut rx) = mpsc::channel(64);
        let mut handle = start(
            dir.path(),
            "echo out; echo err 1>&2; printf 'no newline'; exit 3",
            tx,
            &counters,
        )
        .unwrap();

        let (mut lines, report) = collect(&mut rx).await;
        lines.sort();
        assert_eq!(lines, vec!["err", "no newline", "out"]);
        assert_eq!(
            report,
            ExitReport {
                code: Some(3),
                requested: false
            }
        );
        assert!(!handle.is_alive());
        assert_eq!(handle.wait().await, report);
        assert_eq!(counters.live_processes(), 0);
    }

    #[tokio::test]
    async fn long_lines_are_split() {
        let mut input = vec![b'a'; MAX_LINE_BYTES * 2 + 100];
        input.extend_from_slice(b"\r\nshort\n");
        let (tx, mut rx) = mpsc::channel(16);
        read_stream(StreamKind::Stdout, input.as_slice(), tx).await;

        let mut lengths = Vec::new();
        let mut last = String::new();
        while let Some(ProcessEvent::Output(line)) = rx.recv().await {
            lengths.push(line.text.len());
            last = line.text;
        }
        assert_eq!(lengths, vec![MAX_LINE_BYTES, MAX_LINE_BYTES, 100, 5]);
        assert_eq!(last, "short");
    }

    #[tokio::test]
    async fn endless_output_without_newlines_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let counters = ActivityCounters::new();
        let (tx, mut rx) = mpsc::channel(64);
        let _handle = start(
            dir.path(),
            "head -c 200000 /dev/zero | tr '\\0' a",
            tx,
            &counters,
        )
        .unwrap();
        let mut total = 0;
        loop {
            match rx.recv().await.unwrap() {
                ProcessEvent::Output(line) => {
                    assert!(line.text.len() <= MAX_LINE_BYTES);
                    total += line.text.len();
                }
                ProcessEvent::Exited(_) => break,
            }
        }
        assert_eq!(total, 200_000);
    }

    #[tokio::test]
    async fn runs_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let counters = ActivityCounters::new();
        let (tx, mut rx) = mpsc::channel(64);
        let _handle = start(dir.path(), "cat marker.txt", tx, &counters).unwrap();
        let (lines, report) = collect(&mut rx).await;
        assert_eq!(lines, vec!["here"]);
        assert_eq!(report.code, Some(0));
    }

    #[tokio::test]
    async fn stop_is_graceful_requested_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let counters = ActivityCounters::new();
        let (tx, mut rx) = mpsc::channel(64);
        let mut handle = start(dir.path(), "sleep 30", tx, &counters).unwrap();
        assert!(handle.is_alive());
        assert_eq!(counters.live_processes(), 1);

        let report = handle.stop(Duration::from_secs(5)).await;
        assert!(report.requested);
        assert!(!handle.is_alive());
        assert_eq!(counters.live_processes(), 0);

        let again = handle.stop(Duration::from_secs(5)).await;
        assert_eq!(again, report);
        let (_, event_report) = collect(&mut rx).await;
        assert_eq!(event_report, report);
    }

    #[tokio::test]
    async fn stop_force_kills_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let counters = ActivityCounters::new();
        let (tx, _rx) = mpsc::channel(64);
        let mut handle = start(
            dir.path(),
            "trap '' TERM; while true; do sleep 1; done",
            tx,
            &counters,
        )
        .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            handle.stop(Duration::from_millis(200)),
        )
        .await
        .expect("stop must not hang");
        assert!(report.requested);
        assert_eq!(report.code, None);
    }

    #[tokio::test]
    async fn missing_working_dir_is_a_launch_error() {
        let counters = ActivityCounters::new();
        let (tx, _rx) = mpsc::channel(8);
        let err = start(Path::new("/definitely/not/here"), "true", tx, &counters).unwrap_err();
        assert!(matches!(err, LaunchError::MissingDir(_)));
        assert_eq!(counters.live_processes(), 0);
    }
}
