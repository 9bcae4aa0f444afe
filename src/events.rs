//! Event definitions for the dashboard and line-mode loops.

use crossterm::event::KeyEvent;

/// Which signal asked the supervisor to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

/// Represents an event in the application's main loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// A background supervisor command finished and has something to report.
    CommandDone(String),
    /// A background supervisor command failed.
    CommandFailed(String),
    /// The process received a termination signal.
    Shutdown { signal: ShutdownSignal },
}
