//! Captured output handling.
//!
//! This module provides the bounded per-service log tail (`LogTail`) that the
//! classifier scans and the dashboard renders, plus text sanitization for
//! captured lines.

use std::collections::VecDeque;

use serde::Serialize;
use strip_ansi_escapes::strip;

/// Indicates the source stream of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of output from a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// The content of the line, ANSI escapes removed.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer holding the most recent output of one run.
#[derive(Debug, Clone)]
pub struct LogTail {
    max_lines: usize,
    lines: VecDeque<LogLine>,
    revision: u64,
}

impl LogTail {
    /// Creates a new `LogTail` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            revision: 0,
        }
    }

    /// Adds a line to the tail.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.revision = self.revision.wrapping_add(1);
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        if !self.lines.is_empty() {
            self.revision = self.revision.wrapping_add(1);
            self.lines.clear();
        }
    }

    /// Changes whenever the content does.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns the number of lines currently held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Iterates oldest line first.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Iterates newest line first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().rev()
    }
}

/// Sanitizes captured text: strips ANSI escape codes and carriage returns.
///
/// Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    let text = String::from_utf8_lossy(&stripped);
    // Progress bars redraw with `\r`; keep only the final frame.
    match text.rsplit('\r').find(|part| !part.is_empty()) {
        Some(last) => last.to_string(),
        None => String::new(),
    }
}
