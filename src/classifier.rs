//! Log classification.
//!
//! Turns captured output into a plain-English hint. The rules are an ordered
//! table of data: the first rule (in table order) with any matching line in the
//! tail wins, regardless of where in the tail that line sits.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::HintRuleConfig;
use crate::output::LogTail;

/// A diagnostic surfaced next to a failing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hint {
    /// Id of the rule that produced the hint.
    pub id: String,
    /// Text shown to the user.
    pub text: String,
    /// Command the user can copy to fix the problem.
    pub command: Option<String>,
}

impl Hint {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            command: None,
        }
    }
}

/// Values available to suggested-command templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext<'a> {
    /// Port of the service URL, used when the log line carries none.
    pub port: Option<u16>,
    /// The service start command.
    pub command: &'a str,
}

// (id, pattern, text, suggested command)
const BUILTIN_RULES: &[(&str, &str, &str, Option<&str>)] = &[
    (
        "ssr-storage",
        r"localStorage\.getItem is not a function|(?:window|document|localStorage) is not defined",
        "This app touches browser-only APIs while rendering on the server. \
         Wrap the affected code in `if (typeof window !== 'undefined') { ... }`.",
        None,
    ),
    (
        "port-in-use",
        r"EADDRINUSE|address already in use|port \d+ is already in use",
        "Something else is already using this port. \
         Stop the other process or switch the service to a different port.",
        Some("lsof -ti tcp:{port} | xargs kill"),
    ),
    (
        "command-not-found",
        r"command not found|No such file or directory",
        "A command or file wasn't found. \
         Check the start command and make sure the required tools are installed.",
        None,
    ),
    (
        "module-missing",
        r"MODULE_NOT_FOUND|Cannot find module|ModuleNotFoundError",
        "A required package is missing. Run the install step in the project folder.",
        Some("npm install"),
    ),
    (
        "permission-denied",
        r"EACCES|Permission denied",
        "Permission denied. Use a port above 1024 or check the folder's permissions.",
        None,
    ),
    (
        "out-of-memory",
        r"JavaScript heap out of memory|out of memory",
        "The service ran out of memory. Raise the Node memory limit.",
        Some("NODE_OPTIONS=--max-old-space-size=4096 {command}"),
    ),
];

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct HintRule {
    pub id: String,
    pattern: Regex,
    pub text: String,
    pub command: Option<String>,
}

impl HintRule {
    pub fn new(id: &str, pattern: &str, text: &str, command: Option<&str>) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid pattern for hint rule {}", id))?;
        Ok(Self {
            id: id.to_string(),
            pattern,
            text: text.to_string(),
            command: command.map(str::to_string),
        })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// Ordered, table-driven matcher.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<HintRule>,
    port_in_line: Regex,
    listening_on: Regex,
}

impl Classifier {
    /// The built-in table only.
    #[cfg(test)]
    pub fn builtin() -> Self {
        Self::with_rules(&[]).expect("built-in hint rules are valid")
    }

    /// User rules first, then the built-in table.
    pub fn with_rules(extra: &[HintRuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(extra.len() + BUILTIN_RULES.len());
        for rule in extra {
            rules.push(HintRule::new(
                &rule.id,
                &rule.pattern,
                &rule.text,
                rule.command.as_deref(),
            )?);
        }
        for (id, pattern, text, command) in BUILTIN_RULES {
            rules.push(HintRule::new(id, pattern, text, *command)?);
        }
        Ok(Self {
            rules,
            port_in_line: Regex::new(r"(?i)(?:port\s+|:)(\d{2,5})\b")?,
            listening_on: Regex::new(r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d{2,5})\b")?,
        })
    }

    /// Classifies a service's captured tail.
    pub fn classify(&self, tail: &LogTail, ctx: ClassifyContext<'_>) -> Option<Hint> {
        let recent_first: Vec<&str> = tail.iter_recent().map(|l| l.text.as_str()).collect();
        self.classify_lines(&recent_first, ctx)
    }

    /// Classifies free text, such as a failure cause; later lines count as newer.
    pub fn classify_text(&self, text: &str, ctx: ClassifyContext<'_>) -> Option<Hint> {
        let recent_first: Vec<&str> = text.lines().rev().collect();
        self.classify_lines(&recent_first, ctx)
    }

    fn classify_lines(&self, recent_first: &[&str], ctx: ClassifyContext<'_>) -> Option<Hint> {
        for rule in &self.rules {
            if let Some(line) = recent_first.iter().find(|line| rule.is_match(line)) {
                let port = self.port_from_line(line).or(ctx.port);
                return Some(Hint {
                    id: rule.id.clone(),
                    text: rule.text.clone(),
                    command: rule
                        .command
                        .as_deref()
                        .and_then(|template| render_command(template, port, ctx.command)),
                });
            }
        }
        None
    }

    /// Hint for a service answering on a different port than configured.
    pub fn port_mismatch(&self, tail: &LogTail, configured: u16) -> Option<Hint> {
        let actual = tail.iter_recent().find_map(|line| {
            self.listening_on
                .captures_iter(&line.text)
                .last()
                .and_then(|caps| caps[1].parse::<u16>().ok())
        })?;
        if actual == configured {
            return None;
        }
        Some(Hint::new(
            "port-mismatch",
            format!(
                "Service is listening on :{}, not :{}. Update the URL or change the port in the project.",
                actual, configured
            ),
        ))
    }

    fn port_from_line(&self, line: &str) -> Option<u16> {
        self.port_in_line
            .captures_iter(line)
            .last()
            .and_then(|caps| caps[1].parse::<u16>().ok())
    }
}

fn render_command(template: &str, port: Option<u16>, command: &str) -> Option<String> {
    let mut rendered = template.to_string();
    if rendered.contains("{port}") {
        rendered = rendered.replace("{port}", &port?.to_string());
    }
    if rendered.contains("{command}") {
        if command.trim().is_empty() {
            return None;
        }
        rendered = rendered.replace("{command}", command);
    }
    Some(rendered)
}

/// Port of a URL, including the scheme default.
pub fn url_port(url: &str) -> Option<u16> {
    reqwest::Url::parse(url).ok()?.port_or_known_default()
}
