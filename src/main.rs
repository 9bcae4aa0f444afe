//! devrack: supervise a fleet of local development services.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, starts the supervisor and drives either the dashboard
//! or the plain line-oriented output until the user quits.

mod app;
mod classifier;
mod clipboard;
mod config;
mod counters;
mod error;
mod events;
mod launcher;
mod logging;
mod output;
mod poller;
mod service;
mod state;
mod supervisor;
mod sync;
mod tui;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{App, AppAction};
use crate::classifier::Hint;
use crate::config::{
    Config, ConfigStore, ServiceConfig, TomlConfigStore, DEFAULT_BRANCH, DEFAULT_CONFIG_FILE,
};
use crate::events::{Event, ShutdownSignal};
use crate::logging::LogTarget;
use crate::service::ServiceSnapshot;
use crate::state::ServiceState;
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::error::SyncError;
use crate::sync::{GithubResolver, RepoResolver};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Supervise local development services",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Disable the dashboard and print state changes to stdout.
    #[arg(long)]
    no_ui: bool,
    /// Print state changes (and `list` output) as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Start every service right away.
    #[arg(long)]
    start_all: bool,
    /// Max log lines kept per service.
    #[arg(long)]
    max_lines: Option<usize>,
    /// Directory holding the service checkouts.
    #[arg(long)]
    packages_dir: Option<PathBuf>,
    /// Directory for the supervisor log and per-service output logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append a service to the configuration.
    Add {
        /// Clone URL, local path or owner/repo shorthand.
        #[arg(long)]
        repo: String,
        /// Service name (defaults to the repository name).
        #[arg(long)]
        name: Option<String>,
        /// Branch to check out.
        #[arg(long, default_value = "main")]
        branch: String,
        /// Shell command that starts the service.
        #[arg(long = "cmd")]
        start_command: String,
        /// Health URL polled while the service runs.
        #[arg(long)]
        url: Option<String>,
    },
    /// List configured services.
    List,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = TomlConfigStore::new(config_path(&cli));
    match &cli.command {
        Some(Commands::Version) => {
            println!("devrack {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::List) => list_services(&store, cli.json),
        Some(Commands::Add {
            repo,
            name,
            branch,
            start_command,
            url,
        }) => {
            add_service(
                store,
                repo,
                name.as_deref(),
                branch,
                start_command,
                url.as_deref(),
            )
            .await
        }
        None => run(&cli, store).await,
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

fn load_or_default(store: &TomlConfigStore) -> Result<Config> {
    if store.path().exists() {
        store.load()
    } else {
        Ok(Config::default())
    }
}

fn list_services(store: &TomlConfigStore, json: bool) -> Result<()> {
    let config = load_or_default(store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config.services)?);
        return Ok(());
    }
    if config.services.is_empty() {
        println!("no services in {}", store.path().display());
        return Ok(());
    }
    for service in &config.services {
        let url = service.url.as_deref().unwrap_or("-");
        println!(
            "{}\t{}@{}\t{}\t{}",
            service.name, service.repo, service.branch, url, service.start_command
        );
    }
    Ok(())
}

/// Builds the config for a new service; the name defaults to the repo's.
fn new_service(
    resolver: &dyn RepoResolver,
    repo: &str,
    name: Option<&str>,
    branch: &str,
    start_command: &str,
    url: Option<&str>,
) -> Result<ServiceConfig, SyncError> {
    let name = match name {
        Some(name) => name.to_string(),
        None => resolver.resolve(repo)?.suggested_name,
    };
    Ok(ServiceConfig {
        name,
        repo: repo.to_string(),
        branch: branch.to_string(),
        start_command: start_command.to_string(),
        url: url.map(str::to_string),
    })
}

// Goes through the supervisor so the CLI applies the same checks as the
// dashboard. Services of another running instance are not visible here.
async fn add_service(
    store: TomlConfigStore,
    repo: &str,
    name: Option<&str>,
    branch: &str,
    start_command: &str,
    url: Option<&str>,
) -> Result<()> {
    let base_dir = store.base_dir();
    let service = new_service(
        &GithubResolver::new(base_dir.clone()),
        repo,
        name,
        branch,
        start_command,
        url,
    )?;
    let config = load_or_default(&store)?;
    let path = store.path().to_path_buf();
    let supervisor = Supervisor::new(
        &config,
        Arc::new(store),
        SupervisorSettings::resolve(&config.settings, &base_dir),
        &base_dir,
    )?;
    let added = supervisor.add(service.clone()).await;
    supervisor.shutdown().await;
    added.with_context(|| format!("cannot add {} to {}", service.name, path.display()))?;
    println!("added {} to {}", service.name, path.display());
    Ok(())
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    supervisor: SupervisorSettings,
    no_ui: bool,
    json: bool,
    start_all: bool,
    /// Where the supervisor's own log goes in dashboard mode.
    log_dir: PathBuf,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config, base_dir: &Path) -> Self {
        let mut supervisor = SupervisorSettings::resolve(&config.settings, base_dir);
        if let Some(max_lines) = cli.max_lines {
            supervisor.max_lines = max_lines.max(1);
        }
        if let Some(dir) = &cli.packages_dir {
            supervisor.packages_dir = dir.clone();
        }
        if let Some(dir) = &cli.log_dir {
            supervisor.log_dir = Some(dir.clone());
        }
        let log_dir = supervisor
            .log_dir
            .clone()
            .unwrap_or_else(|| base_dir.join(".devrack"));
        Self {
            supervisor,
            no_ui: cli.no_ui,
            json: cli.json,
            start_all: cli.start_all,
            log_dir,
        }
    }
}

async fn run(cli: &Cli, store: TomlConfigStore) -> Result<()> {
    let config = load_or_default(&store)?;
    let base_dir = store.base_dir();
    let settings = RunSettings::from_cli(cli, &config, &base_dir);
    let _log_guard = logging::init(if settings.no_ui {
        LogTarget::Stderr
    } else {
        LogTarget::File {
            dir: &settings.log_dir,
        }
    })?;
    info!(config = %store.path().display(), services = config.services.len(), "devrack starting");

    let supervisor = Arc::new(Supervisor::new(
        &config,
        Arc::new(store),
        settings.supervisor.clone(),
        &base_dir,
    )?);
    let resolver = GithubResolver::new(base_dir.clone());

    let (event_tx, event_rx) = mpsc::channel(256);
    spawn_signal_listener(event_tx.clone());

    if settings.start_all {
        for (name, result) in supervisor.start_all().await {
            if let Err(err) = result {
                warn!(service = %name, error = %err, "start failed");
            }
        }
    }

    let result = if settings.no_ui {
        run_lines(&supervisor, settings.json, event_rx).await
    } else {
        run_dashboard(&supervisor, &resolver, event_tx, event_rx).await
    };

    supervisor.shutdown().await;
    info!("devrack stopped");
    result
}

async fn run_dashboard(
    supervisor: &Arc<Supervisor>,
    resolver: &dyn RepoResolver,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    let mut terminal = tui::init_terminal().context("failed to initialize terminal")?;
    spawn_input_listener(event_tx.clone());

    let mut app = App::new(supervisor.snapshot().await);
    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Key(key) => {
                    let action = app.handle_key(key);
                    handle_app_action(action, &mut app, supervisor, resolver, &event_tx);
                }
                Event::Resize { width, height } => {
                    debug!(width, height, "terminal resized");
                    let _ = terminal.autoresize();
                }
                Event::CommandDone(message) => app.set_status_message(message),
                Event::CommandFailed(message) => app.set_status_warning(message),
                Event::Shutdown { signal } => {
                    info!(signal = signal.label(), "shutdown requested");
                    app.should_quit = true;
                }
            },
            _ = ticker.tick() => app.update(supervisor.snapshot().await),
        }

        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    app.set_status_warning_persistent("stopping services...");
    let _ = tui::draw(&mut app, &mut terminal);
    supervisor.shutdown().await;
    tui::restore_terminal(terminal)?;
    result
}

// Supervisor commands can take seconds (graceful stop), so they run off the
// UI loop and report failures back as events.
fn handle_app_action(
    action: AppAction,
    app: &mut App,
    supervisor: &Arc<Supervisor>,
    resolver: &dyn RepoResolver,
    event_tx: &mpsc::Sender<Event>,
) {
    let spawn_command = |label: String, name: Option<String>, action: AppAction| {
        let supervisor = Arc::clone(supervisor);
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let failure = match (&action, name.as_deref()) {
                (AppAction::Start(_), Some(name)) => supervisor.start(name).await.err(),
                (AppAction::Stop(_), Some(name)) => supervisor.stop(name).await.err(),
                (AppAction::Restart(_), Some(name)) => supervisor.restart(name).await.err(),
                (AppAction::StartAll, _) => supervisor
                    .start_all()
                    .await
                    .into_iter()
                    .find_map(|(_, result)| result.err()),
                (AppAction::StopAll, _) => supervisor
                    .stop_all()
                    .await
                    .into_iter()
                    .find_map(|(_, result)| result.err()),
                _ => None,
            };
            if let Some(err) = failure {
                warn!(action = %label, error = %err, "command failed");
                let _ = event_tx
                    .send(Event::CommandFailed(format!("{} failed: {}", label, err)))
                    .await;
            }
        });
    };

    match action {
        AppAction::None | AppAction::Quit => {}
        AppAction::Start(name) => {
            app.set_status_message(format!("Starting {}", name));
            spawn_command(format!("start {}", name), Some(name.clone()), AppAction::Start(name));
        }
        AppAction::Stop(name) => {
            app.set_status_message(format!("Stopping {}", name));
            spawn_command(format!("stop {}", name), Some(name.clone()), AppAction::Stop(name));
        }
        AppAction::Restart(name) => {
            app.set_status_message(format!("Restarting {}", name));
            spawn_command(format!("restart {}", name), Some(name.clone()), AppAction::Restart(name));
        }
        AppAction::StartAll => {
            app.set_status_message("Starting all services");
            spawn_command("start all".to_string(), None, AppAction::StartAll);
        }
        AppAction::StopAll => {
            app.set_status_message("Stopping all services");
            spawn_command("stop all".to_string(), None, AppAction::StopAll);
        }
        AppAction::Copy(command) => match clipboard::copy_command(&command) {
            Ok(()) => app.set_status_message(format!("Copied: {}", command)),
            Err(err) => app.set_status_warning(format!("clipboard failed: {:#}", err)),
        },
        AppAction::Add(request) => {
            let service = match new_service(
                resolver,
                &request.repo,
                None,
                DEFAULT_BRANCH,
                &request.start_command,
                request.url.as_deref(),
            ) {
                Ok(service) => service,
                Err(err) => {
                    app.set_status_warning(format!("add failed: {}", err));
                    return;
                }
            };
            app.set_status_message(format!("Adding {}", service.name));
            let supervisor = Arc::clone(supervisor);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let name = service.name.clone();
                let event = match supervisor.add(service).await {
                    Ok(()) => Event::CommandDone(format!("Added {}", name)),
                    Err(err) => {
                        warn!(service = %name, error = %err, "add failed");
                        Event::CommandFailed(format!("add {} failed: {}", name, err))
                    }
                };
                let _ = event_tx.send(event).await;
            });
        }
    }
}

/// One line-mode record; the log tail is left out.
#[derive(Debug, Serialize)]
struct StatusRecord<'a> {
    name: &'a str,
    state: ServiceState,
    url: Option<&'a str>,
    hint: Option<&'a Hint>,
    can_open: bool,
    exit_code: Option<i32>,
    detail: &'a str,
}

impl<'a> From<&'a ServiceSnapshot> for StatusRecord<'a> {
    fn from(snapshot: &'a ServiceSnapshot) -> Self {
        Self {
            name: &snapshot.name,
            state: snapshot.state,
            url: snapshot.url.as_deref(),
            hint: snapshot.hint.as_ref(),
            can_open: snapshot.can_open,
            exit_code: snapshot.exit_code,
            detail: &snapshot.detail,
        }
    }
}

fn format_status_line(snapshot: &ServiceSnapshot) -> String {
    let mut line = format!("[{}] {}", snapshot.name, snapshot.state);
    if !snapshot.detail.is_empty() {
        line.push_str(" - ");
        line.push_str(&snapshot.detail);
    }
    if let Some(hint) = &snapshot.hint {
        line.push_str(" | hint: ");
        line.push_str(&hint.text);
        if let Some(command) = &hint.command {
            line.push_str(" | fix: ");
            line.push_str(command);
        }
    }
    line
}

// What makes a line-mode record worth printing again.
type StatusKey = (ServiceState, String, Option<String>);

fn status_key(snapshot: &ServiceSnapshot) -> StatusKey {
    (
        snapshot.state,
        snapshot.detail.clone(),
        snapshot.hint.as_ref().map(|hint| hint.id.clone()),
    )
}

async fn run_lines(
    supervisor: &Arc<Supervisor>,
    json: bool,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    let mut last: HashMap<String, StatusKey> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                Event::Shutdown { signal } => {
                    info!(signal = signal.label(), "shutdown requested");
                    return Ok(());
                }
                Event::CommandDone(message) => println!("{}", message),
                Event::CommandFailed(message) => eprintln!("{}", message),
                Event::Key(_) | Event::Resize { .. } => {}
            },
            _ = ticker.tick() => {
                for snapshot in supervisor.snapshot().await {
                    let key = status_key(&snapshot);
                    if last.get(&snapshot.name) == Some(&key) {
                        continue;
                    }
                    if json {
                        println!("{}", serde_json::to_string(&StatusRecord::from(&snapshot))?);
                    } else {
                        println!("{}", format_status_line(&snapshot));
                    }
                    last.insert(snapshot.name.clone(), key);
                }
            }
        }
    }
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if tx.is_closed() {
            break;
        }
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key))
                    if key.kind == crossterm::event::KeyEventKind::Press =>
                {
                    let _ = tx.blocking_send(Event::Key(key));
                }
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    let _ = tx.blocking_send(Event::Resize { width, height });
                }
                _ => {}
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: ShutdownSignal::Interrupt }).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: ShutdownSignal::Terminate }).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx
                .send(Event::Shutdown {
                    signal: ShutdownSignal::Interrupt,
                })
                .await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn snapshot(state: ServiceState) -> ServiceSnapshot {
        ServiceSnapshot {
            name: "web".into(),
            state,
            url: Some("http://localhost:3000".into()),
            hint: None,
            can_open: false,
            exit_code: None,
            detail: String::new(),
            log_tail: Arc::default(),
        }
    }

    #[test]
    fn cli_flags_override_file_settings() {
        let cli = Cli::parse_from([
            "devrack",
            "--no-ui",
            "--max-lines",
            "42",
            "--log-dir",
            "/tmp/devrack-logs",
        ]);
        let config = Config {
            settings: Settings {
                max_lines: Some(1000),
                packages_dir: Some("checkouts".into()),
                ..Settings::default()
            },
            ..Config::default()
        };
        let settings = RunSettings::from_cli(&cli, &config, Path::new("/work"));
        assert!(settings.no_ui);
        assert_eq!(settings.supervisor.max_lines, 42);
        assert_eq!(settings.supervisor.packages_dir, PathBuf::from("/work/checkouts"));
        assert_eq!(settings.log_dir, PathBuf::from("/tmp/devrack-logs"));

        let cli = Cli::parse_from(["devrack"]);
        let settings = RunSettings::from_cli(&cli, &Config::default(), Path::new("/work"));
        assert_eq!(settings.log_dir, PathBuf::from("/work/.devrack"));
        assert_eq!(settings.supervisor.log_dir, None);
    }

    #[test]
    fn add_subcommand_parses() {
        let cli = Cli::parse_from([
            "devrack",
            "add",
            "--repo",
            "acme/web",
            "--cmd",
            "npm run dev",
            "--url",
            "http://localhost:3000",
        ]);
        match cli.command {
            Some(Commands::Add {
                repo,
                name,
                branch,
                start_command,
                url,
            }) => {
                assert_eq!(repo, "acme/web");
                assert_eq!(name, None);
                assert_eq!(branch, "main");
                assert_eq!(start_command, "npm run dev");
                assert_eq!(url.as_deref(), Some("http://localhost:3000"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn add_uses_repo_name_and_rejects_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TomlConfigStore::new(tmp.path().join("devrack.toml"));
        add_service(store.clone(), "acme/web", None, "main", "npm run dev", None)
            .await
            .unwrap();
        let config = store.load().unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "web");
        let err = add_service(store.clone(), "acme/web", None, "main", "npm run dev", None)
            .await
            .unwrap_err();
        assert!(err.root_cause().to_string().contains("already exists"));
        assert_eq!(store.load().unwrap().services.len(), 1);
    }

    #[test]
    fn new_service_names_after_the_repo_unless_told_otherwise() {
        let resolver = GithubResolver::new("/work");
        let service = new_service(
            &resolver,
            "https://github.com/acme/shop.git",
            None,
            DEFAULT_BRANCH,
            "make run",
            Some("http://localhost:8080"),
        )
        .unwrap();
        assert_eq!(service.name, "shop");
        assert_eq!(service.url.as_deref(), Some("http://localhost:8080"));

        let named = new_service(&resolver, "acme/shop", Some("storefront"), "dev", "make run", None)
            .unwrap();
        assert_eq!(named.name, "storefront");
        assert_eq!(named.branch, "dev");

        assert!(matches!(
            new_service(&resolver, "not a repo", None, DEFAULT_BRANCH, "true", None),
            Err(SyncError::UnresolvedRepo(_))
        ));
    }

    #[test]
    fn status_lines_include_hint_and_fix() {
        assert_eq!(format_status_line(&snapshot(ServiceState::Starting)), "[web] starting");

        let mut failed = snapshot(ServiceState::Error);
        failed.detail = "exited with code 1".into();
        failed.hint = Some(Hint {
            id: "module-missing".into(),
            text: "A required package is missing.".into(),
            command: Some("npm install".into()),
        });
        assert_eq!(
            format_status_line(&failed),
            "[web] error - exited with code 1 | hint: A required package is missing. | fix: npm install"
        );

        let json = serde_json::to_value(StatusRecord::from(&failed)).unwrap();
        assert_eq!(json["state"], "Error");
        assert_eq!(json["hint"]["command"], "npm install");
        assert!(json.get("log_tail").is_none());
    }
}
