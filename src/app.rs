//! Dashboard state and key handling.
//!
//! `App` holds the latest service snapshots plus purely visual state
//! (selection, log scroll, status message, the add form). It never talks to
//! the supervisor directly: key presses become [`AppAction`]s that the main
//! loop executes.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::service::ServiceSnapshot;

/// The dashboard state container.
#[derive(Debug)]
pub struct App {
    /// Latest snapshot of every service, in config order.
    pub services: Vec<ServiceSnapshot>,
    /// Index of the currently selected service.
    pub selected: usize,
    /// Whether the log pane is shown next to the hint panel.
    pub show_log: bool,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Height of the log view area (for scrolling calculations).
    pub log_view_height: usize,
    /// Current input mode.
    pub input_mode: InputMode,
    /// Fields of the add-service form.
    pub add_form: AddForm,
    log_scroll: usize,
    log_follow: bool,
    status_message: Option<StatusMessage>,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    Start(String),
    Stop(String),
    Restart(String),
    StartAll,
    StopAll,
    /// Copy text to the clipboard.
    Copy(String),
    /// Register a new service.
    Add(AddRequest),
}

/// Modes of user input interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// Standard navigation mode.
    #[default]
    Normal,
    /// Filling in the add-service form.
    Add,
}

/// A service as typed into the add form; the name comes from the repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub repo: String,
    pub start_command: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddField {
    #[default]
    Repo,
    Command,
    Url,
}

impl AddField {
    pub const ALL: [AddField; 3] = [AddField::Repo, AddField::Command, AddField::Url];

    pub fn label(self) -> &'static str {
        match self {
            AddField::Repo => "Repo",
            AddField::Command => "Command",
            AddField::Url => "URL (optional)",
        }
    }

    fn next(self) -> Self {
        match self {
            AddField::Repo => AddField::Command,
            AddField::Command => AddField::Url,
            AddField::Url => AddField::Repo,
        }
    }

    fn prev(self) -> Self {
        match self {
            AddField::Repo => AddField::Url,
            AddField::Command => AddField::Repo,
            AddField::Url => AddField::Command,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddForm {
    pub repo: String,
    pub command: String,
    pub url: String,
    pub focus: AddField,
}

impl AddForm {
    pub fn value(&self, field: AddField) -> &str {
        match field {
            AddField::Repo => &self.repo,
            AddField::Command => &self.command,
            AddField::Url => &self.url,
        }
    }

    fn focused_mut(&mut self) -> &mut String {
        match self.focus {
            AddField::Repo => &mut self.repo,
            AddField::Command => &mut self.command,
            AddField::Url => &mut self.url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

impl App {
    pub fn new(services: Vec<ServiceSnapshot>) -> Self {
        Self {
            services,
            selected: 0,
            show_log: true,
            should_quit: false,
            log_view_height: 0,
            input_mode: InputMode::Normal,
            add_form: AddForm::default(),
            log_scroll: 0,
            log_follow: true,
            status_message: None,
        }
    }

    pub fn selected_service(&self) -> Option<&ServiceSnapshot> {
        self.services.get(self.selected)
    }

    /// Replaces the snapshots, keeping the selection on the same service.
    pub fn update(&mut self, services: Vec<ServiceSnapshot>) {
        let selected_name = self.selected_service().map(|s| s.name.clone());
        self.services = services;
        if let Some(name) = selected_name {
            if let Some(index) = self.services.iter().position(|s| s.name == name) {
                self.selected = index;
            }
        }
        self.selected = self.selected.min(self.services.len().saturating_sub(1));
        if !self.log_follow {
            let max_scroll = self.max_log_scroll();
            self.log_scroll = self.log_scroll.min(max_scroll);
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        match self.input_mode {
            InputMode::Add => self.handle_add_input(key),
            InputMode::Normal => self.handle_normal_input(key),
        }
    }

    fn handle_add_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Esc => {
                self.close_add_form();
                AppAction::None
            }
            KeyCode::Tab | KeyCode::Down => {
                self.add_form.focus = self.add_form.focus.next();
                AppAction::None
            }
            KeyCode::BackTab | KeyCode::Up => {
                self.add_form.focus = self.add_form.focus.prev();
                AppAction::None
            }
            KeyCode::Enter if self.add_form.focus != AddField::Url => {
                self.add_form.focus = self.add_form.focus.next();
                AppAction::None
            }
            KeyCode::Enter => self.submit_add_form(),
            KeyCode::Backspace => {
                self.add_form.focused_mut().pop();
                AppAction::None
            }
            KeyCode::Char(c) => {
                if key.modifiers.contains(KeyModifiers::CONTROL) {
                    return AppAction::None;
                }
                self.add_form.focused_mut().push(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn submit_add_form(&mut self) -> AppAction {
        let repo = self.add_form.repo.trim().to_string();
        let start_command = self.add_form.command.trim().to_string();
        let url = self.add_form.url.trim().to_string();
        if repo.is_empty() {
            self.add_form.focus = AddField::Repo;
            self.set_status_warning("A repository is required");
            return AppAction::None;
        }
        if start_command.is_empty() {
            self.add_form.focus = AddField::Command;
            self.set_status_warning("A start command is required");
            return AppAction::None;
        }
        self.close_add_form();
        AppAction::Add(AddRequest {
            repo,
            start_command,
            url: (!url.is_empty()).then_some(url),
        })
    }

    fn close_add_form(&mut self) {
        self.input_mode = InputMode::Normal;
        self.add_form = AddForm::default();
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Up => {
                if self.selected > 0 {
                    self.selected -= 1;
                    self.reset_scroll();
                }
                AppAction::None
            }
            KeyCode::Down => {
                if self.selected + 1 < self.services.len() {
                    self.selected += 1;
                    self.reset_scroll();
                }
                AppAction::None
            }
            KeyCode::Enter => match self.selected_service() {
                Some(service) if service.state.can_start() => {
                    AppAction::Start(service.name.clone())
                }
                Some(service) => AppAction::Stop(service.name.clone()),
                None => AppAction::None,
            },
            KeyCode::Char('a') => AppAction::StartAll,
            KeyCode::Char('x') => AppAction::StopAll,
            KeyCode::Char('r') => match self.selected_service() {
                Some(service) => AppAction::Restart(service.name.clone()),
                None => AppAction::None,
            },
            KeyCode::Char('c') => {
                let command = self
                    .selected_service()
                    .and_then(|service| service.hint.as_ref())
                    .and_then(|hint| hint.command.clone());
                match command {
                    Some(command) => AppAction::Copy(command),
                    None => {
                        self.set_status_message("No suggested command to copy");
                        AppAction::None
                    }
                }
            }
            KeyCode::Char('l') => {
                self.show_log = !self.show_log;
                AppAction::None
            }
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Add;
                self.add_form = AddForm::default();
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.log_scroll = 0;
                self.log_follow = false;
                AppAction::None
            }
            KeyCode::End => {
                self.reset_scroll();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    pub fn scroll_up(&mut self, amount: usize) {
        let current = self.log_scroll();
        self.log_scroll = current.saturating_sub(amount);
        self.log_follow = false;
    }

    pub fn scroll_down(&mut self, amount: usize) {
        let max_scroll = self.max_log_scroll();
        let next = (self.log_scroll() + amount).min(max_scroll);
        self.log_scroll = next;
        self.log_follow = next == max_scroll;
    }

    /// First visible log line of the selected service.
    pub fn log_scroll(&self) -> usize {
        if self.log_follow {
            self.max_log_scroll()
        } else {
            self.log_scroll.min(self.max_log_scroll())
        }
    }

    pub fn is_following(&self) -> bool {
        self.log_follow
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
    }

    pub fn status_line(&self) -> String {
        let Some(service) = self.selected_service() else {
            return "No services configured (devrack add --repo ... --cmd ...)".to_string();
        };
        let mut parts = vec![service.name.clone(), service.state.to_string()];
        if let Some(url) = &service.url {
            parts.push(url.clone());
        }
        if let Some(code) = service.exit_code {
            parts.push(format!("exit: {}", code));
        }
        parts.push(format!("lines: {}", service.log_tail.len()));
        parts.push(format!("follow: {}", if self.log_follow { "on" } else { "off" }));
        parts.join(" | ")
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Warning, Some(Duration::from_secs(5)));
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Warning, None);
    }

    fn set_status(&mut self, message: impl Into<String>, level: StatusLevel, ttl: Option<Duration>) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }

    fn reset_scroll(&mut self) {
        self.log_scroll = 0;
        self.log_follow = true;
    }

    fn max_log_scroll(&self) -> usize {
        let lines = self
            .selected_service()
            .map(|service| service.log_tail.len())
            .unwrap_or(0);
        lines.saturating_sub(self.log_view_height.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::classifier::Hint;
    use crate::output::{LogLine, StreamKind};
    use crate::state::ServiceState;

    fn snapshot(name: &str, state: ServiceState) -> ServiceSnapshot {
        ServiceSnapshot {
            name: name.to_string(),
            state,
            url: None,
            hint: None,
            can_open: false,
            exit_code: None,
            detail: String::new(),
            log_tail: Arc::default(),
        }
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn enter_toggles_based_on_state() {
        let mut app = App::new(vec![
            snapshot("web", ServiceState::Off),
            snapshot("api", ServiceState::Running),
            snapshot("db", ServiceState::Error),
        ]);
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::Start("web".into()));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::Stop("api".into()));
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::Start("db".into()));
        // Selection stops at the last service.
        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.selected, 2);
    }

    #[test]
    fn copy_uses_the_suggested_command() {
        let mut with_hint = snapshot("web", ServiceState::Error);
        with_hint.hint = Some(Hint {
            id: "module-missing".into(),
            text: "A required package is missing.".into(),
            command: Some("npm install".into()),
        });
        let mut app = App::new(vec![with_hint, snapshot("api", ServiceState::Off)]);
        assert_eq!(
            app.handle_key(key(KeyCode::Char('c'))),
            AppAction::Copy("npm install".into())
        );

        app.handle_key(key(KeyCode::Down));
        assert_eq!(app.handle_key(key(KeyCode::Char('c'))), AppAction::None);
        let (message, level) = app.status_message().unwrap();
        assert_eq!(message, "No suggested command to copy");
        assert_eq!(level, StatusLevel::Info);
    }

    #[test]
    fn update_keeps_selection_on_the_same_service() {
        let mut app = App::new(vec![
            snapshot("web", ServiceState::Off),
            snapshot("api", ServiceState::Off),
        ]);
        app.handle_key(key(KeyCode::Down));
        app.update(vec![
            snapshot("new", ServiceState::Off),
            snapshot("web", ServiceState::Off),
            snapshot("api", ServiceState::Running),
        ]);
        assert_eq!(app.selected_service().unwrap().name, "api");

        app.update(Vec::new());
        assert_eq!(app.selected, 0);
        assert!(app.selected_service().is_none());
    }

    #[test]
    fn global_keys_map_to_actions() {
        let mut app = App::new(vec![snapshot("web", ServiceState::Running)]);
        assert_eq!(app.handle_key(key(KeyCode::Char('a'))), AppAction::StartAll);
        assert_eq!(app.handle_key(key(KeyCode::Char('x'))), AppAction::StopAll);
        assert_eq!(
            app.handle_key(key(KeyCode::Char('r'))),
            AppAction::Restart("web".into())
        );
        assert!(app.show_log);
        app.handle_key(key(KeyCode::Char('l')));
        assert!(!app.show_log);
        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), AppAction::Quit);
        assert!(app.should_quit);
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.handle_key(key(KeyCode::Char(c)));
        }
    }

    #[test]
    fn add_form_collects_fields_and_submits() {
        let mut app = App::new(vec![snapshot("web", ServiceState::Off)]);
        app.handle_key(key(KeyCode::Char('n')));
        assert_eq!(app.input_mode, InputMode::Add);

        // Keys that mean something in normal mode are plain text here.
        type_text(&mut app, "acme/api");
        app.handle_key(key(KeyCode::Enter));
        type_text(&mut app, "npm run devx");
        app.handle_key(key(KeyCode::Backspace));
        app.handle_key(key(KeyCode::Enter));
        assert_eq!(app.add_form.focus, AddField::Url);
        assert!(!app.should_quit);

        let action = app.handle_key(key(KeyCode::Enter));
        assert_eq!(
            action,
            AppAction::Add(AddRequest {
                repo: "acme/api".into(),
                start_command: "npm run dev".into(),
                url: None,
            })
        );
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.add_form.repo.is_empty());
    }

    #[test]
    fn add_form_requires_repo_and_command() {
        let mut app = App::new(Vec::new());
        app.handle_key(key(KeyCode::Char('n')));
        app.handle_key(key(KeyCode::Tab));
        type_text(&mut app, "make run");
        app.handle_key(key(KeyCode::Tab));
        assert_eq!(app.handle_key(key(KeyCode::Enter)), AppAction::None);
        assert_eq!(app.add_form.focus, AddField::Repo);
        assert_eq!(app.status_message().unwrap().1, StatusLevel::Warning);
        assert_eq!(app.input_mode, InputMode::Add);

        app.handle_key(key(KeyCode::Esc));
        assert_eq!(app.input_mode, InputMode::Normal);
        assert!(app.add_form.command.is_empty());
    }

    #[test]
    fn scrolling_leaves_and_resumes_follow() {
        let mut service = snapshot("web", ServiceState::Running);
        service.log_tail = Arc::new(
            (0..30)
                .map(|i| LogLine {
                    text: i.to_string(),
                    stream: StreamKind::Stdout,
                })
                .collect(),
        );
        let mut app = App::new(vec![service]);
        app.set_log_view_height(10);
        assert_eq!(app.log_scroll(), 20);

        app.scroll_up(5);
        assert!(!app.is_following());
        assert_eq!(app.log_scroll(), 15);

        app.scroll_down(100);
        assert!(app.is_following());
        assert_eq!(app.log_scroll(), 20);
    }
}
