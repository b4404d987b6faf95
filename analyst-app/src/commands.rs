//! Slash commands for the interactive `chat` REPL.

use analyst_llm::{ChatMessage, parse_identifier};

/// State threaded across turns of one REPL run.
#[derive(Debug, Clone)]
pub struct ReplSession {
    pub model: String,
    pub default_model: String,
    pub history: Vec<ChatMessage>,
    pub turns: usize,
}

impl ReplSession {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            default_model: model.clone(),
            model,
            history: Vec::new(),
            turns: 0,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.turns = 0;
    }
}

pub const HELP_TEXT: &str = "Commands: /reset /model [<provider:model>|clear] /status /help /quit";

/// `None` when `input` is a question rather than a command.
pub fn handle_command(session: &mut ReplSession, input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    if let Some(response) = handle_model_command(session, trimmed) {
        return Some(response);
    }

    match trimmed {
        "/reset" | "/new" => {
            session.reset();
            Some("Conversation reset.".to_string())
        }
        "/status" => Some(format!(
            "model={}\ndefault_model={}\nturns={}\nmessages={}",
            session.model,
            session.default_model,
            session.turns,
            session.history.len()
        )),
        "/help" => Some(HELP_TEXT.to_string()),
        _ => Some(format!("Unknown command. {HELP_TEXT}")),
    }
}

fn handle_model_command(session: &mut ReplSession, trimmed: &str) -> Option<String> {
    let rest = trimmed.strip_prefix("/model")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let requested = rest.trim();
    if requested.is_empty() {
        return Some(format!(
            "active_model={}\ndefault_model={}",
            session.model, session.default_model
        ));
    }
    if matches!(
        requested.to_ascii_lowercase().as_str(),
        "clear" | "reset" | "unset"
    ) {
        session.model = session.default_model.clone();
        return Some(format!("model reset to {}", session.model));
    }

    let (provider, model) = parse_identifier(requested);
    if model.is_empty() {
        return Some("Usage: /model <provider:model>".to_string());
    }
    session.model = format!("{}:{model}", provider.as_str());
    Some(format!("model set to {}", session.model))
}
