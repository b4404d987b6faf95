//! Analyst main binary.

mod agent;
mod cli;
mod commands;
mod config;
mod events;
mod interpreter;
mod memory;
mod prompts;
mod routes;
mod server;
mod session;
mod voice;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "analyst", version, about = "Conversational SQL data analyst")]
struct Cli {
    /// Config file (default: ./analyst.toml when present).
    #[arg(long, global = true, env = "ANALYST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP chat server (default).
    Serve,
    /// Answer one question and exit.
    Ask {
        question: String,
        /// Model identifier such as `openai:gpt-4o-mini`.
        #[arg(long)]
        model: Option<String>,
        /// Write chart figures as JSON files into this directory.
        #[arg(long)]
        charts_dir: Option<PathBuf>,
    },
    /// Interactive conversation on stdin.
    Chat {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        charts_dir: Option<PathBuf>,
    },
    /// List database tables and their row counts.
    Tables,
    /// Transcribe an audio question and answer it.
    Transcribe {
        file: PathBuf,
        /// Audio mime type; guessed from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Validate config, database and provider credentials.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config).await,
        Command::Ask {
            question,
            model,
            charts_dir,
        } => cli::ask(config, &question, model, charts_dir).await,
        Command::Chat { model, charts_dir } => cli::chat(config, model, charts_dir).await,
        Command::Tables => cli::tables(config).await,
        Command::Transcribe { file, mime, model } => {
            cli::transcribe(config, &file, mime, model).await
        }
        Command::Doctor => server::doctor(config).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,analyst=debug,analyst_app=debug,analyst_llm=debug,analyst_tools=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("ANALYST_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported ANALYST_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["analyst"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn ask_accepts_model_and_global_config() {
        let cli = Cli::try_parse_from([
            "analyst",
            "ask",
            "How many customers are there?",
            "--model",
            "ollama:llama3.1:8b",
            "--config",
            "custom.toml",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Some(Command::Ask {
                question, model, ..
            }) => {
                assert_eq!(question, "How many customers are there?");
                assert_eq!(model.as_deref(), Some("ollama:llama3.1:8b"));
            }
            other => panic!("expected ask, got {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(payload.as_ref()), "boom");
    }
}
