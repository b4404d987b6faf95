//! Terminal front-ends: one-shot questions, the chat REPL, table listing and
//! audio questions.

use crate::agent::{AnalystAgent, TurnRequest};
use crate::commands::{ReplSession, handle_command};
use crate::config::AnalystConfig;
use crate::events::OutputEvent;
use crate::server::build_runtime;
use crate::voice::{AudioClip, Transcriber, WhisperCliTranscriber};
use analyst_llm::ChatMessage;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

pub async fn ask(
    config_path: Option<PathBuf>,
    question: &str,
    model: Option<String>,
    charts_dir: Option<PathBuf>,
) -> Result<()> {
    let cfg = AnalystConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg).await?;
    let model = model.unwrap_or_else(|| cfg.general.model.clone());
    run_and_print(&runtime.agent, question, &model, Vec::new(), charts_dir.as_deref()).await?;
    Ok(())
}

pub async fn chat(
    config_path: Option<PathBuf>,
    model: Option<String>,
    charts_dir: Option<PathBuf>,
) -> Result<()> {
    let cfg = AnalystConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg).await?;
    let mut session = ReplSession::new(model.unwrap_or_else(|| cfg.general.model.clone()));
    println!("analyst chat ({}). /help for commands.", session.model);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "/quit" | "/exit") {
            break;
        }
        if let Some(reply) = handle_command(&mut session, input) {
            println!("{reply}");
            continue;
        }

        let outcome = run_and_print(
            &runtime.agent,
            input,
            &session.model,
            session.history.clone(),
            charts_dir.as_deref(),
        )
        .await;
        match outcome {
            Ok(history) => {
                session.history = history;
                session.turns += 1;
            }
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}

pub async fn tables(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AnalystConfig::load(config_path).await?;
    let runtime = build_runtime(&cfg).await?;
    for table in runtime.executor.list_tables().await? {
        println!("{}\t{}", table.name, table.row_count);
    }
    Ok(())
}

pub async fn transcribe(
    config_path: Option<PathBuf>,
    file: &Path,
    mime: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let cfg = AnalystConfig::load(config_path.clone()).await?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("read audio file {}", file.display()))?;
    let clip = AudioClip {
        bytes: bytes.into(),
        mime: mime.unwrap_or_else(|| mime_for_path(file).to_string()),
    };
    let transcriber = WhisperCliTranscriber::new(&cfg.voice);
    let Some(question) = transcriber.transcribe(&clip).await? else {
        return Err(anyhow::anyhow!("no speech recognized in {}", file.display()));
    };
    eprintln!("Transcribed: {question}");
    ask(config_path, &question, model, None).await
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "audio/webm",
    }
}

/// Runs one turn, printing answer text to stdout and progress to stderr.
/// Returns the log to carry into the next turn.
async fn run_and_print(
    agent: &Arc<AnalystAgent>,
    question: &str,
    model: &str,
    history: Vec<ChatMessage>,
    charts_dir: Option<&Path>,
) -> Result<Vec<ChatMessage>> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted; finishing turn");
                cancel.cancel();
            }
        }
    });

    let mut events = agent.run_turn(
        TurnRequest {
            question: question.to_string(),
            model: model.to_string(),
            history,
        },
        cancel,
    );
    let mut stdout = std::io::stdout();
    let mut memory = None;
    let mut failure = None;
    while let Some(event) = events.next().await {
        match event {
            OutputEvent::TextDelta { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            OutputEvent::ToolStarted {
                name,
                input_summary,
            } => eprintln!("\n[{name}] {input_summary}"),
            OutputEvent::ChartReady { handle } => {
                eprintln!("[chart] {} ({}, {})", handle.title, handle.chart_type.as_str(), handle.id);
                if let Some(dir) = charts_dir {
                    let path = dir.join(format!("{}.json", handle.id));
                    let figure = serde_json::to_vec_pretty(&handle.figure)?;
                    tokio::fs::create_dir_all(dir).await?;
                    tokio::fs::write(&path, figure)
                        .await
                        .with_context(|| format!("write chart {}", path.display()))?;
                    eprintln!("[chart] saved {}", path.display());
                }
            }
            OutputEvent::MemoryUpdate { messages } => memory = Some(messages),
            OutputEvent::Error { message } => failure = Some(message),
        }
    }
    interrupt.abort();
    println!();

    if let Some(message) = failure {
        return Err(anyhow::anyhow!(message));
    }
    memory.ok_or_else(|| anyhow::anyhow!("turn ended without a memory update"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_mime_follows_file_extension() {
        assert_eq!(mime_for_path(Path::new("q.WAV")), "audio/wav");
        assert_eq!(mime_for_path(Path::new("q.mp3")), "audio/mpeg");
        assert_eq!(mime_for_path(Path::new("q.webm")), "audio/webm");
        assert_eq!(mime_for_path(Path::new("q")), "audio/webm");
    }
}
