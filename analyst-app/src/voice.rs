//! Speech to question text via the local `whisper` CLI.

use crate::config::VoiceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Bytes,
    pub mime: String,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `None` when the audio contained no recognizable speech.
    async fn transcribe(&self, clip: &AudioClip) -> Result<Option<String>>;
}

pub struct WhisperCliTranscriber {
    command: String,
    model_size: String,
    timeout: Duration,
}

impl WhisperCliTranscriber {
    pub fn new(cfg: &VoiceConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            model_size: cfg.model_size.clone(),
            timeout: Duration::from_secs(cfg.timeout_seconds),
        }
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("wav") {
        "wav"
    } else if mime.contains("mpeg") || mime.contains("mp3") {
        "mp3"
    } else {
        "webm"
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    #[tracing::instrument(level = "info", skip_all, fields(mime = %clip.mime, bytes = clip.bytes.len()))]
    async fn transcribe(&self, clip: &AudioClip) -> Result<Option<String>> {
        if clip.bytes.is_empty() {
            return Ok(None);
        }
        let dir = tempfile::tempdir().context("create transcription temp dir")?;
        let audio_path = dir
            .path()
            .join(format!("recording.{}", extension_for_mime(&clip.mime)));
        tokio::fs::write(&audio_path, &clip.bytes)
            .await
            .with_context(|| format!("write audio clip to {}", audio_path.display()))?;

        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg(&audio_path)
            .arg("--model")
            .arg(&self.model_size)
            .arg("--output_format")
            .arg("txt")
            .arg("--output_dir")
            .arg(dir.path())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!("{} timed out after {}s", self.command, self.timeout.as_secs())
            })?
            .with_context(|| format!("spawn {}", self.command))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            ));
        }

        let transcript = read_transcript(&audio_path).await?;
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            chars = transcript.as_deref().map_or(0, str::len),
            "audio transcribed"
        );
        Ok(transcript)
    }
}

/// Whisper writes `<stem>.txt` next to the requested output dir.
async fn read_transcript(audio_path: &Path) -> Result<Option<String>> {
    let txt_path = audio_path.with_extension("txt");
    let text = tokio::fs::read_to_string(&txt_path)
        .await
        .with_context(|| format!("read transcript {}", txt_path.display()))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_pick_file_extensions() {
        assert_eq!(extension_for_mime("audio/wav"), "wav");
        assert_eq!(extension_for_mime("audio/x-wav"), "wav");
        assert_eq!(extension_for_mime("audio/mpeg"), "mp3");
        assert_eq!(extension_for_mime("audio/webm;codecs=opus"), "webm");
        assert_eq!(extension_for_mime(""), "webm");
    }

    #[tokio::test]
    async fn empty_clip_transcribes_to_none() {
        let transcriber = WhisperCliTranscriber::new(&VoiceConfig::default());
        let clip = AudioClip {
            bytes: Bytes::new(),
            mime: "audio/webm".to_string(),
        };
        assert_eq!(transcriber.transcribe(&clip).await.expect("transcribe"), None);
    }

    #[tokio::test]
    async fn transcript_is_trimmed_and_blank_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audio = dir.path().join("recording.webm");
        std::fs::write(audio.with_extension("txt"), "  How many customers?\n").expect("write");
        assert_eq!(
            read_transcript(&audio).await.expect("read"),
            Some("How many customers?".to_string())
        );
        std::fs::write(audio.with_extension("txt"), "\n\n").expect("write");
        assert_eq!(read_transcript(&audio).await.expect("read"), None);
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let transcriber = WhisperCliTranscriber {
            command: "definitely-not-a-whisper-binary".to_string(),
            model_size: "base".to_string(),
            timeout: Duration::from_secs(5),
        };
        let clip = AudioClip {
            bytes: Bytes::from_static(b"RIFF...."),
            mime: "audio/wav".to_string(),
        };
        assert!(transcriber.transcribe(&clip).await.is_err());
    }
}
