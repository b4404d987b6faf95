//! Analyst configuration loader.

use analyst_llm::ProviderCredentials;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "analyst.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalystConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// `provider:model`, e.g. `openai:gpt-4o-mini`.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
        }
    }
}

fn default_model() -> String {
    "ollama:llama3.1:8b".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Markdown schema description. Generated from the database when unset.
    #[serde(default)]
    pub schema_path: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            schema_path: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> String {
    "olist.sqlite".to_string()
}

fn default_max_connections() -> usize {
    4
}

/// Whether model text produced between tool calls reaches the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopTextPolicy {
    #[default]
    Stream,
    Suppress,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_sql_row_cap")]
    pub sql_row_cap: usize,
    #[serde(default)]
    pub loop_text: LoopTextPolicy,
    #[serde(default = "default_visualization_keywords")]
    pub visualization_keywords: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_limit: default_history_limit(),
            sql_row_cap: default_sql_row_cap(),
            loop_text: LoopTextPolicy::default(),
            visualization_keywords: default_visualization_keywords(),
        }
    }
}

fn default_max_iterations() -> usize {
    5
}

fn default_history_limit() -> usize {
    10
}

fn default_sql_row_cap() -> usize {
    100
}

pub fn default_visualization_keywords() -> Vec<String> {
    [
        "chart",
        "plot",
        "graph",
        "trend",
        "visualize",
        "bar",
        "line",
        "pie",
        "histogram",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    120
}

fn default_http_max_in_flight() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    /// Local whisper CLI executable.
    #[serde(default = "default_voice_command")]
    pub command: String,
    #[serde(default = "default_voice_model_size")]
    pub model_size: String,
    #[serde(default = "default_voice_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            command: default_voice_command(),
            model_size: default_voice_model_size(),
            timeout_seconds: default_voice_timeout_seconds(),
        }
    }
}

fn default_voice_command() -> String {
    "whisper".to_string()
}

fn default_voice_model_size() -> String {
    "base".to_string()
}

fn default_voice_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_endpoint: Option<String>,
    pub ollama_base_url: Option<String>,
}

impl AnalystConfig {
    /// Loads `path`, or `./analyst.toml` when it exists, or built-in defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    /// Like [`AnalystConfig::load`], also returning the file actually read.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let path = match path {
            Some(explicit) => Some(explicit),
            None => {
                let candidate = default_config_path();
                tokio::fs::try_exists(&candidate)
                    .await
                    .unwrap_or(false)
                    .then_some(candidate)
            }
        };

        let mut cfg = match &path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                Self::parse(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
            }
            None => {
                tracing::debug!("no config file found; using built-in defaults");
                Self::default()
            }
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ANALYST_MODEL") {
            if !v.trim().is_empty() {
                self.general.model = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("ANALYST_DB_PATH") {
            if !v.trim().is_empty() {
                self.database.path = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("ANALYST_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.database.path.trim().is_empty() {
            return Err(anyhow::anyhow!("database.path is required"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("database.max_connections must be > 0"));
        }
        if self.agent.max_iterations == 0 {
            return Err(anyhow::anyhow!("agent.max_iterations must be > 0"));
        }
        if self.agent.history_limit == 0 {
            return Err(anyhow::anyhow!("agent.history_limit must be > 0"));
        }
        if self.agent.sql_row_cap == 0 {
            return Err(anyhow::anyhow!("agent.sql_row_cap must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        Ok(())
    }

    /// Provider credentials from the environment, with `[keys]` taking precedence.
    pub fn credentials(&self) -> ProviderCredentials {
        ProviderCredentials::from_env().overridden_by(ProviderCredentials {
            openai_api_key: self.keys.openai_api_key.clone(),
            anthropic_api_key: self.keys.anthropic_api_key.clone(),
            google_api_key: self.keys.google_api_key.clone(),
            azure_openai_api_key: self.keys.azure_openai_api_key.clone(),
            azure_openai_endpoint: self.keys.azure_openai_endpoint.clone(),
            azure_openai_api_version: None,
            ollama_base_url: self.keys.ollama_base_url.clone(),
        })
    }

    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.database.path)
    }

    pub fn schema_path(&self) -> anyhow::Result<Option<PathBuf>> {
        self.database
            .schema_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_home)
            .transpose()
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(".").join(DEFAULT_CONFIG_FILE)
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}
