use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::{EndpointAuth, OpenAiClient, OpenAiEndpoint};
use crate::types::{ChatMessage, StreamChunk, ToolDefinition};
use async_trait::async_trait;
use futures_util::Stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const GOOGLE_GENAI_CHAT_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
const AZURE_DEFAULT_API_VERSION: &str = "2025-01-01-preview";
const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    GoogleGenAi,
    AzureOpenAi,
    Ollama,
}

impl Provider {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" => Some(Self::Anthropic),
            "google_genai" => Some(Self::GoogleGenAi),
            "azure_openai" => Some(Self::AzureOpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::GoogleGenAi => "google_genai",
            Self::AzureOpenAi => "azure_openai",
            Self::Ollama => "ollama",
        }
    }

    fn is_openai_compatible(self) -> bool {
        !matches!(self, Self::Anthropic)
    }
}

/// Splits `"<provider>:<model>"` at the first colon.
///
/// An unrecognized prefix means the whole string is a bare model name.
pub fn parse_identifier(identifier: &str) -> (Provider, String) {
    let identifier = identifier.trim();
    if let Some((prefix, model)) = identifier.split_once(':') {
        if let Some(provider) = Provider::from_prefix(prefix) {
            return (provider, model.trim().to_string());
        }
    }
    (detect_provider(identifier), identifier.to_string())
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}

/// Keys and endpoints for every provider. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_endpoint: Option<String>,
    pub azure_openai_api_version: Option<String>,
    pub ollama_base_url: Option<String>,
}

impl ProviderCredentials {
    pub fn from_env() -> Self {
        Self {
            openai_api_key: env_nonempty("OPENAI_API_KEY"),
            anthropic_api_key: env_nonempty("ANTHROPIC_API_KEY"),
            google_api_key: env_nonempty("GOOGLE_API_KEY"),
            azure_openai_api_key: env_nonempty("AZURE_OPENAI_API_KEY"),
            azure_openai_endpoint: env_nonempty("AZURE_OPENAI_ENDPOINT"),
            azure_openai_api_version: env_nonempty("AZURE_OPENAI_API_VERSION"),
            ollama_base_url: env_nonempty("OLLAMA_BASE_URL"),
        }
    }

    /// Fields set in `explicit` win over `self`.
    pub fn overridden_by(self, explicit: ProviderCredentials) -> Self {
        fn pick(explicit: Option<String>, fallback: Option<String>) -> Option<String> {
            nonempty(explicit).or_else(|| nonempty(fallback))
        }
        Self {
            openai_api_key: pick(explicit.openai_api_key, self.openai_api_key),
            anthropic_api_key: pick(explicit.anthropic_api_key, self.anthropic_api_key),
            google_api_key: pick(explicit.google_api_key, self.google_api_key),
            azure_openai_api_key: pick(explicit.azure_openai_api_key, self.azure_openai_api_key),
            azure_openai_endpoint: pick(
                explicit.azure_openai_endpoint,
                self.azure_openai_endpoint,
            ),
            azure_openai_api_version: pick(
                explicit.azure_openai_api_version,
                self.azure_openai_api_version,
            ),
            ollama_base_url: pick(explicit.ollama_base_url, self.ollama_base_url),
        }
    }

    /// Names the missing setting for `provider`, if any.
    pub fn missing_for(&self, provider: Provider) -> Option<&'static str> {
        match target_for(provider, "probe", self) {
            Ok(_) => None,
            Err(missing) => Some(missing),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    nonempty(std::env::var(key).ok())
}

fn nonempty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    OpenAiCompatible(OpenAiEndpoint),
    Anthropic { api_key: String },
}

fn target_for(
    provider: Provider,
    model: &str,
    creds: &ProviderCredentials,
) -> std::result::Result<Target, &'static str> {
    match provider {
        Provider::OpenAI => {
            let key = creds.openai_api_key.clone().ok_or("OPENAI_API_KEY")?;
            Ok(Target::OpenAiCompatible(OpenAiEndpoint {
                url: OPENAI_CHAT_URL.to_string(),
                auth: EndpointAuth::Bearer(key),
            }))
        }
        Provider::Anthropic => {
            let api_key = creds.anthropic_api_key.clone().ok_or("ANTHROPIC_API_KEY")?;
            Ok(Target::Anthropic { api_key })
        }
        Provider::GoogleGenAi => {
            let key = creds.google_api_key.clone().ok_or("GOOGLE_API_KEY")?;
            Ok(Target::OpenAiCompatible(OpenAiEndpoint {
                url: GOOGLE_GENAI_CHAT_URL.to_string(),
                auth: EndpointAuth::Bearer(key),
            }))
        }
        Provider::AzureOpenAi => {
            let key = creds
                .azure_openai_api_key
                .clone()
                .ok_or("AZURE_OPENAI_API_KEY")?;
            let endpoint = creds
                .azure_openai_endpoint
                .as_deref()
                .ok_or("AZURE_OPENAI_ENDPOINT")?;
            let version = creds
                .azure_openai_api_version
                .as_deref()
                .unwrap_or(AZURE_DEFAULT_API_VERSION);
            Ok(Target::OpenAiCompatible(OpenAiEndpoint {
                url: format!(
                    "{}/openai/deployments/{model}/chat/completions?api-version={version}",
                    endpoint.trim_end_matches('/')
                ),
                auth: EndpointAuth::ApiKeyHeader(key),
            }))
        }
        Provider::Ollama => {
            let base = creds
                .ollama_base_url
                .as_deref()
                .unwrap_or(OLLAMA_DEFAULT_BASE_URL);
            Ok(Target::OpenAiCompatible(OpenAiEndpoint {
                url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
                auth: EndpointAuth::None,
            }))
        }
    }
}

/// A streaming, tool-binding chat capability.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// The `provider:model` string this capability was resolved from.
    fn identifier(&self) -> &str;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream>;
}

/// Turns a model identifier into a chat capability. Never fails; missing
/// configuration surfaces on the first `stream` call.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, identifier: &str) -> Arc<dyn ChatModel>;
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    model: String,
    identifier: String,
    target: std::result::Result<Target, String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(identifier = %identifier))]
    pub fn new(
        client: reqwest::Client,
        identifier: &str,
        credentials: &ProviderCredentials,
    ) -> Self {
        let (provider, model) = parse_identifier(identifier);
        let target = if model.is_empty() {
            Err(format!("model identifier {identifier:?} names no model"))
        } else {
            target_for(provider, &model, credentials).map_err(|missing| {
                format!(
                    "provider {} requires {missing} to be set",
                    provider.as_str()
                )
            })
        };
        if let Err(reason) = &target {
            tracing::debug!(%reason, "model resolved without usable configuration");
        }
        Self {
            provider,
            model,
            identifier: identifier.trim().to_string(),
            target,
            client,
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = self.provider.as_str(), model = %self.model))]
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        let target = self
            .target
            .as_ref()
            .map_err(|reason| LlmError::Configuration(reason.clone()))?;

        match target {
            Target::OpenAiCompatible(endpoint) => {
                debug_assert!(self.provider.is_openai_compatible());
                let c = OpenAiClient::new(self.client.clone(), endpoint.clone(), &self.model);
                let (tools_sanitized, forward, reverse) = sanitize_tools_for_openai(tools);
                let messages_sanitized = sanitize_messages_for_openai(messages, &forward);
                let stream = c
                    .chat_stream(&messages_sanitized, &tools_sanitized)
                    .await?;
                Ok(Box::pin(stream.map(move |chunk| match chunk {
                    Ok(StreamChunk::ToolCallStart { id, name }) => Ok(StreamChunk::ToolCallStart {
                        id,
                        name: reverse.get(&name).cloned().unwrap_or(name),
                    }),
                    other => other,
                })))
            }
            Target::Anthropic { api_key } => {
                let c = AnthropicClient::new(self.client.clone(), api_key, &self.model);
                c.chat_stream(messages, tools).await
            }
        }
    }
}

/// Resolves identifiers against one shared HTTP client and credential set.
#[derive(Clone)]
pub struct Gateway {
    client: reqwest::Client,
    credentials: ProviderCredentials,
}

impl Gateway {
    pub fn new(credentials: ProviderCredentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            client,
            credentials,
        }
    }}

impl ModelResolver for Gateway {
    fn resolve(&self, identifier: &str) -> Arc<dyn ChatModel> {
        Arc::new(LlmClient::new(
            self.client.clone(),
            identifier,
            &self.credentials,
        ))
    }
}

fn sanitize_tools_for_openai(
    tools: &[ToolDefinition],
) -> (Vec<ToolDefinition>, HashMap<String, String>, HashMap<String, String>) {
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut forward: HashMap<String, String> = HashMap::new(); // original -> sanitized
    let mut reverse: HashMap<String, String> = HashMap::new(); // sanitized -> original
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let mut name = sanitize_openai_tool_name(&t.name);
        if let Some(n) = used.get_mut(&name) {
            *n += 1;
            name = format!("{name}_{}", *n);
        } else {
            used.insert(name.clone(), 0);
        }
        forward.insert(t.name.clone(), name.clone());
        reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    (out, forward, reverse)
}

fn sanitize_messages_for_openai(
    messages: &[ChatMessage],
    forward: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| {
            let mut m2 = m.clone();
            if let ChatMessage::Assistant { tool_calls, .. } = &mut m2 {
                for tc in tool_calls.iter_mut() {
                    tc.name = match forward.get(&tc.name) {
                        Some(s) => s.clone(),
                        // Calls to tools outside the current list still have to validate.
                        None => sanitize_openai_tool_name(&tc.name),
                    };
                }
            }
            m2
        })
        .collect()
}

fn sanitize_openai_tool_name(name: &str) -> String {
    // ^[a-zA-Z0-9_-]+$
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    fn keyed() -> ProviderCredentials {
        ProviderCredentials {
            openai_api_key: Some("sk-openai".to_string()),
            anthropic_api_key: Some("sk-ant".to_string()),
            google_api_key: Some("g-key".to_string()),
            azure_openai_api_key: Some("az-key".to_string()),
            azure_openai_endpoint: Some("https://example.openai.azure.com/".to_string()),
            azure_openai_api_version: None,
            ollama_base_url: None,
        }
    }

    #[test]
    fn identifier_splits_at_first_colon() {
        assert_eq!(
            parse_identifier("ollama:llama3.1:8b"),
            (Provider::Ollama, "llama3.1:8b".to_string())
        );
        assert_eq!(
            parse_identifier("anthropic:claude-3-5-sonnet-latest"),
            (Provider::Anthropic, "claude-3-5-sonnet-latest".to_string())
        );
        assert_eq!(
            parse_identifier("google_genai:gemini-2.0-flash"),
            (Provider::GoogleGenAi, "gemini-2.0-flash".to_string())
        );
    }

    #[test]
    fn unknown_prefix_is_an_opaque_model_name() {
        assert_eq!(
            parse_identifier("claude-3-opus"),
            (Provider::Anthropic, "claude-3-opus".to_string())
        );
        assert_eq!(
            parse_identifier("mystery:model"),
            (Provider::OpenAI, "mystery:model".to_string())
        );
        assert_eq!(
            parse_identifier("gpt-4o-mini"),
            (Provider::OpenAI, "gpt-4o-mini".to_string())
        );
    }

    #[test]
    fn azure_and_ollama_endpoints_are_composed_from_settings() {
        let creds = keyed();
        let azure = target_for(Provider::AzureOpenAi, "gpt-4o", &creds).expect("azure target");
        assert_eq!(
            azure,
            Target::OpenAiCompatible(OpenAiEndpoint {
                url: "https://example.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2025-01-01-preview".to_string(),
                auth: EndpointAuth::ApiKeyHeader("az-key".to_string()),
            })
        );
        let ollama = target_for(Provider::Ollama, "llama3.1:8b", &creds).expect("ollama target");
        assert_eq!(
            ollama,
            Target::OpenAiCompatible(OpenAiEndpoint {
                url: "http://localhost:11434/v1/chat/completions".to_string(),
                auth: EndpointAuth::None,
            })
        );
    }

    #[test]
    fn explicit_credentials_take_precedence_over_env() {
        let env = ProviderCredentials {
            openai_api_key: Some("from-env".to_string()),
            google_api_key: Some("g-env".to_string()),
            ..Default::default()
        };
        let explicit = ProviderCredentials {
            openai_api_key: Some("from-config".to_string()),
            google_api_key: Some("  ".to_string()),
            ..Default::default()
        };
        let merged = env.overridden_by(explicit);
        assert_eq!(merged.openai_api_key.as_deref(), Some("from-config"));
        assert_eq!(merged.google_api_key.as_deref(), Some("g-env"));
        assert_eq!(merged.missing_for(Provider::Anthropic), Some("ANTHROPIC_API_KEY"));
        assert_eq!(merged.missing_for(Provider::Ollama), None);
    }

    #[tokio::test]
    async fn missing_credentials_fail_on_first_stream_call() {
        let gateway = Gateway::new(ProviderCredentials::default());
        let model = gateway.resolve("anthropic:claude-3-5-sonnet-latest");
        assert_eq!(model.identifier(), "anthropic:claude-3-5-sonnet-latest");
        let err = match model.stream(&[ChatMessage::user("hi")], &[]).await {
            Ok(_) => panic!("stream without a key must fail"),
            Err(e) => e,
        };
        assert!(err.is_configuration());
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn openai_tool_names_are_sanitized_and_unique() {
        let tools = vec![
            ToolDefinition {
                name: "sql.execute".to_string(),
                description: "run sql".to_string(),
                parameters: json!({}),
            },
            ToolDefinition {
                name: "sql_execute".to_string(),
                description: "run sql 2".to_string(),
                parameters: json!({}),
            },
        ];

        let (sanitized, forward, reverse) = sanitize_tools_for_openai(&tools);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.iter().all(|t| {
            t.name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }));
        assert_ne!(sanitized[0].name, sanitized[1].name);

        let s1 = forward.get("sql.execute").expect("forward mapping exists");
        let s2 = forward.get("sql_execute").expect("forward mapping exists");
        assert_eq!(reverse.get(s1).expect("reverse mapping exists"), "sql.execute");
        assert_eq!(reverse.get(s2).expect("reverse mapping exists"), "sql_execute");
    }

    #[test]
    fn assistant_tool_calls_are_sanitized_before_send() {
        let tools = vec![ToolDefinition {
            name: "sql.execute".to_string(),
            description: "run sql".to_string(),
            parameters: json!({}),
        }];
        let (_sanitized, forward, _reverse) = sanitize_tools_for_openai(&tools);

        let messages = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant_with_calls(
                "",
                vec![
                    ToolCall {
                        id: "tc1".to_string(),
                        name: "sql.execute".to_string(),
                        arguments: "{}".to_string(),
                    },
                    ToolCall {
                        id: "tc2".to_string(),
                        name: "make chart".to_string(),
                        arguments: "{}".to_string(),
                    },
                ],
            ),
        ];

        let sanitized = sanitize_messages_for_openai(&messages, &forward);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[1].tool_calls()[0].name, "sql_execute");
        assert_eq!(sanitized[1].tool_calls()[1].name, "make_chart");
    }
}
