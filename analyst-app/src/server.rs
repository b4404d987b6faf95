//! Analyst HTTP server and the wiring shared with the CLI commands.

use crate::agent::{AgentSettings, AnalystAgent};
use crate::config::AnalystConfig;
use crate::routes;
use crate::session::SessionManager;
use crate::voice::{Transcriber, WhisperCliTranscriber};
use analyst_llm::{Gateway, parse_identifier};
use analyst_tools::{ChartTool, QueryExecutor, SqlTool, SqliteExecutor, Tool};
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub agent: Arc<AnalystAgent>,
    pub sessions: Arc<SessionManager>,
    pub transcriber: Arc<dyn Transcriber>,
    pub default_model: String,
    /// Cancelled on shutdown; turns run on child tokens.
    pub shutdown: CancellationToken,
    /// Bounds agent turns still running after their response headers went out.
    pub turn_permits: Arc<Semaphore>,
}

/// A ready agent plus the executor it queries through.
pub struct AnalystRuntime {
    pub agent: Arc<AnalystAgent>,
    pub executor: Arc<SqliteExecutor>,
}

pub async fn build_runtime(cfg: &AnalystConfig) -> Result<AnalystRuntime> {
    let db_path = cfg.database_path()?;
    if !tokio::fs::try_exists(&db_path).await.unwrap_or(false) {
        return Err(anyhow::anyhow!(
            "database not found at {}; set database.path or ANALYST_DB_PATH",
            db_path.display()
        ));
    }
    let executor = Arc::new(SqliteExecutor::new(&db_path, cfg.database.max_connections));

    let schema = match cfg.schema_path()? {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read schema {}: {e}", path.display()))?,
        None => executor.describe_schema().await?,
    };

    let query: Arc<dyn QueryExecutor> = executor.clone();
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(SqlTool::new(query.clone(), cfg.agent.sql_row_cap)),
        Arc::new(ChartTool::new(query, cfg.agent.sql_row_cap)),
    ];
    let gateway = Arc::new(Gateway::new(cfg.credentials()));
    let agent = Arc::new(AnalystAgent::new(
        gateway,
        tools,
        &schema,
        AgentSettings::from(&cfg.agent),
    ));
    tracing::info!(
        database = %db_path.display(),
        schema_chars = schema.len(),
        model = %cfg.general.model,
        max_iterations = cfg.agent.max_iterations,
        history_limit = cfg.agent.history_limit,
        "analyst runtime ready"
    );
    Ok(AnalystRuntime { agent, executor })
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AnalystConfig::load_with_path(config_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        config_path = %path.as_ref().map_or("<defaults>".to_string(), |p| p.display().to_string()),
        "config ok"
    );

    let runtime = build_runtime(&cfg).await?;
    let tables = runtime.executor.list_tables().await?;
    if tables.is_empty() {
        return Err(anyhow::anyhow!(
            "database {} has no tables",
            runtime.executor.path().display()
        ));
    }
    tracing::info!(tables = tables.len(), "database ok");

    let (provider, model) = parse_identifier(&cfg.general.model);
    match cfg.credentials().missing_for(provider) {
        None => tracing::info!(provider = provider.as_str(), %model, "credentials ok"),
        Some(missing) => {
            return Err(anyhow::anyhow!(
                "provider {} requires {missing} to be set",
                provider.as_str()
            ));
        }
    }
    Ok(())
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    routes::router().layer(Extension(state))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AnalystConfig::load_with_path(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.general.model,
        config_path = ?path,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;
    let runtime = build_runtime(&cfg).await?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        agent: runtime.agent,
        sessions: Arc::new(SessionManager::new(cfg.general.model.clone())),
        transcriber: Arc::new(WhisperCliTranscriber::new(&cfg.voice)),
        default_model: cfg.general.model.clone(),
        shutdown: shutdown.clone(),
        turn_permits: Arc::new(Semaphore::new(cfg.server.http_max_in_flight)),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router(state)
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "analyst serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    shutdown.cancel();
    tracing::info!("http server shutdown completed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    tracing::debug!(%addr, "listener bound");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::tests::ScriptedModel;
    use crate::voice::AudioClip;
    use async_trait::async_trait;

    /// Returns a fixed transcript without touching the filesystem.
    pub(crate) struct FixedTranscriber(pub(crate) Option<String>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, clip: &AudioClip) -> Result<Option<String>> {
            if clip.bytes.is_empty() {
                return Ok(None);
            }
            Ok(self.0.clone())
        }
    }

    pub(crate) fn test_state(model: Arc<ScriptedModel>, transcript: Option<&str>) -> Arc<AppState> {
        Arc::new(AppState {
            agent: crate::agent::tests::agent(model),
            sessions: Arc::new(SessionManager::new("mock:scripted")),
            transcriber: Arc::new(FixedTranscriber(transcript.map(str::to_string))),
            default_model: "mock:scripted".to_string(),
            shutdown: CancellationToken::new(),
            turn_permits: Arc::new(Semaphore::new(1)),
        })
    }

    #[tokio::test]
    async fn runtime_requires_an_existing_database() {
        let mut cfg = AnalystConfig::default();
        cfg.database.path = "/definitely/missing/olist.sqlite".to_string();
        let err = build_runtime(&cfg).await.err().expect("missing db is an error");
        assert!(err.to_string().contains("database not found"));
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        assert_eq!(request_id_from_headers(&HeaderMap::new()), "missing");
    }
}
