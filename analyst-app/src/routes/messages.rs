//! Chat turns over HTTP, streamed back as one JSON event per line.

use crate::agent::TurnRequest;
use crate::events::OutputEvent;
use crate::server::AppState;
use crate::voice::AudioClip;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

const NDJSON: &str = "application/x-ndjson";
const DEFAULT_AUDIO_MIME: &str = "audio/webm";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PostMessageRequest {
    content: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions/{id}/messages", post(post_message))
        .route("/api/v1/sessions/{id}/audio", post(post_audio))
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PostMessageRequest>,
) -> Response {
    let id = match existing_session(&state, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let question = req.content.trim().to_string();
    if question.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "content is required");
    }
    stream_turn(state, id, question, Vec::new())
}

#[tracing::instrument(level = "info", skip_all, fields(bytes = body.len()))]
async fn post_audio(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match existing_session(&state, &id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if body.is_empty() {
        return single_error_line("empty audio upload");
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_AUDIO_MIME)
        .to_string();
    let clip = AudioClip { bytes: body, mime };
    match state.transcriber.transcribe(&clip).await {
        Ok(Some(text)) => {
            tracing::info!(session_id = %id, chars = text.len(), "audio question transcribed");
            let preface = serde_json::json!({ "type": "transcription", "text": text });
            stream_turn(state, id, text, vec![line_for(&preface)])
        }
        Ok(None) => single_error_line("no speech recognized in audio"),
        Err(e) => {
            tracing::warn!(session_id = %id, error = %e, "transcription failed");
            single_error_line(&format!("transcription failed: {e:#}"))
        }
    }
}

fn existing_session(state: &AppState, raw: &str) -> Result<Uuid, Response> {
    let Ok(id) = Uuid::parse_str(raw) else {
        return Err(error_json(StatusCode::BAD_REQUEST, "invalid id"));
    };
    if state.sessions.get(id).is_none() {
        return Err(error_json(StatusCode::NOT_FOUND, "session not found"));
    }
    Ok(id)
}

fn stream_turn(state: Arc<AppState>, id: Uuid, question: String, preface: Vec<String>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    for line in preface {
        let _ = tx.send(line);
    }
    tokio::spawn(forward_turn(state, id, question, tx));
    ndjson_response(rx)
}

/// Runs the turn to completion even if the client goes away, so the
/// session still records what happened.
async fn forward_turn(state: Arc<AppState>, id: Uuid, question: String, tx: UnboundedSender<String>) {
    let Ok(_permit) = state.turn_permits.clone().acquire_owned().await else {
        let _ = tx.send(error_line("server is shutting down"));
        return;
    };
    let Some(turn) = state.sessions.begin_turn(id).await else {
        let _ = tx.send(error_line("session not found"));
        return;
    };
    let cancel = state.shutdown.child_token();
    let request = TurnRequest {
        question,
        model: turn.model.clone(),
        history: turn.history(),
    };
    let mut turn = Some(turn);
    let mut events = state.agent.run_turn(request, cancel.clone());
    let mut client_gone = false;

    while let Some(event) = events.next().await {
        let line = match event {
            OutputEvent::MemoryUpdate { messages } => {
                let count = messages.len();
                if let Some(turn) = turn.take() {
                    state.sessions.finish_turn(turn, messages);
                }
                line_for(&serde_json::json!({ "type": "memory", "messages": count }))
            }
            other => match serde_json::to_value(&other) {
                Ok(value) => line_for(&value),
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize turn event");
                    continue;
                }
            },
        };
        if !client_gone && tx.send(line).is_err() {
            tracing::info!(session_id = %id, "client disconnected; cancelling turn");
            client_gone = true;
            cancel.cancel();
        }
    }
}

fn line_for(value: &serde_json::Value) -> String {
    format!("{value}\n")
}

fn error_line(message: &str) -> String {
    line_for(&serde_json::json!({ "type": "error", "message": message }))
}

fn single_error_line(message: &str) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(error_line(message));
    ndjson_response(rx)
}

fn ndjson_response(rx: UnboundedReceiver<String>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(Bytes::from(line)), rx))
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(stream)).into_response()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::agent::tests::{ScriptedModel, call, say};
    use crate::server::{router, tests::test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn ndjson_lines(response: axum::response::Response) -> Vec<serde_json::Value> {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 22)
            .await
            .expect("body");
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    fn counting_model() -> std::sync::Arc<ScriptedModel> {
        ScriptedModel::new(
            vec![
                call(
                    "c1",
                    "execute_sql",
                    serde_json::json!({"query": "SELECT COUNT(*) FROM customers"}),
                ),
                say("There are 99441 customers."),
                say("- 99441 customers."),
            ],
            say("- unused"),
        )
    }

    #[tokio::test]
    async fn message_turn_streams_events_and_stores_memory() {
        let state = test_state(counting_model(), None);
        let id = state.sessions.create(None).id;
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::post(format!("/api/v1/sessions/{id}/messages"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "How many customers are there?"}"#))
                    .expect("request"),
            )
            .await
            .expect("post message");
        assert_eq!(response.status(), StatusCode::OK);
        let lines = ndjson_lines(response).await;

        assert_eq!(lines[0]["type"], "tool_started");
        assert_eq!(lines[0]["name"], "execute_sql");
        let last = lines.last().expect("lines");
        assert_eq!(last["type"], "memory");
        assert_eq!(last["messages"], 7);
        assert!(lines.iter().all(|l| l["type"] != "memory_update"));
        assert_eq!(state.sessions.get(id).expect("session").messages, 7);
    }

    #[tokio::test]
    async fn audio_turn_starts_with_transcription() {
        let state = test_state(counting_model(), Some("How many customers are there?"));
        let id = state.sessions.create(None).id;
        let response = router(state)
            .oneshot(
                Request::post(format!("/api/v1/sessions/{id}/audio"))
                    .header("content-type", "audio/wav")
                    .body(Body::from(vec![1u8, 2, 3]))
                    .expect("request"),
            )
            .await
            .expect("post audio");
        let lines = ndjson_lines(response).await;
        assert_eq!(lines[0]["type"], "transcription");
        assert_eq!(lines[0]["text"], "How many customers are there?");
        assert_eq!(lines.last().expect("lines")["type"], "memory");
    }

    #[tokio::test]
    async fn empty_or_silent_audio_yields_one_error_line() {
        let state = test_state(counting_model(), None);
        let id = state.sessions.create(None).id;
        let app = router(state);

        for body in [Vec::new(), vec![0u8; 16]] {
            let response = app
                .clone()
                .oneshot(
                    Request::post(format!("/api/v1/sessions/{id}/audio"))
                        .body(Body::from(body))
                        .expect("request"),
                )
                .await
                .expect("post audio");
            let lines = ndjson_lines(response).await;
            assert_eq!(lines.len(), 1);
            assert_eq!(lines[0]["type"], "error");
        }
    }

    #[tokio::test]
    async fn turns_wait_for_a_free_permit() {
        use futures_util::StreamExt;

        let state = test_state(counting_model(), None);
        let id = state.sessions.create(None).id;
        let held = state
            .turn_permits
            .clone()
            .acquire_owned()
            .await
            .expect("permit");

        let response = router(state.clone())
            .oneshot(
                Request::post(format!("/api/v1/sessions/{id}/messages"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "How many customers are there?"}"#))
                    .expect("request"),
            )
            .await
            .expect("post message");
        let mut body = response.into_body().into_data_stream();
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(50), body.next()).await;
        assert!(waiting.is_err(), "turn ran without a permit");

        drop(held);
        let mut raw = Vec::new();
        while let Some(chunk) = body.next().await {
            raw.extend_from_slice(&chunk.expect("chunk"));
        }
        let text = String::from_utf8_lossy(&raw);
        let last: serde_json::Value =
            serde_json::from_str(text.lines().last().expect("lines")).expect("json line");
        assert_eq!(last["type"], "memory");
        assert_eq!(state.sessions.get(id).expect("session").messages, 7);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let app = router(test_state(counting_model(), None));
        let response = app
            .oneshot(
                Request::post(format!("/api/v1/sessions/{}/messages", uuid::Uuid::new_v4()))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "hi"}"#))
                    .expect("request"),
            )
            .await
            .expect("post message");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
