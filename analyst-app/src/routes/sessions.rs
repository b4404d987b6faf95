use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionRequest {
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetSessionModelRequest {
    provider: String,
    model: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route("/api/v1/sessions/{id}", delete(delete_session))
        .route("/api/v1/sessions/{id}/model", post(set_session_model))
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_session(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        match serde_json::from_slice::<CreateSessionRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
            }
        }
    };
    let session = state.sessions.create(req.model);
    Json(serde_json::json!({ "id": session.id, "model": session.model }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    Json(serde_json::json!({ "sessions": sessions }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn delete_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Json(serde_json::json!({ "status": "error", "error": "invalid id" }));
    };
    let removed = state.sessions.delete(id);
    Json(serde_json::json!({ "status": if removed { "ok" } else { "not_found" } }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn set_session_model(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetSessionModelRequest>,
) -> Json<serde_json::Value> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Json(serde_json::json!({ "status": "error", "error": "invalid id" }));
    };
    match state.sessions.set_model(id, &req.provider, &req.model) {
        Ok(Some(session)) => Json(serde_json::json!({ "status": "ok", "session": session })),
        Ok(None) => Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use crate::agent::tests::{ScriptedModel, say};
    use crate::server::{router, tests::test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let state = test_state(ScriptedModel::new(Vec::new(), say("-")), None);
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/sessions", serde_json::json!({})))
            .await
            .expect("create");
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        assert_eq!(created["model"], "mock:scripted");
        let id = created["id"].as_str().expect("id").to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/sessions/{id}/model"),
                serde_json::json!({"provider": "openai", "model": "gpt-4o-mini"}),
            ))
            .await
            .expect("set model");
        let updated = json_body(response).await;
        assert_eq!(updated["status"], "ok");
        assert_eq!(updated["session"]["model"], "openai:gpt-4o-mini");

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/sessions").body(Body::empty()).expect("request"))
            .await
            .expect("list");
        let listed = json_body(response).await;
        assert_eq!(listed["sessions"].as_array().map(Vec::len), Some(1));

        let response = app
            .clone()
            .oneshot(
                Request::delete(format!("/api/v1/sessions/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("delete");
        assert_eq!(json_body(response).await["status"], "ok");
        assert!(state.sessions.list().is_empty());
    }

    #[tokio::test]
    async fn invalid_ids_are_reported() {
        let app = router(test_state(ScriptedModel::new(Vec::new(), say("-")), None));
        let response = app
            .oneshot(
                Request::delete("/api/v1/sessions/not-a-uuid")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("delete");
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "invalid id");
    }
}
