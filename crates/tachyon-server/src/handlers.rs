use std::time::SystemTime;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    service::{NewNote, NoteError},
    AppState,
};

// ── Errors ───────────────────────────────────────────────────────────────────

impl NoteError {
    pub fn status(&self) -> StatusCode {
        match self {
            NoteError::NotFound => StatusCode::NOT_FOUND,
            NoteError::Unauthorized => StatusCode::UNAUTHORIZED,
            NoteError::Validation(_) => StatusCode::BAD_REQUEST,
            NoteError::Conflict | NoteError::DuplicateKey | NoteError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            NoteError::IntegrityFailure(_) | NoteError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for NoteError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            NoteError::IntegrityFailure(_) | NoteError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                "internal server error".to_owned()
            }
            NoteError::ServiceUnavailable(_) => {
                tracing::warn!(error = %self, "service unavailable");
                "service temporarily unavailable".to_owned()
            }
            _ => self.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    let now = humantime::format_rfc3339_nanos(SystemTime::now()).to_string();
    Json(json!({ "server_time": now }))
}

pub async fn stat(State(state): State<AppState>) -> Result<Response, NoteError> {
    Ok(Json(state.notes.stats().await?).into_response())
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub max_number_visits: u32,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub encrypt_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub sign: String,
}

pub async fn create_note(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Response, NoteError> {
    let Json(body) = payload.map_err(|e| NoteError::Validation(e.body_text()))?;
    let sign = state
        .notes
        .create_note(NewNote {
            name: body.name,
            text: body.text,
            max_visits: body.max_number_visits,
            is_encrypted: body.is_encrypted,
            password: body.encrypt_password,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(CreateResponse { sign })).into_response())
}

// ── Read ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReadParams {
    pub password: Option<String>,
}

pub async fn read_note(
    State(state): State<AppState>,
    Path(sign): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Response, NoteError> {
    let content = state.notes.read_note(&sign, params.password.as_deref()).await?;
    Ok(Json(content).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::crypto::CryptoBox;
    use crate::hasher::{fast_config, PasswordHasher};
    use crate::service::{NoteService, ServiceConfig};
    use crate::store::RedbNoteStore;

    fn make_app() -> (axum::Router, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbNoteStore::open(&dir.path().join("http.db"), "notes").unwrap();
        let notes = NoteService::new(
            Arc::new(store),
            CryptoBox::default(),
            PasswordHasher::new(fast_config()),
            ServiceConfig::default(),
        );
        (crate::server::router(AppState { notes }), dir)
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_note(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/note/")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_server_time() {
        let (app, _dir) = make_app();
        let (status, body) = send(&app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["server_time"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn create_then_read_once() {
        let (app, _dir) = make_app();
        let (status, body) = send(
            &app,
            post_note(json!({"name": "n", "text": "hello", "max_number_visits": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let sign = body["sign"].as_str().unwrap().to_owned();

        let (status, body) = send(&app, get(&format!("/api/note/{sign}/"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"name": "n", "message": "hello"}));

        let (status, body) = send(&app, get(&format!("/api/note/{sign}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn encrypted_note_needs_password() {
        let (app, _dir) = make_app();
        let (_, body) = send(
            &app,
            post_note(json!({
                "name": "n",
                "text": "hidden",
                "is_encrypted": true,
                "encrypt_password": "s3cret",
            })),
        )
        .await;
        let sign = body["sign"].as_str().unwrap().to_owned();

        let (status, _) = send(&app, get(&format!("/api/note/{sign}/?password=nope"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, get(&format!("/api/note/{sign}/?password=s3cret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "hidden");
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let (app, _dir) = make_app();

        let (status, _) = send(&app, get("/api/note/123/")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post_note(json!({"name": "n", "text": "t", "is_encrypted": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_create_body_is_a_json_400() {
        let (app, _dir) = make_app();

        let (status, body) = send(&app, post_note(json!({"name": "no text"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("text"));

        let request = Request::builder()
            .method("POST")
            .uri("/api/note")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let request = Request::builder()
            .method("POST")
            .uri("/api/note/")
            .body(Body::from("name=n"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn monitoring_routes() {
        let (app, _dir) = make_app();

        let (status, body) = send(&app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["server_time"].is_string());

        let (_, body) = send(&app, get("/api/stat")).await;
        assert_eq!(body, json!({"current_notes_count": 0}));

        send(&app, post_note(json!({"name": "n", "text": "t"}))).await;
        let (status, body) = send(&app, get("/api/stat")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_notes_count"], 1);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(NoteError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(NoteError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            NoteError::ServiceUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(NoteError::Conflict.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            NoteError::IntegrityFailure("bad tag".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
