//! HTTP surface: chat endpoints, SSE streaming of agent turns, cookie
//! sessions and sandboxed workspace file serving.

use crate::document::SessionMode;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::runner::SseEvent;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

const SESSION_COOKIE: &str = "stats_agent_session";
const USER_COOKIE: &str = "stats_agent_user";
const COOKIE_MAX_AGE_SECS: i64 = 30 * 24 * 3600;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Run status for client reattach
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub user_message_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    session_id: Uuid,
    user_message_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ChatAccepted {
    session_id: Uuid,
    user_message_id: Uuid,
}

/// Error wrapper mapping engine failures onto HTTP statuses. Internal
/// detail goes to logs only.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            e if e.is_not_found() => (StatusCode::NOT_FOUND, "not found".to_string()),
            EngineError::RunActive(_) => {
                (StatusCode::CONFLICT, "a run is already active".to_string())
            }
            EngineError::Config(_) => (StatusCode::BAD_REQUEST, "invalid request".to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        warn!("API error ({status}): {}", self.0);
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the HTTP router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/chat", post(chat_post_handler))
        .route("/chat/new", get(chat_new_handler))
        .route("/chat/stream", get(chat_stream_handler))
        .route("/chat/stop", post(chat_stop_handler))
        .route("/chat/status", get(chat_status_handler))
        .route("/chat/{session_id}", get(chat_page_handler))
        .route("/chat/{session_id}", delete(chat_delete_handler))
        .route("/workspaces/{session_id}/{*filepath}", get(workspace_file_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Session id from the cookie when it names a live session, otherwise a
/// fresh placeholder session plus its Set-Cookie line
async fn resolve_session(
    state: &AppState,
    headers: &HeaderMap,
    secure: bool,
    set_cookies: &mut Vec<String>,
) -> ApiResult<Uuid> {
    if let Some(id) = cookie_value(headers, SESSION_COOKIE).and_then(|v| Uuid::parse_str(&v).ok())
    {
        if state.engine.store.get_session(id).await.is_ok() {
            return Ok(id);
        }
    }

    let session = state.engine.create_session(None, SessionMode::Dataset).await?;
    set_cookies.push(build_cookie(SESSION_COOKIE, &session.id.to_string(), secure));
    Ok(session.id)
}

/// Render the chat shell; mint session and user cookies when absent
async fn index_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let secure = is_secure_request(&headers);
    let mut set_cookies: Vec<String> = Vec::new();

    let session_id = resolve_session(&state, &headers, secure, &mut set_cookies).await?;

    if cookie_value(&headers, USER_COOKIE).is_none() {
        set_cookies.push(build_cookie(USER_COOKIE, &Uuid::new_v4().to_string(), secure));
    }

    let mut response = Html(format!(
        "<!doctype html><html><body data-session=\"{session_id}\">\
         <h1>Statistics Agent</h1></body></html>"
    ))
    .into_response();
    for cookie in set_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    Ok(response)
}

/// Clear the session cookie and start over
async fn chat_new_handler(headers: HeaderMap) -> Response {
    let secure = is_secure_request(&headers);
    let mut response = Redirect::to("/").into_response();
    if let Ok(value) = clear_cookie(SESSION_COOKIE, secure).parse() {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Load an existing session's messages
async fn chat_page_handler(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<Uuid>,
) -> ApiResult<Json<Vec<crate::document::ChatMessage>>> {
    state.engine.store.get_session(session_id).await?;
    let messages = state.engine.store.list_messages(session_id).await?;
    Ok(Json(messages))
}

/// Accept a user message plus an optional file upload
async fn chat_post_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let secure = is_secure_request(&headers);

    let mut message_text = String::new();
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => {
                message_text = field.text().await.unwrap_or_default();
            }
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                if let Ok(bytes) = field.bytes().await {
                    upload = Some((filename, bytes.to_vec()));
                }
            }
            _ => {}
        }
    }

    if message_text.trim().is_empty() && upload.is_none() {
        return Err(EngineError::Config("empty message".to_string()).into());
    }

    let mut set_cookies: Vec<String> = Vec::new();
    let session_id = resolve_session(&state, &headers, secure, &mut set_cookies).await?;

    if let Some((filename, data)) = upload {
        if filename.to_lowercase().ends_with(".pdf") {
            let pages = state.engine.upload_pdf(session_id, &filename, &data).await?;
            info!("Indexed {pages} PDF pages for session {session_id}");
        } else {
            state.engine.upload_dataset(session_id, &filename, &data).await?;
        }
    }

    let message = state.engine.submit_user_message(session_id, &message_text).await?;

    let mut response = Json(ChatAccepted { session_id, user_message_id: message.id }).into_response();
    for cookie in set_cookies {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    Ok(response)
}

/// SSE stream of one agent turn
async fn chat_stream_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<SseEvent>(64);

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine
            .runner
            .run_turn(params.session_id, params.user_message_id, tx.clone())
            .await
        {
            warn!("Agent run failed: {e}");
            let _ = tx
                .send(SseEvent::Error { content: "agent run failed".to_string() })
                .await;
            let _ = tx.send(SseEvent::End).await;
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Some((Ok(Event::default().data(data)), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Cancel the session's active run
async fn chat_stop_handler(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Json<serde_json::Value> {
    let stopped = state.engine.registry.stop(params.session_id);
    Json(serde_json::json!({ "stopped": stopped }))
}

/// Liveness for client reattach after reconnect
async fn chat_status_handler(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Json<StatusResponse> {
    let user_message_id = state.engine.registry.status(params.session_id);
    Json(StatusResponse { running: user_message_id.is_some(), user_message_id })
}

/// Delete a session and cascade its workspace
async fn chat_delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath(session_id): UrlPath<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    require_session_ownership(&headers, session_id)?;
    state.engine.delete_session(session_id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// Serve a generated file from the session workspace. Ownership is checked
/// against the session cookie and the path is confined to the workspace
/// subtree.
async fn workspace_file_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath((session_id, filepath)): UrlPath<(Uuid, String)>,
) -> ApiResult<Response> {
    require_session_ownership(&headers, session_id)?;

    let relative = sanitize_relative_path(&filepath)
        .ok_or_else(|| EngineError::Config("invalid file path".to_string()))?;

    let full = state.engine.workspace_path(session_id).join(relative);
    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|_| EngineError::NotFound(filepath.clone()))?;

    let content_type = guess_content_type(&filepath);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

fn require_session_ownership(headers: &HeaderMap, session_id: Uuid) -> ApiResult<()> {
    let owner = cookie_value(headers, SESSION_COOKIE)
        .and_then(|v| Uuid::parse_str(&v).ok())
        .filter(|id| *id == session_id);
    if owner.is_none() {
        return Err(EngineError::NotFound(format!("session {session_id}")).into());
    }
    Ok(())
}

/// Reject absolute paths and any parent-directory component
pub fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    if raw.is_empty() || raw.contains('\\') {
        return None;
    }
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn guess_content_type(path: &str) -> &'static str {
    match path.rsplit('.').next().map(|e| e.to_lowercase()).as_deref() {
        Some("html") => "text/html; charset=utf-8",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Read one cookie value from the request headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// HttpOnly + SameSite=Lax cookie, Secure when the request arrived over HTTPS
pub fn build_cookie(name: &str, value: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn clear_cookie(name: &str, secure: bool) -> String {
    let mut cookie = format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// HTTPS detection behind proxies: direct TLS is invisible here, so trust
/// the standard forwarding headers
pub fn is_secure_request(headers: &HeaderMap) -> bool {
    let header_is = |name: &str, expected: &[&str]| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| expected.contains(&v.to_lowercase().trim()))
            .unwrap_or(false)
    };

    if header_is("x-forwarded-proto", &["https"]) || header_is("x-forwarded-scheme", &["https"]) {
        return true;
    }
    if header_is("x-forwarded-ssl", &["on", "1", "true"]) {
        return true;
    }
    if headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("proto=https"))
        .unwrap_or(false)
    {
        return true;
    }
    // Cf-Visitor: {"scheme":"https"}
    headers
        .get("cf-visitor")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| serde_json::from_str::<serde_json::Value>(v).ok())
        .and_then(|v| v.get("scheme").and_then(|s| s.as_str()).map(|s| s == "https"))
        .unwrap_or(false)
}

/// Serve the API on the configured bind address
pub async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    let addr = engine.config.server.bind_addr.clone();
    let app = create_router(AppState { engine });

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_cookie_round_trip() {
        let id = Uuid::new_v4().to_string();
        let cookie = build_cookie(SESSION_COOKIE, &id, false);
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=2592000"));
        assert!(!cookie.contains("Secure"));

        let headers = headers_with("cookie", &format!("other=1; {SESSION_COOKIE}={id}"));
        assert_eq!(cookie_value(&headers, SESSION_COOKIE).as_deref(), Some(id.as_str()));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_secure_flag_added_over_https() {
        let cookie = build_cookie(SESSION_COOKIE, "x", true);
        assert!(cookie.ends_with("; Secure"));
    }

    #[test]
    fn test_is_secure_request_variants() {
        assert!(is_secure_request(&headers_with("x-forwarded-proto", "https")));
        assert!(is_secure_request(&headers_with("x-forwarded-scheme", "https")));
        assert!(is_secure_request(&headers_with("x-forwarded-ssl", "on")));
        assert!(is_secure_request(&headers_with("x-forwarded-ssl", "1")));
        assert!(is_secure_request(&headers_with(
            "forwarded",
            "for=1.2.3.4;proto=https;by=proxy"
        )));
        assert!(is_secure_request(&headers_with("cf-visitor", "{\"scheme\":\"https\"}")));

        assert!(!is_secure_request(&headers_with("x-forwarded-proto", "http")));
        assert!(!is_secure_request(&headers_with("cf-visitor", "{\"scheme\":\"http\"}")));
        assert!(!is_secure_request(&HeaderMap::new()));
    }

    #[test]
    fn test_sanitize_relative_path_guards_traversal() {
        assert_eq!(
            sanitize_relative_path("plots/figure1.png"),
            Some(PathBuf::from("plots/figure1.png"))
        );
        assert_eq!(sanitize_relative_path("./report.html"), Some(PathBuf::from("report.html")));

        assert_eq!(sanitize_relative_path("../secrets.txt"), None);
        assert_eq!(sanitize_relative_path("plots/../../etc/passwd"), None);
        assert_eq!(sanitize_relative_path("/etc/passwd"), None);
        assert_eq!(sanitize_relative_path(""), None);
        assert_eq!(sanitize_relative_path("a\\..\\b"), None);
    }

    #[test]
    fn test_sse_event_envelope_shape() {
        let chunk = serde_json::to_value(SseEvent::Chunk { content: "hi".to_string() }).unwrap();
        assert_eq!(chunk, serde_json::json!({"type": "chunk", "content": "hi"}));

        let end = serde_json::to_value(SseEvent::End).unwrap();
        assert_eq!(end, serde_json::json!({"type": "end"}));

        let established = serde_json::to_value(SseEvent::ConnectionEstablished).unwrap();
        assert_eq!(established, serde_json::json!({"type": "connection_established"}));
    }

    #[test]
    fn test_content_type_guesses() {
        assert_eq!(guess_content_type("plot.png"), "image/png");
        assert_eq!(guess_content_type("data.csv"), "text/csv");
        assert_eq!(guess_content_type("mystery"), "application/octet-stream");
    }
}
