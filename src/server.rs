//! HTTP surface with bearer-key authentication
//!
//! Builds the axum router, validates requests at the boundary, calls one
//! [`Mailbox`] or [`Composer`] operation per request and shapes the response.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::compose::{self, Composer};
use crate::errors::{AppError, AppResult};
use crate::imap::Mailbox;
use crate::models::{
    EmailBody, FolderQuery, FoldersResponse, ListEmailsQuery, MessageResponse, MessageSummary,
    MoveQuery, SendEmailRequest, ThreadedEmailRequest,
};

/// Folder drafts are appended to
const DRAFTS_FOLDER: &str = "Drafts";
/// Maximum folder name length in characters
const MAX_FOLDER_CHARS: usize = 256;

/// Shared request-handler state
///
/// Read-only after startup; handlers share it through an `Arc`.
pub struct AppState {
    /// Bearer key required on protected routes when present
    pub api_key: Option<SecretString>,
    /// Mailbox operations
    pub mailbox: Arc<dyn Mailbox>,
    /// Outbound composer
    pub composer: Composer,
}

/// Build the application router
///
/// `/health` is always open; every other route sits behind the bearer check.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/", post(send_email))
        .route("/emails", get(list_emails))
        .route("/emails/{uid}", get(read_email).delete(delete_email))
        .route("/emails/{uid}/move", post(move_email))
        .route("/emails/{uid}/forward", post(forward_email))
        .route("/emails/{uid}/reply", post(reply_email))
        .route("/folders", get(list_folders))
        .route("/drafts", post(store_draft))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

/// Reject requests without the configured bearer key
///
/// A missing credential is 401; a wrong one is 403. The scheme name is
/// matched case-insensitively. No key configured means every request passes.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(request).await);
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, credential) = value.trim_start().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(credential)
        })
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match presented {
        None => Err(AppError::Unauthenticated(
            "missing bearer credential".to_owned(),
        )),
        Some(key) if keys_match(key, expected.expose_secret()) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "rejected request with invalid API key");
            Err(AppError::Forbidden("invalid API key".to_owned()))
        }
    }
}

/// Compare without short-circuiting on the first differing byte
fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn send_email(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SendEmailRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<MessageResponse>)> {
    let started = Instant::now();
    let Json(request) = body.map_err(rejected)?;
    let outgoing = request.into_outgoing()?;
    finalize("send", started, state.composer.send(&outgoing).await)?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("Email sent successfully")),
    ))
}

async fn list_emails(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListEmailsQuery>, QueryRejection>,
) -> AppResult<Json<Vec<MessageSummary>>> {
    let started = Instant::now();
    let Query(query) = query.map_err(rejected)?;
    validate_folder(&query.folder)?;
    if query.limit == 0 {
        return Err(AppError::invalid("limit must be greater than 0"));
    }
    let summaries = state
        .mailbox
        .fetch_summaries(&query.folder, query.limit, query.unread)
        .await;
    finalize("list_emails", started, summaries).map(Json)
}

async fn list_folders(State(state): State<Arc<AppState>>) -> AppResult<Json<FoldersResponse>> {
    let started = Instant::now();
    let folders = finalize("list_folders", started, state.mailbox.list_folders().await)?;
    Ok(Json(FoldersResponse { folders }))
}

async fn read_email(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    query: Result<Query<FolderQuery>, QueryRejection>,
) -> AppResult<Json<EmailBody>> {
    let started = Instant::now();
    let uid = parse_uid(&uid)?;
    let Query(query) = query.map_err(rejected)?;
    validate_folder(&query.folder)?;

    let message = finalize(
        "read_email",
        started,
        state.mailbox.fetch_full_message(uid, &query.folder).await,
    )?;
    Ok(Json(EmailBody {
        body: message.text_body(),
        html: message.sanitized_html(),
        subject: message.subject,
        from: message.from,
        message_id: message.message_id,
        date: message.date,
    }))
}

async fn move_email(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    query: Result<Query<MoveQuery>, QueryRejection>,
) -> AppResult<Json<MessageResponse>> {
    let started = Instant::now();
    let uid = parse_uid(&uid)?;
    let Query(query) = query.map_err(rejected)?;
    validate_folder(&query.folder)?;
    validate_folder(&query.source_folder)?;

    let moved = state
        .mailbox
        .move_message(uid, &query.source_folder, &query.folder)
        .await;
    finalize("move_email", started, moved)?;
    Ok(Json(MessageResponse::new("Email moved")))
}

async fn delete_email(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    query: Result<Query<FolderQuery>, QueryRejection>,
) -> AppResult<Json<MessageResponse>> {
    let started = Instant::now();
    let uid = parse_uid(&uid)?;
    let Query(query) = query.map_err(rejected)?;
    validate_folder(&query.folder)?;

    let deleted = state.mailbox.delete_message(uid, &query.folder).await;
    finalize("delete_email", started, deleted)?;
    Ok(Json(MessageResponse::new("Email deleted")))
}

async fn forward_email(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    query: Result<Query<FolderQuery>, QueryRejection>,
    body: Result<Json<ThreadedEmailRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let started = Instant::now();
    let uid = parse_uid(&uid)?;
    let Query(query) = query.map_err(rejected)?;
    let Json(request) = body.map_err(rejected)?;
    validate_folder(&query.folder)?;

    let original = finalize(
        "forward_email",
        started,
        state.mailbox.fetch_full_message(uid, &query.folder).await,
    )?;
    let outgoing = compose::forward_message(&original, &request)?;
    finalize("forward_email", started, state.composer.send(&outgoing).await)?;
    Ok(Json(MessageResponse::new("Email forwarded")))
}

async fn reply_email(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    query: Result<Query<FolderQuery>, QueryRejection>,
    body: Result<Json<ThreadedEmailRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let started = Instant::now();
    let uid = parse_uid(&uid)?;
    let Query(query) = query.map_err(rejected)?;
    let Json(request) = body.map_err(rejected)?;
    validate_folder(&query.folder)?;

    let original = finalize(
        "reply_email",
        started,
        state.mailbox.fetch_full_message(uid, &query.folder).await,
    )?;
    let outgoing = compose::reply_message(&original, &request)?;
    finalize("reply_email", started, state.composer.send(&outgoing).await)?;
    Ok(Json(MessageResponse::new("Email sent")))
}

async fn store_draft(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SendEmailRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<MessageResponse>)> {
    let started = Instant::now();
    let Json(request) = body.map_err(rejected)?;
    let outgoing = request.into_outgoing()?;
    let draft = state.composer.build_draft(&outgoing)?;
    let stored = state.mailbox.append_draft(DRAFTS_FOLDER, &draft).await;
    finalize("store_draft", started, stored)?;
    Ok((StatusCode::CREATED, Json(MessageResponse::new("Draft stored"))))
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Log the outcome timing of one operation and pass the result through
fn finalize<T>(operation: &'static str, started: Instant, result: AppResult<T>) -> AppResult<T> {
    let elapsed_ms = duration_ms(started);
    match &result {
        Ok(_) => tracing::debug!(operation, elapsed_ms, "operation completed"),
        Err(e) => tracing::warn!(operation, elapsed_ms, code = e.code(), "operation failed"),
    }
    result
}

/// Map an extractor rejection to a client error
fn rejected(rejection: impl std::fmt::Display) -> AppError {
    AppError::InvalidInput(rejection.to_string())
}

/// Parse a path UID; must be a positive decimal integer
fn parse_uid(raw: &str) -> AppResult<u32> {
    match raw.parse::<u32>() {
        Ok(uid) if uid > 0 && raw.bytes().all(|b| b.is_ascii_digit()) => Ok(uid),
        _ => Err(AppError::InvalidInput(format!(
            "uid must be a positive integer, got '{raw}'"
        ))),
    }
}

/// Validate folder name format
fn validate_folder(folder: &str) -> AppResult<()> {
    let chars = folder.chars().count();
    if chars == 0 || chars > MAX_FOLDER_CHARS {
        return Err(AppError::InvalidInput(format!(
            "folder must be 1..{MAX_FOLDER_CHARS} characters"
        )));
    }
    if folder.chars().any(char::is_control) {
        return Err(AppError::invalid(
            "folder must not contain control characters",
        ));
    }
    Ok(())
}
