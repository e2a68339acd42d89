//! Session endpoints
//!
//! Upload creates a session from PDFs; questions and quizzes run against it.
//! Every handler reports its route, status and latency to the metrics
//! recorder.

use std::future::Future;
use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::AppState;
use crate::documents::Document;
use crate::error::ApiError;
use crate::session::Session;

/// Multipart field carrying the uploaded files.
const DOCUMENTS_FIELD: &str = "documents";

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub documents: usize,
    pub characters: usize,
    pub chunks: usize,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct QuizResponse {
    pub quiz: String,
}

/// Run a handler body, then record its outcome.
async fn timed<F>(route: &'static str, handler: F) -> Response
where
    F: Future<Output = Result<Response, ApiError>>,
{
    let started = Instant::now();
    let response = handler.await.unwrap_or_else(IntoResponse::into_response);
    crate::metrics::record_request(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// `POST /sessions`
pub async fn create_session(State(state): State<AppState>, multipart: Multipart) -> Response {
    timed("create_session", upload(state, multipart)).await
}

/// `POST /sessions/{id}/questions`
pub async fn ask_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    timed("ask_question", ask(state, id, body)).await
}

/// `POST /sessions/{id}/quiz`
pub async fn create_quiz(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    timed("create_quiz", quiz(state, id)).await
}

/// `DELETE /sessions/{id}`
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    timed("delete_session", async move {
        let id = parse_id(&id)?;
        if state.sessions.remove(&id).await {
            info!(session = %id, "session deleted");
            Ok(StatusCode::NO_CONTENT.into_response())
        } else {
            Err(ApiError::SessionNotFound)
        }
    })
    .await
}

#[instrument(skip_all)]
async fn upload(state: AppState, mut multipart: Multipart) -> Result<Response, ApiError> {
    let mut documents = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(DOCUMENTS_FIELD) {
            debug!(field = ?field.name(), "ignoring multipart field");
            continue;
        }
        let name = field.file_name().unwrap_or("document.pdf").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;

        if !looks_like_pdf(&name, content_type.as_deref(), &bytes) {
            warn!(document = %name, "skipping non-PDF upload");
            continue;
        }
        documents.push(Document {
            name,
            bytes: bytes.to_vec(),
        });
    }

    let assistant = &state.assistant;
    let document_count = documents.len();
    let text = assistant.extract_text(documents).await?;
    let chunks = assistant.chunk(&text);
    let chunk_count = chunks.len();
    let index = assistant.build_index(chunks).await?;
    let conversation = assistant.build_conversation(index).await?;

    let characters = text.chars().count();
    let session_id = state
        .sessions
        .insert(Session {
            raw_text: text,
            conversation,
        })
        .await;
    info!(
        session = %session_id,
        documents = document_count,
        characters,
        chunks = chunk_count,
        "documents processed"
    );

    let body = SessionCreated {
        session_id,
        documents: document_count,
        characters,
        chunks: chunk_count,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

#[instrument(skip_all, fields(session = %id))]
async fn ask(
    state: AppState,
    id: String,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or(ApiError::SessionNotFound)?;

    let mut session = session.lock().await;
    let reply = session.conversation.ask(&request.question).await?;
    if reply.cached {
        debug!("answered from the previous turn");
    }
    Ok(Json(reply).into_response())
}

#[instrument(skip_all, fields(session = %id))]
async fn quiz(state: AppState, id: String) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or(ApiError::SessionNotFound)?;

    let mut session = session.lock().await;
    let quiz = state.assistant.generate_quiz(&session.raw_text).await?;
    session.conversation.forget_last_question();
    Ok(Json(QuizResponse { quiz }).into_response())
}

/// Malformed ids cannot name a session.
fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::SessionNotFound)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

fn looks_like_pdf(name: &str, content_type: Option<&str>, bytes: &[u8]) -> bool {
    content_type == Some("application/pdf")
        || name.to_ascii_lowercase().ends_with(".pdf")
        || bytes.starts_with(b"%PDF-")
}
