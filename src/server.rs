//! HTTP API.
//!
//! Exposes upload, chat, search, documents, notes, and accounts as a JSON
//! API for the web frontend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, indexed chunk count) |
//! | `POST` | `/register` | Create an account |
//! | `POST` | `/login` | Exchange credentials for a bearer token |
//! | `POST` | `/upload` | Multipart upload (field `file`), extract and index |
//! | `POST` | `/chat` | Answer a message from the indexed documents |
//! | `POST` | `/search` | Document-level search |
//! | `GET`  | `/documents` | List indexed documents |
//! | `GET`/`DELETE` | `/documents/{id}` | Fetch or remove a document |
//! | `GET`/`POST` | `/notes` | List or create notes |
//! | `GET`/`PUT`/`DELETE` | `/notes/{id}` | Read, update, or delete a note |
//! | `GET`  | `/stats` | Index statistics |
//! | `POST` | `/index/sync` | Embed pending chunks and reload the vector index |
//!
//! `/upload/` and `/chat/` are accepted as aliases.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `unauthorized` (401), `not_found` (404), `conflict` (409),
//! `payload_too_large` (413), `unsupported_media_type` (415),
//! `unprocessable` (422), `internal` (500), `upstream` (502).
//!
//! # Authentication
//!
//! `Authorization: Bearer <token>` from `/login`. A bad token is always
//! rejected; a missing token is rejected only with `auth.require_auth`.
//! Notes belong to the signed-in user, or to nobody for anonymous callers.

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthError, Claims, LoginResponse, TokenSigner};
use crate::chat::{self, ChatAnswer, ChatError};
use crate::config::{Config, SearchMode, ServerConfig};
use crate::db;
use crate::documents::{self, DocumentResponse, DocumentSummary};
use crate::embed_cmd;
use crate::extract::ExtractError;
use crate::index::VectorIndex;
use crate::ingest::{self, IngestError};
use crate::migrate;
use crate::models::Note;
use crate::notes::{self, NewNote, NoteError, NoteUpdate};
use crate::search::{self, SearchResultItem};
use crate::stats::{self, Stats};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    index: Arc<VectorIndex>,
    signer: Arc<TokenSigner>,
    /// Serializes writes to documents, chunks, and the vector index.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Open the database, apply migrations, and load the vector index.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    tokio::fs::create_dir_all(&config.server.uploads_dir).await?;

    let index = VectorIndex::for_config(&pool, &config.embedding).await?;
    tracing::info!(
        model = index.model(),
        chunks = index.len(),
        documents = index.document_count(),
        "vector index loaded"
    );

    Ok(AppState {
        config: Arc::new(config.clone()),
        pool,
        index: Arc::new(index),
        signer: Arc::new(TokenSigner::from_config(&config.auth)),
        write_lock: Arc::new(tokio::sync::Mutex::new(())),
    })
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server);
    let body_limit = state.config.server.max_upload_bytes;

    Router::new()
        .route("/health", get(handle_health))
        .route("/register", post(handle_register))
        .route("/login", post(handle_login))
        .route("/upload", post(handle_upload))
        .route("/upload/", post(handle_upload))
        .route("/chat", post(handle_chat))
        .route("/chat/", post(handle_chat))
        .route("/search", post(handle_search))
        .route("/documents", get(handle_list_documents))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/notes", get(handle_list_notes).post(handle_create_note))
        .route(
            "/notes/{id}",
            get(handle_get_note)
                .put(handle_update_note)
                .delete(handle_delete_note),
        )
        .route("/stats", get(handle_stats))
        .route("/index/sync", post(handle_index_sync))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = build_state(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    println!("ragnote listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if config.cors_origins.is_empty() || config.cors_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(origins))
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, code = self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn embeddings_disabled(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "embeddings_disabled", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    app_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn conflict(message: impl Into<String>) -> AppError {
    app_error(StatusCode::CONFLICT, "conflict", message)
}

fn unsupported_media_type(message: impl Into<String>) -> AppError {
    app_error(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "unsupported_media_type",
        message,
    )
}

fn unprocessable(message: impl Into<String>) -> AppError {
    app_error(StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", message)
}

fn upstream(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_GATEWAY, "upstream", message)
}

fn internal(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::InvalidToken | AuthError::Expired => {
                unauthorized(err.to_string())
            }
            AuthError::EmailTaken => conflict(err.to_string()),
            AuthError::InvalidInput(msg) => bad_request(msg),
            AuthError::Storage(e) => internal(e.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedType(_)
            | IngestError::Extract(ExtractError::UnsupportedContentType(_)) => {
                unsupported_media_type(err.to_string())
            }
            IngestError::InvalidFilename(_) => bad_request(err.to_string()),
            IngestError::Extract(_)
            | IngestError::EmptyText(_)
            | IngestError::ExtractionAborted(_) => unprocessable(err.to_string()),
            IngestError::Other(e) => internal(e.to_string()),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyMessage | ChatError::NoDocuments => bad_request(err.to_string()),
            ChatError::Retrieval(_) => internal(err.to_string()),
            ChatError::Generation(_) => upstream(err.to_string()),
        }
    }
}

impl From<NoteError> for AppError {
    fn from(err: NoteError) -> Self {
        match err {
            NoteError::EmptyTitle => bad_request(err.to_string()),
            NoteError::Storage(e) => internal(e.to_string()),
        }
    }
}

// ============ Authentication ============

/// The caller's verified token claims, if a bearer token was sent.
struct CurrentUser(Option<Claims>);

impl CurrentUser {
    fn owner(&self) -> Option<i64> {
        self.0.as_ref().map(|c| c.sub)
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
            if state.config.auth.require_auth {
                return Err(unauthorized("Not authenticated"));
            }
            return Ok(CurrentUser(None));
        };

        let value = value
            .to_str()
            .map_err(|_| unauthorized("Invalid authorization header"))?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| unauthorized("Authorization must use the Bearer scheme"))?;

        let claims = state.signer.verify(token.trim())?;
        Ok(CurrentUser(Some(claims)))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    indexed_chunks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        indexed_chunks: state.index.len(),
    })
}

// ============ Accounts ============

#[derive(Deserialize)]
struct CredentialsRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    message: String,
    id: i64,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let id = auth::register(
        &state.pool,
        &req.email,
        &req.password,
        state.config.auth.password_hash_rounds,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully".to_string(),
            id,
        }),
    ))
}

async fn handle_login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let response = auth::login(
        &state.pool,
        &state.signer,
        &req.email,
        &req.password,
        state.config.auth.password_hash_rounds,
    )
    .await?;
    Ok(Json(response))
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    document_id: String,
    filename: String,
    chunks: u64,
    embedded: u64,
    pending: u64,
}

async fn handle_upload(
    State(state): State<AppState>,
    _user: CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e.status(), e.body_text()))?;
        upload = Some((filename, bytes));
        break;
    }

    let (filename, bytes) =
        upload.ok_or_else(|| bad_request("multipart field 'file' is required"))?;

    let outcome = {
        let _guard = state.write_lock.lock().await;
        ingest::ingest_upload(
            &state.pool,
            &state.index,
            &state.config,
            &filename,
            bytes.to_vec(),
        )
        .await?
    };

    let message = if outcome.unchanged {
        "File unchanged; already indexed"
    } else {
        "File uploaded and indexed successfully"
    };

    Ok(Json(UploadResponse {
        message: message.to_string(),
        document_id: outcome.document_id,
        filename: ingest::sanitize_filename(&filename)?,
        chunks: outcome.chunks,
        embedded: outcome.embedded,
        pending: outcome.pending,
    }))
}

fn multipart_error(status: StatusCode, message: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        app_error(status, "payload_too_large", message)
    } else {
        bad_request(message)
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(alias = "query")]
    message: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_chat(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatAnswer>, AppError> {
    let reply = chat::answer(
        &state.pool,
        &state.index,
        &state.config,
        &req.message,
        req.top_k,
    )
    .await?;
    Ok(Json(reply))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

async fn handle_search(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let mode = match req.mode.as_deref() {
        Some(m) => m.parse::<SearchMode>().map_err(|e| bad_request(e.to_string()))?,
        None => state
            .config
            .retrieval
            .effective_mode(&state.config.embedding),
    };
    if mode.needs_embeddings() && !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled(format!(
            "mode '{}' requires embeddings, but no embedding provider is configured",
            mode
        )));
    }

    let limit = req
        .limit
        .unwrap_or(state.config.retrieval.final_limit)
        .clamp(1, 100);

    let results = search::search_documents(
        &state.pool,
        &state.index,
        &state.config,
        &req.query,
        mode,
        limit,
    )
    .await
    .map_err(|e| {
        if mode.needs_embeddings() {
            upstream(e.to_string())
        } else {
            internal(e.to_string())
        }
    })?;

    Ok(Json(SearchResponse { results }))
}

// ============ Documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = documents::list_documents(&state.pool).await?;
    Ok(Json(DocumentListResponse { documents }))
}

async fn handle_get_document(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    documents::get_document(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let _guard = state.write_lock.lock().await;
    let removed =
        ingest::delete_upload(&state.pool, Some(&state.index), &state.config, &id).await?;
    if !removed {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Notes ============

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct NoteListResponse {
    notes: Vec<Note>,
}

async fn handle_create_note(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<NewNote>,
) -> Result<(StatusCode, Json<Note>), AppError> {
    let note = notes::create_note(&state.pool, user.owner(), &req).await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn handle_list_notes(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<ListParams>,
) -> Result<Json<NoteListResponse>, AppError> {
    let notes = notes::list_notes(&state.pool, user.owner(), params.limit, params.offset).await?;
    Ok(Json(NoteListResponse { notes }))
}

async fn handle_get_note(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<Note>, AppError> {
    notes::get_note(&state.pool, user.owner(), id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Note not found"))
}

async fn handle_update_note(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<NoteUpdate>,
) -> Result<Json<Note>, AppError> {
    notes::update_note(&state.pool, user.owner(), id, &req)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("Note not found"))
}

async fn handle_delete_note(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !notes::delete_note(&state.pool, user.owner(), id).await? {
        return Err(not_found("Note not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ Index ============

async fn handle_stats(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<Stats>, AppError> {
    Ok(Json(stats::collect_stats(&state.pool).await?))
}

#[derive(Serialize)]
struct SyncResponse {
    embedded: u64,
    failed: u64,
    indexed_chunks: usize,
}

async fn handle_index_sync(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<SyncResponse>, AppError> {
    if !state.config.embedding.is_enabled() {
        return Err(embeddings_disabled(
            "no embedding provider is configured",
        ));
    }

    let _guard = state.write_lock.lock().await;
    let summary = embed_cmd::embed_pending(
        &state.pool,
        &state.config,
        None,
        state.config.embedding.batch_size,
    )
    .await?;
    state.index.reload(&state.pool).await?;

    Ok(Json(SyncResponse {
        embedded: summary.embedded,
        failed: summary.failed,
        indexed_chunks: state.index.len(),
    }))
}
