//! HTTP API server.
//!
//! Exposes the chat service as a JSON API under `/api/v1`: account signup
//! and login, conversation management, document uploads (multipart), and
//! the ask endpoint. All `/conversations` routes require a bearer token.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/auth/signup` | Register, returns a bearer token |
//! | `POST` | `/api/v1/auth/token` | Login (form), returns a bearer token |
//! | `POST` | `/api/v1/conversations` | Create a conversation |
//! | `GET`  | `/api/v1/conversations` | List the caller's conversations |
//! | `GET`  | `/api/v1/conversations/{id}/history` | Stored messages, oldest first |
//! | `POST` | `/api/v1/conversations/{id}/ask` | Ask a question |
//! | `POST` | `/api/v1/conversations/{id}/documents` | Upload to the conversation scope |
//! | `POST` | `/api/v1/conversations/documents/global` | Upload to the global scope |
//! | `GET`  | `/api/v1/conversations/{id}/documents` | List the scope's documents |
//! | `DELETE` | `/api/v1/conversations/{id}/documents/{doc_id}` | Delete one document's chunks |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unauthorized", "message": "Could not validate credentials" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `internal` (500). Ask-time faults are not errors: the ask endpoint always
//! answers 200 and folds failures into the `answer` field.

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::ask;
use crate::auth;
use crate::config::Config;
use crate::db;
use crate::index::{ScopeIndex, SqliteIndex};
use crate::ingest;
use crate::llm::{create_generation_client, GenerationClient};
use crate::migrate;
use crate::models::{ChatRequest, ChatResponse, Message, UploadResponse, User};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub index: Arc<SqliteIndex>,
    pub llm: Arc<dyn GenerationClient>,
}

/// Starts the HTTP server.
///
/// Construction of the generation client happens here, before binding:
/// a missing provider credential refuses to start the process instead of
/// failing requests one at a time. The same applies to a missing
/// `[auth] token_secret`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    if config.auth.token_secret.is_none() {
        anyhow::bail!("auth.token_secret must be set to run the server");
    }

    let llm: Arc<dyn GenerationClient> = create_generation_client(&config.llm)?.into();

    migrate::run_migrations(config).await?;
    let pool = db::connect(config).await?;
    let index = Arc::new(SqliteIndex::new(pool.clone(), config.embedding.clone()));

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        index,
        llm,
    };

    let bind_addr = state.config.server.bind.clone();
    let app = build_router(state);

    println!("scope-rag server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the full route table. Split from [`run_server`] so tests can
/// serve the router in-process.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/auth/signup", post(handle_signup))
        .route("/api/v1/auth/token", post(handle_login))
        .route(
            "/api/v1/conversations",
            post(handle_create_conversation).get(handle_list_conversations),
        )
        .route("/api/v1/conversations/{id}/history", get(handle_history))
        .route("/api/v1/conversations/{id}/ask", post(handle_ask))
        .route(
            "/api/v1/conversations/{id}/documents",
            post(handle_upload_document).get(handle_list_documents),
        )
        .route(
            "/api/v1/conversations/documents/global",
            post(handle_upload_global),
        )
        .route(
            "/api/v1/conversations/{id}/documents/{doc_id}",
            delete(handle_delete_document),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ Auth helpers ============

fn token_secret(state: &AppState) -> Result<&str, AppError> {
    state
        .config
        .auth
        .token_secret
        .as_deref()
        .ok_or_else(|| internal(anyhow::anyhow!("auth.token_secret not configured")))
}

/// Resolves the `Authorization: Bearer` header to a user.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let secret = token_secret(state)?;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("Could not validate credentials"))?;

    auth::current_user(&state.pool, secret, token)
        .await
        .map_err(|e| unauthorized(e.to_string()))
}

/// Confirms the conversation exists and belongs to the caller.
async fn require_ownership(
    state: &AppState,
    conversation_id: &str,
    user_id: i64,
) -> Result<(), AppError> {
    let owner: Option<i64> =
        sqlx::query_scalar("SELECT user_id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&state.pool)
            .await
            .map_err(|e| internal(e.into()))?;
    match owner {
        Some(owner) if owner == user_id => Ok(()),
        _ => Err(not_found("Conversation not found")),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Auth routes ============

#[derive(Deserialize)]
struct SignupRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
}

async fn handle_signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let secret = token_secret(&state)?;
    let token = auth::signup(
        &state.pool,
        secret,
        state.config.auth.token_ttl_hours,
        &payload.email,
        &payload.password,
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("already registered") {
            bad_request(e.to_string())
        } else {
            internal(e)
        }
    })?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}

async fn handle_login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, AppError> {
    let secret = token_secret(&state)?;
    let token = auth::login(
        &state.pool,
        secret,
        state.config.auth.token_ttl_hours,
        &form.username,
        &form.password,
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("Incorrect username") {
            unauthorized(e.to_string())
        } else {
            internal(e)
        }
    })?;

    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}

// ============ Conversation routes ============

#[derive(Serialize)]
struct ConversationCreateResponse {
    convo_id: String,
}

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<String>,
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConversationCreateResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let convo_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    sqlx::query("INSERT INTO conversations (id, user_id, created_at) VALUES (?, ?, ?)")
        .bind(&convo_id)
        .bind(user.id)
        .bind(&now)
        .execute(&state.pool)
        .await
        .map_err(|e| internal(e.into()))?;

    Ok(Json(ConversationCreateResponse { convo_id }))
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConversationListResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    let rows = sqlx::query(
        "SELECT id FROM conversations WHERE user_id = ? ORDER BY created_at DESC, id",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    Ok(Json(ConversationListResponse {
        conversations: rows.iter().map(|row| row.get("id")).collect(),
    }))
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<Message>,
}

async fn handle_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(convo_id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    require_ownership(&state, &convo_id, user.id).await?;

    let rows = sqlx::query(
        "SELECT role, content, timestamp FROM messages WHERE conversation_id = ? ORDER BY id",
    )
    .bind(&convo_id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.into()))?;

    Ok(Json(HistoryResponse {
        history: rows
            .iter()
            .map(|row| Message {
                role: row.get("role"),
                content: row.get("content"),
                timestamp: row.get("timestamp"),
            })
            .collect(),
    }))
}

// ============ Ask route ============

async fn handle_ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(convo_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;

    // Ownership failures and pipeline faults fold into the answer field.
    let response = ask::answer_question(
        &state.pool,
        state.index.as_ref(),
        state.llm.as_ref(),
        &state.config.retrieval,
        user.id,
        &convo_id,
        &request,
    )
    .await;

    Ok(Json(response))
}

// ============ Document routes ============

/// Pulls the first file out of a multipart body.
async fn read_multipart_file(mut multipart: Multipart) -> Result<(String, Vec<u8>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(|s| s.to_string()) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("Failed to read upload: {}", e)))?;
        return Ok((filename, bytes.to_vec()));
    }
    Err(bad_request("Multipart body contained no file"))
}

async fn upload_to_scope(
    state: &AppState,
    scope: &str,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let (filename, bytes) = read_multipart_file(multipart).await?;

    let outcome = ingest::ingest_document(
        state.index.as_ref(),
        state.config.chunking.chunk_chars,
        scope,
        &filename,
        &bytes,
    )
    .await
    .map_err(internal)?;

    Ok(Json(UploadResponse {
        status: outcome.status,
        chunks_added: outcome.chunks_added,
    }))
}

async fn handle_upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(convo_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    require_ownership(&state, &convo_id, user.id).await?;
    upload_to_scope(&state, &convo_id, multipart).await
}

async fn handle_upload_global(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    authenticate(&state, &headers).await?;
    upload_to_scope(&state, crate::index::GLOBAL_SCOPE, multipart).await
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<String>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(convo_id): Path<String>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    require_ownership(&state, &convo_id, user.id).await?;

    let refs = state.index.get(&convo_id).await.map_err(internal)?;
    let mut documents: Vec<String> = refs.into_iter().map(|r| r.source).collect();
    documents.dedup();

    Ok(Json(DocumentListResponse { documents }))
}

#[derive(Serialize)]
struct DocumentDeleteResponse {
    status: String,
    chunks_removed: usize,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((convo_id, doc_id)): Path<(String, String)>,
) -> Result<Json<DocumentDeleteResponse>, AppError> {
    let user = authenticate(&state, &headers).await?;
    require_ownership(&state, &convo_id, user.id).await?;

    let chunks_removed = state
        .index
        .remove(&convo_id, &doc_id)
        .await
        .map_err(internal)?;

    Ok(Json(DocumentDeleteResponse {
        status: "deleted".to_string(),
        chunks_removed,
    }))
}
