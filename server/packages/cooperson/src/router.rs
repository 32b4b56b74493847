use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderName, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use cooperson_error::{CoachError, ErrorType, ProblemDetails};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use url::Url;
use utoipa::{Modify, OpenApi, ToSchema};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::chat::{ChatOutput, ChatRequest, ChatService, ChatStream};
use crate::chatkit::{self, ChatKitEvent, ChatKitRequest, ChatKitResponse};
use crate::config::CoachConfig;
use crate::conversation_cache::ConversationCache;
use crate::data_stream;
use crate::openai::{FileList, KnowledgeFile, OpenAiClient, UploadedFile};
use crate::store::{
    AssistantMessageItem, Attachment, AttachmentCreate, ClientToolCallItem, ContentPart, ItemPage,
    Page, SortOrder, Thread, ThreadItem, ThreadMetadata, ThreadPage, ThreadStore, ToolCallItem,
    ToolCallStatus, UserMessageItem, DEFAULT_PAGE_LIMIT, DEFAULT_SESSION_KEY,
};

mod support;
mod types;

use support::*;
pub use types::*;

const AGENT_NAME: &str = "Jason Cooperson Coaching Agent";
/// Attachment and knowledge-base uploads.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug)]
pub struct AppState {
    chat: ChatService,
    openai: OpenAiClient,
}

impl AppState {
    /// `upload_base` is the externally reachable origin used for attachment
    /// upload URLs.
    pub fn new(
        config: CoachConfig,
        upload_base: Url,
        runner: Arc<dyn AgentRunner>,
        conversations: ConversationCache,
    ) -> Self {
        let store = Arc::new(ThreadStore::new(upload_base));
        let chat = ChatService::new(store, runner, Arc::new(conversations));
        let openai = OpenAiClient::new(Arc::new(config), Client::new());
        Self {
            chat,
            openai,
        }
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn store(&self) -> &Arc<ThreadStore> {
        self.chat.store()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/chat", post(post_chat))
        .route("/chatkit/session", post(create_chatkit_session))
        .route("/threads", get(list_threads))
        .route("/threads/:thread_id", get(get_thread).delete(delete_thread))
        .route("/threads/:thread_id/items", get(list_items))
        .route(
            "/threads/:thread_id/items/:item_id",
            get(get_item).delete(delete_item),
        )
        .route("/attachments", post(create_attachment))
        .route(
            "/attachments/:attachment_id",
            get(get_attachment).delete(delete_attachment),
        )
        .route("/attachments/:attachment_id/upload", post(upload_attachment))
        .route("/files", get(list_files))
        .route("/files/upload", post(upload_file))
        .route("/files/:file_id", axum::routing::delete(delete_file))
        .route("/transcribe", post(transcribe))
        .route("/tts", post(text_to_speech))
        .route("/widget-action", post(widget_action))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/chatkit", post(post_chatkit))
        .with_state(shared.clone())
        .nest("/api", api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("COOPERSON_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        post_chat,
        post_chatkit,
        create_chatkit_session,
        list_threads,
        get_thread,
        delete_thread,
        list_items,
        get_item,
        delete_item,
        create_attachment,
        upload_attachment,
        get_attachment,
        delete_attachment,
        list_files,
        upload_file,
        delete_file,
        transcribe,
        text_to_speech,
        widget_action
    ),
    components(
        schemas(
            HealthResponse,
            ChatRequestBody,
            ChatMessage,
            ChatKitSessionResponse,
            ThreadMetadata,
            Thread,
            ThreadPage,
            ItemPage,
            ThreadItem,
            UserMessageItem,
            AssistantMessageItem,
            ToolCallItem,
            ClientToolCallItem,
            ToolCallStatus,
            ContentPart,
            AttachmentCreate,
            Attachment,
            KnowledgeFile,
            FileList,
            UploadedFile,
            FileDeleteResponse,
            TranscriptionResponse,
            SpeechRequest,
            StatusResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Coaching conversations"),
        (name = "threads", description = "Thread history"),
        (name = "attachments", description = "Chat attachments"),
        (name = "files", description = "Knowledge base files"),
        (name = "speech", description = "Speech proxy")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Coach(#[from] CoachError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = match &self {
            ApiError::Coach(err) => {
                if err.error_type() == ErrorType::UpstreamFailure {
                    tracing::error!(error = %err, "upstream request failed");
                }
                err.to_problem_details()
            }
        };
        problem_response(problem)
    }
}

async fn get_root() -> Json<RootResponse> {
    let endpoints = [
        ("chat", "/api/chat"),
        ("chatkit", "/chatkit"),
        ("session", "/api/chatkit/session"),
        ("threads", "/api/threads"),
        ("attachments", "/api/attachments"),
        ("files", "/api/files"),
        ("health", "/health"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), path.to_string()))
    .collect();
    Json(RootResponse {
        message: "Jason's Coaching API".to_string(),
        status: "running".to_string(),
        endpoints,
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        agent: AGENT_NAME.to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequestBody,
    params(("sid" = Option<String>, Query, description = "Session key")),
    responses(
        (status = 200, description = "Data-stream protocol lines", content_type = "text/plain"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 415, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<ChatRequestBody>,
) -> Result<Response, ApiError> {
    let Some(last) = request.messages.last() else {
        return Err(CoachError::invalid_request("messages must not be empty").into());
    };
    if last.role != "user" {
        return Err(CoachError::invalid_request("last message must come from the user").into());
    }
    let text = last.text();
    if text.trim().is_empty() && request.attachments.is_empty() {
        return Err(CoachError::invalid_request("last user message is empty").into());
    }
    let outputs = state
        .chat
        .respond(ChatRequest {
            session: query.key().to_string(),
            thread_id: request.thread_id,
            text,
            attachment_ids: request.attachments,
        })
        .await?;
    Ok(data_stream_response(outputs))
}

#[utoipa::path(
    post,
    path = "/chatkit",
    request_body(content = Value, description = "`{type, params}` widget request"),
    params(("sid" = Option<String>, Query, description = "Session key")),
    responses(
        (status = 200, description = "SSE event stream or JSON document"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chatkit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<ChatKitRequest>,
) -> Result<Response, ApiError> {
    match chatkit::handle(&state.chat, query.key(), request).await? {
        ChatKitResponse::Stream(events) => Ok(chatkit_sse_response(events)),
        ChatKitResponse::Json(value) => Ok(Json(value).into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/chatkit/session",
    responses((status = 200, body = ChatKitSessionResponse)),
    tag = "chat"
)]
async fn create_chatkit_session() -> Json<ChatKitSessionResponse> {
    let session_id = random_token(16);
    tracing::info!(session_id = %session_id, "chatkit session created");
    Json(ChatKitSessionResponse {
        client_secret: format!("cs_{}", random_token(32)),
        session_id,
    })
}

#[utoipa::path(
    get,
    path = "/api/threads",
    params(
        ("sid" = Option<String>, Query, description = "Session key"),
        ("limit" = Option<usize>, Query, description = "Page size, 1 to 100"),
        ("after" = Option<String>, Query, description = "Cursor: last thread id of the previous page"),
        ("order" = Option<String>, Query, description = "asc or desc")
    ),
    responses(
        (status = 200, body = ThreadPage),
        (status = 400, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn list_threads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<ThreadMetadata>>, ApiError> {
    let order = SortOrder::parse(query.order.as_deref())?;
    let session = state.store().get_or_create_session(query.key()).await;
    let page = session
        .list_threads(query.limit(), query.after.as_deref(), order)
        .await;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/threads/{thread_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses(
        (status = 200, body = Thread),
        (status = 404, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Thread>, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    let metadata = session.load_thread(&thread_id).await?;
    let items = session
        .list_items(&thread_id, DEFAULT_PAGE_LIMIT, None, SortOrder::Asc)
        .await?;
    Ok(Json(Thread { metadata, items }))
}

#[utoipa::path(
    delete,
    path = "/api/threads/{thread_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses((status = 204, description = "Thread deleted")),
    tag = "threads"
)]
async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> StatusCode {
    let session = state.store().get_or_create_session(query.key()).await;
    session.delete_thread(&thread_id).await;
    state
        .chat
        .conversations()
        .remove(session.key(), &thread_id)
        .await;
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    get,
    path = "/api/threads/{thread_id}/items",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("sid" = Option<String>, Query, description = "Session key"),
        ("limit" = Option<usize>, Query, description = "Page size, 1 to 100"),
        ("after" = Option<String>, Query, description = "Cursor: last item id of the previous page"),
        ("order" = Option<String>, Query, description = "asc or desc")
    ),
    responses(
        (status = 200, body = ItemPage),
        (status = 404, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn list_items(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<ThreadItem>>, ApiError> {
    let order = SortOrder::parse(query.order.as_deref())?;
    let session = state.store().get_or_create_session(query.key()).await;
    let page = session
        .list_items(&thread_id, query.limit(), query.after.as_deref(), order)
        .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/threads/{thread_id}/items/{item_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("item_id" = String, Path, description = "Item id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses(
        (status = 200, body = ThreadItem),
        (status = 404, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn get_item(
    State(state): State<Arc<AppState>>,
    Path((thread_id, item_id)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ThreadItem>, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    Ok(Json(session.get_item(&thread_id, &item_id).await?))
}

#[utoipa::path(
    delete,
    path = "/api/threads/{thread_id}/items/{item_id}",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("item_id" = String, Path, description = "Item id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses(
        (status = 204, description = "Item deleted"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path((thread_id, item_id)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> Result<StatusCode, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    session.delete_item(&thread_id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/attachments",
    request_body = AttachmentCreate,
    params(("sid" = Option<String>, Query, description = "Session key")),
    responses(
        (status = 200, body = Attachment),
        (status = 400, body = ProblemDetails)
    ),
    tag = "attachments"
)]
async fn create_attachment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<AttachmentCreate>,
) -> Result<Json<Attachment>, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    let attachment = session.create_attachment(request).await?;
    tracing::debug!(session = %session.key(), attachment_id = %attachment.id, "attachment created");
    Ok(Json(attachment))
}

#[utoipa::path(
    post,
    path = "/api/attachments/{attachment_id}/upload",
    request_body(content = Vec<u8>, description = "Raw attachment bytes", content_type = "application/octet-stream"),
    params(
        ("attachment_id" = String, Path, description = "Attachment id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses(
        (status = 200, description = "Upload stored"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "attachments"
)]
async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<String>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    let attachment = session
        .complete_attachment_upload(&attachment_id, body)
        .await?;
    tracing::debug!(attachment_id = %attachment.id, size = attachment.size, "attachment uploaded");
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/api/attachments/{attachment_id}",
    params(
        ("attachment_id" = String, Path, description = "Attachment id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses(
        (status = 200, description = "Attachment bytes with their stored MIME type"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "attachments"
)]
async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    let session = state.store().get_or_create_session(query.key()).await;
    let stored = session.load_attachment(&attachment_id).await?;
    let disposition = format!(
        "inline; filename=\"{}\"",
        stored.metadata.name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, stored.metadata.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        stored.bytes,
    )
        .into_response())
}

#[utoipa::path(
    delete,
    path = "/api/attachments/{attachment_id}",
    params(
        ("attachment_id" = String, Path, description = "Attachment id"),
        ("sid" = Option<String>, Query, description = "Session key")
    ),
    responses((status = 204, description = "Attachment deleted")),
    tag = "attachments"
)]
async fn delete_attachment(
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> StatusCode {
    let session = state.store().get_or_create_session(query.key()).await;
    session.delete_attachment(&attachment_id).await;
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    get,
    path = "/api/files",
    responses(
        (status = 200, body = FileList),
        (status = 502, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn list_files(State(state): State<Arc<AppState>>) -> Result<Json<FileList>, ApiError> {
    Ok(Json(state.openai.list_files().await?))
}

#[utoipa::path(
    post,
    path = "/api/files/upload",
    request_body(content = Vec<u8>, description = "Multipart form with a `file` field", content_type = "multipart/form-data"),
    responses(
        (status = 200, body = UploadedFile),
        (status = 400, body = ProblemDetails),
        (status = 502, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadedFile>, ApiError> {
    let (filename, _, bytes) = read_file_field(&mut multipart, "file").await?;
    Ok(Json(state.openai.upload_file(&filename, bytes).await?))
}

#[utoipa::path(
    delete,
    path = "/api/files/{file_id}",
    params(("file_id" = String, Path, description = "Knowledge file id")),
    responses(
        (status = 200, body = FileDeleteResponse),
        (status = 502, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "files"
)]
async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Json<FileDeleteResponse>, ApiError> {
    state.openai.delete_file(&file_id).await?;
    Ok(Json(FileDeleteResponse {
        status: "deleted".to_string(),
        file_id,
    }))
}

#[utoipa::path(
    post,
    path = "/api/transcribe",
    request_body(content = Vec<u8>, description = "Multipart form with an audio `file` field", content_type = "multipart/form-data"),
    responses(
        (status = 200, body = TranscriptionResponse),
        (status = 400, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "speech"
)]
async fn transcribe(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<TranscriptionResponse>, ApiError> {
    let (filename, content_type, bytes) = read_file_field(&mut multipart, "file").await?;
    let text = state
        .openai
        .transcribe(&filename, content_type.as_deref(), bytes)
        .await?;
    Ok(Json(TranscriptionResponse { text }))
}

#[utoipa::path(
    post,
    path = "/api/tts",
    request_body = SpeechRequest,
    responses(
        (status = 200, description = "MPEG audio", content_type = "audio/mpeg"),
        (status = 400, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "speech"
)]
async fn text_to_speech(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpeechRequest>,
) -> Result<Response, ApiError> {
    let audio = state
        .openai
        .speech(&request.text, request.voice.as_deref())
        .await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response())
}

#[utoipa::path(
    post,
    path = "/api/widget-action",
    request_body(content = Value, description = "Arbitrary widget action payload"),
    responses((status = 200, body = StatusResponse)),
    tag = "chat"
)]
async fn widget_action(Json(action): Json<Value>) -> Json<StatusResponse> {
    tracing::info!(action = %action, "widget action");
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}
