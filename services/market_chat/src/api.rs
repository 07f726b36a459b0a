use crate::attachments::{BlobStore, FsBlobStore};
use crate::auth::{self, CurrentUser};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{ChatError, ChatResult};
use crate::housekeeping::spawn_housekeeping;
use crate::model::{AttachmentRef, Emoji, UploadFile};
use crate::service::{ChatService, EditMessage, SendMessage};
use crate::session::ConversationSession;
use crate::{db, ws};
use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub service: ChatService,
    pub blobs: Arc<dyn BlobStore>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build the state with an explicit time source.
    pub async fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        tokio::fs::create_dir_all(config.blob_dir())
            .await
            .with_context(|| format!("creating {}", config.blob_dir().display()))?;
        let pool = db::open_pool(config.db_path(), config.edit_window_ms())?;
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
            config.blob_dir(),
            config.public_url.clone(),
        ));
        let service = ChatService::new(
            pool,
            clock,
            blobs.clone(),
            config.max_upload_bytes(),
            config.edit_window_ms(),
        );
        Ok(Self {
            config,
            service,
            blobs,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    // leave room above the limit so oversize files reach the pipeline and
    // are reported as size_exceeded
    let uploads = Router::new()
        .route("/api/conversations/:id/attachments", post(upload_attachment))
        .layer(DefaultBodyLimit::max(
            (state.config.max_upload_bytes() * 2) as usize,
        ));
    let protected = Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id", get(open_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/api/conversations/:id/messages/:mid",
            patch(edit_message).delete(delete_message),
        )
        .route(
            "/api/conversations/:id/messages/:mid/reactions",
            post(toggle_reaction),
        )
        .route("/api/conversations/:id/messages/:mid/pin", post(toggle_pin))
        .route("/api/files/*path", get(download_file))
        .route("/ws", get(ws_handler))
        .merge(uploads)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ChatError> {
    let token =
        auth::request_token(req.headers(), req.uri().query()).ok_or(ChatError::Unauthorized)?;
    let claims =
        auth::verify_jwt(&state.config.jwt_secret, &token).map_err(|_| ChatError::Unauthorized)?;
    req.extensions_mut().insert(CurrentUser(claims.sub));
    Ok(next.run(req).await)
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.list_conversations(&user).await?))
}

async fn open_conversation(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.open_conversation(id, &user).await?))
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> ChatResult<impl IntoResponse> {
    Ok(Json(state.service.messages(id, &user).await?))
}

#[derive(Deserialize)]
struct SendReq {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachment: Option<AttachmentRef>,
    #[serde(default)]
    reply_to: Option<Uuid>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendReq>,
) -> ChatResult<impl IntoResponse> {
    let msg = state
        .service
        .send_message(SendMessage {
            conversation_id: id,
            sender_id: user,
            text: req.text,
            attachment: req.attachment,
            reply_to: req.reply_to,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(msg)))
}

#[derive(Deserialize)]
struct EditReq {
    text: String,
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    Json(req): Json<EditReq>,
) -> ChatResult<impl IntoResponse> {
    let msg = state
        .service
        .edit_message(EditMessage {
            conversation_id: id,
            message_id: mid,
            sender_id: user,
            new_text: req.text,
        })
        .await?;
    Ok(Json(msg))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
) -> ChatResult<StatusCode> {
    state.service.delete_message(id, mid, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ReactReq {
    emoji: Emoji,
}

#[derive(Serialize)]
struct ReactResp {
    reacted: bool,
}

async fn toggle_reaction(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
    Json(req): Json<ReactReq>,
) -> ChatResult<impl IntoResponse> {
    let reacted = state
        .service
        .toggle_reaction(id, mid, &user, req.emoji)
        .await?;
    Ok(Json(ReactResp { reacted }))
}

#[derive(Serialize)]
struct PinResp {
    pinned: bool,
}

async fn toggle_pin(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((id, mid)): Path<(Uuid, Uuid)>,
) -> ChatResult<impl IntoResponse> {
    let pinned = state.service.toggle_pin(id, mid, &user).await?;
    Ok(Json(PinResp { pinned }))
}

async fn upload_attachment(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> ChatResult<impl IntoResponse> {
    let malformed =
        |_: axum::extract::multipart::MultipartError| ChatError::Invalid("malformed_upload".into());
    let field = multipart
        .next_field()
        .await
        .map_err(malformed)?
        .ok_or_else(|| ChatError::Invalid("missing_file".into()))?;
    let file_name = field
        .file_name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "file".into());
    let data = field.bytes().await.map_err(malformed)?;
    let attachment = state
        .service
        .upload_attachment(
            id,
            &user,
            UploadFile { file_name, data },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn download_file(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(path): Path<String>,
) -> ChatResult<impl IntoResponse> {
    let path = path.trim_start_matches('/').to_string();
    if !state.service.can_read_blob(&path, &user).await? {
        return Err(ChatError::NotParticipant);
    }
    // same sniffing as at upload, so the served type matches the reference
    let stored = state.service.stored_blob(&path).await?.ok_or(ChatError::NotFound)?;
    let reader = state
        .blobs
        .open(&path)
        .await
        .map_err(|e| ChatError::Store(e.to_string()))?
        .ok_or(ChatError::NotFound)?;
    let body = StreamBody::new(ReaderStream::new(reader));
    Ok(([(header::CONTENT_TYPE, stored.mime)], body))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> impl IntoResponse {
    let session = ConversationSession::new(state.service.clone(), user);
    ws.on_upgrade(move |socket| ws::handle_socket(socket, session))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Run the HTTP server until interrupted.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(config).await?;
    spawn_housekeeping(state.clone());
    tracing::info!(%addr, data_dir = %state.config.data_dir.display(), "market chat listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
