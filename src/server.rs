use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::chat::{NewMessage, Role};
use crate::config::Config;
use crate::error::ApiError;
use crate::session::ChatController;
use crate::store::Store;

/// Uploaded images are capped at 10 MB before any gateway sees them.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

pub struct AppState {
    pub store: Store,
    pub controller: ChatController,
    pub upload_dir: PathBuf,
}

pub fn router(store: Store, controller: ChatController, config: &Config) -> Router {
    let state = Arc::new(AppState {
        store,
        controller,
        upload_dir: config.upload_dir.clone(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/user/:user_id", get(user_conversations))
        .route(
            "/api/conversations/:id/messages",
            get(conversation_messages).post(append_message),
        )
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", get(chat_stream))
        .route("/api/analyze-image", post(analyze_image))
        .route("/api/transcribe", post(transcribe))
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

// --- Conversations ---

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    user_id: Option<String>,
    title: String,
    #[serde(default = "default_language")]
    language: String,
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }

    let convo = state
        .store
        .create_conversation(req.user_id, &req.title, &req.language)
        .await?;
    Ok(Json(serde_json::to_value(convo).unwrap_or_default()))
}

async fn user_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversations = state.store.get_user_conversations(&user_id).await?;
    Ok(Json(serde_json::to_value(conversations).unwrap_or_default()))
}

async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages = state.store.get_conversation_messages(&id).await?;
    Ok(Json(serde_json::to_value(messages).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendMessageRequest {
    role: String,
    content: String,
    image_url: Option<String>,
    audio_url: Option<String>,
    metadata: Option<serde_json::Value>,
}

/// Raw message append, no generation involved.
async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = Role::parse(&req.role)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid role: {}", req.role)))?;

    let message = state
        .store
        .create_message(
            &id,
            role,
            NewMessage {
                content: req.content,
                image_url: req.image_url,
                audio_url: req.audio_url,
                metadata: req.metadata,
            },
        )
        .await?;
    state.store.touch_conversation(&id).await?;

    Ok(Json(serde_json::to_value(message).unwrap_or_default()))
}

// --- Chat turns ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    conversation_id: String,
    content: String,
    #[serde(default = "default_language")]
    language: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }

    let outcome = state
        .controller
        .buffered_turn(&req.conversation_id, &req.content, &req.language)
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    conversation_id: Option<String>,
    content: Option<String>,
    language: Option<String>,
}

/// SSE chat turn. Each event is one `data: <json>` line followed by a
/// blank line; EventSource clients depend on that framing.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (Some(conversation_id), Some(content)) = (query.conversation_id, query.content) else {
        return Err(ApiError::BadRequest(
            "Missing required parameters: conversationId and content".into(),
        ));
    };
    let language = query.language.unwrap_or_else(default_language);

    let events = state
        .controller
        .stream_turn(conversation_id, content, language)
        .map(|event| {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
            Ok(Event::default().data(payload))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// --- Image analysis ---

#[derive(Debug, Default)]
struct ImageForm {
    image: Option<(Vec<u8>, String, String)>, // bytes, mime, original name
    conversation_id: Option<String>,
    context: Option<String>,
    language: Option<String>,
}

async fn read_image_form(multipart: &mut Multipart) -> Result<ImageForm, ApiError> {
    let mut form = ImageForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "image" => {
                let mime = field.content_type().unwrap_or_default().to_string();
                if !mime.starts_with("image/") {
                    return Err(ApiError::BadRequest("Only image files are allowed!".into()));
                }
                let name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read image: {e}")))?;
                if bytes.len() > MAX_IMAGE_BYTES {
                    return Err(ApiError::BadRequest("Image exceeds the 10MB size limit".into()));
                }
                form.image = Some((bytes.to_vec(), mime, name));
            }
            "conversationId" => form.conversation_id = Some(read_text_field(field).await?),
            "context" => form.context = Some(read_text_field(field).await?),
            "language" => form.language = Some(read_text_field(field).await?),
            _ => {}
        }
    }

    Ok(form)
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart field: {e}")))
}

async fn analyze_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let form = read_image_form(&mut multipart).await?;

    let (bytes, mime, original_name) = form
        .image
        .ok_or_else(|| ApiError::BadRequest("No image file provided".into()))?;
    let conversation_id = form
        .conversation_id
        .ok_or_else(|| ApiError::BadRequest("Missing conversationId".into()))?;
    let context = form.context.unwrap_or_else(|| "crop disease".to_string());
    let language = form.language.unwrap_or_else(default_language);

    let image_url = store_upload(&state.upload_dir, &original_name, &bytes).await?;

    let (message, analysis) = state
        .controller
        .image_turn(&conversation_id, &bytes, &mime, image_url, &context, &language)
        .await?;

    Ok(Json(json!({ "message": message, "analysis": analysis })))
}

/// Persist an upload under a fresh random name, keeping the original
/// extension, and return the URL it is served at.
async fn store_upload(
    upload_dir: &std::path::Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<String, ApiError> {
    let extension = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let file_name = format!("{}.{}", Uuid::new_v4(), extension);

    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to prepare upload directory: {e}")))?;
    tokio::fs::write(upload_dir.join(&file_name), bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to store upload: {e}")))?;

    info!(file = %file_name, "stored uploaded image");
    Ok(format!("/uploads/{file_name}"))
}

// --- Voice ---

/// Transcription is handled client-side by the browser's speech API; this
/// endpoint only exists so older clients get a clear pointer.
async fn transcribe(mut multipart: Multipart) -> Result<Json<serde_json::Value>, ApiError> {
    let mut has_audio = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("audio") {
            // Drain and discard; nothing is transcribed server-side.
            let _ = field.bytes().await;
            has_audio = true;
        }
    }

    if !has_audio {
        return Err(ApiError::BadRequest("No audio file provided".into()));
    }

    Ok(Json(json!({
        "message": "Using browser speech recognition",
        "transcription": "Please speak again using the microphone button"
    })))
}
