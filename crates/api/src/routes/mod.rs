use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State};
use axum::{
    Json, Router,
    extract::ws::close_code,
    http::{StatusCode, header},
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use telecare_domain::{
    chat::{Chat, ChatMessage},
    diagnosis::Diagnosis,
    error::DomainError,
    events::ChatEvent,
    pipeline::{MAX_VOICE_UPLOAD_BYTES, ResponseReceipt, VoiceUpload},
    verification::VerificationRequest,
};
use telecare_infra::media::zip_bundle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_stream::wrappers::UnboundedReceiverStream;
use validator::Validate;

use crate::middleware::AuthContext;
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chats", post(create_chat).get(list_chats))
        .route("/v1/chats/:chat_id", axum::routing::put(rename_chat).delete(delete_chat))
        .route(
            "/v1/chats/:chat_id/messages",
            get(list_messages).post(send_text_message),
        )
        .route("/v1/chats/:chat_id/messages/sync", get(sync_messages))
        .route("/v1/chats/:chat_id/voice", post(send_voice_message))
        .route("/v1/chats/:chat_id/responding", get(response_in_progress))
        .route("/v1/chats/:chat_id/diagnosing", get(diagnosis_in_progress))
        .route("/v1/chats/:chat_id/audio/:message_id", get(download_reply_audio))
        .route(
            "/v1/chats/:chat_id/diagnoses",
            post(request_diagnosis)
                .get(list_diagnoses)
                .delete(delete_all_diagnoses),
        )
        .route(
            "/v1/diagnoses/:diagnosis_id",
            get(diagnosis_details).delete(delete_diagnosis),
        )
        .route("/v1/chats/:chat_id/events/ws", get(stream_events_ws))
        .route("/v1/chats/:chat_id/events/sse", get(stream_events_sse))
        .route("/v1/verification/requests", post(submit_verification_request))
        .route(
            "/v1/verification/requests/:request_id/attachments",
            get(download_attachment_archive),
        )
        .route(
            "/v1/verification/attachments/:attachment_id",
            get(download_attachment),
        )
        .route(
            "/v1/verification/requests/:request_id/approve",
            post(approve_verification_request),
        )
        .route(
            "/v1/verification/requests/:request_id/reject",
            post(reject_verification_request),
        )
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        // Voice uploads and credential scans exceed axum's default limit.
        .layer(DefaultBodyLimit::max(MAX_VOICE_UPLOAD_BYTES + 1024 * 1024))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Deserialize, Validate)]
struct CreateChatRequest {
    #[validate(length(max = 50))]
    title: Option<String>,
}

#[derive(Deserialize, Validate)]
struct RenameChatRequest {
    #[validate(length(max = 50))]
    title: Option<String>,
}

#[derive(Deserialize, Validate)]
struct SendMessageRequest {
    #[validate(length(min = 1, max = 2000))]
    content: String,
}

#[derive(Deserialize)]
struct SyncQuery {
    last_message_id: Option<String>,
}

#[derive(Deserialize)]
struct RejectRequest {
    note: Option<String>,
}

#[derive(Serialize)]
struct ChatMessagesResponse {
    chat: Chat,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct InProgressResponse {
    in_progress: bool,
}

#[derive(Serialize)]
struct DeletedCountResponse {
    removed: usize,
}

async fn create_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let chat = state.chats.create_chat(&actor, payload.title).await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let actor = auth.actor()?;
    Ok(Json(state.chats.list_chats(&actor).await?))
}

async fn rename_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    Json(payload): Json<RenameChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let chat = state
        .chats
        .rename_chat(&actor, &chat_id, payload.title)
        .await?;
    Ok(Json(chat))
}

async fn delete_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let actor = auth.actor()?;
    state.chats.delete_chat(&actor, &chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatMessagesResponse>, ApiError> {
    let actor = auth.actor()?;
    let (chat, messages) = state.chats.get_messages(&actor, &chat_id).await?;
    Ok(Json(ChatMessagesResponse { chat, messages }))
}

async fn sync_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let actor = auth.actor()?;
    let messages = state
        .chats
        .sync_messages(&actor, &chat_id, query.last_message_id.as_deref())
        .await?;
    Ok(Json(messages))
}

async fn send_text_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<ResponseReceipt>), ApiError> {
    validation::validate(&payload)?;
    let actor = auth.actor()?;
    let result = state
        .pipelines
        .try_start_text_response(&actor, &chat_id, &payload.content)
        .await;
    observability::register_pipeline_run("text-response", admission_outcome(&result));
    Ok((StatusCode::ACCEPTED, Json(result?)))
}

async fn send_voice_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let actor = auth.actor()?;
    let upload = voice_upload_from_multipart(multipart).await?;
    let result = state
        .pipelines
        .try_start_voice_response(&actor, &chat_id, upload)
        .await;
    observability::register_pipeline_run("voice-response", admission_outcome(&result));
    result?;
    Ok(StatusCode::ACCEPTED)
}

async fn voice_upload_from_multipart(mut multipart: Multipart) -> Result<VoiceUpload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Validation(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let mime_type = field
            .content_type()
            .ok_or_else(|| ApiError::Validation("audio content type is required".into()))?
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        return Ok(VoiceUpload {
            mime_type,
            bytes: bytes.to_vec(),
        });
    }
    Err(ApiError::Validation("multipart field 'file' is required".into()))
}

async fn response_in_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<InProgressResponse>, ApiError> {
    let actor = auth.actor()?;
    state.chats.owned_chat(&actor, &chat_id).await?;
    Ok(Json(InProgressResponse {
        in_progress: state.pipelines.is_response_in_progress(&chat_id),
    }))
}

async fn diagnosis_in_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<InProgressResponse>, ApiError> {
    let actor = auth.actor()?;
    state.chats.owned_chat(&actor, &chat_id).await?;
    Ok(Json(InProgressResponse {
        in_progress: state.pipelines.is_diagnosis_in_progress(&chat_id),
    }))
}

async fn download_reply_audio(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let message = state
        .chats
        .get_ai_message(&actor, &chat_id, &message_id)
        .await?;
    let bytes = state
        .media
        .read_reply_audio(&chat_id, &message.message_id)
        .await
        .map_err(DomainError::from)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "audio/wav")],
        bytes,
    )
        .into_response())
}

async fn request_diagnosis(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<(StatusCode, Json<Diagnosis>), ApiError> {
    let actor = auth.actor()?;
    let result = state.pipelines.try_start_diagnosis(&actor, &chat_id).await;
    observability::register_pipeline_run("diagnosis", admission_outcome(&result));
    Ok((StatusCode::ACCEPTED, Json(result?)))
}

async fn list_diagnoses(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<Diagnosis>>, ApiError> {
    let actor = auth.actor()?;
    Ok(Json(state.diagnoses.list_for_chat(&actor, &chat_id).await?))
}

async fn delete_all_diagnoses(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Json<DeletedCountResponse>, ApiError> {
    let actor = auth.actor()?;
    let removed = state
        .diagnoses
        .delete_all_completed(&actor, &chat_id)
        .await?;
    Ok(Json(DeletedCountResponse { removed }))
}

async fn diagnosis_details(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(diagnosis_id): Path<String>,
) -> Result<Json<Diagnosis>, ApiError> {
    let actor = auth.actor()?;
    Ok(Json(state.diagnoses.details(&actor, &diagnosis_id).await?))
}

async fn delete_diagnosis(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(diagnosis_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let actor = auth.actor()?;
    state
        .diagnoses
        .delete_completed(&actor, &diagnosis_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_events_ws(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    state.chats.owned_chat(&actor, &chat_id).await?;
    let receiver = state.realtime.subscribe(&chat_id).await;
    Ok(ws.on_upgrade(move |socket| handle_event_websocket(socket, receiver)))
}

async fn handle_event_websocket(socket: WebSocket, mut receiver: broadcast::Receiver<ChatEvent>) {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let notice = format!("{{\"event\":\"lagged\",\"skipped\":{skipped}}}");
                    if sink.send(Message::Text(notice)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "stream ended".into(),
        })))
        .await;
}

async fn stream_events_sse(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(chat_id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    state.chats.owned_chat(&actor, &chat_id).await?;
    let mut receiver = state.realtime.subscribe(&chat_id).await;
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if tx.send(Ok(Event::default().event(event.name()).data(data))).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let notice = Event::default().event("lagged").data(skipped.to_string());
                    if tx.send(Ok(notice)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

async fn submit_verification_request(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<VerificationRequest>), ApiError> {
    let actor = auth.actor()?;
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Validation(err.to_string()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        uploads.push((file_name, bytes.to_vec()));
    }
    let request = state.vault.submit_request(&actor, uploads).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn download_attachment_archive(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let bundle = state.vault.archive_attachments(&actor, &request_id).await?;
    let archive = zip_bundle(&bundle).map_err(DomainError::from)?;
    let disposition = format!("attachment; filename=\"{request_id}.zip\"");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

async fn download_attachment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(attachment_id): Path<String>,
) -> Result<Response, ApiError> {
    let actor = auth.actor()?;
    let (file_name, bytes) = state.vault.fetch_attachment(&actor, &attachment_id).await?;
    let disposition = format!("attachment; filename=\"{file_name}\"");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn approve_verification_request(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> Result<Json<VerificationRequest>, ApiError> {
    let actor = auth.actor()?;
    Ok(Json(state.vault.approve(&actor, &request_id).await?))
}

async fn reject_verification_request(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(request_id): Path<String>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<VerificationRequest>, ApiError> {
    let actor = auth.actor()?;
    Ok(Json(
        state.vault.reject(&actor, &request_id, payload.note).await?,
    ))
}

fn admission_outcome<T>(result: &Result<T, DomainError>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(DomainError::Busy) => "busy",
        Err(_) => "rejected",
    }
}
