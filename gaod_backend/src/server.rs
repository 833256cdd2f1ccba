use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::auth::{AuthService, LoginOutcome, NewUser, User};
use crate::chat::{ChatEvent, ChatService, RejectionKind, SendMessageRequest, TurnOutcome};
use crate::llm_client::{load_model_catalog, ModelDescriptor, CUSTOM_MODELS_KEY};
use crate::runtime::GaodRuntime;
use crate::security;
use crate::store::{AttachmentMeta, Conversation, SettingsStore};

#[derive(Clone)]
pub struct ServerState {
    pub chat: Arc<ChatService>,
    pub auth: AuthService,
    pub settings: Arc<dyn SettingsStore>,
    pub default_model: ModelDescriptor,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

/// Authenticated caller, attached to the request by [`auth_middleware`].
#[derive(Debug, Clone)]
struct Session {
    user: User,
    token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip)]
    pub user_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    content: String,
    #[serde(default, alias = "modelId")]
    model_id: Option<String>,
    #[serde(default)]
    attachments: Vec<AttachmentMeta>,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct MemoryResponse {
    memory: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingValue {
    #[serde(default)]
    value: Option<String>,
}

pub async fn serve_backend(
    runtime: GaodRuntime,
    event_rx: flume::Receiver<ChatEvent>,
) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let (ws_events, _) = broadcast::channel(512);
    let state = Arc::new(ServerState {
        chat: runtime.chat.clone(),
        auth: runtime.auth.clone(),
        settings: runtime.settings.clone(),
        default_model: runtime.config.default_model.clone(),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Gaod backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .with_state(state.clone());

    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/me", get(me))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/conversations/:id/messages", post(send_message))
        .route("/memory", get(get_memory).delete(clear_memory))
        .route("/models", get(list_models).put(update_models))
        .route("/settings/:key", get(get_setting).put(put_setting))
        .route("/users", get(list_users).post(create_user))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", public.merge(protected))
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<ChatEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_chat_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_chat_event(event: ChatEvent) -> ApiEventEnvelope {
    match event {
        ChatEvent::TurnStarted {
            user_id,
            conversation_id,
            user_turn_id,
        } => envelope(
            "turn_started",
            user_id,
            serde_json::json!({
                "conversation_id": conversation_id,
                "user_turn_id": user_turn_id,
            }),
        ),
        ChatEvent::TurnChunk {
            user_id,
            conversation_id,
            content,
        } => envelope(
            "turn_chunk",
            user_id,
            serde_json::json!({ "conversation_id": conversation_id, "content": content }),
        ),
        ChatEvent::TurnCompleted {
            user_id,
            conversation_id,
            assistant_turn_id,
            effects,
        } => envelope(
            "turn_completed",
            user_id,
            serde_json::json!({
                "conversation_id": conversation_id,
                "assistant_turn_id": assistant_turn_id,
                "effects": effects,
            }),
        ),
        ChatEvent::TurnFailed {
            user_id,
            conversation_id,
            error,
        } => envelope(
            "turn_failed",
            user_id,
            serde_json::json!({ "conversation_id": conversation_id, "error": error }),
        ),
        ChatEvent::TurnRejected {
            user_id,
            conversation_id,
            reason,
        } => envelope(
            "turn_rejected",
            user_id,
            serde_json::json!({ "conversation_id": conversation_id, "reason": reason }),
        ),
    }
}

fn envelope(event_type: &str, user_id: String, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
        user_id,
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(&headers)?;
    let user = state
        .auth
        .current_user(&token)
        .await
        .map_err(|error| {
            tracing::error!("Session lookup failed: {:#}", error);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    request.extensions_mut().insert(Session { user, token });
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<String, StatusCode> {
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(token) = auth_value.trim().strip_prefix("Bearer ") else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(token.to_string())
}

fn require_admin(user: &User) -> Result<(), (StatusCode, String)> {
    if user.is_admin() {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "admin access required".to_string()))
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn login(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, (StatusCode, String)> {
    let outcome = state
        .auth
        .login(&body.email, &body.password)
        .await
        .map_err(internal_error)?;
    let status = match outcome {
        LoginOutcome::Success { .. } => StatusCode::OK,
        LoginOutcome::Failure { .. } => StatusCode::UNAUTHORIZED,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn logout(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<HealthResponse>, (StatusCode, String)> {
    state
        .auth
        .logout(&session.token)
        .await
        .map_err(internal_error)?;
    Ok(Json(HealthResponse { status: "ok" }))
}

async fn me(Extension(session): Extension<Session>) -> Json<User> {
    Json(session.user)
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<Conversation>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .chat
        .list_conversations(&session.user, limit)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn create_conversation(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Conversation>, (StatusCode, String)> {
    state
        .chat
        .create_conversation(&session.user)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Conversation>, (StatusCode, String)> {
    require_conversation(&state, &session.user, &conversation_id)
        .await
        .map(Json)
}

async fn delete_conversation(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    let deleted = state
        .chat
        .delete_conversation(&session.user, &conversation_id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!(
            "conversation '{}' not found",
            conversation_id
        )));
    }
    Ok(Json(DeleteResponse { deleted }))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, (StatusCode, String)> {
    require_conversation(&state, &session.user, &conversation_id).await?;

    let outcome = state
        .chat
        .send_message(
            &session.user,
            SendMessageRequest {
                conversation_id,
                content: body.content,
                model_id: body.model_id,
                attachments: body.attachments,
            },
        )
        .await
        .map_err(internal_error)?;

    Ok((outcome_status(&outcome), Json(outcome)).into_response())
}

fn outcome_status(outcome: &TurnOutcome) -> StatusCode {
    match outcome {
        TurnOutcome::Completed { .. } | TurnOutcome::Failed { .. } => StatusCode::OK,
        TurnOutcome::Rejected { kind, .. } => match kind {
            RejectionKind::Validation => StatusCode::BAD_REQUEST,
            RejectionKind::Busy => StatusCode::CONFLICT,
            RejectionKind::Quota => StatusCode::TOO_MANY_REQUESTS,
        },
    }
}

async fn get_memory(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<MemoryResponse>, (StatusCode, String)> {
    let memory = state
        .chat
        .memory()
        .read(&session.user.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(MemoryResponse { memory }))
}

async fn clear_memory(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<MemoryResponse>, (StatusCode, String)> {
    state
        .chat
        .memory()
        .clear(&session.user.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(MemoryResponse {
        memory: String::new(),
    }))
}

async fn list_models(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<ModelDescriptor>>, (StatusCode, String)> {
    load_model_catalog(state.settings.as_ref(), &state.default_model)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn update_models(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Json(models): Json<Vec<ModelDescriptor>>,
) -> Result<Json<Vec<ModelDescriptor>>, (StatusCode, String)> {
    require_admin(&session.user)?;
    let raw = serde_json::to_string(&models)
        .map_err(|error| internal_error(anyhow::Error::new(error)))?;
    state
        .settings
        .set(CUSTOM_MODELS_KEY, &raw)
        .await
        .map_err(internal_error)?;
    tracing::info!("Model catalog updated ({} entries)", models.len());
    Ok(Json(models))
}

async fn get_setting(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, (StatusCode, String)> {
    require_admin(&session.user)?;
    let value = state.settings.get(&key).await.map_err(internal_error)?;
    Ok(Json(SettingValue { value }))
}

/// A missing or empty value deletes the key.
async fn put_setting(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> Result<Json<SettingValue>, (StatusCode, String)> {
    require_admin(&session.user)?;
    let result = match body.value.as_deref().filter(|value| !value.is_empty()) {
        Some(value) => state.settings.set(&key, value).await,
        None => state.settings.delete(&key).await,
    };
    result.map_err(internal_error)?;
    tracing::info!("Setting '{}' updated by {}", key, session.user.id);
    Ok(Json(body))
}

async fn list_users(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<User>>, (StatusCode, String)> {
    require_admin(&session.user)?;
    state
        .auth
        .list_users(&session.user)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn create_user(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    Json(body): Json<NewUser>,
) -> Result<Json<User>, (StatusCode, String)> {
    require_admin(&session.user)?;
    state
        .auth
        .create_user(&session.user, &body)
        .await
        .map(Json)
        .map_err(|error| (StatusCode::BAD_REQUEST, error.to_string()))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    Extension(session): Extension<Session>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, session.user.id, socket))
}

/// Forward the caller's own chat events until either side closes.
async fn handle_events_socket(state: Arc<ServerState>, user_id: String, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.user_id != user_id {
                            continue;
                        }
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn require_conversation(
    state: &ServerState,
    user: &User,
    conversation_id: &str,
) -> Result<Conversation, (StatusCode, String)> {
    state
        .chat
        .get_conversation(user, conversation_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("conversation '{}' not found", conversation_id)))
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    let request_id = security::log_failure("http", &format!("{:#}", error), &serde_json::Value::Null);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{} (request {})", security::redact_text(&error.to_string()), request_id),
    )
}
