use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::assignment::{AgentRoster, AgentStatus};
use crate::config::{Config, StoreBackend};
use crate::error::{HelpdeskError, StoreError, SuggestionError};
use crate::generator::OpenAiSuggestionGenerator;
use crate::knowledge::KnowledgeBase;
use crate::pg_store::PgConversationStore;
use crate::realtime::{notify, RealtimeHub, EVENT_AGENTS_PRESENCE};
use crate::service::{HelpdeskService, ServiceParts};
use crate::store::{ConversationStore, MemoryStore};
use crate::types::{
    AgentReplyBody, CategoryBody, CreateConversationBody, EventEnvelopeIn, ModeBody, SystemMode,
    VisitorMessageBody,
};

/// Process-wide system mode. Handlers read it once per request.
#[derive(Clone, Default)]
pub struct ModeHandle(Arc<RwLock<SystemMode>>);

impl ModeHandle {
    pub fn new(mode: SystemMode) -> Self {
        Self(Arc::new(RwLock::new(mode)))
    }

    pub async fn current(&self) -> SystemMode {
        *self.0.read().await
    }

    pub async fn set(&self, mode: SystemMode) -> SystemMode {
        let mut guard = self.0.write().await;
        std::mem::replace(&mut *guard, mode)
    }
}

pub struct AppState {
    pub service: Arc<HelpdeskService>,
    pub hub: Arc<RealtimeHub>,
    pub roster: Arc<AgentRoster>,
    pub mode: ModeHandle,
}

fn error_status(error: &HelpdeskError) -> StatusCode {
    match error {
        HelpdeskError::EmptyMessage
        | HelpdeskError::Suggestion(SuggestionError::EmptyContext { .. }) => StatusCode::BAD_REQUEST,
        HelpdeskError::Store(StoreError::ConversationNotFound { .. }) => StatusCode::NOT_FOUND,
        HelpdeskError::Suggestion(_) => StatusCode::BAD_GATEWAY,
        HelpdeskError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: HelpdeskError) -> Response {
    let status = error_status(&error);
    if status.is_server_error() {
        tracing::error!(%error, "request failed");
    }
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "now": Utc::now().to_rfc3339(),
        "agentConnections": state.hub.agent_client_count().await,
    }))
}

async fn get_mode(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "mode": state.mode.current().await }))
}

async fn put_mode(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ModeBody>,
) -> impl IntoResponse {
    let Some(mode) = SystemMode::parse(&body.mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "mode must be one of off, autopilot, hitl" })),
        )
            .into_response();
    };
    let previous = state.mode.set(mode).await;
    if previous != mode {
        tracing::info!(from = %previous, to = %mode, "system mode changed");
    }
    Json(json!({ "mode": mode })).into_response()
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    match state
        .service
        .open_conversation(body.visitor_id.as_deref())
        .await
    {
        Ok(conversation) => (
            StatusCode::CREATED,
            Json(json!({ "conversation": conversation })),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.service.messages(&conversation_id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn post_visitor_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<VisitorMessageBody>,
) -> Response {
    let mode = state.mode.current().await;
    match state
        .service
        .process_incoming_visitor_message(&conversation_id, &body.text, mode)
        .await
    {
        Ok(exchange) => Json(exchange).into_response(),
        Err(error) => error_response(error),
    }
}

async fn post_agent_reply(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentReplyBody>,
) -> Response {
    if body.agent_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "agentId is required" })),
        )
            .into_response();
    }
    match state
        .service
        .agent_reply(&conversation_id, body.agent_id.trim(), &body.text)
        .await
    {
        Ok(message) => Json(json!({ "message": message })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_suggestion(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.service.current_suggestion(&conversation_id).await {
        Ok(suggestion) => Json(json!({ "suggestion": suggestion })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn post_suggestion(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state
        .service
        .generate_manual_suggestion(&conversation_id)
        .await
    {
        Ok(manual) => Json(manual).into_response(),
        Err(error) => error_response(error),
    }
}

async fn patch_category(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CategoryBody>,
) -> Response {
    match state
        .service
        .set_category(&conversation_id, body.category_id.as_deref())
        .await
    {
        Ok(conversation) => Json(json!({ "conversation": conversation })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn close_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.service.close_conversation(&conversation_id).await {
        Ok(conversation) => Json(json!({ "conversation": conversation })).into_response(),
        Err(error) => error_response(error),
    }
}

async fn broadcast_presence(state: &AppState) {
    let online = state.roster.online().await;
    notify(state.hub.as_ref(), EVENT_AGENTS_PRESENCE, &online).await;
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.hub.register().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "agent:join" => {
                let agent_id = envelope
                    .data
                    .get("agentId")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                if agent_id.is_empty() {
                    state
                        .hub
                        .emit_to_client(client_id, "error", &json!({ "message": "agentId is required" }))
                        .await;
                    continue;
                }
                let name = envelope
                    .data
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(agent_id);

                match state.hub.agent_for_client(client_id).await {
                    Some(previous) if previous == agent_id => {}
                    Some(previous) => {
                        state.roster.disconnect(&previous).await;
                        state.roster.connect(agent_id, name).await;
                    }
                    None => state.roster.connect(agent_id, name).await,
                }
                state.hub.join_agent(client_id, agent_id).await;
                tracing::info!(client_id, agent_id, "agent joined");

                let mode = state.mode.current().await;
                state
                    .hub
                    .emit_to_client(
                        client_id,
                        "agent:joined",
                        &json!({ "agentId": agent_id, "mode": mode }),
                    )
                    .await;
                broadcast_presence(&state).await;
            }
            "agent:status" => {
                let Some(agent_id) = state.hub.agent_for_client(client_id).await else {
                    state
                        .hub
                        .emit_to_client(client_id, "error", &json!({ "message": "join as an agent first" }))
                        .await;
                    continue;
                };
                let Some(status) = envelope
                    .data
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(AgentStatus::parse)
                else {
                    state
                        .hub
                        .emit_to_client(
                            client_id,
                            "error",
                            &json!({ "message": "status must be online, away or offline" }),
                        )
                        .await;
                    continue;
                };
                state.roster.set_status(&agent_id, status).await;
                broadcast_presence(&state).await;
            }
            other => {
                tracing::debug!(client_id, event = other, "ignoring unknown socket event");
            }
        }
    }

    if let Some(agent_id) = state.hub.unregister(client_id).await {
        state.roster.disconnect(&agent_id).await;
        tracing::info!(client_id, %agent_id, "agent disconnected");
        broadcast_presence(&state).await;
    }
    send_task.abort();
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/mode", get(get_mode).put(put_mode))
        .route("/api/conversations", post(create_conversation))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_visitor_message),
        )
        .route(
            "/api/conversations/{conversation_id}/reply",
            post(post_agent_reply),
        )
        .route(
            "/api/conversations/{conversation_id}/suggestion",
            get(get_suggestion).post(post_suggestion),
        )
        .route(
            "/api/conversations/{conversation_id}/category",
            patch(patch_category),
        )
        .route(
            "/api/conversations/{conversation_id}/close",
            post(close_conversation),
        )
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn ConversationStore> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PgConversationStore::connect(&config.database_url)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("using in-memory conversation store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let knowledge = match config.generator.knowledge_dir.as_deref() {
        Some(dir) => KnowledgeBase::load_dir(dir)
            .await
            .with_context(|| format!("failed to load knowledge base from {}", dir.display()))?,
        None => KnowledgeBase::empty(),
    };
    tracing::info!(chunks = knowledge.len(), "knowledge base ready");

    let generator = Arc::new(OpenAiSuggestionGenerator::new(
        reqwest::Client::new(),
        config.generator.clone(),
        Arc::new(knowledge),
    ));
    let hub = Arc::new(RealtimeHub::new());
    let roster = Arc::new(AgentRoster::new());
    let service = Arc::new(HelpdeskService::new(ServiceParts {
        store,
        generator,
        resolver: roster.clone(),
        notifier: hub.clone(),
        limits: config.context,
        use_retrieval: config.generator.retrieval_enabled,
        offline_notice: config.offline_notice.clone(),
    }));

    let state = Arc::new(AppState {
        service,
        hub,
        roster,
        mode: ModeHandle::new(config.initial_mode),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(port = config.port, mode = %config.initial_mode, "helpdesk server listening");
    axum::serve(listener, router(state))
        .await
        .context("server runtime failure")?;
    Ok(())
}
