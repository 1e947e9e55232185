use crate::error::ChatError;
use crate::pipeline::ChatService;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
struct AppState {
    service: Arc<ChatService>,
}

#[derive(Deserialize)]
struct ConversationsQuery {
    user: String,
}

#[derive(Deserialize)]
struct MessagesQuery {
    conversation: String,
    user: String,
    limit: Option<usize>,
    /// RFC 3339 cursor; only messages strictly older are returned.
    before: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

fn error_response(e: ChatError) -> axum::response::Response {
    let status = match &e {
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Persistence(_) | ChatError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            code: e.kind().to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

pub async fn start_http_server(
    http_port: u16,
    service: Arc<ChatService>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app_state = AppState { service };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/conversations", get(conversations_handler))
        .route("/api/messages", get(messages_handler))
        .layer(cors)
        .with_state(app_state);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to bind HTTP server to {}: {}. Try a different port.",
                    addr, e
                );
            }
        }
    });

    info!("HTTP server started");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn conversations_handler(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
) -> axum::response::Response {
    match state.service.list_conversations(&query.user).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => error_response(e),
    }
}

async fn messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> axum::response::Response {
    match state
        .service
        .list_messages(&query.user, &query.conversation, query.limit, query.before)
        .await
    {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e),
    }
}
