//! Conversation history endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState, api_error, error_response};
use crate::db::{Conversation, ConversationStore, ConversationTurn, Identity, TurnRole};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// Build conversation router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/",
            get(get_conversation)
                .post(append_message)
                .delete(clear_conversation),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub role: &'static str,
    pub content: String,
    pub timestamp: String,
}

impl From<&ConversationTurn> for MessageResponse {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            id: turn.id.clone(),
            role: turn.role.as_str(),
            content: turn.text.clone(),
            timestamp: turn.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationBody {
    pub id: String,
    pub messages: Vec<MessageResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Conversation> for ConversationBody {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            messages: conversation.turns.iter().map(MessageResponse::from).collect(),
            created_at: conversation.created_at.to_rfc3339(),
            updated_at: conversation.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: ConversationBody,
    pub user: Identity,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub conversation_id: String,
    pub message: MessageResponse,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub success: bool,
}

/// Read the upstream identity headers
///
/// Values are raw UTF-8, so names like "Ayşe" pass through unchanged.
fn identity(headers: &HeaderMap) -> Result<Identity, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    let Some(id) = header(USER_ID_HEADER) else {
        tracing::debug!("request without user id header");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing user identity",
        ));
    };

    Ok(Identity {
        id,
        name: header(USER_NAME_HEADER),
        email: header(USER_EMAIL_HEADER),
    })
}

/// Resolve the identity and record the user
fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let identity = identity(headers)?;
    let user = state.users.upsert(&identity).map_err(|e| api_error(&e))?;
    Ok(user.identity())
}

/// Get a specific conversation, or the current one
async fn get_conversation(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;

    let conversation = match query.conversation_id.as_deref() {
        Some(id) => state.conversations.get(&user.id, id),
        None => state.conversations.fetch_current(&user.id),
    }
    .map_err(|e| api_error(&e))?;

    Ok(Json(ConversationResponse {
        conversation: ConversationBody::from(&conversation),
        user,
    }))
}

/// Append one message
async fn append_message(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<AppendRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let user = authenticate(&state, &headers)?;

    if req.role.is_empty() || req.content.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "role and content are required",
        ));
    }
    let role = TurnRole::parse(&req.role).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            &format!("unknown role: {}", req.role),
        )
    })?;

    let conversation_id = state
        .conversations
        .append(&user.id, req.conversation_id.as_deref(), role, &req.content)
        .map_err(|e| api_error(&e))?;

    let conversation = state
        .conversations
        .get(&user.id, &conversation_id)
        .map_err(|e| api_error(&e))?;
    let message = conversation.turns.last().map(MessageResponse::from).ok_or_else(|| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "db_error",
            "appended message missing",
        )
    })?;

    Ok((
        StatusCode::CREATED,
        Json(AppendResponse {
            conversation_id,
            message,
        }),
    ))
}

/// Delete one conversation, or all of the user's
async fn clear_conversation(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ClearResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;

    state
        .conversations
        .clear(&user.id, query.conversation_id.as_deref())
        .map_err(|e| api_error(&e))?;

    Ok(Json(ClearResponse { success: true }))
}
