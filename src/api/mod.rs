//! HTTP API server for murmur
//!
//! Exposes the conversation history store and the live pipeline status.
//! Identity arrives from an upstream authenticator as request headers.

pub mod conversation;
pub mod health;
pub mod pipeline;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{ConversationRepo, DbPool, UserRepo};
use crate::pipeline::PipelineHandle;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub conversations: ConversationRepo,
    pub users: UserRepo,
    pub persona_id: String,
    /// Present when a talk session runs in this process
    pub pipeline: Option<PipelineHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error half of every handler result
pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

/// Map a crate error onto a status code
fn api_error(e: &Error) -> ApiError {
    match e {
        Error::NotFound(what) => {
            error_response(StatusCode::NOT_FOUND, "not_found", &format!("{what} not found"))
        }
        Error::InvalidInput(message) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", message)
        }
        other => {
            tracing::error!(error = %other, "request failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "db_error",
                &other.to_string(),
            )
        }
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    port: u16,
    persona_id: String,
    pipeline: Option<PipelineHandle>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, port: u16) -> Self {
        Self {
            db,
            port,
            persona_id: String::new(),
            pipeline: None,
        }
    }

    /// Set the persona reported by the status endpoint
    #[must_use]
    pub fn persona_id(mut self, id: impl Into<String>) -> Self {
        self.persona_id = id.into();
        self
    }

    /// Attach a live pipeline for `/api/pipeline`
    #[must_use]
    pub fn pipeline(mut self, handle: PipelineHandle) -> Self {
        self.pipeline = Some(handle);
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            conversations: ConversationRepo::new(self.db.clone()),
            users: UserRepo::new(self.db.clone()),
            db: self.db,
            persona_id: self.persona_id,
            pipeline: self.pipeline,
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let router = Router::new()
            .nest("/api/conversation", conversation::router(self.state.clone()))
            .nest("/api/pipeline", pipeline::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        // CORS layer for cross-origin requests from frontend
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
