use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::error;

pub mod completions;
pub mod config;
pub mod context_builder;
pub mod db;
pub mod models;
pub mod registry;
pub mod web;

use completions::CompletionClient;
use db::{DBConnection, DBError};
use registry::StreamRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid JWT")]
    InvalidJwt,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad Request")]
    BadRequest,

    #[error("Resource not found")]
    NotFound,

    #[error("Internal server error")]
    InternalServerError,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::InvalidJwt => StatusCode::UNAUTHORIZED,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        if err.is_not_found() {
            return ApiError::NotFound;
        }
        error!("Database error: {:?}", err);
        ApiError::InternalServerError
    }
}

pub struct AppState {
    pub db: Arc<dyn DBConnection + Send + Sync>,
    pub completions: Arc<dyn CompletionClient + Send + Sync>,
    pub registry: StreamRegistry,
    pub chat_model: String,
    pub title_model: String,
    pub jwt_secret: String,
    pub stream_ttl: Duration,
}
