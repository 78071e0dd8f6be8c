//! Error types shared across the engine and the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::logging;

#[derive(Debug, Error)]
pub enum GurukulError {
    #[error("Invalid agent type: {0}")]
    UnknownPersona(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Curriculum error: {0}")]
    Curriculum(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stored data is invalid: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, GurukulError>;

impl GurukulError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn curriculum(message: impl Into<String>) -> Self {
        Self::Curriculum(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownPersona(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GurukulError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            logging::log_error(None, &self.to_string());
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
