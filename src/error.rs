//! Error type shared by the handoff controller and its HTTP surface.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HandoffError>;

#[derive(Debug, Error)]
pub enum HandoffError {
    /// Visitor, staff member or queue entry does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The operation is illegal for the visitor's current service status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A store, cache or message-bus call failed.
    #[error("{service} unavailable: {source}")]
    UpstreamUnavailable {
        service: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl HandoffError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn upstream(
        service: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::UpstreamUnavailable {
            service,
            source: source.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for HandoffError {
    fn from(err: sqlx::Error) -> Self {
        Self::upstream("database", err)
    }
}

impl From<sqlx::migrate::MigrateError> for HandoffError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::upstream("database", err)
    }
}

impl From<reqwest::Error> for HandoffError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream("message bus", err)
    }
}

impl IntoResponse for HandoffError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status_code(),
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
