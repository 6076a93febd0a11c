//! Centralized error types for the dispatch core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the ingest engine.
///
/// Variants correspond to the closed error-kind enumeration: each kind has
/// a fixed propagation policy (retry, skip-and-count, warn, or fatal) that
/// callers must honor rather than re-deciding per call site.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum EngineError {
    /// Startup configuration is missing or malformed. Fatal.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A required dependency (DB at startup) could not be reached. Fatal for DB;
    /// MQTT and the object store use this variant too but callers there warn
    /// and retry instead of propagating.
    #[error("dependency unreachable: {0}")]
    DependencyUnreachable(String),

    /// An inbound record did not match any recognized envelope shape.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Identity resolution hit a conflicting or vanished merge target.
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// A unique-constraint violation raced a concurrent resolve.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// The local leg of an audio save failed outright.
    #[error("audio save failed: {0}")]
    AudioSaveLocal(String),

    /// The object-store leg of an audio save failed; local copy is authoritative.
    #[error("audio upload failed: {0}")]
    AudioUploadRemote(String),

    /// A requested key resolved outside the configured audio root.
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    /// A bounded queue (transcription, subscriber, upload) was full.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// The upstream transcription service returned an error or timed out.
    #[error("transcription upstream error: {0}")]
    UpstreamSTT(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all for unclassified internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::DependencyUnreachable(_) => "dependency_unreachable",
            Self::MalformedRecord(_) => "malformed_record",
            Self::IdentityConflict(_) => "identity_conflict",
            Self::WriteConflict(_) => "write_conflict",
            Self::AudioSaveLocal(_) => "audio_save_local",
            Self::AudioUploadRemote(_) => "audio_upload_remote",
            Self::PathTraversal(_) => "path_traversal",
            Self::QueueFull(_) => "queue_full",
            Self::UpstreamSTT(_) => "upstream_stt",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PathTraversal(_) | Self::MalformedRecord(_) => StatusCode::BAD_REQUEST,
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DependencyUnreachable(_) | Self::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::IdentityConflict(_) | Self::WriteConflict(_) => StatusCode::CONFLICT,
            Self::AudioSaveLocal(_) | Self::AudioUploadRemote(_) | Self::UpstreamSTT(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("internal error surfaced to HTTP layer: {self}");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::WriteConflict(err.to_string())
            }
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::DependencyUnreachable(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::UpstreamSTT(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::AudioSaveLocal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_traversal_returns_bad_request() {
        let err = EngineError::PathTraversal("../../etc/passwd".into());
        assert_eq!(err.code(), "path_traversal");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn queue_full_returns_service_unavailable() {
        let err = EngineError::QueueFull("transcription".into());
        assert_eq!(err.code(), "queue_full");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn not_found_returns_404() {
        let err = EngineError::NotFound("call 123".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
