//! Error types for the microcdn service

use crate::compiler::CompileError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use script_storage::StorageError;
use serde_json::json;
use std::fmt;

/// Failures while starting the service
#[derive(Debug)]
pub enum MicrocdnError {
    Storage(StorageError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for MicrocdnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MicrocdnError::Storage(err) => write!(f, "Storage error: {}", err),
            MicrocdnError::Io(err) => write!(f, "IO error: {}", err),
            MicrocdnError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for MicrocdnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MicrocdnError::Storage(err) => Some(err),
            MicrocdnError::Io(err) => Some(err.as_ref()),
            MicrocdnError::Config(_) => None,
        }
    }
}

impl From<StorageError> for MicrocdnError {
    fn from(err: StorageError) -> Self {
        MicrocdnError::Storage(err)
    }
}

impl From<std::io::Error> for MicrocdnError {
    fn from(err: std::io::Error) -> Self {
        MicrocdnError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for MicrocdnError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        MicrocdnError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MicrocdnError>;

/// Request failures, rendered as `{"error": ...}` JSON
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Compile(CompileError),
    Storage(StorageError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(id) => (StatusCode::NOT_FOUND, format!("No such file: {}", id)),
            AppError::Compile(err) => {
                let status = StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(error = %err, "Compile pipeline error");
                    (status, "Internal server error".to_string())
                } else {
                    (status, err.to_string())
                }
            }
            AppError::Storage(err) => {
                tracing::error!(error = %err, "Storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<CompileError> for AppError {
    fn from(err: CompileError) -> Self {
        AppError::Compile(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Storage(err)
    }
}
