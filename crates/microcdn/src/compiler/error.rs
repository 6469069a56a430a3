//! Errors raised while ingesting an upload

use crate::streams::LimitExceeded;
use script_storage::StorageError;
use std::fmt;

#[derive(Debug)]
pub enum CompileError {
    /// Unsupported or unrecognised content type
    Validation(String),
    /// One of the size ceilings was reached
    SizeLimitExceeded { stage: &'static str, limit: u64 },
    /// An archive held no eligible script
    EmptyArchive,
    /// The minifier rejected the input; carries its diagnostics
    MinificationFailed(String),
    NotFound(String),
    Forbidden,
    Storage(StorageError),
    Io(Box<std::io::Error>),
}

impl CompileError {
    /// HTTP status the error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            CompileError::Validation(_) => 400,
            CompileError::SizeLimitExceeded { .. } => 413,
            CompileError::EmptyArchive | CompileError::MinificationFailed(_) => 422,
            CompileError::NotFound(_) => 404,
            CompileError::Forbidden => 403,
            CompileError::Storage(_) | CompileError::Io(_) => 500,
        }
    }

    /// Map an IO failure from a limited stream, keeping size-limit failures distinct
    pub(crate) fn from_limited_io(err: std::io::Error, stage: &'static str) -> Self {
        match LimitExceeded::find(&err) {
            Some(LimitExceeded { limit }) => CompileError::SizeLimitExceeded { stage, limit },
            None => CompileError::Io(Box::new(err)),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Validation(msg) => write!(f, "Invalid upload: {}", msg),
            CompileError::SizeLimitExceeded { stage, limit } => {
                write!(f, "The {} size limit of {} bytes was exceeded", stage, limit)
            }
            CompileError::EmptyArchive => write!(f, "The archive contains no script files"),
            CompileError::MinificationFailed(diagnostics) => {
                write!(f, "Minification failed: {}", diagnostics)
            }
            CompileError::NotFound(id) => write!(f, "No such file: {}", id),
            CompileError::Forbidden => write!(f, "Wrong password"),
            CompileError::Storage(err) => write!(f, "Storage error: {}", err),
            CompileError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Storage(err) => Some(err),
            CompileError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StorageError> for CompileError {
    fn from(err: StorageError) -> Self {
        CompileError::Storage(err)
    }
}

impl From<std::io::Error> for CompileError {
    fn from(err: std::io::Error) -> Self {
        CompileError::Io(Box::new(err))
    }
}

impl From<zip::result::ZipError> for CompileError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(err) => CompileError::Io(Box::new(err)),
            other => CompileError::Validation(format!("unreadable archive: {}", other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CompileError::Validation("x".into()).status_code(), 400);
        assert_eq!(
            CompileError::SizeLimitExceeded {
                stage: "upload",
                limit: 1
            }
            .status_code(),
            413
        );
        assert_eq!(CompileError::EmptyArchive.status_code(), 422);
        assert_eq!(CompileError::NotFound("00-a.js".into()).status_code(), 404);
        assert_eq!(CompileError::Forbidden.status_code(), 403);
    }

    #[test]
    fn test_limited_io_keeps_size_failures_apart() {
        let tripped = std::io::Error::other(LimitExceeded { limit: 10 });
        assert!(matches!(
            CompileError::from_limited_io(tripped, "upload"),
            CompileError::SizeLimitExceeded {
                stage: "upload",
                limit: 10
            }
        ));

        let plain = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            CompileError::from_limited_io(plain, "upload"),
            CompileError::Io(_)
        ));
    }

    #[test]
    fn test_minification_failure_display() {
        let err = CompileError::MinificationFailed("ERROR - Parse error".to_string());
        assert_eq!(format!("{}", err), "Minification failed: ERROR - Parse error");
    }
}
