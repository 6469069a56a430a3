//! Error types for script storage

use std::fmt;

#[derive(Debug)]
pub enum StorageError {
    Redis(Box<redis::RedisError>),
    Io(Box<std::io::Error>),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Redis(err) => write!(f, "Redis error: {}", err),
            StorageError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Redis(err) => Some(err.as_ref()),
            StorageError::Io(err) => Some(err.as_ref()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::Redis(Box::new(err))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(Box::new(err))
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(err) => *err,
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
