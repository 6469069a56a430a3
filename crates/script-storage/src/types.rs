//! Read-path types shared with the fetch layer

use crate::metadata::Metadata;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;

/// A lazily produced sequence of byte chunks
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An object body plus the metadata it was served with
pub struct ObjectStream {
    pub id: String,
    pub metadata: Option<Metadata>,
    pub body: ByteStream,
}

impl ObjectStream {
    pub fn new(id: impl Into<String>, metadata: Option<Metadata>, body: ByteStream) -> Self {
        Self {
            id: id.into(),
            metadata,
            body,
        }
    }

    /// Replace the body, keeping id and metadata
    pub fn map_body(self, f: impl FnOnce(ByteStream) -> ByteStream) -> Self {
        Self {
            id: self.id,
            metadata: self.metadata,
            body: f(self.body),
        }
    }
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream")
            .field("id", &self.id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Result of a conditional read
#[derive(Debug)]
pub enum ReadOutcome {
    Stream(ObjectStream),
    /// The caller's copy is at least as new as the stored object
    NotModified,
    NotFound,
}

impl ReadOutcome {
    pub fn into_stream(self) -> Option<ObjectStream> {
        match self {
            ReadOutcome::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, ReadOutcome::NotModified)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReadOutcome::NotFound)
    }
}
