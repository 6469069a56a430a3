//! Streaming stages used by the read and write paths
//!
//! Each stage takes a [`ByteStream`] and returns a new one. Stages only pull
//! from upstream when polled, so a slow consumer slows the whole chain, and
//! an error from any stage ends the chain for the consumer.

use brotli::enc::backward_references::BrotliEncoderMode;
use brotli::enc::BrotliEncoderParams;
use brotli::CompressorReader;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use script_lru_cache::ScriptCache;
use script_storage::{ByteStream, Metadata};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

pub const CHUNK_SIZE: usize = 16 * 1024;

const BROTLI_QUALITY: i32 = 9;

/// Compressed chunks buffered between the encoder and its consumer
const COMPRESS_QUEUE_DEPTH: usize = 4;

/// Raised inside an `io::Error` when a size limiter trips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub limit: u64,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size limit of {} bytes exceeded", self.limit)
    }
}

impl std::error::Error for LimitExceeded {}

impl LimitExceeded {
    /// Find a limiter failure inside an IO error
    pub fn find(err: &io::Error) -> Option<LimitExceeded> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<LimitExceeded>())
            .copied()
    }
}

/// Fail the stream as soon as the running byte count reaches `limit`
pub fn limit_size(body: ByteStream, limit: u64) -> ByteStream {
    let mut seen: u64 = 0;
    body.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen >= limit {
            return Err(io::Error::other(LimitExceeded { limit }));
        }
        Ok(chunk)
    })
    .boxed()
}

/// Brotli-decode the stream
pub fn decompress(body: ByteStream) -> ByteStream {
    let decoder = async_compression::tokio::bufread::BrotliDecoder::new(StreamReader::new(body));
    ReaderStream::with_capacity(decoder, CHUNK_SIZE).boxed()
}

/// Encoder settings for script text of roughly `size_hint` bytes
fn text_params(size_hint: usize) -> BrotliEncoderParams {
    let mut params = BrotliEncoderParams::default();
    params.mode = BrotliEncoderMode::BROTLI_MODE_TEXT;
    params.quality = BROTLI_QUALITY;
    params.size_hint = size_hint;
    params
}

/// Read a file as a brotli text-mode stream.
///
/// Encoding runs on the blocking pool and hands chunks over a bounded
/// channel, so the encoder only runs ahead of the consumer by a few chunks.
/// Dropping the stream stops the encoder at its next send.
pub fn compress_file(path: PathBuf) -> ByteStream {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(COMPRESS_QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = compress_blocking(&path, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn compress_blocking(path: &Path, tx: &mpsc::Sender<io::Result<Bytes>>) -> io::Result<()> {
    let file = std::fs::File::open(path)?;
    let size_hint = file.metadata()?.len() as usize;
    let mut encoder = CompressorReader::with_params(file, CHUNK_SIZE, &text_params(size_hint));
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = encoder.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
            debug!(path = %path.display(), "Compressed stream dropped by consumer");
            return Ok(());
        }
    }
}

struct CaptureState {
    body: ByteStream,
    buffer: BytesMut,
    target: Option<CaptureTarget>,
}

struct CaptureTarget {
    cache: Arc<ScriptCache<Metadata>>,
    key: String,
    metadata: Metadata,
    generation: u64,
}

/// Pass chunks through unchanged while buffering them; once the stream ends
/// cleanly the buffered bytes are inserted into `cache` under `key`.
///
/// A failed stream is never cached, and neither is one whose key was removed
/// from the cache after `generation` was read.
pub fn capture_into_cache(
    body: ByteStream,
    cache: Arc<ScriptCache<Metadata>>,
    key: String,
    metadata: Metadata,
    generation: u64,
) -> ByteStream {
    let state = CaptureState {
        body,
        buffer: BytesMut::new(),
        target: Some(CaptureTarget {
            cache,
            key,
            metadata,
            generation,
        }),
    };

    stream::unfold(state, |mut state| async move {
        match state.body.next().await {
            Some(Ok(chunk)) => {
                if state.target.is_some() {
                    state.buffer.extend_from_slice(&chunk);
                }
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                state.target = None;
                state.buffer = BytesMut::new();
                Some((Err(e), state))
            }
            None => {
                if let Some(target) = state.target.take() {
                    let data = std::mem::take(&mut state.buffer).freeze();
                    let size = data.len();
                    let key = target.key.clone();
                    if target
                        .cache
                        .put_if_unchanged(target.key, data, target.metadata, target.generation)
                    {
                        debug!(key = %key, size, "Cached streamed object");
                    }
                }
                None
            }
        }
    })
    .boxed()
}

/// A single in-memory chunk as a stream
pub fn once(data: Bytes) -> ByteStream {
    stream::once(async move { Ok(data) }).boxed()
}

/// Drain a stream into one buffer
pub async fn collect(mut body: ByteStream) -> io::Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
