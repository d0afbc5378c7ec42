//! The boundary with the underlying HTTP/2 transport.
//!
//! The engine issues one logical "send request, receive response headers
//! early" operation per attempt. Connection pooling, TLS, and HTTP/2 flow
//! control live behind this trait; the engine only frames bodies and
//! interprets headers, trailers, and transport failures.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};

use crate::completion::CompletionSource;
use crate::metadata::Metadata;

/// Errors reported by the transport before a gRPC status was obtained.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote endpoint refused the connection.
    #[error("connection refused to {authority}")]
    ConnectionRefused {
        /// The target authority.
        authority: String,
    },

    /// The remote host could not be resolved.
    #[error("host not found: {authority}")]
    HostNotFound {
        /// The target authority.
        authority: String,
    },

    /// The HTTP/2 stream was reset with the given error code.
    #[error("HTTP/2 stream reset with error code 0x{code:X}")]
    Http2Reset {
        /// The HTTP/2 error code.
        code: u32,
    },

    /// The HTTP/3 stream was reset with the given error code.
    #[error("HTTP/3 stream reset with error code 0x{code:X}")]
    Http3Reset {
        /// The HTTP/3 error code.
        code: u64,
    },

    /// An I/O failure on the connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other transport failure.
    #[error("transport failure: {reason}")]
    Other {
        /// Description of the failure.
        reason: String,
        /// Underlying cause, when available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// HTTP version negotiated for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    /// HTTP/1.x; a protocol downgrade gRPC cannot run over.
    Http1,
    /// HTTP/2.
    Http2,
    /// HTTP/3.
    Http3,
}

/// One frame of a streamed request body.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Framed message bytes (header plus payload).
    pub bytes: Bytes,
    /// Whether the transport should flush after this frame.
    pub flush: bool,
}

/// One-time signal that the transport has opened the writable request
/// stream. The streaming writer waits on this gate before transmitting.
#[derive(Debug, Clone, Default)]
pub struct BodyGate {
    opened: Arc<CompletionSource<()>>,
}

impl BodyGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the stream as opened. Idempotent.
    pub fn open(&self) {
        self.opened.try_set(());
    }

    /// Returns `true` once opened.
    pub fn is_open(&self) -> bool {
        self.opened.is_set()
    }

    /// Waits until the stream has been opened.
    pub async fn wait_open(&self) {
        self.opened.wait().await;
    }
}

/// The request body handed to the transport.
pub enum RequestBody {
    /// A fully framed unary body.
    Unary(Bytes),
    /// A streamed body fed by the streaming writer.
    Streaming {
        /// Framed messages produced by the writer.
        frames: mpsc::Receiver<StreamFrame>,
        /// Gate the transport opens once the writable stream exists.
        opened: BodyGate,
    },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Unary(bytes) => f.debug_tuple("Unary").field(&bytes.len()).finish(),
            RequestBody::Streaming { .. } => f.write_str("Streaming"),
        }
    }
}

/// One transport-level request.
#[derive(Debug)]
pub struct TransportRequest {
    /// Request path, `/service/method`.
    pub path: String,
    /// Request headers, including `content-type` and `grpc-timeout`.
    pub metadata: Metadata,
    /// The request body.
    pub body: RequestBody,
}

/// One transport-level response. Headers are available as soon as the
/// server sends them; the body and trailers follow.
pub struct TransportResponse {
    /// Negotiated HTTP version.
    pub version: HttpVersion,
    /// HTTP status code.
    pub http_status: u16,
    /// Response headers.
    pub headers: Metadata,
    /// Response body byte stream.
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    /// Trailing metadata, delivered after the body ends.
    pub trailers: oneshot::Receiver<Metadata>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("version", &self.version)
            .field("http_status", &self.http_status)
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// The underlying HTTP/2 transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dispatches one request and resolves when response headers arrive.
    async fn dispatch(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Per-call credentials. The provider may perform asynchronous I/O (token
/// refresh, key exchange) and may fail; a failure aborts the attempt with a
/// mapped status.
#[async_trait]
pub trait CallCredentials: Send + Sync {
    /// Produces metadata entries attached to the request.
    async fn get_metadata(
        &self,
        path: &str,
    ) -> std::result::Result<Metadata, Box<dyn std::error::Error + Send + Sync>>;
}
