//! Common test utilities and fixtures for integration tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use grpc_client_core::framing;
use grpc_client_core::metadata::Metadata;
use grpc_client_core::transport::{
    HttpVersion, RequestBody, StreamFrame, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use grpc_client_core::{MethodDescriptor, MethodKind};
use grpc_client_core::codec::BincodeSerializer;
use tokio::sync::oneshot;

/// One scripted transport exchange.
pub enum Exchange {
    /// Dispatch fails with a connection-level error.
    Refuse,
    /// The server responds with the given HTTP status and headers, no body.
    HeadersOnly {
        version: HttpVersion,
        http_status: u16,
        headers: Metadata,
    },
    /// A full response: headers, framed body bytes, trailing metadata.
    Full {
        headers: Metadata,
        body: Vec<u8>,
        trailers: Metadata,
    },
    /// Headers arrive but the body never produces bytes, so reads hang until
    /// cancelled.
    Hang { headers: Metadata },
    /// The body delivers the given bytes and then stalls without ever
    /// signalling end of stream.
    FullThenHang { headers: Metadata, body: Vec<u8> },
}

/// A transport that serves a scripted sequence of exchanges and records what
/// the client sent.
pub struct MockTransport {
    exchanges: Mutex<Vec<Exchange>>,
    dispatches: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// What the transport saw for one dispatch.
pub struct RecordedRequest {
    pub path: String,
    pub metadata: Metadata,
    pub unary_body: Option<Vec<u8>>,
    pub streamed_frames: Arc<Mutex<Vec<StreamFrame>>>,
}

impl MockTransport {
    pub fn new(exchanges: Vec<Exchange>) -> Arc<Self> {
        Arc::new(Self {
            exchanges: Mutex::new(exchanges),
            dispatches: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn dispatch(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);

        let streamed_frames = Arc::new(Mutex::new(Vec::new()));
        let unary_body = match request.body {
            RequestBody::Unary(bytes) => Some(bytes.to_vec()),
            RequestBody::Streaming { mut frames, opened } => {
                opened.open();
                let sink = streamed_frames.clone();
                tokio::spawn(async move {
                    while let Some(frame) = frames.recv().await {
                        sink.lock().unwrap().push(frame);
                    }
                });
                None
            }
        };
        self.requests.lock().unwrap().push(RecordedRequest {
            path: request.path,
            metadata: request.metadata,
            unary_body,
            streamed_frames,
        });

        let exchange = {
            let mut exchanges = self.exchanges.lock().unwrap();
            if exchanges.is_empty() {
                Exchange::Refuse
            } else {
                exchanges.remove(0)
            }
        };
        match exchange {
            Exchange::Refuse => Err(TransportError::ConnectionRefused {
                authority: "mock".to_string(),
            }),
            Exchange::HeadersOnly {
                version,
                http_status,
                headers,
            } => {
                let (_tx, rx) = oneshot::channel();
                Ok(TransportResponse {
                    version,
                    http_status,
                    headers,
                    body: Box::new(Cursor::new(Vec::new())),
                    trailers: rx,
                })
            }
            Exchange::Full {
                headers,
                body,
                trailers,
            } => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(trailers);
                Ok(TransportResponse {
                    version: HttpVersion::Http2,
                    http_status: 200,
                    headers,
                    body: Box::new(Cursor::new(body)),
                    trailers: rx,
                })
            }
            Exchange::Hang { headers } => {
                let (reader, _writer) = tokio::io::duplex(64);
                let (tx, rx) = oneshot::channel();
                // Keep the write half and trailer sender alive so the body
                // never ends on its own.
                tokio::spawn(async move {
                    let _writer = _writer;
                    let _tx = tx;
                    std::future::pending::<()>().await;
                });
                Ok(TransportResponse {
                    version: HttpVersion::Http2,
                    http_status: 200,
                    headers,
                    body: Box::new(reader),
                    trailers: rx,
                })
            }
            Exchange::FullThenHang { headers, body } => {
                let (reader, mut writer) = tokio::io::duplex(body.len() + 64);
                let (tx, rx) = oneshot::channel();
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let _ = writer.write_all(&body).await;
                    // Hold the write half and trailer sender open forever.
                    let _tx = tx;
                    std::future::pending::<()>().await;
                });
                Ok(TransportResponse {
                    version: HttpVersion::Http2,
                    http_status: 200,
                    headers,
                    body: Box::new(reader),
                    trailers: rx,
                })
            }
        }
    }
}

pub fn grpc_headers() -> Metadata {
    let mut headers = Metadata::new();
    headers.insert("content-type", "application/grpc");
    headers
}

pub fn trailers_with_status(code: i32) -> Metadata {
    let mut trailers = Metadata::new();
    trailers.insert("grpc-status", code.to_string());
    trailers
}

/// Frames each value as a bincode message in gRPC wire format.
pub fn framed_body(values: &[u32]) -> Vec<u8> {
    let mut body = BytesMut::new();
    for value in values {
        let payload = bincode::serialize(value).unwrap();
        framing::encode_frame(&payload, &mut body);
    }
    body.to_vec()
}

pub fn method(kind: MethodKind) -> MethodDescriptor<u32, u32> {
    MethodDescriptor::new(
        "echo.Echo",
        "Repeat",
        kind,
        Arc::new(BincodeSerializer::new()),
        Arc::new(BincodeSerializer::new()),
    )
}
