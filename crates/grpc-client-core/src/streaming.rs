//! Streaming message readers and writers.
//!
//! Both halves enforce a single outstanding operation: a second `read_next`
//! or `write_next` while one is in flight is a usage error, reported
//! immediately without touching the stream. The reader additionally owns the
//! terminal-status resolution for server-streaming shapes, because only it
//! observes the end of the response body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tracing::debug;

use crate::call::{AttemptInner, ResponseParts};
use crate::codec::{BufferPool, MessageSerializer};
use crate::error::{CallError, Result};
use crate::framing::{self, ReadOutcome};
use crate::method::WriteOptions;
use crate::resolver;
use crate::status::StatusCode;
use crate::transport::{BodyGate, StreamFrame};

/// Clears the in-progress flag when the operation completes or is dropped
/// mid-await.
struct OpGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Reads response messages from a server-streaming or duplex call.
pub struct StreamingReader<Resp> {
    inner: Arc<AttemptInner>,
    serializer: Arc<dyn MessageSerializer<Resp>>,
    read_in_progress: AtomicBool,
    // The response body moves in here on first read and stays until the
    // stream ends. The async mutex serializes body access across reads.
    source: tokio::sync::Mutex<Option<ResponseParts>>,
}

impl<Resp> StreamingReader<Resp> {
    pub(crate) fn new(
        inner: Arc<AttemptInner>,
        serializer: Arc<dyn MessageSerializer<Resp>>,
    ) -> Self {
        Self {
            inner,
            serializer,
            read_in_progress: AtomicBool::new(false),
            source: tokio::sync::Mutex::new(None),
        }
    }

    /// Reads the next response message.
    ///
    /// Returns `Ok(Some(message))` for each message, `Ok(None)` once the
    /// stream has ended with an OK status, and an error for a non-OK status
    /// or a local failure. Only one read may be outstanding at a time.
    pub async fn read_next(&self) -> Result<Option<Resp>> {
        if self.inner.is_disposed() {
            return Err(CallError::Disposed);
        }
        if self.inner.is_finished() {
            return self.after_finished();
        }
        if let Some(reason) = self.inner.cancel.reason() {
            self.inner.finish_cancelled(reason);
            return Err(self.inner.terminal_error());
        }
        if self.read_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallError::ReadInProgress);
        }
        let _guard = OpGuard {
            flag: &self.read_in_progress,
        };
        self.read_locked().await
    }

    /// The result a read returns once the terminal status is resolved.
    fn after_finished(&self) -> Result<Option<Resp>> {
        match self.inner.status_now() {
            Some(status) if status.is_ok() => Ok(None),
            _ => Err(self.inner.terminal_error()),
        }
    }

    async fn read_locked(&self) -> Result<Option<Resp>> {
        let mut source = self.source.lock().await;
        if source.is_none() {
            // Headers must have been validated before the body is readable.
            let headers = tokio::select! {
                headers = self.inner.headers.wait() => Some(headers),
                _ = self.inner.wait_finished() => None,
                reason = self.inner.cancel.cancelled() => {
                    self.inner.finish_cancelled(reason);
                    None
                }
            };
            if headers.is_none() {
                return self.after_finished();
            }
            *source = self.inner.response_slot.lock().unwrap().take();
        }
        let Some(parts) = source.as_mut() else {
            // The attempt finished and released the response while we waited.
            return self.after_finished();
        };

        let outcome = tokio::select! {
            outcome = framing::read_message(&mut parts.body, self.inner.receive_limit) => outcome,
            reason = self.inner.cancel.cancelled() => {
                self.inner.finish_cancelled(reason);
                return Err(self.inner.terminal_error());
            }
        };

        match outcome {
            Ok(ReadOutcome::Message(payload)) => match self.serializer.deserialize(payload) {
                Ok(message) => {
                    self.inner.messages_read.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(message))
                }
                Err(err) => {
                    self.inner.finish(
                        crate::status::Status::new(
                            StatusCode::Internal,
                            format!("failed to deserialize response message: {err}"),
                        ),
                        None,
                    );
                    source.take();
                    Err(self.inner.terminal_error())
                }
            },
            Ok(ReadOutcome::EndOfStream) => {
                let parts = source.take().ok_or(CallError::StatusNotResolved)?;
                let trailers = tokio::select! {
                    received = parts.trailers => received.unwrap_or_default(),
                    reason = self.inner.cancel.cancelled() => {
                        self.inner.finish_cancelled(reason);
                        return Err(self.inner.terminal_error());
                    }
                };
                let status = resolver::status_from_trailers(&trailers);
                if status.code() == StatusCode::DeadlineExceeded {
                    self.inner.deadline.try_latch();
                }
                debug!(path = %self.inner.path, status = %status, "response stream ended");
                self.inner.finish(status.clone(), Some(trailers));
                if status.is_ok() {
                    Ok(None)
                } else {
                    Err(self.inner.terminal_error())
                }
            }
            Err(err) => {
                let status = resolver::status_from_call_error(&err);
                self.inner.finish(status, None);
                source.take();
                Err(self.inner.terminal_error())
            }
        }
    }
}

/// Writes request messages for a client-streaming or duplex call.
pub struct StreamingWriter<Req> {
    inner: Arc<AttemptInner>,
    serializer: Arc<dyn MessageSerializer<Req>>,
    frames: std::sync::Mutex<Option<mpsc::Sender<StreamFrame>>>,
    opened: BodyGate,
    default_options: WriteOptions,
    write_in_progress: AtomicBool,
    completed: AtomicBool,
    pool: Arc<BufferPool>,
}

impl<Req> StreamingWriter<Req> {
    pub(crate) fn new(
        inner: Arc<AttemptInner>,
        serializer: Arc<dyn MessageSerializer<Req>>,
        frames: mpsc::Sender<StreamFrame>,
        opened: BodyGate,
        default_options: WriteOptions,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            inner,
            serializer,
            frames: std::sync::Mutex::new(Some(frames)),
            opened,
            default_options,
            write_in_progress: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            pool,
        }
    }

    /// Writes one message with the call-level write options.
    pub async fn write_next(&self, message: &Req) -> Result<()> {
        self.write_next_with(message, self.default_options).await
    }

    /// Writes one message. Only one write may be outstanding at a time, and
    /// no write may follow [`Self::complete`].
    pub async fn write_next_with(&self, message: &Req, options: WriteOptions) -> Result<()> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(CallError::WriteAfterComplete);
        }
        if self.inner.is_disposed() {
            return Err(CallError::Disposed);
        }
        if self.inner.is_finished() {
            return Err(self.inner.finished_write_error());
        }
        if let Some(reason) = self.inner.cancel.reason() {
            self.inner.finish_cancelled(reason);
            return Err(self.inner.terminal_error());
        }
        if self.write_in_progress.swap(true, Ordering::SeqCst) {
            return Err(CallError::WriteInProgress);
        }
        let _guard = OpGuard {
            flag: &self.write_in_progress,
        };

        // The transport opens the gate once it is ready to accept body
        // frames; writes queue behind it rather than racing the dispatch.
        tokio::select! {
            _ = self.opened.wait_open() => {}
            reason = self.inner.cancel.cancelled() => {
                self.inner.finish_cancelled(reason);
                return Err(self.inner.terminal_error());
            }
        }

        let mut payload = self.pool.acquire();
        self.serializer.serialize(message, &mut payload)?;
        let mut framed = BytesMut::with_capacity(payload.len() + framing::HEADER_SIZE);
        framing::encode_frame(&payload, &mut framed);
        self.pool.release(payload);

        let frame = StreamFrame {
            bytes: framed.freeze(),
            flush: !options.buffer_hint,
        };
        let sender = self.frames.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(CallError::WriteAfterComplete);
        };
        let sent = tokio::select! {
            sent = sender.send(frame) => sent,
            reason = self.inner.cancel.cancelled() => {
                self.inner.finish_cancelled(reason);
                return Err(self.inner.terminal_error());
            }
        };
        match sent {
            Ok(()) => {
                self.inner.messages_written.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            // The transport dropped the receiver; the attempt has finished
            // or is about to.
            Err(_) => {
                if self.inner.is_finished() {
                    Err(self.inner.finished_write_error())
                } else {
                    Err(CallError::Rpc {
                        status: crate::status::Status::new(
                            StatusCode::Unavailable,
                            "request stream was closed by the transport",
                        ),
                        trailers: Default::default(),
                    })
                }
            }
        }
    }

    /// Marks the request stream complete. No further writes are allowed, and
    /// the transport observes end-of-body. Fails if a write is in flight.
    pub fn complete(&self) -> Result<()> {
        if self.write_in_progress.load(Ordering::SeqCst) {
            return Err(CallError::WriteInProgress);
        }
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyCompleted);
        }
        debug!(path = %self.inner.path, "request stream completed");
        self.frames.lock().unwrap().take();
        Ok(())
    }

    /// Returns `true` once [`Self::complete`] has been called.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{AttemptPhase, CallAttempt};
    use crate::codec::BincodeSerializer;
    use crate::config::CancellationMode;
    use crate::method::{CallOptions, MethodDescriptor, MethodKind};
    use crate::status::Status;
    use crate::transport::{
        HttpVersion, RequestBody, Transport, TransportError, TransportRequest, TransportResponse,
    };
    use crate::metadata::Metadata;
    use std::io::Cursor;
    use tokio::sync::oneshot;

    // Serves one scripted response and drains any streamed request body.
    struct ScriptedTransport {
        response: std::sync::Mutex<Option<(Vec<u8>, Metadata, Metadata)>>,
    }

    impl ScriptedTransport {
        fn new(body: Vec<u8>, headers: Metadata, trailers: Metadata) -> Self {
            Self {
                response: std::sync::Mutex::new(Some((body, headers, trailers))),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn dispatch(
            &self,
            request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if let RequestBody::Streaming { mut frames, opened } = request.body {
                opened.open();
                tokio::spawn(async move { while frames.recv().await.is_some() {} });
            }
            let (body, headers, trailers) = self
                .response
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Other {
                    reason: "no scripted response".to_string(),
                    source: None,
                })?;
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
    }

    fn grpc_headers() -> Metadata {
        let mut headers = Metadata::new();
        headers.insert("content-type", "application/grpc");
        headers
    }

    fn ok_trailers() -> Metadata {
        let mut trailers = Metadata::new();
        trailers.insert("grpc-status", "0");
        trailers
    }

    fn framed(values: &[u32]) -> Vec<u8> {
        let mut body = BytesMut::new();
        for value in values {
            let payload = bincode::serialize(value).unwrap();
            framing::encode_frame(&payload, &mut body);
        }
        body.to_vec()
    }

    fn server_streaming_attempt(
        transport: Arc<dyn Transport>,
    ) -> CallAttempt<u32, u32> {
        let method = MethodDescriptor::new(
            "test.Service",
            "Stream",
            MethodKind::ServerStreaming,
            Arc::new(BincodeSerializer::new()),
            Arc::new(BincodeSerializer::new()),
        );
        CallAttempt::new(
            transport,
            method,
            CallOptions::new(),
            CancellationMode::StatusError,
            1024,
            None,
            Arc::new(BufferPool::new()),
            1,
            None,
        )
    }

    #[tokio::test]
    async fn test_read_message_sequence() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[7, 11]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = server_streaming_attempt(transport);
        attempt.start_server_streaming(1).unwrap();
        let reader = attempt.reader().unwrap();

        assert_eq!(reader.read_next().await.unwrap(), Some(7));
        assert_eq!(reader.read_next().await.unwrap(), Some(11));
        assert_eq!(reader.read_next().await.unwrap(), None);
        assert!(attempt.status().unwrap().is_ok());
        assert_eq!(attempt.messages_read(), 2);
        assert_eq!(attempt.phase(), AttemptPhase::Finished);
    }

    #[tokio::test]
    async fn test_read_after_end_keeps_returning_none() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = server_streaming_attempt(transport);
        attempt.start_server_streaming(1).unwrap();
        let reader = attempt.reader().unwrap();
        assert_eq!(reader.read_next().await.unwrap(), None);
        assert_eq!(reader.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_ok_trailers_surface_as_error() {
        let mut trailers = Metadata::new();
        trailers.insert("grpc-status", "5");
        trailers.insert("grpc-message", "missing");
        let transport = Arc::new(ScriptedTransport::new(framed(&[]), grpc_headers(), trailers));
        let attempt = server_streaming_attempt(transport);
        attempt.start_server_streaming(1).unwrap();
        let reader = attempt.reader().unwrap();

        let err = reader.read_next().await.unwrap_err();
        let status = err.status().unwrap();
        assert_eq!(status.code(), StatusCode::NotFound);
        assert_eq!(status.message(), "missing");
        // Subsequent reads report the same failure.
        let err = reader.read_next().await.unwrap_err();
        assert_eq!(err.status().unwrap().code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_read_after_finish_reports_terminal_error() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[3]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = server_streaming_attempt(transport);
        attempt.start_server_streaming(1).unwrap();
        let reader = attempt.reader().unwrap();
        attempt.inner_for_test().finish(
            Status::new(StatusCode::Internal, "broken"),
            None,
        );
        let err = reader.read_next().await.unwrap_err();
        assert_eq!(err.status().unwrap().code(), StatusCode::Internal);
    }

    fn duplex_attempt(transport: Arc<dyn Transport>) -> CallAttempt<u32, u32> {
        let method = MethodDescriptor::new(
            "test.Service",
            "Chat",
            MethodKind::DuplexStreaming,
            Arc::new(BincodeSerializer::new()),
            Arc::new(BincodeSerializer::new()),
        );
        CallAttempt::new(
            transport,
            method,
            CallOptions::new(),
            CancellationMode::StatusError,
            1024,
            None,
            Arc::new(BufferPool::new()),
            1,
            None,
        )
    }

    #[tokio::test]
    async fn test_write_then_complete() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[9]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();

        writer.write_next(&1).await.unwrap();
        writer.write_next(&2).await.unwrap();
        writer.complete().unwrap();
        assert!(writer.is_completed());
        assert_eq!(attempt.messages_written(), 2);

        let reader = attempt.reader().unwrap();
        assert_eq!(reader.read_next().await.unwrap(), Some(9));
        assert_eq!(reader.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_after_complete_fails() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();
        writer.complete().unwrap();
        assert!(matches!(
            writer.write_next(&1).await.unwrap_err(),
            CallError::WriteAfterComplete
        ));
    }

    #[tokio::test]
    async fn test_complete_twice_fails() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();
        writer.complete().unwrap();
        assert!(matches!(
            writer.complete().unwrap_err(),
            CallError::AlreadyCompleted
        ));
    }

    #[tokio::test]
    async fn test_write_after_terminal_status_fails() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();
        attempt
            .inner_for_test()
            .finish(Status::new(StatusCode::Unavailable, "gone"), None);
        let err = writer.write_next(&1).await.unwrap_err();
        assert_eq!(err.status().unwrap().code(), StatusCode::Unavailable);
    }

    // Serves a body backed by a duplex pipe so the test controls when bytes
    // arrive. Trailers never resolve on their own.
    struct HangingBodyTransport {
        body: std::sync::Mutex<Option<tokio::io::DuplexStream>>,
    }

    impl HangingBodyTransport {
        fn new() -> (Arc<Self>, tokio::io::DuplexStream) {
            let (served, feeder) = tokio::io::duplex(256);
            (
                Arc::new(Self {
                    body: std::sync::Mutex::new(Some(served)),
                }),
                feeder,
            )
        }
    }

    #[async_trait::async_trait]
    impl Transport for HangingBodyTransport {
        async fn dispatch(
            &self,
            request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if let RequestBody::Streaming { mut frames, opened } = request.body {
                opened.open();
                tokio::spawn(async move { while frames.recv().await.is_some() {} });
            }
            let body = self
                .body
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::Other {
                    reason: "body already served".to_string(),
                    source: None,
                })?;
            let (tx, rx) = oneshot::channel();
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            });
            Ok(TransportResponse {
                version: HttpVersion::Http2,
                http_status: 200,
                headers: grpc_headers(),
                body: Box::new(body),
                trailers: rx,
            })
        }
    }

    // Captures the request stream without ever dispatching, so writers stay
    // parked on the open gate until the test releases them.
    #[derive(Default)]
    struct PendingTransport {
        captured: std::sync::Mutex<Option<(BodyGate, mpsc::Receiver<StreamFrame>)>>,
    }

    #[async_trait::async_trait]
    impl Transport for PendingTransport {
        async fn dispatch(
            &self,
            request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            if let RequestBody::Streaming { frames, opened } = request.body {
                *self.captured.lock().unwrap() = Some((opened, frames));
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_second_read_while_first_pending_fails_immediately() {
        use tokio::io::AsyncWriteExt;

        let (transport, mut feeder) = HangingBodyTransport::new();
        let attempt = server_streaming_attempt(transport);
        attempt.start_server_streaming(1).unwrap();
        let reader = attempt.reader().unwrap();

        let pending = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read_next().await })
        };
        // Let the first read claim the slot and block on the empty body.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            reader.read_next().await.unwrap_err(),
            CallError::ReadInProgress
        ));

        // The rejected read did not disturb the pending one.
        feeder.write_all(&framed(&[7])).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_second_write_while_first_pending_fails_immediately() {
        let transport = Arc::new(PendingTransport::default());
        let attempt = duplex_attempt(transport.clone());
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();

        let pending = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write_next(&5).await })
        };
        // Let the first write claim the slot and park on the closed gate.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            writer.write_next(&6).await.unwrap_err(),
            CallError::WriteInProgress
        ));
        assert!(matches!(
            writer.complete().unwrap_err(),
            CallError::WriteInProgress
        ));

        // Releasing the gate lets the pending write finish normally.
        let (gate, mut frames) = transport.captured.lock().unwrap().take().unwrap();
        gate.open();
        tokio::spawn(async move { while frames.recv().await.is_some() {} });
        pending.await.unwrap().unwrap();
        assert_eq!(attempt.messages_written(), 1);
    }

    #[tokio::test]
    async fn test_write_after_ok_resolution_is_cancellation_shaped() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();
        attempt.inner_for_test().finish(Status::ok(), None);

        // An OK terminal status still rejects the write, and never as an
        // error that carries an OK status.
        let err = writer.write_next(&1).await.unwrap_err();
        assert_eq!(err.status().unwrap().code(), StatusCode::Cancelled);
    }

    #[tokio::test]
    async fn test_write_after_ok_resolution_cooperative_mode() {
        let method = MethodDescriptor::new(
            "test.Service",
            "Chat",
            MethodKind::DuplexStreaming,
            Arc::new(BincodeSerializer::new()),
            Arc::new(BincodeSerializer::new()),
        );
        let attempt: CallAttempt<u32, u32> = CallAttempt::new(
            Arc::new(ScriptedTransport::new(
                framed(&[]),
                grpc_headers(),
                ok_trailers(),
            )),
            method,
            CallOptions::new(),
            CancellationMode::CooperativeError,
            1024,
            None,
            Arc::new(BufferPool::new()),
            1,
            None,
        );
        attempt.start_duplex_streaming().unwrap();
        let writer = attempt.writer().unwrap();
        attempt.inner_for_test().finish(Status::ok(), None);
        assert!(matches!(
            writer.write_next(&1).await.unwrap_err(),
            CallError::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn test_disposed_rejects_operations() {
        let transport = Arc::new(ScriptedTransport::new(
            framed(&[]),
            grpc_headers(),
            ok_trailers(),
        ));
        let attempt = duplex_attempt(transport);
        attempt.start_duplex_streaming().unwrap();
        let reader = attempt.reader().unwrap();
        let writer = attempt.writer().unwrap();
        attempt.dispose();
        assert!(matches!(
            reader.read_next().await.unwrap_err(),
            CallError::Disposed
        ));
        assert!(matches!(
            writer.write_next(&1).await.unwrap_err(),
            CallError::Disposed
        ));
    }
}
