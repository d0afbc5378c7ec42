//! The call-attempt state machine.
//!
//! One `CallAttempt` is one transport-level execution of an RPC method. The
//! attempt owns a single background orchestration routine plus asynchronous
//! reactions to three external events: transport completion, deadline timer
//! fire, and cancellation. Every exit path funnels through one terminal-
//! resolution routine that resolves the status exactly once, releases the
//! timer and transport resources, and notifies the owning channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::codec::{BufferPool, MessageSerializer};
use crate::completion::CompletionSource;
use crate::config::CancellationMode;
use crate::deadline::{encode_grpc_timeout, DeadlineCoordinator};
use crate::error::{CallError, Result};
use crate::framing::{self, ReadOutcome};
use crate::metadata::Metadata;
use crate::method::{CallOptions, MethodDescriptor, MethodKind};
use crate::resolver::{self, HeaderDecision, CONTENT_TYPE, GRPC_CONTENT_TYPE, GRPC_TIMEOUT};
use crate::status::{Status, StatusCode};
use crate::streaming::{StreamingReader, StreamingWriter};
use crate::transport::{
    BodyGate, CallCredentials, RequestBody, Transport, TransportRequest, TransportResponse,
};

/// Capacity of the writer-to-transport frame channel.
const STREAM_FRAME_BUFFER: usize = 8;

/// Observable lifecycle phase of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Created, not yet started.
    Initialized,
    /// Request handed to the transport.
    Dispatched,
    /// Response headers received and validated.
    HeadersReceived,
    /// Response body is being streamed to the reader.
    Streaming,
    /// Terminal status resolved.
    Finished,
}

/// The transport response pieces handed to the streaming reader.
pub(crate) struct ResponseParts {
    pub(crate) body: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) trailers: oneshot::Receiver<Metadata>,
}

/// State shared between the attempt handle, its orchestration routine, the
/// deadline timer, and the streaming reader/writer.
pub(crate) struct AttemptInner {
    pub(crate) path: String,
    pub(crate) kind: MethodKind,
    pub(crate) ordinal: u32,
    pub(crate) cancellation_mode: CancellationMode,
    pub(crate) receive_limit: usize,
    phase: Mutex<AttemptPhase>,
    status: CompletionSource<Status>,
    pub(crate) headers: CompletionSource<Metadata>,
    trailers: Mutex<Option<Metadata>>,
    pub(crate) response_slot: Mutex<Option<ResponseParts>>,
    pub(crate) cancel: CancelToken,
    cancel_handle: CancelHandle,
    pub(crate) deadline: Arc<DeadlineCoordinator>,
    pub(crate) messages_read: AtomicU64,
    pub(crate) messages_written: AtomicU64,
    disposed: AtomicBool,
    on_finished: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl AttemptInner {
    pub(crate) fn phase(&self) -> AttemptPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: AttemptPhase) {
        let mut slot = self.phase.lock().unwrap();
        // Finished is terminal; nothing moves an attempt out of it.
        if *slot != AttemptPhase::Finished {
            *slot = phase;
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.status.is_set()
    }

    pub(crate) fn status_now(&self) -> Option<Status> {
        self.status.get()
    }

    pub(crate) async fn wait_finished(&self) -> Status {
        self.status.wait().await
    }

    fn trailers_snapshot(&self) -> Metadata {
        self.trailers.lock().unwrap().clone().unwrap_or_default()
    }

    /// The terminal-resolution routine. Sets the status exactly once, records
    /// the trailer set, releases the timer, drops the transport response, and
    /// notifies the owning channel. Safe to call concurrently; only the first
    /// caller has any effect.
    pub(crate) fn finish(&self, status: Status, trailers: Option<Metadata>) -> bool {
        if !self.status.try_set(status.clone()) {
            return false;
        }
        {
            let mut slot = self.trailers.lock().unwrap();
            if slot.is_none() {
                *slot = Some(trailers.unwrap_or_default());
            }
        }
        *self.phase.lock().unwrap() = AttemptPhase::Finished;
        self.deadline.release();
        self.response_slot.lock().unwrap().take();
        if let Some(hook) = self.on_finished.lock().unwrap().take() {
            hook();
        }
        debug!(path = %self.path, ordinal = self.ordinal, status = %status, "call attempt finished");
        true
    }

    /// Finishes the attempt from a cancellation reason.
    pub(crate) fn finish_cancelled(&self, reason: CancelReason) -> bool {
        if reason == CancelReason::DeadlineExceeded {
            self.deadline.try_latch();
        }
        self.finish(reason.to_status(), None)
    }

    /// Shapes a status into the caller-visible error, honoring the channel's
    /// cancellation-reporting mode. This is the single decision point for
    /// the cooperative-vs-typed duality.
    fn shaped_error(&self, status: Status) -> CallError {
        let cooperative = matches!(
            status.code(),
            StatusCode::Cancelled | StatusCode::DeadlineExceeded
        ) && self.cancellation_mode == CancellationMode::CooperativeError;
        if cooperative {
            CallError::Cancelled { status }
        } else {
            CallError::Rpc {
                status,
                trailers: self.trailers_snapshot(),
            }
        }
    }

    /// Builds the caller-visible error for the already-resolved terminal
    /// status.
    pub(crate) fn terminal_error(&self) -> CallError {
        let status = self
            .status
            .get()
            .unwrap_or_else(|| Status::new(StatusCode::Unknown, "status was not resolved"));
        self.shaped_error(status)
    }

    /// The error reported for a write attempted after the call finished.
    ///
    /// An OK resolution still rejects the write, as a cancellation rather
    /// than forwarding a success status inside an error.
    pub(crate) fn finished_write_error(&self) -> CallError {
        match self.status_now() {
            Some(status) if status.is_ok() => self.shaped_error(Status::new(
                StatusCode::Cancelled,
                "cannot write message because the call has already finished",
            )),
            _ => self.terminal_error(),
        }
    }
}

/// One transport-level request/response exchange for one RPC invocation.
pub struct CallAttempt<Req, Resp> {
    inner: Arc<AttemptInner>,
    transport: Arc<dyn Transport>,
    method: MethodDescriptor<Req, Resp>,
    options: CallOptions,
    credentials: Option<Arc<dyn CallCredentials>>,
    pool: Arc<BufferPool>,
    response_rx: Mutex<Option<oneshot::Receiver<Result<Resp>>>>,
    reader: Mutex<Option<Arc<StreamingReader<Resp>>>>,
    writer: Mutex<Option<Arc<StreamingWriter<Req>>>>,
}

impl<Req, Resp> CallAttempt<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    /// Creates an attempt. `on_finished` runs once when the terminal status
    /// resolves, letting the owning channel drop the attempt from its
    /// active-call accounting.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        method: MethodDescriptor<Req, Resp>,
        options: CallOptions,
        cancellation_mode: CancellationMode,
        receive_limit: usize,
        credentials: Option<Arc<dyn CallCredentials>>,
        pool: Arc<BufferPool>,
        ordinal: u32,
        on_finished: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let (cancel, cancel_handle) = match &options.cancel {
            Some(caller) => caller.child(),
            None => new_cancel_pair(),
        };
        let deadline = DeadlineCoordinator::new(options.deadline);
        let inner = Arc::new(AttemptInner {
            path: method.path(),
            kind: method.kind,
            ordinal,
            cancellation_mode,
            receive_limit,
            phase: Mutex::new(AttemptPhase::Initialized),
            status: CompletionSource::new(),
            headers: CompletionSource::new(),
            trailers: Mutex::new(None),
            response_slot: Mutex::new(None),
            cancel,
            cancel_handle,
            deadline,
            messages_read: AtomicU64::new(0),
            messages_written: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            on_finished: Mutex::new(on_finished),
        });
        Self {
            inner,
            transport,
            method,
            options,
            credentials,
            pool,
            response_rx: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// The attempt ordinal: 1 for the first attempt, higher for retries and
    /// hedges of the same logical call.
    pub fn ordinal(&self) -> u32 {
        self.inner.ordinal
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> AttemptPhase {
        self.inner.phase()
    }

    /// Messages successfully written so far.
    pub fn messages_written(&self) -> u64 {
        self.inner.messages_written.load(Ordering::SeqCst)
    }

    /// Messages successfully read so far.
    pub fn messages_read(&self) -> u64 {
        self.inner.messages_read.load(Ordering::SeqCst)
    }

    /// Starts a unary call: one framed request message, one response message.
    pub fn start_unary(&self, request: Req) -> Result<()> {
        self.ensure_shape(MethodKind::Unary)?;
        self.start_internal(Some(request))
    }

    /// Starts a client-streaming call; messages go through [`Self::writer`].
    pub fn start_client_streaming(&self) -> Result<()> {
        self.ensure_shape(MethodKind::ClientStreaming)?;
        self.start_internal(None)
    }

    /// Starts a server-streaming call; responses come from [`Self::reader`].
    pub fn start_server_streaming(&self, request: Req) -> Result<()> {
        self.ensure_shape(MethodKind::ServerStreaming)?;
        self.start_internal(Some(request))
    }

    /// Starts a duplex-streaming call.
    pub fn start_duplex_streaming(&self) -> Result<()> {
        self.ensure_shape(MethodKind::DuplexStreaming)?;
        self.start_internal(None)
    }

    fn ensure_shape(&self, expected: MethodKind) -> Result<()> {
        if self.method.kind != expected {
            return Err(CallError::ShapeMismatch {
                kind: shape_name(self.method.kind),
            });
        }
        Ok(())
    }

    fn start_internal(&self, request: Option<Req>) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(CallError::Disposed);
        }
        {
            let mut phase = self.inner.phase.lock().unwrap();
            if *phase != AttemptPhase::Initialized {
                return Err(CallError::AlreadyStarted);
            }
            *phase = AttemptPhase::Dispatched;
        }

        let kind = self.method.kind;
        let single_response = !kind.server_streams();
        let (response_tx, response_rx) = if single_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        *self.response_rx.lock().unwrap() = response_rx;

        // An already-expired deadline transitions synchronously, before any
        // transport work happens.
        if self.inner.deadline.check_expired_at_start() {
            self.inner
                .finish(CancelReason::DeadlineExceeded.to_status(), None);
            if let Some(tx) = response_tx {
                let _ = tx.send(Err(self.inner.terminal_error()));
            }
            return Ok(());
        }

        let mut metadata = Metadata::new();
        metadata.insert(CONTENT_TYPE, GRPC_CONTENT_TYPE);
        metadata.insert("te", "trailers");
        metadata.merge(&self.options.metadata);
        if let Some(remaining) = self.options.deadline.remaining() {
            metadata.insert(GRPC_TIMEOUT, encode_grpc_timeout(remaining));
        }

        let body = if kind.client_streams() {
            let (frames_tx, frames_rx) = mpsc::channel(STREAM_FRAME_BUFFER);
            let gate = BodyGate::new();
            let writer = Arc::new(StreamingWriter::new(
                self.inner.clone(),
                self.method.request_serializer.clone(),
                frames_tx,
                gate.clone(),
                self.options.write_options,
                self.pool.clone(),
            ));
            *self.writer.lock().unwrap() = Some(writer);
            RequestBody::Streaming {
                frames: frames_rx,
                opened: gate,
            }
        } else {
            let Some(request) = request else {
                return Err(CallError::ShapeMismatch {
                    kind: shape_name(kind),
                });
            };
            let mut payload = self.pool.acquire();
            self.method
                .request_serializer
                .serialize(&request, &mut payload)?;
            let mut framed = self.pool.acquire();
            framing::encode_frame(&payload, &mut framed);
            self.pool.release(payload);
            self.inner.messages_written.fetch_add(1, Ordering::SeqCst);
            RequestBody::Unary(framed.freeze())
        };

        if kind.server_streams() {
            let reader = Arc::new(StreamingReader::new(
                self.inner.clone(),
                self.method.response_serializer.clone(),
            ));
            *self.reader.lock().unwrap() = Some(reader);
        }

        let request = TransportRequest {
            path: self.inner.path.clone(),
            metadata,
            body,
        };

        self.inner
            .deadline
            .start(self.inner.cancel_handle.clone());

        let inner = self.inner.clone();
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        let response_serializer = self.method.response_serializer.clone();
        tokio::spawn(run_attempt(
            inner,
            transport,
            credentials,
            request,
            response_tx,
            response_serializer,
        ));
        Ok(())
    }

    /// Resolves with the single response message for unary and
    /// client-streaming calls. May be awaited once.
    pub async fn response(&self) -> Result<Resp> {
        if self.method.kind.server_streams() {
            return Err(CallError::ShapeMismatch {
                kind: shape_name(self.method.kind),
            });
        }
        let rx = self
            .response_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(CallError::ResponseAlreadyTaken)?;
        match rx.await {
            Ok(result) => result,
            // The orchestration routine resolves the status before it drops
            // the sender, so fall back to the terminal error.
            Err(_) => Err(self.inner.terminal_error()),
        }
    }

    /// The streaming reader for server-streaming and duplex calls.
    /// Available once the call has started.
    pub fn reader(&self) -> Option<Arc<StreamingReader<Resp>>> {
        self.reader.lock().unwrap().clone()
    }

    /// The streaming writer for client-streaming and duplex calls.
    /// Available once the call has started.
    pub fn writer(&self) -> Option<Arc<StreamingWriter<Req>>> {
        self.writer.lock().unwrap().clone()
    }

    /// Returns the terminal status.
    ///
    /// Fails with an invalid-state error until the attempt has finished.
    pub fn status(&self) -> Result<Status> {
        self.inner.status_now().ok_or(CallError::StatusNotResolved)
    }

    /// Returns the response trailers.
    ///
    /// Fails until the response has finished. Trailers come from the header
    /// block for trailers-only responses or from the trailing block
    /// otherwise, never mixed.
    pub fn trailers(&self) -> Result<Metadata> {
        if !self.inner.is_finished() {
            return Err(CallError::TrailersNotAvailable);
        }
        Ok(self.inner.trailers_snapshot())
    }

    /// Waits until the terminal status is resolved and returns it.
    pub async fn finished(&self) -> Status {
        self.inner.wait_finished().await
    }

    /// Cancels any in-flight work and releases resources. Never blocks on
    /// in-flight operations; they observe the cancellation signal. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel_handle.cancel(CancelReason::Disposed);
        // Without a background routine there is nobody to observe the
        // signal, so resolve here. Harmless if the routine races us.
        if self.inner.phase() == AttemptPhase::Initialized {
            self.inner.finish_cancelled(CancelReason::Disposed);
        }
    }

    #[cfg(test)]
    pub(crate) fn inner_for_test(&self) -> Arc<AttemptInner> {
        self.inner.clone()
    }

    /// The handle the owning channel cancels at shutdown.
    pub(crate) fn cancel_handle_for_channel(&self) -> CancelHandle {
        self.inner.cancel_handle.clone()
    }
}

impl<Req, Resp> Drop for CallAttempt<Req, Resp> {
    fn drop(&mut self) {
        // An attempt dropped mid-flight (a losing hedge, an abandoned call)
        // must not keep transport work alive.
        if !self.inner.is_finished() && !self.inner.disposed.swap(true, Ordering::SeqCst) {
            self.inner.cancel_handle.cancel(CancelReason::Disposed);
            if self.inner.phase() == AttemptPhase::Initialized {
                self.inner.finish_cancelled(CancelReason::Disposed);
            }
        }
    }
}

fn shape_name(kind: MethodKind) -> &'static str {
    match kind {
        MethodKind::Unary => "unary",
        MethodKind::ClientStreaming => "client-streaming",
        MethodKind::ServerStreaming => "server-streaming",
        MethodKind::DuplexStreaming => "duplex-streaming",
    }
}

fn deliver<Resp>(
    tx: Option<oneshot::Sender<Result<Resp>>>,
    inner: &AttemptInner,
    message: Option<Resp>,
) {
    if let Some(tx) = tx {
        let result = match (inner.status_now(), message) {
            (Some(status), Some(msg)) if status.is_ok() => Ok(msg),
            _ => Err(inner.terminal_error()),
        };
        let _ = tx.send(result);
    }
}

/// The attempt's single background orchestration routine. Converts every
/// exception into a resolved terminal status; nothing escapes this function.
async fn run_attempt<Resp: Send + 'static>(
    inner: Arc<AttemptInner>,
    transport: Arc<dyn Transport>,
    credentials: Option<Arc<dyn CallCredentials>>,
    mut request: TransportRequest,
    response_tx: Option<oneshot::Sender<Result<Resp>>>,
    response_serializer: Arc<dyn MessageSerializer<Resp>>,
) {
    // Fail fast on a signal that fired before dispatch.
    if let Some(reason) = inner.cancel.reason() {
        inner.finish_cancelled(reason);
        deliver(response_tx, &inner, None);
        return;
    }

    if let Some(provider) = credentials {
        match provider.get_metadata(&request.path).await {
            Ok(extra) => request.metadata.merge(&extra),
            Err(err) => {
                warn!(path = %inner.path, error = %err, "call credentials failed");
                inner.finish(
                    Status::new(
                        StatusCode::Internal,
                        format!("error getting call credentials: {err}"),
                    ),
                    None,
                );
                deliver(response_tx, &inner, None);
                return;
            }
        }
    }

    debug!(path = %inner.path, ordinal = inner.ordinal, "dispatching call attempt");
    let dispatched = tokio::select! {
        result = transport.dispatch(request) => result,
        reason = inner.cancel.cancelled() => {
            inner.finish_cancelled(reason);
            deliver(response_tx, &inner, None);
            return;
        }
    };

    let response = match dispatched {
        Ok(response) => response,
        Err(err) => {
            let status = resolver::status_from_transport_error(&err);
            warn!(path = %inner.path, error = %err, "transport dispatch failed");
            inner.finish(status, None);
            deliver(response_tx, &inner, None);
            return;
        }
    };

    match resolver::validate_headers(response.version, response.http_status, &response.headers) {
        HeaderDecision::AlreadyFinished(status) => {
            // Error arrived with no body; the header block doubles as the
            // trailer set. A server-reported DEADLINE_EXCEEDED takes the
            // same latch the local timer uses.
            if status.code() == StatusCode::DeadlineExceeded {
                inner.deadline.try_latch();
            }
            let trailers = response.headers.clone();
            inner.finish(status, Some(trailers));
            deliver(response_tx, &inner, None);
        }
        HeaderDecision::InProgress => {
            inner.headers.try_set(response.headers.clone());
            inner.set_phase(AttemptPhase::HeadersReceived);
            if inner.kind.server_streams() {
                inner.set_phase(AttemptPhase::Streaming);
                *inner.response_slot.lock().unwrap() = Some(ResponseParts {
                    body: response.body,
                    trailers: response.trailers,
                });
                // The reader produces the terminal status; react to
                // cancellation and the timer while it does.
                tokio::select! {
                    _ = inner.wait_finished() => {}
                    reason = inner.cancel.cancelled() => {
                        inner.finish_cancelled(reason);
                    }
                }
            } else {
                let (status, message, trailers) =
                    read_single_response(&inner, response, response_serializer).await;
                if status.code() == StatusCode::DeadlineExceeded {
                    inner.deadline.try_latch();
                }
                inner.finish(status, trailers);
                deliver(response_tx, &inner, message);
            }
        }
    }
}

/// Eagerly reads the entire single-response body: exactly one message, then
/// end of stream, then trailers.
async fn read_single_response<Resp>(
    inner: &AttemptInner,
    response: TransportResponse,
    serializer: Arc<dyn MessageSerializer<Resp>>,
) -> (Status, Option<Resp>, Option<Metadata>) {
    let mut body = response.body;
    let mut trailers_rx = response.trailers;

    let outcome = tokio::select! {
        outcome = framing::read_message(&mut body, inner.receive_limit) => outcome,
        reason = inner.cancel.cancelled() => return (reason.to_status(), None, None),
    };

    match outcome {
        Ok(ReadOutcome::Message(payload)) => {
            let ended = tokio::select! {
                ended = framing::expect_end_of_stream(&mut body) => ended,
                reason = inner.cancel.cancelled() => return (reason.to_status(), None, None),
            };
            if let Err(err) = ended {
                return (resolver::status_from_call_error(&err), None, None);
            }
            let trailers = tokio::select! {
                received = &mut trailers_rx => received.unwrap_or_default(),
                reason = inner.cancel.cancelled() => return (reason.to_status(), None, None),
            };
            let status = resolver::status_from_trailers(&trailers);
            if !status.is_ok() {
                return (status, None, Some(trailers));
            }
            match serializer.deserialize(payload) {
                Ok(message) => {
                    inner.messages_read.fetch_add(1, Ordering::SeqCst);
                    (status, Some(message), Some(trailers))
                }
                Err(err) => (
                    Status::new(
                        StatusCode::Internal,
                        format!("failed to deserialize response message: {err}"),
                    ),
                    None,
                    Some(trailers),
                ),
            }
        }
        Ok(ReadOutcome::EndOfStream) => {
            let trailers = tokio::select! {
                received = &mut trailers_rx => received.unwrap_or_default(),
                reason = inner.cancel.cancelled() => return (reason.to_status(), None, None),
            };
            let status = resolver::status_from_trailers(&trailers);
            if status.is_ok() {
                // OK without a message is a broken response.
                (
                    Status::new(
                        StatusCode::Internal,
                        "response stream ended without a message",
                    ),
                    None,
                    Some(trailers),
                )
            } else {
                (status, None, Some(trailers))
            }
        }
        Err(err) => (resolver::status_from_call_error(&err), None, None),
    }
}
