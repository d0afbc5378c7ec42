//! Method descriptors, call shapes, and per-call options.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::codec::MessageSerializer;
use crate::deadline::Deadline;
use crate::metadata::Metadata;

/// The streaming shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// One request message, one response message.
    Unary,
    /// A stream of request messages, one response message.
    ClientStreaming,
    /// One request message, a stream of response messages.
    ServerStreaming,
    /// Streams in both directions.
    DuplexStreaming,
}

impl MethodKind {
    /// Returns `true` for shapes where the client streams request messages.
    pub fn client_streams(self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::DuplexStreaming)
    }

    /// Returns `true` for shapes where the server streams response messages.
    pub fn server_streams(self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::DuplexStreaming)
    }
}

/// Describes one RPC method: identity, shape, and its serializers.
pub struct MethodDescriptor<Req, Resp> {
    /// Fully qualified service name, e.g. `example.Greeter`.
    pub service: String,
    /// Method name, e.g. `SayHello`.
    pub name: String,
    /// Streaming shape.
    pub kind: MethodKind,
    /// Serializer for outbound request messages.
    pub request_serializer: Arc<dyn MessageSerializer<Req>>,
    /// Serializer for inbound response messages.
    pub response_serializer: Arc<dyn MessageSerializer<Resp>>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    /// Creates a descriptor.
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        kind: MethodKind,
        request_serializer: Arc<dyn MessageSerializer<Req>>,
        response_serializer: Arc<dyn MessageSerializer<Resp>>,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            kind,
            request_serializer,
            response_serializer,
        }
    }

    /// The HTTP/2 request path for this method: `/service/name`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.name)
    }

    /// The fully qualified method name used for policy lookups.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.service, self.name)
    }
}

impl<Req, Resp> Clone for MethodDescriptor<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            name: self.name.clone(),
            kind: self.kind,
            request_serializer: self.request_serializer.clone(),
            response_serializer: self.response_serializer.clone(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Options applying to a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// When set, the transport may buffer this write instead of flushing it
    /// immediately.
    pub buffer_hint: bool,
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Extra request headers.
    pub metadata: Metadata,
    /// Absolute deadline for the call.
    pub deadline: Deadline,
    /// Caller-supplied cancellation signal.
    pub cancel: Option<CancelToken>,
    /// Call-level write options; a writer-level override takes precedence
    /// per write.
    pub write_options: WriteOptions,
}

impl CallOptions {
    /// Options with no metadata, no deadline, and no cancellation signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the caller cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }
}
