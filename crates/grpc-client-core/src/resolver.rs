//! Status and exception resolution.
//!
//! Pure mapping functions that decide, from response headers, trailers, or a
//! transport failure, what gRPC status an attempt resolves with. The tables
//! here are fixed by the gRPC wire protocol.

use crate::error::CallError;
use crate::metadata::Metadata;
use crate::status::{Status, StatusCode};
use crate::transport::{HttpVersion, TransportError};

/// Trailer key carrying the numeric status code.
pub const GRPC_STATUS: &str = "grpc-status";
/// Trailer key carrying the percent-encoded status message.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Header key for the request/response content type.
pub const CONTENT_TYPE: &str = "content-type";
/// The gRPC content type prefix.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";
/// Header key for the encoded deadline.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// What the response headers alone say about the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDecision {
    /// The call is already complete; no body is expected. The status came
    /// from the header block, which doubles as the trailer set.
    AlreadyFinished(Status),
    /// The call is still in progress; a body and trailers follow.
    InProgress,
}

/// Maps a non-success HTTP status to a gRPC status code.
pub fn grpc_status_from_http(http_status: u16) -> StatusCode {
    match http_status {
        400 => StatusCode::Internal,
        401 => StatusCode::Unauthenticated,
        403 => StatusCode::PermissionDenied,
        404 => StatusCode::Unimplemented,
        429 | 502 | 503 | 504 => StatusCode::Unavailable,
        _ => StatusCode::Unknown,
    }
}

/// Maps an HTTP/2 RST_STREAM error code to a gRPC status code.
pub fn grpc_status_from_http2_error(code: u32) -> StatusCode {
    match code {
        // REFUSED_STREAM
        0x7 => StatusCode::Unavailable,
        // CANCEL
        0x8 => StatusCode::Cancelled,
        // ENHANCE_YOUR_CALM
        0xb => StatusCode::ResourceExhausted,
        // INADEQUATE_SECURITY
        0xc => StatusCode::PermissionDenied,
        _ => StatusCode::Internal,
    }
}

/// Maps an HTTP/3 stream error code to a gRPC status code.
pub fn grpc_status_from_http3_error(code: u64) -> StatusCode {
    match code {
        // H3_EXCESSIVE_LOAD
        0x107 => StatusCode::ResourceExhausted,
        // H3_REQUEST_REJECTED
        0x10b => StatusCode::Unavailable,
        // H3_REQUEST_CANCELLED
        0x10c => StatusCode::Cancelled,
        _ => StatusCode::Internal,
    }
}

/// Decodes percent-escaped bytes in a `grpc-message` value.
///
/// Best effort: malformed escapes pass through unchanged rather than failing
/// status resolution.
pub fn percent_decode(value: &str) -> String {
    fn hex_val(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    // Work on raw bytes only; a malformed escape next to a multibyte
    // character must pass through, not split a char boundary.
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extracts the terminal status from a trailer block.
///
/// A missing or unparsable `grpc-status` is itself an error and resolves to
/// INTERNAL; the `grpc-message` value is percent-decoded.
pub fn status_from_trailers(trailers: &Metadata) -> Status {
    let raw = match trailers.get(GRPC_STATUS) {
        Some(raw) => raw,
        None => {
            return Status::new(
                StatusCode::Internal,
                "response is missing the grpc-status trailer",
            )
        }
    };
    let code = match raw.parse::<i32>().ok().and_then(StatusCode::from_i32) {
        Some(code) => code,
        None => {
            return Status::new(
                StatusCode::Internal,
                format!("invalid grpc-status trailer value '{raw}'"),
            )
        }
    };
    let message = trailers
        .get(GRPC_MESSAGE)
        .map(percent_decode)
        .unwrap_or_default();
    Status::new(code, message)
}

/// Decides from the response headers alone whether the call already
/// finished.
///
/// Priority order: an explicit `grpc-status` in the headers wins
/// (trailers-only response); then a protocol downgrade is INTERNAL; then a
/// non-success HTTP status maps through the fixed table; then a missing or
/// foreign content type is CANCELLED. Anything else means the call is still
/// in progress.
pub fn validate_headers(
    version: HttpVersion,
    http_status: u16,
    headers: &Metadata,
) -> HeaderDecision {
    if headers.contains_key(GRPC_STATUS) {
        return HeaderDecision::AlreadyFinished(status_from_trailers(headers));
    }

    if version == HttpVersion::Http1 {
        return HeaderDecision::AlreadyFinished(Status::new(
            StatusCode::Internal,
            "the response was downgraded below HTTP/2; gRPC requires HTTP/2",
        ));
    }

    if !(200..300).contains(&http_status) {
        let code = grpc_status_from_http(http_status);
        return HeaderDecision::AlreadyFinished(Status::new(
            code,
            format!("bad gRPC response: HTTP status {http_status}"),
        ));
    }

    match headers.get(CONTENT_TYPE) {
        Some(content_type) if content_type.starts_with(GRPC_CONTENT_TYPE) => {
            HeaderDecision::InProgress
        }
        Some(content_type) => HeaderDecision::AlreadyFinished(Status::new(
            StatusCode::Cancelled,
            format!("bad gRPC response: unexpected content-type '{content_type}'"),
        )),
        None => HeaderDecision::AlreadyFinished(Status::new(
            StatusCode::Cancelled,
            "bad gRPC response: missing content-type header",
        )),
    }
}

fn chain_contains_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cursor = Some(err);
    while let Some(current) = cursor {
        if current.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        cursor = current.source();
    }
    false
}

/// Maps a transport failure to a status by walking its cause chain.
///
/// Connection-level failures are UNAVAILABLE so policies may retry them;
/// protocol reset codes map through the dedicated tables; anything
/// unrecognized is INTERNAL.
pub fn status_from_transport_error(err: &TransportError) -> Status {
    match err {
        TransportError::ConnectionRefused { .. }
        | TransportError::HostNotFound { .. }
        | TransportError::Io(_) => Status::new(StatusCode::Unavailable, err.to_string()),
        TransportError::Http2Reset { code } => {
            Status::new(grpc_status_from_http2_error(*code), err.to_string())
        }
        TransportError::Http3Reset { code } => {
            Status::new(grpc_status_from_http3_error(*code), err.to_string())
        }
        TransportError::Other { source, .. } => {
            let is_io = source
                .as_deref()
                .map(|cause| chain_contains_io(cause as &(dyn std::error::Error + 'static)))
                .unwrap_or(false);
            if is_io {
                Status::new(StatusCode::Unavailable, err.to_string())
            } else {
                Status::new(StatusCode::Internal, err.to_string())
            }
        }
    }
}

/// Maps a local call failure to the status the attempt resolves with.
///
/// Used when the failure happens while reading the response body, after the
/// transport has already produced headers.
pub fn status_from_call_error(err: &CallError) -> Status {
    match err {
        CallError::Rpc { status, .. } | CallError::Cancelled { status } => status.clone(),
        CallError::MessageTooLarge { size, max_size } => Status::new(
            StatusCode::ResourceExhausted,
            format!("received message of {size} bytes exceeds limit of {max_size} bytes"),
        ),
        CallError::Transport(transport) => status_from_transport_error(transport),
        _ => Status::new(StatusCode::Internal, err.to_string()),
    }
}
