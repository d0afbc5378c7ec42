//! gRPC status codes and the terminal status of a call attempt.
//!
//! A `Status` is the final, immutable outcome of one attempt. It is resolved
//! exactly once by the call state machine and observed by every reader of the
//! attempt afterwards.

/// Canonical gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity the client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or supported by the server.
    Unimplemented = 12,
    /// Internal error; an invariant expected by the underlying system broke.
    Internal = 13,
    /// The service is currently unavailable; retrying may help.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl StatusCode {
    /// Converts a numeric wire value (from a `grpc-status` trailer) to a code.
    ///
    /// Returns `None` for values outside the canonical range.
    pub fn from_i32(value: i32) -> Option<Self> {
        let code = match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }

    /// Returns the numeric wire value of this code.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Returns the canonical name of this code (e.g. `DEADLINE_EXCEEDED`).
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The terminal status of a call attempt: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Creates a new status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The OK status with an empty message.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Returns the status code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Returns the status message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if the code is `OK`.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_i32_roundtrip() {
        for value in 0..=16 {
            let code = StatusCode::from_i32(value).unwrap();
            assert_eq!(code.value(), value);
        }
    }

    #[test]
    fn test_from_i32_out_of_range() {
        assert_eq!(StatusCode::from_i32(-1), None);
        assert_eq!(StatusCode::from_i32(17), None);
        assert_eq!(StatusCode::from_i32(100), None);
    }

    #[test]
    fn test_status_ok() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert_eq!(status.code(), StatusCode::Ok);
        assert_eq!(status.message(), "");
    }

    #[test]
    fn test_status_with_message() {
        let status = Status::new(StatusCode::NotFound, "no such method");
        assert!(!status.is_ok());
        assert_eq!(status.code(), StatusCode::NotFound);
        assert_eq!(status.message(), "no such method");
    }

    #[test]
    fn test_status_display() {
        let status = Status::new(StatusCode::DeadlineExceeded, "too slow");
        assert_eq!(status.to_string(), "DEADLINE_EXCEEDED: too slow");
        assert_eq!(Status::ok().to_string(), "OK");
    }

    #[test]
    fn test_code_names() {
        assert_eq!(StatusCode::Unavailable.name(), "UNAVAILABLE");
        assert_eq!(StatusCode::Unauthenticated.name(), "UNAUTHENTICATED");
    }
}
