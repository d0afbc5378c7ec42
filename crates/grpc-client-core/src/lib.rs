#![warn(missing_docs)]

//! Client-side gRPC call engine: wire framing, deadlines, cancellation, call
//! attempts, streaming, and retry/hedging dispatch over a pluggable transport.

pub mod call;
pub mod cancel;
pub mod channel;
pub mod codec;
pub mod completion;
pub mod config;
pub mod deadline;
pub mod error;
pub mod framing;
pub(crate) mod hedge;
pub mod metadata;
pub mod method;
pub mod resolver;
pub(crate) mod retry;
pub mod status;
pub mod streaming;
pub mod transport;

pub use call::{AttemptPhase, CallAttempt};
pub use channel::Channel;
pub use config::{CallPolicy, ChannelConfig, ConfigError, HedgingPolicy, MethodConfig, RetryPolicy};
pub use error::{CallError, Result};
pub use method::{CallOptions, MethodDescriptor, MethodKind, WriteOptions};
pub use status::{Status, StatusCode};
