//! Cooperative cancellation signals for call attempts.
//!
//! A caller-supplied signal and the deadline timer both route through the
//! same token; the only difference between the two is the reason, which
//! selects the resulting status code (CANCELLED vs DEADLINE_EXCEEDED).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::status::{Status, StatusCode};

/// Why a call attempt was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
    /// The deadline expired before the call completed.
    DeadlineExceeded,
    /// The call object was disposed while the attempt was in flight.
    Disposed,
    /// The owning channel was shut down.
    ChannelShutdown,
}

impl CancelReason {
    /// Maps the reason to the status the attempt resolves with.
    pub fn to_status(self) -> Status {
        match self {
            CancelReason::UserRequested => {
                Status::new(StatusCode::Cancelled, "call was cancelled by the caller")
            }
            CancelReason::DeadlineExceeded => {
                Status::new(StatusCode::DeadlineExceeded, "deadline exceeded")
            }
            CancelReason::Disposed => {
                Status::new(StatusCode::Cancelled, "call was disposed")
            }
            CancelReason::ChannelShutdown => {
                Status::new(StatusCode::Cancelled, "channel was shut down")
            }
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Disposed => write!(f, "Disposed"),
            CancelReason::ChannelShutdown => write!(f, "ChannelShutdown"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Arc<Shared>>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = self.children.lock().unwrap().clone();
        for child in children {
            child.cancel(reason);
        }
    }
}

/// A cloneable cancellation listener. Multiple recipients can observe the
/// same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Returns `true` if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.shared.reason.lock().unwrap()
    }

    /// Waits until this token is cancelled and returns the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_cancelled() {
                return self.reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Creates a child token that is cancelled when this token is cancelled,
    /// and can also be cancelled independently without affecting the parent.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let shared = Shared::new();
        if self.is_cancelled() {
            shared.cancel(self.reason().unwrap_or_default());
        } else {
            self.shared.children.lock().unwrap().push(shared.clone());
        }
        (
            CancelToken {
                shared: shared.clone(),
            },
            CancelHandle { shared },
        )
    }
}

/// The handle that triggers cancellation. First cancel wins; later reasons
/// are ignored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Triggers cancellation with the given reason.
    pub fn cancel(&self, reason: CancelReason) {
        self.shared.cancel(reason);
    }

    /// Returns `true` if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Creates a new token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let shared = Shared::new();
    (
        CancelToken {
            shared: shared.clone(),
        },
        CancelHandle { shared },
    )
}
