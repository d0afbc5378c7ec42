//! The client channel: policy validation, attempt creation, and dispatch.
//!
//! A channel pairs a transport with a validated configuration. Every method
//! config is validated when the channel is built; calls then select their
//! dispatch strategy with a plain lookup. The channel is the only place the
//! shutdown latch is checked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::call::CallAttempt;
use crate::cancel::{CancelHandle, CancelReason};
use crate::codec::BufferPool;
use crate::config::{CallPolicy, ChannelConfig, ConfigError};
use crate::error::{CallError, Result};
use crate::hedge::HedgeExecutor;
use crate::method::{CallOptions, MethodDescriptor};
use crate::retry::RetryExecutor;
use crate::transport::Transport;

struct ChannelState {
    shutdown: AtomicBool,
    next_call_id: AtomicU64,
    // Cancel handles of in-flight attempts, removed as each one finishes.
    active: Mutex<HashMap<u64, CancelHandle>>,
}

/// A client channel over one transport.
pub struct Channel {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    policies: HashMap<String, CallPolicy>,
    pool: Arc<BufferPool>,
    state: Arc<ChannelState>,
}

impl Channel {
    /// Builds a channel, validating every configured method policy.
    ///
    /// Fails closed: any invalid policy prevents construction.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let mut policies = HashMap::new();
        for (method, method_config) in &config.method_configs {
            let policy = method_config.validate(method)?;
            policies.insert(method.clone(), policy);
        }
        debug!(methods = policies.len(), "channel configured");
        Ok(Self {
            transport,
            config,
            policies,
            pool: Arc::new(BufferPool::new()),
            state: Arc::new(ChannelState {
                shutdown: AtomicBool::new(false),
                next_call_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The dispatch policy for a method, `Plain` when none is configured.
    pub fn policy_for(&self, full_name: &str) -> &CallPolicy {
        self.policies.get(full_name).unwrap_or(&CallPolicy::Plain)
    }

    /// Number of attempts currently in flight.
    pub fn active_calls(&self) -> usize {
        self.state.active.lock().unwrap().len()
    }

    /// Returns `true` once [`Self::shut_down`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Latches the shutdown flag and cancels every in-flight attempt. New
    /// calls fail with a shutdown error. Idempotent.
    pub fn shut_down(&self) {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<CancelHandle> = {
            let mut active = self.state.active.lock().unwrap();
            active.drain().map(|(_, handle)| handle).collect()
        };
        if !handles.is_empty() {
            warn!(count = handles.len(), "cancelling in-flight calls at shutdown");
        }
        for handle in handles {
            handle.cancel(CancelReason::ChannelShutdown);
        }
    }

    fn factory<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        options: &CallOptions,
    ) -> AttemptFactory<Req, Resp> {
        AttemptFactory {
            transport: self.transport.clone(),
            method: method.clone(),
            options: options.clone(),
            cancellation_mode: self.config.cancellation_mode,
            receive_limit: self.config.receive_limit(),
            credentials: self.config.credentials.clone(),
            pool: self.pool.clone(),
            state: self.state.clone(),
        }
    }

    /// Creates a single call attempt without starting it. Streaming shapes
    /// use this; retry and hedging policies apply only to unary calls.
    pub fn create_call<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        options: CallOptions,
    ) -> Result<CallAttempt<Req, Resp>>
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        self.factory(method, &options).make(1)
    }

    /// Invokes a unary method end to end, applying the method's configured
    /// retry or hedging policy.
    pub async fn call_unary<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        request: Req,
        options: CallOptions,
    ) -> Result<Resp>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let factory = self.factory(method, &options);
        match self.policy_for(&method.full_name()) {
            CallPolicy::Plain => {
                let attempt = factory.make(1)?;
                attempt.start_unary(request)?;
                attempt.response().await
            }
            CallPolicy::Retry(policy) => {
                let executor = RetryExecutor::new(policy.clone());
                executor
                    .execute(move |ordinal| {
                        let factory = factory.clone();
                        let request = request.clone();
                        async move {
                            let attempt = factory.make(ordinal)?;
                            attempt.start_unary(request)?;
                            attempt.response().await
                        }
                    })
                    .await
            }
            CallPolicy::Hedging(policy) => {
                let executor = HedgeExecutor::new(policy.clone());
                executor
                    .execute(move |ordinal| {
                        let factory = factory.clone();
                        let request = request.clone();
                        async move {
                            let attempt = factory.make(ordinal)?;
                            attempt.start_unary(request)?;
                            attempt.response().await
                        }
                    })
                    .await
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("config", &self.config)
            .field("policies", &self.policies.len())
            .field("active_calls", &self.active_calls())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Everything needed to mint one attempt, owned so retry and hedging
/// operations can outlive the borrow of the channel.
struct AttemptFactory<Req, Resp> {
    transport: Arc<dyn Transport>,
    method: MethodDescriptor<Req, Resp>,
    options: CallOptions,
    cancellation_mode: crate::config::CancellationMode,
    receive_limit: usize,
    credentials: Option<Arc<dyn crate::transport::CallCredentials>>,
    pool: Arc<BufferPool>,
    state: Arc<ChannelState>,
}

impl<Req, Resp> Clone for AttemptFactory<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            method: self.method.clone(),
            options: self.options.clone(),
            cancellation_mode: self.cancellation_mode,
            receive_limit: self.receive_limit,
            credentials: self.credentials.clone(),
            pool: self.pool.clone(),
            state: self.state.clone(),
        }
    }
}

impl<Req, Resp> AttemptFactory<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    fn make(&self, ordinal: u32) -> Result<CallAttempt<Req, Resp>> {
        if self.state.shutdown.load(Ordering::SeqCst) {
            return Err(CallError::ChannelShutdown);
        }
        let call_id = self.state.next_call_id.fetch_add(1, Ordering::SeqCst);
        let state = self.state.clone();
        let attempt = CallAttempt::new(
            self.transport.clone(),
            self.method.clone(),
            self.options.clone(),
            self.cancellation_mode,
            self.receive_limit,
            self.credentials.clone(),
            self.pool.clone(),
            ordinal,
            Some(Box::new(move || {
                state.active.lock().unwrap().remove(&call_id);
            })),
        );
        self.state
            .active
            .lock()
            .unwrap()
            .insert(call_id, attempt.cancel_handle_for_channel());
        Ok(attempt)
    }
}
