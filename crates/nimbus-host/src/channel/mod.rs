//! Worker channel: the host's logical connection to one language worker.
//!
//! A [`WorkerChannel`] owns the logical side of its [`ChannelPair`]. It drives
//! the worker through init and function load, correlates invocation
//! responses with their callers, and tears everything down on dispose. It
//! never touches the wire directly: frames go out through the pair's
//! outbound queue and come back through a private inbound pump.
//!
//! ```text
//!   initialize()      load_functions()           invoke() ×N
//! Created ─► Initializing ─► Initialized ─► LoadingFunctions ─► Ready
//! ```
//!
//! Responses are matched to pending invocations by invocation id only, so
//! they may arrive in any order. Every pending invocation is fulfilled
//! exactly once: by its response, its deadline, a cancel, or a batch failure.

mod pending;
mod state;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nimbus_proto::capabilities::{
    HANDLES_INVOCATION_CANCEL, HANDLES_WORKER_TERMINATE, SUPPORTS_LOAD_RESPONSE_COLLECTION,
};
use nimbus_proto::rpc::{
    rpc_log, CloseSharedMemoryResourcesRequest, FileChangeEventRequest,
    FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, FunctionLoadRequest,
    FunctionLoadRequestCollection, FunctionLoadResponse, FunctionMetadataResponse,
    FunctionsMetadataRequest, InvocationCancel, InvocationRequest, InvocationResponse,
    ParameterBinding, RpcFunctionMetadata, RpcLog, TypedData, WorkerInitRequest,
    WorkerInitResponse, WorkerStatusRequest, WorkerTerminate,
};
use nimbus_proto::{Content, MessageKind, StreamingMessage};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{EventBus, HostEvent};
use crate::config::ChannelConfig;
use crate::error::{HostError, InvocationError, Result};
use crate::pair::{ChannelPair, ChannelPairRegistry, InboundMessage, WorkerId};

pub use nimbus_proto::rpc::file_change_event_request::Type as FileChangeKind;
pub use pending::InvocationResult;
pub use state::ChannelState;

use pending::PendingTable;

/// Version reported to workers in `WorkerInitRequest`.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-channel settings.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub timeouts: ChannelConfig,
    /// Directory the worker runs from.
    pub worker_directory: String,
    /// Root of the function application.
    pub function_app_directory: String,
}

/// A request to run one function.
#[derive(Debug, Clone, Default)]
pub struct InvocationInput {
    pub function_id: String,
    /// Generated when not supplied.
    pub invocation_id: Option<String>,
    pub inputs: Vec<ParameterBinding>,
    pub trigger_metadata: HashMap<String, TypedData>,
    /// Overrides the channel's default invocation timeout.
    pub timeout: Option<Duration>,
}

impl InvocationInput {
    #[must_use]
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_invocation_id(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }

    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, data: impl Into<TypedData>) -> Self {
        self.inputs.push(ParameterBinding::new(name, data.into()));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a function load pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Function id and the worker's reason.
    pub failed: Vec<(String, String)>,
}

/// Cloneable handle to a worker channel.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<Inner>,
}

struct Inner {
    worker_id: WorkerId,
    runtime: String,
    generation: u64,
    options: ChannelOptions,
    bus: EventBus,
    registry: Arc<ChannelPairRegistry>,
    outbound: mpsc::UnboundedSender<StreamingMessage>,
    state: watch::Sender<ChannelState>,
    pending: PendingTable,
    init_waiter: Mutex<Option<oneshot::Sender<WorkerInitResponse>>>,
    load_waiters: Mutex<HashMap<String, oneshot::Sender<FunctionLoadResponse>>>,
    reload_waiter: Mutex<Option<oneshot::Sender<FunctionEnvironmentReloadResponse>>>,
    metadata_waiter: Mutex<Option<oneshot::Sender<FunctionMetadataResponse>>>,
    status_waiters: Mutex<HashMap<String, oneshot::Sender<()>>>,
    metadata: OnceCell<Vec<RpcFunctionMetadata>>,
    capabilities: RwLock<HashMap<String, String>>,
    functions: RwLock<HashSet<String>>,
    load_errors: RwLock<HashMap<String, String>>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("worker_id", &self.inner.worker_id)
            .field("runtime", &self.inner.runtime)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn fulfil<T>(slot: &Mutex<Option<oneshot::Sender<T>>>, value: T) -> bool {
    slot.lock()
        .take()
        .is_some_and(|waiter| waiter.send(value).is_ok())
}

impl WorkerChannel {
    /// Creates a channel over a registered pair and starts its inbound pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        pair: ChannelPair,
        runtime: impl Into<String>,
        options: ChannelOptions,
        bus: EventBus,
        registry: Arc<ChannelPairRegistry>,
    ) -> Self {
        let ChannelPair {
            worker_id,
            generation,
            outbound,
            inbound,
        } = pair;
        let (state, _) = watch::channel(ChannelState::Created);

        let inner = Arc::new(Inner {
            worker_id,
            runtime: runtime.into(),
            generation,
            options,
            bus,
            registry,
            outbound,
            state,
            pending: PendingTable::default(),
            init_waiter: Mutex::new(None),
            load_waiters: Mutex::new(HashMap::new()),
            reload_waiter: Mutex::new(None),
            metadata_waiter: Mutex::new(None),
            status_waiters: Mutex::new(HashMap::new()),
            metadata: OnceCell::new(),
            capabilities: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashSet::new()),
            load_errors: RwLock::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inbound_pump(
            Arc::downgrade(&inner),
            inbound,
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    #[must_use]
    pub fn runtime(&self) -> &str {
        &self.inner.runtime
    }

    /// Generation of the channel pair this channel owns.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Capabilities the worker advertised.
    #[must_use]
    pub fn capabilities(&self) -> HashMap<String, String> {
        self.inner.capabilities.read().clone()
    }

    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.inner.has_capability(name)
    }

    /// Ids of successfully loaded functions, sorted.
    #[must_use]
    pub fn loaded_functions(&self) -> Vec<String> {
        let mut loaded: Vec<_> = self.inner.functions.read().iter().cloned().collect();
        loaded.sort();
        loaded
    }

    /// The cached load failure for a function, if any.
    #[must_use]
    pub fn load_error(&self, function_id: &str) -> Option<String> {
        self.inner.load_errors.read().get(function_id).cloned()
    }

    /// Number of invocations awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Performs the init handshake.
    ///
    /// Failure publishes [`HostEvent::WorkerError`] and disposes the channel.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        if let Err(state) = inner.transition(&[ChannelState::Created], ChannelState::Initializing) {
            return Err(match state {
                ChannelState::Initializing
                | ChannelState::Initialized
                | ChannelState::LoadingFunctions
                | ChannelState::Ready => HostError::InitInProgress(inner.worker_id.clone()),
                other => HostError::InvalidState {
                    state: other,
                    operation: "initialize",
                },
            });
        }

        let (waiter, response) = oneshot::channel();
        *inner.init_waiter.lock() = Some(waiter);

        info!(worker_id = %inner.worker_id, runtime = %inner.runtime, "Initializing worker");
        let request = WorkerInitRequest {
            host_version: HOST_VERSION.to_owned(),
            capabilities: HashMap::new(),
            log_categories: HashMap::new(),
            worker_directory: inner.options.worker_directory.clone(),
            function_app_directory: inner.options.function_app_directory.clone(),
        };
        if let Err(e) = inner.send(Content::WorkerInitRequest(request)) {
            return Err(self.fail_startup(e));
        }

        let timeout = inner.options.timeouts.init_timeout;
        let mut response = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(self.fail_startup(HostError::ChannelClosed(inner.worker_id.clone())))
            }
            Err(_) => {
                inner.init_waiter.lock().take();
                return Err(self.fail_startup(HostError::Timeout {
                    operation: "worker init",
                    after: timeout,
                }));
            }
        };

        let status = response.result.take().unwrap_or_default();
        if !status.is_success() {
            return Err(self.fail_startup(HostError::InitFailed {
                worker_id: inner.worker_id.clone(),
                reason: status.error_message(),
            }));
        }

        *inner.capabilities.write() = std::mem::take(&mut response.capabilities);
        inner
            .transition(&[ChannelState::Initializing], ChannelState::Initialized)
            .map_err(|state| HostError::InvalidState {
                state,
                operation: "initialize",
            })?;

        info!(
            worker_id = %inner.worker_id,
            worker_version = %response.worker_version,
            capabilities = inner.capabilities.read().len(),
            "Worker initialized"
        );
        Ok(())
    }

    /// Loads functions onto the worker and moves the channel to Ready.
    ///
    /// A function the worker fails to load does not fail the pass; its error
    /// is cached and returned by every later invoke of that function.
    pub async fn load_functions(&self, functions: Vec<RpcFunctionMetadata>) -> Result<LoadReport> {
        let inner = &self.inner;
        inner
            .transition(
                &[ChannelState::Initialized, ChannelState::Ready],
                ChannelState::LoadingFunctions,
            )
            .map_err(|state| HostError::InvalidState {
                state,
                operation: "load_functions",
            })?;

        let mut seen = HashSet::with_capacity(functions.len());
        let functions: Vec<RpcFunctionMetadata> = functions
            .into_iter()
            .filter(|function| {
                let first = seen.insert(function.function_id.clone());
                if !first {
                    warn!(worker_id = %inner.worker_id, function_id = %function.function_id, "Skipping duplicate function");
                }
                first
            })
            .collect();

        let mut report = LoadReport::default();
        if functions.is_empty() {
            self.become_ready(&report)?;
            return Ok(report);
        }

        let mut receivers = Vec::with_capacity(functions.len());
        {
            let mut waiters = inner.load_waiters.lock();
            for function in &functions {
                let (waiter, receiver) = oneshot::channel();
                waiters.insert(function.function_id.clone(), waiter);
                receivers.push((function.function_id.clone(), receiver));
            }
        }

        let requests: Vec<FunctionLoadRequest> = functions
            .into_iter()
            .map(|metadata| FunctionLoadRequest {
                function_id: metadata.function_id.clone(),
                managed_dependency_enabled: metadata.managed_dependency_enabled,
                metadata: Some(metadata),
            })
            .collect();

        debug!(worker_id = %inner.worker_id, count = requests.len(), "Loading functions");
        let sent = if inner.has_capability(SUPPORTS_LOAD_RESPONSE_COLLECTION) {
            inner.send(Content::FunctionLoadRequestCollection(
                FunctionLoadRequestCollection {
                    function_load_requests: requests,
                },
            ))
        } else {
            requests
                .into_iter()
                .try_for_each(|request| inner.send(Content::FunctionLoadRequest(request)))
        };
        if let Err(e) = sent {
            inner.load_waiters.lock().clear();
            return Err(self.fail_startup(e));
        }

        let timeout = inner.options.timeouts.load_timeout;
        let (ids, receivers): (Vec<_>, Vec<_>) = receivers.into_iter().unzip();
        let responses =
            match tokio::time::timeout(timeout, futures::future::join_all(receivers)).await {
                Ok(responses) => responses,
                Err(_) => {
                    inner.load_waiters.lock().clear();
                    return Err(self.fail_startup(HostError::Timeout {
                        operation: "function load",
                        after: timeout,
                    }));
                }
            };

        for (function_id, response) in ids.into_iter().zip(responses) {
            let Ok(response) = response else {
                return Err(self.fail_startup(HostError::ChannelClosed(inner.worker_id.clone())));
            };
            let status = response.result.unwrap_or_default();
            if status.is_success() {
                inner.load_errors.write().remove(&function_id);
                inner.functions.write().insert(function_id.clone());
                report.loaded.push(function_id);
            } else {
                let reason = status.error_message();
                warn!(worker_id = %inner.worker_id, function_id = %function_id, reason = %reason, "Function failed to load");
                inner.functions.write().remove(&function_id);
                inner
                    .load_errors
                    .write()
                    .insert(function_id.clone(), reason.clone());
                report.failed.push((function_id, reason));
            }
        }

        self.become_ready(&report)?;
        Ok(report)
    }

    fn become_ready(&self, report: &LoadReport) -> Result<()> {
        let inner = &self.inner;
        inner
            .transition(&[ChannelState::LoadingFunctions], ChannelState::Ready)
            .map_err(|state| HostError::InvalidState {
                state,
                operation: "load_functions",
            })?;
        info!(
            worker_id = %inner.worker_id,
            runtime = %inner.runtime,
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Worker channel ready"
        );
        inner.bus.publish(HostEvent::ChannelReady {
            worker_id: inner.worker_id.clone(),
            runtime: inner.runtime.clone(),
        });
        Ok(())
    }

    /// Invokes a function and waits for its response or deadline.
    ///
    /// Dropping the returned future removes the pending entry.
    pub async fn invoke(&self, input: InvocationInput) -> Result<InvocationResult> {
        let inner = &self.inner;
        let state = self.state();
        if state != ChannelState::Ready {
            return Err(HostError::InvalidState {
                state,
                operation: "invoke",
            });
        }
        if let Some(reason) = self.load_error(&input.function_id) {
            return Err(HostError::FunctionLoadFailed {
                function_id: input.function_id,
                reason,
            });
        }
        if !inner.functions.read().contains(&input.function_id) {
            return Err(HostError::FunctionNotLoaded(input.function_id));
        }

        let invocation_id = input
            .invocation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let timeout = input
            .timeout
            .unwrap_or(inner.options.timeouts.invocation_timeout);

        let Some((completion, _guard)) = inner.pending.insert(&invocation_id, &input.function_id)
        else {
            return Err(HostError::Protocol(format!(
                "invocation {invocation_id} is already in flight"
            )));
        };

        trace!(worker_id = %inner.worker_id, invocation_id = %invocation_id, function_id = %input.function_id, "Sending invocation");
        inner.send(Content::InvocationRequest(InvocationRequest {
            invocation_id: invocation_id.clone(),
            function_id: input.function_id,
            input_data: input.inputs,
            trigger_metadata: input.trigger_metadata,
        }))?;

        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(completion)) => completion.map_err(HostError::from),
            // The table was dropped without fulfilling the entry.
            Ok(Err(_)) => Err(InvocationError::Cancelled.into()),
            Err(_) => {
                inner.pending.remove(&invocation_id);
                warn!(
                    worker_id = %inner.worker_id,
                    invocation_id = %invocation_id,
                    timeout_ms = millis(timeout),
                    "Invocation timed out"
                );
                if inner.has_capability(HANDLES_INVOCATION_CANCEL) {
                    let _ = inner.send(Content::InvocationCancel(InvocationCancel {
                        invocation_id: invocation_id.clone(),
                        grace_period_ms: 0,
                    }));
                }
                Err(InvocationError::Timeout {
                    invocation_id,
                    after: timeout,
                }
                .into())
            }
        }
    }

    /// Requests cancellation of an in-flight invocation.
    ///
    /// If the worker has not completed the invocation when the cancel grace
    /// period ends, it is fulfilled with [`InvocationError::Cancelled`].
    /// Returns false if nothing was pending under that id.
    pub fn cancel(&self, invocation_id: &str) -> Result<bool> {
        let inner = &self.inner;
        if !inner.pending.contains(invocation_id) {
            return Ok(false);
        }

        let grace = inner.options.timeouts.cancel_grace_period;
        if inner.has_capability(HANDLES_INVOCATION_CANCEL) {
            inner.send(Content::InvocationCancel(InvocationCancel {
                invocation_id: invocation_id.to_owned(),
                grace_period_ms: millis(grace),
            }))?;
        }

        let pending = inner.pending.clone();
        let worker_id = inner.worker_id.clone();
        let invocation_id = invocation_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if pending
                .complete(&invocation_id, Err(InvocationError::Cancelled))
                .is_some()
            {
                debug!(worker_id = %worker_id, invocation_id = %invocation_id, "Cancelled invocation was not acknowledged");
            }
        });
        Ok(true)
    }

    /// Sends new environment variables to the worker and waits for the ack.
    ///
    /// Variables with empty values are not sent.
    pub async fn reload_environment(
        &self,
        environment: HashMap<String, String>,
        function_app_directory: &str,
    ) -> Result<()> {
        let inner = &self.inner;
        let state = self.state();
        if !matches!(state, ChannelState::Initialized | ChannelState::Ready) {
            return Err(HostError::InvalidState {
                state,
                operation: "reload_environment",
            });
        }

        let environment_variables: HashMap<_, _> = environment
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        let count = environment_variables.len();

        let (waiter, response) = oneshot::channel();
        *inner.reload_waiter.lock() = Some(waiter);
        inner.send(Content::FunctionEnvironmentReloadRequest(
            FunctionEnvironmentReloadRequest {
                environment_variables,
                function_app_directory: function_app_directory.to_owned(),
            },
        ))?;

        let timeout = inner.options.timeouts.env_reload_timeout;
        let response = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(HostError::ChannelClosed(inner.worker_id.clone())),
            Err(_) => {
                inner.reload_waiter.lock().take();
                return Err(HostError::Timeout {
                    operation: "environment reload",
                    after: timeout,
                });
            }
        };

        let status = response.result.unwrap_or_default();
        if !status.is_success() {
            return Err(HostError::EnvironmentReloadFailed {
                worker_id: inner.worker_id.clone(),
                reason: status.error_message(),
            });
        }
        inner.capabilities.write().extend(response.capabilities);

        info!(worker_id = %inner.worker_id, variables = count, app_dir = %function_app_directory, "Worker environment reloaded");
        Ok(())
    }

    /// Asks the worker to index its own functions.
    ///
    /// The request is sent at most once per channel; later calls return the
    /// cached result.
    pub async fn get_function_metadata(
        &self,
        function_app_directory: &str,
    ) -> Result<Vec<RpcFunctionMetadata>> {
        let inner = &self.inner;
        inner
            .metadata
            .get_or_try_init(|| async move {
                let (waiter, response) = oneshot::channel();
                *inner.metadata_waiter.lock() = Some(waiter);
                inner.send(Content::FunctionsMetadataRequest(FunctionsMetadataRequest {
                    function_app_directory: function_app_directory.to_owned(),
                }))?;

                let timeout = inner.options.timeouts.load_timeout;
                let response = match tokio::time::timeout(timeout, response).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => return Err(HostError::ChannelClosed(inner.worker_id.clone())),
                    Err(_) => {
                        inner.metadata_waiter.lock().take();
                        return Err(HostError::Timeout {
                            operation: "function metadata",
                            after: timeout,
                        });
                    }
                };

                let status = response.result.unwrap_or_default();
                if !status.is_success() {
                    return Err(HostError::Protocol(format!(
                        "worker failed to index functions: {}",
                        status.error_message()
                    )));
                }
                debug!(worker_id = %inner.worker_id, count = response.function_metadata_results.len(), "Worker indexed functions");
                Ok(response.function_metadata_results)
            })
            .await
            .cloned()
    }

    /// Round-trips a status request and returns the latency.
    pub async fn worker_status(&self) -> Result<Duration> {
        let inner = &self.inner;
        let request_id = uuid::Uuid::new_v4().to_string();
        let (waiter, response) = oneshot::channel();
        inner
            .status_waiters
            .lock()
            .insert(request_id.clone(), waiter);

        let started = Instant::now();
        let frame = StreamingMessage::with_request_id(
            request_id.clone(),
            Content::WorkerStatusRequest(WorkerStatusRequest {}),
        );
        if let Err(e) = inner.send_frame(frame) {
            inner.status_waiters.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(STATUS_TIMEOUT, response).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(HostError::ChannelClosed(inner.worker_id.clone())),
            Err(_) => {
                inner.status_waiters.lock().remove(&request_id);
                Err(HostError::Timeout {
                    operation: "worker status",
                    after: STATUS_TIMEOUT,
                })
            }
        }
    }

    /// Tells the worker a file in the function app changed.
    pub fn notify_file_change(&self, kind: FileChangeKind, name: &str, full_path: &str) -> Result<()> {
        self.inner
            .send(Content::FileChangeEventRequest(FileChangeEventRequest {
                r#type: kind.into(),
                full_path: full_path.to_owned(),
                name: name.to_owned(),
            }))
    }

    /// Asks the worker to release shared memory maps.
    pub fn close_shared_memory_resources(&self, map_names: Vec<String>) -> Result<()> {
        self.inner.send(Content::CloseSharedMemoryResourcesRequest(
            CloseSharedMemoryResourcesRequest { map_names },
        ))
    }

    /// Fulfils every pending invocation with `error`. Returns the count.
    pub fn fail_invocations(&self, error: &InvocationError) -> usize {
        let failed = self.inner.pending.fail_all(error);
        if failed > 0 {
            warn!(worker_id = %self.inner.worker_id, failed, error = %error, "Failed pending invocations");
        }
        failed
    }

    /// Moves the channel to Restarting and fails its pending invocations.
    pub fn mark_restarting(&self, error: &InvocationError) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ChannelState::Restarting;
                true
            }
        });
        if changed {
            info!(worker_id = %self.inner.worker_id, "Worker channel restarting");
        }
        self.fail_invocations(error);
    }

    /// Disposes the channel. Returns false if it was already disposed.
    ///
    /// Sends `WorkerTerminate` when the worker supports it, fails pending
    /// invocations with [`InvocationError::WorkerTerminated`], stops the
    /// inbound pump and removes the channel pair.
    pub fn dispose(&self) -> bool {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if inner.has_capability(HANDLES_WORKER_TERMINATE) {
            let grace = inner.options.timeouts.terminate_grace_period;
            let terminate = StreamingMessage::new(Content::WorkerTerminate(WorkerTerminate {
                grace_period_ms: millis(grace),
            }));
            // Queued ahead of the pair removal so the push loop flushes it.
            let _ = inner.outbound.send(terminate);
        }

        let failed = inner.pending.fail_all(&InvocationError::WorkerTerminated {
            worker_id: inner.worker_id.to_string(),
            reason: "worker channel disposed".to_owned(),
        });

        inner.init_waiter.lock().take();
        inner.load_waiters.lock().clear();
        inner.reload_waiter.lock().take();
        inner.metadata_waiter.lock().take();
        inner.status_waiters.lock().clear();

        inner.shutdown.cancel();
        inner.state.send_replace(ChannelState::Disposed);
        inner.registry.remove(&inner.worker_id, inner.generation);

        info!(worker_id = %inner.worker_id, runtime = %inner.runtime, failed, "Worker channel disposed");
        true
    }

    fn fail_startup(&self, error: HostError) -> HostError {
        let inner = &self.inner;
        if self.is_disposed() {
            return error;
        }
        error!(worker_id = %inner.worker_id, runtime = %inner.runtime, error = %error, "Worker startup failed");
        inner.bus.publish(HostEvent::WorkerError {
            worker_id: inner.worker_id.clone(),
            runtime: inner.runtime.clone(),
            error: error.to_string(),
        });
        self.dispose();
        error
    }
}

impl Inner {
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.read().contains_key(name)
    }

    fn send(&self, content: Content) -> Result<()> {
        self.send_frame(StreamingMessage::new(content))
    }

    fn send_frame(&self, frame: StreamingMessage) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(HostError::ChannelClosed(self.worker_id.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| HostError::ChannelClosed(self.worker_id.clone()))
    }

    /// Moves to `to` if the current state is one of `from`; otherwise
    /// returns the current state.
    fn transition(
        &self,
        from: &[ChannelState],
        to: ChannelState,
    ) -> std::result::Result<(), ChannelState> {
        let mut current = to;
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                current = *state;
                false
            }
        });
        if changed {
            debug!(worker_id = %self.worker_id, state = %to, "Worker channel state changed");
            Ok(())
        } else {
            Err(current)
        }
    }

    fn dispatch(&self, frame: StreamingMessage) {
        let StreamingMessage {
            request_id,
            content,
        } = frame;
        let Some(content) = content else {
            warn!(worker_id = %self.worker_id, "Ignoring frame without content");
            return;
        };
        let kind = MessageKind::of(&content);

        match content {
            Content::StartStream(_) => {
                debug!(worker_id = %self.worker_id, "Worker stream started");
            }
            Content::WorkerInitResponse(response) => {
                if !fulfil(&self.init_waiter, response) {
                    debug!(worker_id = %self.worker_id, "Ignoring unsolicited init response");
                }
            }
            Content::FunctionLoadResponse(response) => self.complete_load(response),
            Content::FunctionLoadResponseCollection(collection) => {
                for response in collection.function_load_responses {
                    self.complete_load(response);
                }
            }
            Content::InvocationResponse(response) => self.complete_invocation(response),
            Content::FunctionEnvironmentReloadResponse(response) => {
                if !fulfil(&self.reload_waiter, response) {
                    debug!(worker_id = %self.worker_id, "Ignoring unsolicited environment reload response");
                }
            }
            Content::FunctionMetadataResponse(response) => {
                if !fulfil(&self.metadata_waiter, response) {
                    debug!(worker_id = %self.worker_id, "Ignoring unsolicited metadata response");
                }
            }
            Content::WorkerStatusResponse(_) => {
                let waiter = self.status_waiters.lock().remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => {
                        debug!(worker_id = %self.worker_id, request_id = %request_id, "Ignoring unsolicited status response");
                    }
                }
            }
            Content::CloseSharedMemoryResourcesResponse(response) => {
                let failed = response.close_map_results.values().filter(|ok| !**ok).count();
                debug!(worker_id = %self.worker_id, closed = response.close_map_results.len(), failed, "Shared memory resources closed");
            }
            Content::RpcLog(log) => self.log(&log),
            Content::WorkerInitRequest(_)
            | Content::WorkerTerminate(_)
            | Content::WorkerStatusRequest(_)
            | Content::FileChangeEventRequest(_)
            | Content::FunctionLoadRequest(_)
            | Content::FunctionLoadRequestCollection(_)
            | Content::InvocationRequest(_)
            | Content::InvocationCancel(_)
            | Content::FunctionEnvironmentReloadRequest(_)
            | Content::CloseSharedMemoryResourcesRequest(_)
            | Content::FunctionsMetadataRequest(_) => {
                warn!(worker_id = %self.worker_id, kind = %kind, "Ignoring host-bound message sent by worker");
            }
        }
    }

    fn complete_load(&self, response: FunctionLoadResponse) {
        let waiter = self.load_waiters.lock().remove(&response.function_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => {
                debug!(worker_id = %self.worker_id, function_id = %response.function_id, "Ignoring unsolicited load response");
            }
        }
    }

    fn complete_invocation(&self, response: InvocationResponse) {
        let invocation_id = response.invocation_id.clone();
        let completion = InvocationResult::from_response(response);
        match self.pending.complete(&invocation_id, completion) {
            Some((function_id, elapsed)) => {
                debug!(
                    worker_id = %self.worker_id,
                    invocation_id = %invocation_id,
                    function_id = %function_id,
                    elapsed_ms = millis(elapsed),
                    "Invocation completed"
                );
            }
            None => {
                debug!(worker_id = %self.worker_id, invocation_id = %invocation_id, "Ignoring response for unknown or expired invocation");
            }
        }
    }

    fn log(&self, log: &RpcLog) {
        use rpc_log::{Level, RpcLogCategory};

        let worker_id = &self.worker_id;
        let exception = log.exception.as_ref().map_or("", |e| e.message.as_str());

        macro_rules! emit {
            ($target:literal) => {
                match log.level() {
                    Level::Trace => trace!(target: $target, worker_id = %worker_id, invocation_id = %log.invocation_id, category = %log.category, "{}", log.message),
                    Level::Debug => debug!(target: $target, worker_id = %worker_id, invocation_id = %log.invocation_id, category = %log.category, "{}", log.message),
                    Level::Information => info!(target: $target, worker_id = %worker_id, invocation_id = %log.invocation_id, category = %log.category, "{}", log.message),
                    Level::Warning => warn!(target: $target, worker_id = %worker_id, invocation_id = %log.invocation_id, category = %log.category, "{}", log.message),
                    Level::Error | Level::Critical => error!(target: $target, worker_id = %worker_id, invocation_id = %log.invocation_id, category = %log.category, exception, "{}", log.message),
                    Level::None => {}
                }
            };
        }

        if log.log_category() == RpcLogCategory::User {
            emit!("nimbus::worker::user");
        } else {
            emit!("nimbus::worker::system");
        }
    }
}

async fn inbound_pump(
    channel: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(inner) = channel.upgrade() else {
            break;
        };
        inner.dispatch(message.message);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::pair::AttachedPair;
    use nimbus_proto::rpc::{InvocationResponse, StatusResult};

    struct Peer {
        attached: AttachedPair,
    }

    impl Peer {
        async fn next(&mut self) -> Content {
            tokio::time::timeout(Duration::from_secs(5), self.attached.outbound.recv())
                .await
                .expect("no frame from host")
                .unwrap()
                .content
                .unwrap()
        }

        fn reply(&self, content: Content) {
            self.reply_frame(StreamingMessage::new(content));
        }

        fn reply_frame(&self, message: StreamingMessage) {
            self.attached
                .inbound
                .send(InboundMessage {
                    worker_id: self.attached.worker_id.clone(),
                    message,
                })
                .unwrap();
        }
    }

    fn setup(timeouts: ChannelConfig) -> (WorkerChannel, Peer, EventBus, Arc<ChannelPairRegistry>) {
        let bus = EventBus::new();
        let registry = Arc::new(ChannelPairRegistry::new());
        let worker_id = WorkerId::from("w-1");
        let pair = registry.register(worker_id.clone()).unwrap();
        let channel = WorkerChannel::new(
            pair,
            "node",
            ChannelOptions {
                timeouts,
                ..Default::default()
            },
            bus.clone(),
            registry.clone(),
        );
        let attached = registry.attach(&worker_id).unwrap();
        (channel, Peer { attached }, bus, registry)
    }

    async fn init(channel: &WorkerChannel, peer: &mut Peer, capabilities: &[&str]) {
        let (result, ()) = tokio::join!(channel.initialize(), async {
            assert!(matches!(peer.next().await, Content::WorkerInitRequest(_)));
            peer.reply(Content::WorkerInitResponse(WorkerInitResponse {
                capabilities: capabilities
                    .iter()
                    .map(|c| ((*c).to_owned(), "true".to_owned()))
                    .collect(),
                result: Some(StatusResult::success()),
                ..Default::default()
            }));
        });
        result.unwrap();
    }

    fn function(id: &str) -> RpcFunctionMetadata {
        RpcFunctionMetadata {
            name: id.into(),
            function_id: id.into(),
            ..Default::default()
        }
    }

    fn load_response(id: &str, status: StatusResult) -> FunctionLoadResponse {
        FunctionLoadResponse {
            function_id: id.into(),
            result: Some(status),
            ..Default::default()
        }
    }

    async fn ready(channel: &WorkerChannel, peer: &mut Peer, capabilities: &[&str]) {
        init(channel, peer, capabilities).await;
        let (report, ()) = tokio::join!(channel.load_functions(vec![function("F")]), async {
            let Content::FunctionLoadRequest(request) = peer.next().await else {
                panic!("expected function load request");
            };
            peer.reply(Content::FunctionLoadResponse(load_response(
                &request.function_id,
                StatusResult::success(),
            )));
        });
        assert_eq!(report.unwrap().loaded, vec!["F"]);
    }

    #[tokio::test]
    async fn duplicate_function_ids_are_loaded_once() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        let functions = vec![function("F"), function("G"), function("F")];
        let (report, ()) = tokio::join!(channel.load_functions(functions), async {
            for _ in 0..2 {
                let Content::FunctionLoadRequest(request) = peer.next().await else {
                    panic!("expected function load request");
                };
                peer.reply(Content::FunctionLoadResponse(load_response(
                    &request.function_id,
                    StatusResult::success(),
                )));
            }
        });

        assert_eq!(report.unwrap().loaded, vec!["F", "G"]);
        assert_eq!(channel.state(), ChannelState::Ready);
        assert!(peer.attached.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn init_records_capabilities() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[HANDLES_WORKER_TERMINATE]).await;

        assert_eq!(channel.state(), ChannelState::Initialized);
        assert!(channel.has_capability(HANDLES_WORKER_TERMINATE));
    }

    #[tokio::test]
    async fn second_init_is_rejected() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        let err = channel.initialize().await.unwrap_err();
        assert!(matches!(err, HostError::InitInProgress(_)));
    }

    #[tokio::test]
    async fn failed_init_publishes_worker_error_and_disposes() {
        let (channel, mut peer, bus, registry) = setup(ChannelConfig::default());
        let mut errors = bus.subscribe_kinds(&[EventKind::WorkerError]);

        let (result, ()) = tokio::join!(channel.initialize(), async {
            peer.next().await;
            peer.reply(Content::WorkerInitResponse(WorkerInitResponse {
                result: Some(StatusResult::failure("bad runtime")),
                ..Default::default()
            }));
        });

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "worker init failed for w-1: bad runtime");
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(!registry.contains(&WorkerId::from("w-1")));
        assert!(errors.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn init_times_out() {
        let timeouts = ChannelConfig {
            init_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (channel, _peer, _bus, _registry) = setup(timeouts);

        let err = channel.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Timeout {
                operation: "worker init",
                ..
            }
        ));
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn load_uses_collection_when_supported() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[SUPPORTS_LOAD_RESPONSE_COLLECTION]).await;

        let (report, ()) = tokio::join!(
            channel.load_functions(vec![function("A"), function("B")]),
            async {
                let Content::FunctionLoadRequestCollection(collection) = peer.next().await else {
                    panic!("expected a load collection");
                };
                assert_eq!(collection.function_load_requests.len(), 2);
                peer.reply(Content::FunctionLoadResponseCollection(
                    nimbus_proto::rpc::FunctionLoadResponseCollection {
                        function_load_responses: vec![
                            load_response("A", StatusResult::success()),
                            load_response("B", StatusResult::failure("syntax error")),
                        ],
                    },
                ));
            }
        );

        let report = report.unwrap();
        assert_eq!(report.loaded, vec!["A"]);
        assert_eq!(report.failed, vec![("B".to_owned(), "syntax error".to_owned())]);
        assert!(channel.is_ready());

        let err = channel.invoke(InvocationInput::new("B")).await.unwrap_err();
        assert_eq!(err.to_string(), "function B failed to load: syntax error");
    }

    #[tokio::test]
    async fn empty_load_goes_straight_to_ready() {
        let (channel, mut peer, bus, _registry) = setup(ChannelConfig::default());
        let mut ready_events = bus.subscribe_kinds(&[EventKind::ChannelReady]);
        init(&channel, &mut peer, &[]).await;

        let report = channel.load_functions(Vec::new()).await.unwrap();
        assert_eq!(report, LoadReport::default());
        assert!(channel.is_ready());
        assert!(ready_events.recv().await.is_some());
    }

    #[tokio::test]
    async fn invoke_requires_ready_and_loaded_function() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        let err = channel.invoke(InvocationInput::new("F")).await.unwrap_err();
        assert!(matches!(
            err,
            HostError::InvalidState {
                state: ChannelState::Created,
                ..
            }
        ));

        ready(&channel, &mut peer, &[]).await;
        let err = channel.invoke(InvocationInput::new("G")).await.unwrap_err();
        assert!(matches!(err, HostError::FunctionNotLoaded(id) if id == "G"));
    }

    #[tokio::test]
    async fn failed_execution_is_reported() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        ready(&channel, &mut peer, &[]).await;

        let (result, ()) = tokio::join!(channel.invoke(InvocationInput::new("F")), async {
            let Content::InvocationRequest(request) = peer.next().await else {
                panic!("expected invocation request");
            };
            peer.reply(Content::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id,
                result: Some(StatusResult::failure("TypeError: x is undefined")),
                ..Default::default()
            }));
        });

        let err = result.unwrap_err();
        assert_eq!(
            err.as_invocation(),
            Some(&InvocationError::Failed("TypeError: x is undefined".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_cancel_completes_after_grace() {
        let timeouts = ChannelConfig {
            cancel_grace_period: Duration::from_millis(200),
            ..Default::default()
        };
        let (channel, mut peer, _bus, _registry) = setup(timeouts);
        ready(&channel, &mut peer, &[HANDLES_INVOCATION_CANCEL]).await;

        let invoking = channel.clone();
        let call = tokio::spawn(async move {
            invoking
                .invoke(InvocationInput::new("F").with_invocation_id("inv-1"))
                .await
        });
        assert!(matches!(peer.next().await, Content::InvocationRequest(_)));

        assert!(channel.cancel("inv-1").unwrap());
        let Content::InvocationCancel(cancel) = peer.next().await else {
            panic!("expected invocation cancel");
        };
        assert_eq!(cancel.grace_period_ms, 200);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.as_invocation(), Some(&InvocationError::Cancelled));
        assert!(!channel.cancel("inv-1").unwrap());
    }

    #[tokio::test]
    async fn dispose_terminates_worker_and_fails_pending() {
        let (channel, mut peer, _bus, registry) = setup(ChannelConfig::default());
        ready(&channel, &mut peer, &[HANDLES_WORKER_TERMINATE]).await;

        let invoking = channel.clone();
        let call = tokio::spawn(async move { invoking.invoke(InvocationInput::new("F")).await });
        assert!(matches!(peer.next().await, Content::InvocationRequest(_)));

        assert!(channel.dispose());
        assert!(!channel.dispose());

        assert!(matches!(peer.next().await, Content::WorkerTerminate(t) if t.grace_period_ms == 5000));
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err.as_invocation(),
            Some(InvocationError::WorkerTerminated { .. })
        ));
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(!registry.contains(&WorkerId::from("w-1")));
        assert!(peer.attached.closed.is_cancelled());
    }

    #[tokio::test]
    async fn mark_restarting_fails_pending_invocations() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        ready(&channel, &mut peer, &[]).await;

        let invoking = channel.clone();
        let call = tokio::spawn(async move { invoking.invoke(InvocationInput::new("F")).await });
        assert!(matches!(peer.next().await, Content::InvocationRequest(_)));

        let restarted = InvocationError::WorkerRestarted {
            worker_id: "w-1".into(),
        };
        channel.mark_restarting(&restarted);

        assert_eq!(call.await.unwrap().unwrap_err().as_invocation(), Some(&restarted));
        assert_eq!(channel.state(), ChannelState::Restarting);
    }

    #[tokio::test]
    async fn environment_reload_drops_empty_values() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        let environment = HashMap::from([
            ("KEEP".to_owned(), "1".to_owned()),
            ("DROP".to_owned(), String::new()),
        ]);
        let (result, ()) = tokio::join!(channel.reload_environment(environment, "/home/site"), async {
            let Content::FunctionEnvironmentReloadRequest(request) = peer.next().await else {
                panic!("expected environment reload");
            };
            assert_eq!(request.function_app_directory, "/home/site");
            assert_eq!(request.environment_variables.len(), 1);
            assert!(request.environment_variables.contains_key("KEEP"));
            peer.reply(Content::FunctionEnvironmentReloadResponse(
                FunctionEnvironmentReloadResponse {
                    capabilities: HashMap::from([(HANDLES_INVOCATION_CANCEL.to_owned(), "true".to_owned())]),
                    result: Some(StatusResult::success()),
                    ..Default::default()
                },
            ));
        });

        result.unwrap();
        assert!(channel.has_capability(HANDLES_INVOCATION_CANCEL));
    }

    #[tokio::test]
    async fn function_metadata_is_requested_once() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        let (first, ()) = tokio::join!(channel.get_function_metadata("/home/site"), async {
            assert!(matches!(peer.next().await, Content::FunctionsMetadataRequest(_)));
            peer.reply(Content::FunctionMetadataResponse(FunctionMetadataResponse {
                function_metadata_results: vec![function("Indexed")],
                result: Some(StatusResult::success()),
                ..Default::default()
            }));
        });
        assert_eq!(first.unwrap().len(), 1);

        let second = channel.get_function_metadata("/home/site").await.unwrap();
        assert_eq!(second[0].function_id, "Indexed");
        assert!(peer.attached.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_round_trip_matches_request_id() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        let (latency, ()) = tokio::join!(channel.worker_status(), async {
            let frame = peer.attached.outbound.recv().await.unwrap();
            assert!(matches!(frame.content, Some(Content::WorkerStatusRequest(_))));
            peer.reply_frame(StreamingMessage::with_request_id(
                frame.request_id,
                Content::WorkerStatusResponse(nimbus_proto::rpc::WorkerStatusResponse {}),
            ));
        });
        assert!(latency.is_ok());
    }

    #[tokio::test]
    async fn worker_logs_do_not_disturb_invocations() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        ready(&channel, &mut peer, &[]).await;

        let (result, ()) = tokio::join!(channel.invoke(InvocationInput::new("F")), async {
            let Content::InvocationRequest(request) = peer.next().await else {
                panic!("expected invocation request");
            };
            peer.reply(Content::RpcLog(RpcLog {
                invocation_id: request.invocation_id.clone(),
                message: "processing".into(),
                level: rpc_log::Level::Information.into(),
                ..Default::default()
            }));
            peer.reply(Content::InvocationResponse(InvocationResponse {
                invocation_id: request.invocation_id,
                result: Some(StatusResult::success()),
                return_value: Some(TypedData::string("done")),
                ..Default::default()
            }));
        });

        assert_eq!(result.unwrap().return_value, Some(TypedData::string("done")));
    }

    #[tokio::test]
    async fn file_change_is_forwarded() {
        let (channel, mut peer, _bus, _registry) = setup(ChannelConfig::default());
        init(&channel, &mut peer, &[]).await;

        channel
            .notify_file_change(FileChangeKind::Changed, "index.js", "/home/site/index.js")
            .unwrap();
        let Content::FileChangeEventRequest(event) = peer.next().await else {
            panic!("expected file change event");
        };
        assert_eq!(event.r#type(), FileChangeKind::Changed);
        assert_eq!(event.name, "index.js");
    }
}
