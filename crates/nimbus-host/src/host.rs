//! Host wiring: config, bus, registry, multiplexer, manager and launcher.
//!
//! [`Host`] starts one worker per configured runtime and keeps them alive.
//! A background event loop reacts to worker lifecycle events:
//!
//! | event          | pending invocations fail with | then                    |
//! |----------------|-------------------------------|-------------------------|
//! | WorkerError    | `WorkerTerminated`            | dispose, respawn        |
//! | WorkerRestart  | `WorkerRestarted`             | dispose, respawn        |
//! | StreamClosed   | `Cancelled`                   | dispose, respawn        |
//!
//! A runtime configured with several processes starts the first one with the
//! host and the rest in the background, `process_startup_interval` apart.
//! Invocations are spread across them round-robin.
//!
//! Each runtime may be respawned `max_restart_attempts` times per configured
//! process. After that the runtime is marked unavailable and [`HostEvent::RuntimeUnavailable`] is
//! published once.
//!
//! Only workers still in the host's table are recovered. Removal from the
//! table is the claim, so a crash that publishes both `WorkerError` and
//! `WorkerRestart` is handled once. Workers stopped on purpose, such as the
//! standby workers dropped by specialisation, leave the table before their
//! channels are disposed.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::bus::{EventBus, EventKind, HostEvent, Subscription};
use crate::channel::{ChannelOptions, InvocationInput, InvocationResult, WorkerChannel};
use crate::config::HostConfig;
use crate::error::{HostError, InvocationError, Result};
use crate::grpc;
use crate::manager::{ChannelManager, Specialization, SpecializeOutcome};
use crate::multiplexer::Multiplexer;
use crate::pair::{ChannelPairRegistry, WorkerId};
use crate::process::{
    LaunchRequest, Platform, ProcessLauncher, WorkerArgs, WorkerCommand, WorkerHandle,
    WorkerLauncher, WorkerProcessCount,
};
use crate::store::{DurableStore, HeartbeatWriter};

/// How long a closed stream may precede the process exit that explains it.
///
/// Longer than the supervisor's output drain, so a crash is reported as a
/// crash rather than as a lost stream.
const STREAM_LOSS_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct WorkerEntry {
    runtime: String,
    channel: WorkerChannel,
    /// Set once the launcher returns.
    process: Option<Box<dyn WorkerHandle>>,
}

#[derive(Debug, Clone)]
struct AppEnvironment {
    environment: HashMap<String, String>,
    function_app_directory: String,
}

struct HostInner {
    host_id: String,
    config: HostConfig,
    bus: EventBus,
    registry: Arc<ChannelPairRegistry>,
    multiplexer: Multiplexer,
    manager: ChannelManager,
    launcher: Arc<dyn WorkerLauncher>,
    store: Option<Arc<dyn DurableStore>>,
    workers: DashMap<WorkerId, WorkerEntry>,
    /// Workers whose lifecycle events are deferred, with the first failure
    /// seen while held.
    held: Mutex<HashMap<WorkerId, Option<InvocationError>>>,
    restarts: Mutex<HashMap<String, u32>>,
    unavailable: Mutex<HashSet<String>>,
    specialized: RwLock<Option<AppEnvironment>>,
    port: AtomicU16,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Builder for [`Host`].
#[must_use]
pub struct HostBuilder {
    config: HostConfig,
    bus: Option<EventBus>,
    registry: Option<Arc<ChannelPairRegistry>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl HostBuilder {
    /// Shares an existing bus.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Shares an existing pair registry.
    pub fn registry(mut self, registry: Arc<ChannelPairRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the OS process launcher.
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Store used for the host heartbeat.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Host {
        let bus = self.bus.unwrap_or_default();
        let registry = self.registry.unwrap_or_default();
        let multiplexer = Multiplexer::new(registry.clone(), bus.clone());
        let port = self.config.rpc.port;

        Host {
            inner: Arc::new(HostInner {
                host_id: uuid::Uuid::new_v4().to_string(),
                config: self.config,
                bus,
                registry,
                multiplexer,
                manager: ChannelManager::new(),
                launcher: self.launcher.unwrap_or_else(|| Arc::new(ProcessLauncher)),
                store: self.store,
                workers: DashMap::new(),
                held: Mutex::new(HashMap::new()),
                restarts: Mutex::new(HashMap::new()),
                unavailable: Mutex::new(HashSet::new()),
                specialized: RwLock::new(None),
                port: AtomicU16::new(port),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

/// The language worker host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("host_id", &self.inner.host_id)
            .field("workers", &self.inner.workers.len())
            .finish_non_exhaustive()
    }
}

fn runtime_key(runtime: &str) -> String {
    runtime.to_ascii_lowercase()
}

impl Host {
    /// A host that launches real worker processes.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder {
            config,
            bus: None,
            registry: None,
            launcher: None,
            store: None,
        }
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelPairRegistry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.multiplexer
    }

    #[must_use]
    pub fn manager(&self) -> &ChannelManager {
        &self.inner.manager
    }

    /// Port workers are told to connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::Relaxed)
    }

    /// Restarts consumed by `runtime` so far.
    #[must_use]
    pub fn restart_count(&self, runtime: &str) -> u32 {
        self.inner
            .restarts
            .lock()
            .get(&runtime_key(runtime))
            .copied()
            .unwrap_or(0)
    }

    /// Returns true once `runtime` has exhausted its restart budget.
    #[must_use]
    pub fn is_unavailable(&self, runtime: &str) -> bool {
        self.inner.unavailable.lock().contains(&runtime_key(runtime))
    }

    /// Number of workers launched or launching and not yet released.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Binds the event stream listener on the configured address and
    /// records the port passed to workers.
    pub async fn bind(&self) -> Result<TcpListener> {
        let rpc = &self.inner.config.rpc;
        let listener = TcpListener::bind((rpc.host.as_str(), rpc.port)).await?;
        let addr = listener.local_addr()?;
        self.inner.port.store(addr.port(), Ordering::Relaxed);
        debug!(addr = %addr, "Event stream listener bound");
        Ok(listener)
    }

    /// Binds and serves the event stream until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve_with_listener(listener, cancel).await
    }

    /// Serves the event stream on a listener returned by [`Host::bind`].
    pub async fn serve_with_listener(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        grpc::serve_with_listener(
            self.inner.multiplexer.clone(),
            listener,
            self.inner.config.rpc.max_message_length,
            cancel,
        )
        .await
    }

    /// Address workers are told to connect to.
    #[must_use]
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.inner.config.rpc.host, self.port())
            .parse()
            .ok()
    }

    /// Starts the event loop, the heartbeat and the first worker of each
    /// runtime. Further processes are provisioned in the background.
    ///
    /// In placeholder mode the configured placeholder runtimes are started
    /// with one process each and no functions loaded. A runtime that fails to
    /// start is logged and skipped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::Config("host already started".into()));
        }

        let events = self.inner.bus.subscribe_kinds(&[
            EventKind::WorkerError,
            EventKind::WorkerRestart,
            EventKind::StreamClosed,
        ]);
        let event_loop = tokio::spawn(
            self.clone()
                .run_events(events, self.inner.cancel.child_token()),
        );
        self.inner.tasks.lock().push(("events", event_loop));

        self.start_heartbeat();

        let runtimes = self.startup_runtimes();
        info!(
            host_id = %self.inner.host_id,
            placeholder = self.inner.config.placeholder.enabled,
            runtimes = ?runtimes,
            "Starting worker host"
        );
        let results = join_all(runtimes.iter().map(|runtime| self.start_channel(runtime))).await;
        for (runtime, result) in runtimes.iter().zip(results) {
            match result {
                Ok(_) => self.provision(runtime),
                Err(e) => error!(runtime = %runtime, error = %e, "Failed to start worker"),
            }
        }
        Ok(())
    }

    fn processes(&self, runtime: &str) -> WorkerProcessCount {
        self.inner
            .config
            .worker(runtime)
            .map(|worker| worker.processes.clone())
            .unwrap_or_default()
    }

    /// Starts the remaining processes of `runtime` one interval apart.
    fn provision(&self, runtime: &str) {
        if self.placeholder_pending() {
            return;
        }
        let processes = self.processes(runtime);
        if processes.process_count <= 1 {
            return;
        }

        let host = self.clone();
        let runtime = runtime.to_owned();
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(async move {
            for index in 1..processes.process_count {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(processes.process_startup_interval) => {}
                }
                match host.start_channel(&runtime).await {
                    Ok(channel) => {
                        info!(runtime = %runtime, index, worker_id = %channel.worker_id(), "Worker process provisioned");
                    }
                    Err(e @ (HostError::Config(_) | HostError::UnsupportedPlatform(_))) => {
                        error!(runtime = %runtime, error = %e, "Stopped provisioning worker processes");
                        return;
                    }
                    Err(e) => warn!(runtime = %runtime, index, error = %e, "Failed to provision worker process"),
                }
            }
        });
        self.inner.tasks.lock().push(("provision", handle));
    }

    fn startup_runtimes(&self) -> Vec<String> {
        let config = &self.inner.config;
        let mut runtimes: Vec<String> = if config.placeholder.enabled {
            config.placeholder.runtimes.clone()
        } else {
            config.workers.iter().map(|w| w.language.clone()).collect()
        };
        let mut seen = HashSet::new();
        runtimes.retain(|runtime| seen.insert(runtime_key(runtime)));
        runtimes
    }

    fn start_heartbeat(&self) {
        let config = self.inner.config.heartbeat;
        if !config.enabled {
            return;
        }
        let Some(store) = self.inner.store.clone() else {
            warn!("Heartbeat enabled but no store configured");
            return;
        };
        let writer = HeartbeatWriter::new(store, self.inner.host_id.clone(), RetryPolicy::default());
        let handle = tokio::spawn(writer.run(config.interval, self.inner.cancel.child_token()));
        self.inner.tasks.lock().push(("heartbeat", handle));
    }

    fn placeholder_pending(&self) -> bool {
        self.inner.config.placeholder.enabled && self.inner.specialized.read().is_none()
    }

    /// Launches a worker for `runtime`, initializes it, loads its functions
    /// and hands the channel to the manager.
    ///
    /// Configuration errors fail before anything is launched. A failure
    /// after launch also publishes [`HostEvent::WorkerError`], which the
    /// event loop recovers from.
    pub async fn start_channel(&self, runtime: &str) -> Result<WorkerChannel> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(HostError::RuntimeUnavailable(runtime.to_owned()));
        }

        let mut description = inner
            .config
            .worker(runtime)
            .cloned()
            .ok_or_else(|| HostError::Config(format!("no worker configured for runtime {runtime}")))?;
        description
            .apply_defaults_and_validate(&Platform::current(), None)
            .inspect_err(|e| error!(runtime, error = %e, "Worker description rejected"))?;

        let app = inner.specialized.read().clone();
        let function_app_directory = app
            .as_ref()
            .map_or_else(|| inner.config.function_app_directory.clone(), |a| a.function_app_directory.clone());

        let worker_id = WorkerId::generate();
        let pair = inner.registry.register(worker_id.clone())?;
        let options = ChannelOptions {
            timeouts: inner.config.channel,
            worker_directory: description
                .worker_directory
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default(),
            function_app_directory,
        };
        let channel = WorkerChannel::new(
            pair,
            runtime,
            options,
            inner.bus.clone(),
            inner.registry.clone(),
        );
        inner.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                runtime: runtime.to_owned(),
                channel: channel.clone(),
                process: None,
            },
        );

        let mut command = WorkerCommand::build(
            &description,
            &WorkerArgs {
                host: inner.config.rpc.host.clone(),
                port: self.port(),
                worker_id: worker_id.clone(),
                request_id: uuid::Uuid::new_v4().to_string(),
                max_message_length: inner.config.rpc.max_message_length,
            },
        );
        if let Some(app) = &app {
            command
                .env
                .extend(app.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        info!(runtime, worker_id = %worker_id, command = %command, "Launching worker");

        let request = LaunchRequest {
            worker_id: worker_id.clone(),
            runtime: runtime.to_owned(),
            command,
            bus: inner.bus.clone(),
        };
        let launcher = &inner.launcher;
        let request = &request;
        let launched = inner
            .config
            .process
            .spawn_retry
            .retry(
                "worker spawn",
                move |_| launcher.launch(request.clone()),
                HostError::is_transient,
            )
            .await;

        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                error!(runtime, worker_id = %worker_id, error = %e, "Worker launch failed");
                inner.workers.remove(&worker_id);
                channel.dispose();
                return Err(e);
            }
        };
        let orphan = match inner.workers.get_mut(&worker_id) {
            Some(mut entry) => {
                entry.process = Some(handle);
                None
            }
            None => Some(handle),
        };
        if let Some(handle) = orphan {
            debug!(worker_id = %worker_id, "Worker lost during launch");
            handle.shutdown(inner.config.channel.terminate_grace_period).await;
            return Err(HostError::ChannelClosed(worker_id));
        }

        channel.initialize().await?;
        let functions = if self.placeholder_pending() {
            Vec::new()
        } else {
            inner.config.functions_for(runtime)
        };
        channel.load_functions(functions).await?;

        if !inner.workers.contains_key(&worker_id) {
            return Err(HostError::ChannelClosed(worker_id));
        }
        inner.manager.add_channel(channel.clone());
        Ok(channel)
    }

    /// Invokes a function on a ready worker of `runtime`.
    pub async fn invoke(&self, runtime: &str, input: InvocationInput) -> Result<InvocationResult> {
        if self.is_unavailable(runtime) {
            return Err(HostError::RuntimeUnavailable(runtime.to_owned()));
        }
        let channel = self.inner.manager.get_ready_channel(runtime)?;
        channel.invoke(input).await
    }

    /// Specialises a placeholder host for one application.
    ///
    /// Workers of other runtimes are stopped. If the pre-warmed worker
    /// rejects the new environment it is replaced by a fresh worker started
    /// with that environment. Either way the application's functions are
    /// loaded before the channel is returned.
    pub async fn specialize(
        &self,
        runtime: &str,
        environment: HashMap<String, String>,
        function_app_directory: &str,
    ) -> Result<WorkerChannel> {
        *self.inner.specialized.write() = Some(AppEnvironment {
            environment: environment.clone(),
            function_app_directory: function_app_directory.to_owned(),
        });

        let (parked, held) = self.park_for_specialization(runtime);
        let Specialization { outcome, stopped } = self
            .inner
            .manager
            .specialize(runtime, environment, function_app_directory)
            .await;

        let mut released = parked;
        if let SpecializeOutcome::Respawn {
            failed: Some(worker_id),
            ..
        } = &outcome
        {
            released.extend(self.inner.workers.remove(worker_id).map(|(_, entry)| entry));
        }
        released.extend(
            stopped
                .iter()
                .filter_map(|worker_id| self.inner.workers.remove(worker_id).map(|(_, entry)| entry)),
        );
        self.unhold(&held);
        join_all(released.into_iter().map(|entry| self.stop_entry(entry))).await;

        match outcome {
            SpecializeOutcome::Specialized { worker_id } => {
                let channel = self
                    .inner
                    .manager
                    .find_by_worker(&worker_id)
                    .ok_or(HostError::UnknownWorker(worker_id))?;
                channel
                    .load_functions(self.inner.config.functions_for(runtime))
                    .await?;
                self.provision(runtime);
                Ok(channel)
            }
            SpecializeOutcome::Respawn { reason, .. } => {
                info!(runtime, reason = %reason, "Starting a fresh worker for the application");
                let channel = self.start_channel(runtime).await?;
                self.provision(runtime);
                Ok(channel)
            }
        }
    }

    /// Takes workers of other runtimes out of the table and holds the
    /// lifecycle events of `runtime`'s workers while the manager disposes
    /// or reloads them.
    fn park_for_specialization(&self, runtime: &str) -> (Vec<WorkerEntry>, Vec<WorkerId>) {
        let target = runtime_key(runtime);
        let tracked: Vec<(WorkerId, bool)> = self
            .inner
            .workers
            .iter()
            .map(|entry| (entry.key().clone(), runtime_key(&entry.runtime) == target))
            .collect();

        let mut parked = Vec::new();
        let mut held = Vec::new();
        let mut holds = self.inner.held.lock();
        for (worker_id, same_runtime) in tracked {
            if same_runtime {
                holds.insert(worker_id.clone(), None);
                held.push(worker_id);
            } else if let Some((_, entry)) = self.inner.workers.remove(&worker_id) {
                parked.push(entry);
            }
        }
        (parked, held)
    }

    /// Releases held workers, recovering any that failed while held.
    fn unhold(&self, worker_ids: &[WorkerId]) {
        let deferred: Vec<(WorkerId, InvocationError)> = {
            let mut holds = self.inner.held.lock();
            worker_ids
                .iter()
                .filter_map(|worker_id| {
                    let failure = holds.remove(worker_id).flatten()?;
                    Some((worker_id.clone(), failure))
                })
                .collect()
        };
        for (worker_id, failure) in deferred {
            self.recover(&worker_id, &failure);
        }
    }

    /// Disposes a worker's channel and stops its process. The entry must
    /// already be out of the table.
    async fn stop_entry(&self, entry: WorkerEntry) {
        entry.channel.dispose();
        if let Some(process) = entry.process {
            process
                .shutdown(self.inner.config.channel.terminate_grace_period)
                .await;
        }
    }

    /// Stops everything: background tasks, channels, then processes.
    ///
    /// Processes get the terminate grace period each and the whole stop is
    /// bounded by the process shutdown timeout.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(host_id = %inner.host_id, "Shutting down worker host");
        inner.cancel.cancel();
        inner.manager.shutdown_all();

        let worker_ids: Vec<WorkerId> = inner.workers.iter().map(|e| e.key().clone()).collect();
        let mut processes = Vec::new();
        for worker_id in worker_ids {
            if let Some((_, entry)) = inner.workers.remove(&worker_id) {
                entry.channel.dispose();
                processes.extend(entry.process);
            }
        }

        let grace = inner.config.channel.terminate_grace_period;
        let stops = join_all(processes.iter().map(|process| process.shutdown(grace)));
        if tokio::time::timeout(inner.config.process.shutdown_timeout, stops)
            .await
            .is_err()
        {
            warn!(
                timeout = ?inner.config.process.shutdown_timeout,
                "Worker processes did not stop in time"
            );
        }

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Host task failed");
            }
        }
        info!(host_id = %inner.host_id, "Worker host stopped");
    }

    async fn run_events(self, mut events: Subscription, cancel: CancellationToken) {
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<(WorkerId, u64)>();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some((worker_id, generation)) = lost_rx.recv() => {
                    if self.stream_lost(&worker_id, generation) {
                        self.recover(&worker_id, &InvocationError::Cancelled);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &lost_tx);
                }
            }
        }
        debug!("Host event loop stopped");
    }

    fn handle_event(&self, event: HostEvent, lost: &mpsc::UnboundedSender<(WorkerId, u64)>) {
        match event {
            HostEvent::WorkerError {
                worker_id, error, ..
            } => {
                let failure = InvocationError::WorkerTerminated {
                    worker_id: worker_id.to_string(),
                    reason: error,
                };
                self.recover(&worker_id, &failure);
            }
            HostEvent::WorkerRestart { worker_id, .. } => {
                let failure = InvocationError::WorkerRestarted {
                    worker_id: worker_id.to_string(),
                };
                self.recover(&worker_id, &failure);
            }
            HostEvent::StreamClosed {
                worker_id,
                generation,
                ..
            } => {
                if !self.stream_lost(&worker_id, generation) {
                    return;
                }
                debug!(worker_id = %worker_id, generation, "Event stream lost, waiting for process exit");
                let lost = lost.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(STREAM_LOSS_GRACE).await;
                    let _ = lost.send((worker_id, generation));
                });
            }
            HostEvent::ChannelReady { .. }
            | HostEvent::StreamEstablished { .. }
            | HostEvent::RuntimeUnavailable { .. } => {}
        }
    }

    /// A closed stream means a lost worker only if the channel is still
    /// tracked, matches the generation and was not disposed on purpose.
    fn stream_lost(&self, worker_id: &WorkerId, generation: u64) -> bool {
        self.inner.workers.get(worker_id).is_some_and(|entry| {
            entry.channel.generation() == generation && !entry.channel.is_disposed()
        })
    }

    fn recover(&self, worker_id: &WorkerId, failure: &InvocationError) {
        if let Some(slot) = self.inner.held.lock().get_mut(worker_id) {
            debug!(worker_id = %worker_id, error = %failure, "Lifecycle event deferred during specialisation");
            slot.get_or_insert_with(|| failure.clone());
            return;
        }
        let Some((_, entry)) = self.inner.workers.remove(worker_id) else {
            debug!(worker_id = %worker_id, "Lifecycle event for untracked worker ignored");
            return;
        };
        warn!(
            worker_id = %worker_id,
            runtime = %entry.runtime,
            error = %failure,
            "Worker lost"
        );

        entry.channel.mark_restarting(failure);
        self.inner.manager.remove_channel(&entry.runtime, worker_id);
        entry.channel.dispose();
        if let Some(process) = entry.process {
            let grace = self.inner.config.channel.terminate_grace_period;
            tokio::spawn(async move { process.shutdown(grace).await });
        }

        self.schedule_restart(entry.runtime);
    }

    fn schedule_restart(&self, runtime: String) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let processes = u32::try_from(self.processes(&runtime).process_count.max(1)).unwrap_or(u32::MAX);
        let max = self
            .inner
            .config
            .process
            .max_restart_attempts
            .saturating_mul(processes);
        let attempt = {
            let mut restarts = self.inner.restarts.lock();
            let count = restarts.entry(runtime_key(&runtime)).or_insert(0);
            if *count >= max {
                None
            } else {
                *count += 1;
                Some(*count)
            }
        };
        let Some(attempt) = attempt else {
            self.mark_unavailable(&runtime, max);
            return;
        };

        info!(runtime = %runtime, attempt, max, "Restarting worker");
        let host = self.clone();
        tokio::spawn(async move {
            match host.start_channel(&runtime).await {
                Ok(channel) => {
                    info!(runtime = %runtime, worker_id = %channel.worker_id(), "Worker restarted");
                }
                // Failures before launch publish no event, so nothing else
                // will schedule another attempt.
                Err(
                    e @ (HostError::Config(_)
                    | HostError::UnsupportedPlatform(_)
                    | HostError::Spawn { .. }
                    | HostError::AlreadyRegistered(_)),
                ) => {
                    error!(runtime = %runtime, error = %e, "Worker restart failed permanently");
                    let attempts = host.restart_count(&runtime);
                    host.mark_unavailable(&runtime, attempts);
                }
                Err(e) => warn!(runtime = %runtime, attempt, error = %e, "Worker restart failed"),
            }
        });
    }

    fn mark_unavailable(&self, runtime: &str, attempts: u32) {
        if !self.inner.unavailable.lock().insert(runtime_key(runtime)) {
            return;
        }
        error!(runtime, attempts, "Runtime exhausted its restart budget");
        self.inner.bus.publish(HostEvent::RuntimeUnavailable {
            runtime: runtime.to_owned(),
            attempts,
        });
    }
}
