//! Common test utilities for host integration tests.
//!
//! [`FakeWorker`] speaks the worker side of the event stream in-process,
//! either over the in-memory transport or as a real tonic client.
//! [`FakeLauncher`] hands the host fake workers instead of OS processes.

pub mod fixtures;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_host::process::{handle_exit, WorkerCommand};
use nimbus_host::transport::memory::{self, MemoryWriter};
use nimbus_host::transport::{FrameReader, FrameWriter};
use nimbus_host::{
    EventBus, Host, HostConfig, HostError, LaunchRequest, Multiplexer, WorkerChannel,
    WorkerHandle, WorkerId, WorkerLauncher,
};
use nimbus_proto::capabilities::{HANDLES_INVOCATION_CANCEL, HANDLES_WORKER_TERMINATE};
use nimbus_proto::rpc::{
    FunctionEnvironmentReloadResponse, FunctionLoadResponse, FunctionLoadResponseCollection,
    InvocationRequest, InvocationResponse, StartStream, StatusResult, TypedData,
    WorkerInitResponse, WorkerStatusResponse,
};
use nimbus_proto::{Content, FunctionRpcClient, MessageKind, StreamingMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// How a fake worker answers the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Responds to every invocation with its first input.
    Echo,
    /// Queues invocations for the test to answer.
    Hold,
    /// Rejects the init handshake.
    FailInit,
    /// Rejects environment reloads.
    RejectReload,
}

/// Worker side of one event stream.
pub struct FakeWorker {
    pub worker_id: WorkerId,
    pub runtime: String,
    pub command: WorkerCommand,
    out: mpsc::UnboundedSender<StreamingMessage>,
    memory: Option<MemoryWriter>,
    received: Arc<Mutex<Vec<MessageKind>>>,
    held: tokio::sync::Mutex<mpsc::UnboundedReceiver<InvocationRequest>>,
    bus: EventBus,
    stop: CancellationToken,
    shutdowns: AtomicU32,
}

fn start_stream(worker_id: &WorkerId) -> StreamingMessage {
    StreamingMessage::new(Content::StartStream(StartStream {
        worker_id: worker_id.to_string(),
    }))
}

impl FakeWorker {
    /// Connects over the in-memory transport, served by `multiplexer`.
    pub fn in_memory(multiplexer: &Multiplexer, request: LaunchRequest, behaviour: Behaviour) -> Arc<Self> {
        Self::attach(multiplexer, request, behaviour, |writer| writer)
    }

    /// Like [`FakeWorker::in_memory`], with the host's writer wrapped by `wrap`.
    pub fn attach<W, F>(multiplexer: &Multiplexer, request: LaunchRequest, behaviour: Behaviour, wrap: F) -> Arc<Self>
    where
        W: FrameWriter,
        F: FnOnce(MemoryWriter) -> W,
    {
        let (host_end, worker_end) = memory::duplex();
        let multiplexer = multiplexer.clone();
        let host_writer = wrap(host_end.writer);
        tokio::spawn(async move {
            let _ = multiplexer
                .accept(host_end.reader, host_writer, CancellationToken::new())
                .await;
        });

        let (out, mut out_rx) = mpsc::unbounded_channel::<StreamingMessage>();
        let writer = worker_end.writer.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if writer.send(frame).is_err() {
                    break;
                }
            }
        });

        out.send(start_stream(&request.worker_id)).unwrap();
        Self::start(request, worker_end.reader, out, Some(worker_end.writer), behaviour)
    }

    /// Connects to a host's tonic server as a real gRPC client.
    pub async fn over_grpc(addr: SocketAddr, request: LaunchRequest, behaviour: Behaviour) -> Arc<Self> {
        let (out, rx) = mpsc::unbounded_channel();
        out.send(start_stream(&request.worker_id)).unwrap();

        let mut client = FunctionRpcClient::connect(format!("http://{addr}"))
            .await
            .expect("worker failed to connect");
        let inbound = client
            .event_stream(UnboundedReceiverStream::new(rx))
            .await
            .expect("event stream rejected")
            .into_inner();

        Self::start(request, inbound, out, None, behaviour)
    }

    fn start<R: FrameReader>(
        request: LaunchRequest,
        reader: R,
        out: mpsc::UnboundedSender<StreamingMessage>,
        memory: Option<MemoryWriter>,
        behaviour: Behaviour,
    ) -> Arc<Self> {
        let (held_tx, held_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            worker_id: request.worker_id,
            runtime: request.runtime,
            command: request.command,
            out: out.clone(),
            memory,
            received: Arc::new(Mutex::new(Vec::new())),
            held: tokio::sync::Mutex::new(held_rx),
            bus: request.bus,
            stop: CancellationToken::new(),
            shutdowns: AtomicU32::new(0),
        });

        let terminated = {
            let worker = worker.clone();
            move || worker.exit(0, &[])
        };
        tokio::spawn(run_worker(
            reader,
            out,
            behaviour,
            worker.received.clone(),
            held_tx,
            worker.stop.clone(),
            terminated,
        ));
        worker
    }

    /// Answers a held invocation with a string return value.
    pub fn respond(&self, invocation_id: &str, value: &str) {
        let _ = self.out.send(StreamingMessage::new(Content::InvocationResponse(
            InvocationResponse {
                invocation_id: invocation_id.to_owned(),
                return_value: Some(TypedData::string(value)),
                result: Some(StatusResult::success()),
                ..Default::default()
            },
        )));
    }

    /// Next invocation queued under [`Behaviour::Hold`].
    pub async fn next_invocation(&self) -> InvocationRequest {
        let mut held = self.held.lock().await;
        tokio::time::timeout(Duration::from_secs(5), held.recv())
            .await
            .expect("no invocation arrived")
            .expect("worker stopped")
    }

    /// Simulates the process dying with `code`.
    pub fn exit(&self, code: i32, stderr: &[&str]) {
        self.stop.cancel();
        handle_exit(
            &self.bus,
            &self.worker_id,
            &self.runtime,
            self.command.executable_name(),
            code,
            false,
            stderr.iter().map(|line| (*line).to_owned()).collect(),
        );
    }

    /// Breaks the in-memory connection without the process exiting.
    pub fn disconnect(&self) {
        if let Some(writer) = &self.memory {
            let _ = writer.send_error("connection reset by peer");
        }
    }

    /// Kinds of every frame received from the host, in order.
    pub fn received(&self) -> Vec<MessageKind> {
        self.received.lock().clone()
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

async fn run_worker<R: FrameReader>(
    mut reader: R,
    out: mpsc::UnboundedSender<StreamingMessage>,
    behaviour: Behaviour,
    received: Arc<Mutex<Vec<MessageKind>>>,
    held: mpsc::UnboundedSender<InvocationRequest>,
    stop: CancellationToken,
    terminated: impl FnOnce(),
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            frame = reader.read_frame() => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(_) => return,
            },
        };
        let Some(content) = frame.content else {
            continue;
        };
        received.lock().push(MessageKind::of(&content));

        let reply = match content {
            Content::WorkerInitRequest(_) => {
                let result = if behaviour == Behaviour::FailInit {
                    StatusResult::failure("worker refused to start")
                } else {
                    StatusResult::success()
                };
                Some(Content::WorkerInitResponse(WorkerInitResponse {
                    worker_version: "1.0.0".into(),
                    capabilities: [
                        (HANDLES_INVOCATION_CANCEL.to_owned(), "true".to_owned()),
                        (HANDLES_WORKER_TERMINATE.to_owned(), "true".to_owned()),
                    ]
                    .into(),
                    result: Some(result),
                    ..Default::default()
                }))
            }
            Content::FunctionLoadRequest(load) => Some(Content::FunctionLoadResponse(FunctionLoadResponse {
                function_id: load.function_id,
                result: Some(StatusResult::success()),
                ..Default::default()
            })),
            Content::FunctionLoadRequestCollection(collection) => Some(Content::FunctionLoadResponseCollection(
                FunctionLoadResponseCollection {
                    function_load_responses: collection
                        .function_load_requests
                        .into_iter()
                        .map(|load| FunctionLoadResponse {
                            function_id: load.function_id,
                            result: Some(StatusResult::success()),
                            ..Default::default()
                        })
                        .collect(),
                },
            )),
            Content::InvocationRequest(request) if behaviour == Behaviour::Hold => {
                let _ = held.send(request);
                None
            }
            Content::InvocationRequest(request) => {
                let return_value = request
                    .input_data
                    .first()
                    .and_then(|binding| binding.data.clone());
                Some(Content::InvocationResponse(InvocationResponse {
                    invocation_id: request.invocation_id,
                    return_value,
                    result: Some(StatusResult::success()),
                    ..Default::default()
                }))
            }
            Content::FunctionEnvironmentReloadRequest(_) => {
                let result = if behaviour == Behaviour::RejectReload {
                    StatusResult::failure("cannot specialise")
                } else {
                    StatusResult::success()
                };
                Some(Content::FunctionEnvironmentReloadResponse(
                    FunctionEnvironmentReloadResponse {
                        result: Some(result),
                        ..Default::default()
                    },
                ))
            }
            Content::WorkerStatusRequest(_) => Some(Content::WorkerStatusResponse(WorkerStatusResponse {})),
            // A well-behaved worker exits cleanly once told to terminate.
            Content::WorkerTerminate(_) => {
                if !stop.is_cancelled() {
                    terminated();
                }
                return;
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let frame = StreamingMessage {
                request_id: frame.request_id,
                content: Some(reply),
            };
            if out.send(frame).is_err() {
                return;
            }
        }
    }
}

/// Handle the host holds for a fake worker.
#[derive(Debug)]
struct FakeHandle {
    worker_id: WorkerId,
    worker: Arc<FakeWorker>,
}

impl std::fmt::Debug for FakeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeWorker")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    /// Gives the worker `grace` to exit on its own, like a real process
    /// answering `WorkerTerminate`, then stops it.
    async fn shutdown(&self, grace: Duration) {
        self.worker.shutdowns.fetch_add(1, Ordering::SeqCst);
        let _ = tokio::time::timeout(grace, self.worker.stop.cancelled()).await;
        self.worker.stop.cancel();
    }
}

/// How fake workers reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Memory,
    Grpc,
}

/// Launches fake workers and keeps them for inspection.
pub struct FakeLauncher {
    multiplexer: Multiplexer,
    transport: Transport,
    behaviour: Mutex<Behaviour>,
    script: Mutex<VecDeque<Behaviour>>,
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    launched: Notify,
    failures: AtomicU32,
}

impl FakeLauncher {
    pub fn new(multiplexer: Multiplexer, transport: Transport, behaviour: Behaviour) -> Self {
        Self {
            multiplexer,
            transport,
            behaviour: Mutex::new(behaviour),
            script: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            launched: Notify::new(),
            failures: AtomicU32::new(0),
        }
    }

    /// Behaviour of workers launched from now on.
    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock() = behaviour;
    }

    /// Behaviours for the next launches, in order, before falling back to
    /// the default.
    pub fn script(&self, behaviours: impl IntoIterator<Item = Behaviour>) {
        self.script.lock().extend(behaviours);
    }

    /// Fails the next `count` launches with a spawn error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Every worker launched so far.
    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        self.workers.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// The `index`th launched worker, waiting for it if necessary.
    pub async fn worker(&self, index: usize) -> Arc<FakeWorker> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.launched.notified();
                if let Some(worker) = self.workers.lock().get(index).cloned() {
                    return worker;
                }
                notified.await;
            }
        })
        .await
        .expect("worker was never launched")
    }
}

fn port_arg(command: &WorkerCommand) -> u16 {
    command
        .args
        .iter()
        .position(|arg| arg == "--port")
        .and_then(|i| command.args.get(i + 1))
        .and_then(|port| port.parse().ok())
        .expect("worker command has no --port")
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, request: LaunchRequest) -> nimbus_host::Result<Box<dyn WorkerHandle>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HostError::Spawn {
                executable: request.command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let scripted = self.script.lock().pop_front();
        let behaviour = scripted.unwrap_or_else(|| *self.behaviour.lock());
        let worker_id = request.worker_id.clone();
        let worker = match self.transport {
            Transport::Memory => FakeWorker::in_memory(&self.multiplexer, request, behaviour),
            Transport::Grpc => {
                let addr = SocketAddr::from(([127, 0, 0, 1], port_arg(&request.command)));
                FakeWorker::over_grpc(addr, request, behaviour).await
            }
        };
        self.workers.lock().push(worker.clone());
        self.launched.notify_waiters();
        Ok(Box::new(FakeHandle { worker_id, worker }))
    }
}

/// Complete test host with fake workers.
pub struct TestHost {
    pub host: Host,
    pub bus: EventBus,
    pub launcher: Arc<FakeLauncher>,
}

impl TestHost {
    /// Creates a host whose workers connect in memory.
    pub fn new(config: HostConfig, behaviour: Behaviour) -> Self {
        Self::with_transport(config, behaviour, Transport::Memory)
    }

    pub fn with_transport(config: HostConfig, behaviour: Behaviour, transport: Transport) -> Self {
        let bus = EventBus::new();
        let registry = Arc::new(nimbus_host::ChannelPairRegistry::new());
        let multiplexer = Multiplexer::new(registry.clone(), bus.clone());
        let launcher = Arc::new(FakeLauncher::new(multiplexer, transport, behaviour));
        let host = Host::builder(config)
            .bus(bus.clone())
            .registry(registry)
            .launcher(launcher.clone())
            .build();
        Self {
            host,
            bus,
            launcher,
        }
    }

    /// Creates and starts a host with in-memory workers.
    pub async fn started(config: HostConfig, behaviour: Behaviour) -> Self {
        let test = Self::new(config, behaviour);
        test.host.start().await.expect("host failed to start");
        test
    }

    /// Waits until `runtime` has a ready channel.
    pub async fn ready_channel(&self, runtime: &str) -> WorkerChannel {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(channel) = self.host.manager().get_ready_channel(runtime) {
                    return channel;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no ready channel")
    }
}
