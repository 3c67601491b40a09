//! Connection state machine.
//!
//! One worker task per chain owns the status, the retry counter and the
//! readiness cycle. Commands from [`SubstrateApi`] handles, events from both
//! backends and completions of its own background steps are all reduced in
//! that task, so it is the only writer of connection state.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chainconn_core::{ApiInfo, ChainRegistry, ConnectionState, ConnectionStatus, MetadataItem};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backend::{Backend, BackendEvent, BackendKind};
use crate::bootstrap::{
    BackendFactory, BackendMessage, BackendPair, BootstrapRequest, SubxtBackendFactory, wire,
};
use crate::calls::{
    ConstFuture, QueryFn, RpcMethod, RuntimeCallFn, TxFn, consts_chain, query_chain, rpc_chain,
    rpc_registry, runtime_call_chain, tx_chain,
};
use crate::error::ChainError;
use crate::metadata::{export_metadata, fill_api_info};
use crate::proxy::{CallRegistry, ProxyChain, path_segments};
use crate::readiness::{ReadinessBarrier, ReadyState, wait_ready, wait_settled};

const COMMAND_CAPACITY: usize = 32;

/// How long a deliberate disconnect waits for backends to report it.
const QUIESCE_TIMEOUT: Duration = Duration::from_millis(500);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum Command {
    Connect {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    /// Replies with the readiness cycle the recovery starts.
    Recover {
        reply: oneshot::Sender<u64>,
    },
    UpdateApiUrl {
        url: String,
        reply: oneshot::Sender<Result<bool, ChainError>>,
    },
}

type FillResult = Result<(ApiInfo, CallRegistry<RpcMethod>), String>;

enum Internal {
    LegacyReady {
        epoch: u64,
        result: Result<(), String>,
    },
    FillFinished {
        epoch: u64,
        cycle: u64,
        result: FillResult,
    },
}

/// State readable by handles without a round trip to the worker.
struct Shared {
    chain_slug: String,
    pair: RwLock<Arc<BackendPair>>,
    rpc: RwLock<Arc<CallRegistry<RpcMethod>>>,
    registry: ChainRegistry,
    proxy_depth: usize,
}

/// Handle to the connection of one chain.
///
/// Cheap to clone. The worker stops and disconnects both backends when the
/// last handle is dropped.
#[derive(Clone)]
pub struct SubstrateApi {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    ready: watch::Receiver<ReadyState>,
    shared: Arc<Shared>,
}

impl SubstrateApi {
    /// Build the backends for `request` and start connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(request: BootstrapRequest) -> Result<Self, ChainError> {
        Self::with_factory(request, Arc::new(SubxtBackendFactory))
    }

    pub fn with_factory(
        request: BootstrapRequest,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, ChainError> {
        let pair = Arc::new(factory.build(&request)?);

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::new(
            request.api_url.clone(),
            pair.use_light_client,
        ));
        let (ready_tx, ready) = watch::channel(ReadyState::Pending { cycle: 0 });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            chain_slug: request.chain_slug.clone(),
            pair: RwLock::new(pair.clone()),
            rpc: RwLock::new(Arc::new(CallRegistry::default())),
            registry: ChainRegistry::new(),
            proxy_depth: request.config.proxy_depth,
        });

        let worker = Worker {
            max_retries: request.config.max_retries,
            forwarders: wire(&pair, 0, events_tx.clone()),
            request,
            factory,
            shared: shared.clone(),
            state: state_tx,
            ready: ready_tx,
            events_tx,
            internal_tx,
            connect_task: None,
            fill_task: None,
            epoch: 0,
            cycle: 0,
            barrier: ReadinessBarrier::new(),
            clients_ready: HashSet::new(),
            fill_attempted: false,
            ready_once: false,
            info: None,
        };
        tokio::spawn(worker.run(command_rx, events_rx, internal_rx));

        Ok(Self {
            commands,
            state,
            ready,
            shared,
        })
    }

    pub fn chain_slug(&self) -> &str {
        &self.shared.chain_slug
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn is_api_connected(&self) -> bool {
        self.state.borrow().status.is_connected()
    }

    /// Whether the current readiness cycle has resolved.
    pub fn is_api_ready(&self) -> bool {
        self.ready.borrow().is_ready()
    }

    pub fn api_url(&self) -> String {
        self.state.borrow().api_url.clone()
    }

    pub fn use_light_client(&self) -> bool {
        self.state.borrow().use_light_client
    }

    pub fn api_error(&self) -> Option<String> {
        self.state.borrow().api_error.clone()
    }

    pub fn retry(&self) -> u32 {
        self.state.borrow().retry
    }

    /// Observe every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Chain identity of the current cycle, once ready.
    pub fn api_info(&self) -> Option<Arc<ApiInfo>> {
        match &*self.ready.borrow() {
            ReadyState::Ready { info, .. } => Some(info.clone()),
            _ => None,
        }
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.shared.registry
    }

    /// Resolves when the readiness cycle current at call time does.
    ///
    /// Rejects with the fill error if that cycle fails. If the connection
    /// drops first the cycle is abandoned and the future never resolves.
    pub fn is_ready(&self) -> impl Future<Output = Result<Arc<ApiInfo>, ChainError>> + Send + 'static {
        wait_ready(self.ready.clone())
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ChainError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|e| ChainError::Connection(format!("Failed to send command: {}", e)))?;
        rx.await
            .map_err(|_| ChainError::Connection("Connection worker stopped".into()))
    }

    /// Connect both backends. Re-asserts `Connected` if already connected;
    /// ignored while unstable.
    pub async fn connect(&self) -> Result<(), ChainError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), ChainError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnect, reset the retry counter, connect again and wait for
    /// readiness. The way out of `Unstable`.
    pub async fn recover_connect(&self) -> Result<Arc<ApiInfo>, ChainError> {
        let cycle = self.request(|reply| Command::Recover { reply }).await?;
        wait_settled(self.ready.clone(), cycle).await
    }

    /// Rebuild transport and backends against `url`. Returns whether anything
    /// changed; the current URL is a no-op.
    pub async fn update_api_url(&self, url: impl Into<String>) -> Result<bool, ChainError> {
        let url = url.into();
        self.request(|reply| Command::UpdateApiUrl { url, reply })
            .await?
    }

    /// Same as [`disconnect`](Self::disconnect).
    // TODO: release the backends here once callers stop reusing destroyed handles.
    pub async fn destroy(&self) -> Result<(), ChainError> {
        self.disconnect().await
    }

    fn pair(&self) -> Arc<BackendPair> {
        read(&self.shared.pair).clone()
    }

    pub fn legacy(&self) -> Arc<dyn Backend> {
        self.pair().legacy.clone()
    }

    pub fn dynamic(&self) -> Arc<dyn Backend> {
        self.pair().dynamic.clone()
    }

    /// Backend that supplies connection events and metadata for this chain.
    pub fn canonical(&self) -> Arc<dyn Backend> {
        self.pair().canonical().clone()
    }

    /// RPC methods, e.g. `api.rpc().get("system").get("chain")`.
    pub fn rpc(&self) -> ProxyChain<Result<RpcMethod, ChainError>> {
        rpc_chain(read(&self.shared.rpc).clone(), self.shared.proxy_depth)
    }

    pub fn tx(&self) -> ProxyChain<TxFn> {
        let pair = self.pair();
        tx_chain(pair.dynamic.clone(), pair.options.signed_extensions)
    }

    pub fn query(&self) -> ProxyChain<QueryFn> {
        query_chain(self.dynamic())
    }

    pub fn consts(&self) -> ProxyChain<ConstFuture> {
        consts_chain(self.dynamic())
    }

    pub fn call(&self) -> ProxyChain<RuntimeCallFn> {
        runtime_call_chain(self.dynamic())
    }

    /// Resolve a dotted RPC path such as `system.chain`.
    pub fn rpc_method(&self, path: &str) -> Result<RpcMethod, ChainError> {
        self.rpc().resolve(&path_segments(path))?
    }

    /// Genesis hash, spec version and metadata of the connected runtime.
    /// Pass it as [`BootstrapRequest::metadata`] to skip the download next time.
    pub async fn export_metadata(&self) -> Result<MetadataItem, ChainError> {
        export_metadata(self.canonical().as_ref()).await
    }
}

struct Worker {
    request: BootstrapRequest,
    factory: Arc<dyn BackendFactory>,
    shared: Arc<Shared>,
    max_retries: u32,

    state: watch::Sender<ConnectionState>,
    ready: watch::Sender<ReadyState>,
    events_tx: mpsc::UnboundedSender<BackendMessage>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    forwarders: Vec<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    fill_task: Option<JoinHandle<()>>,

    /// Generation of the wired backends; bumped on every deliberate disconnect.
    epoch: u64,
    /// Readiness cycle; bumped on every disconnect.
    cycle: u64,
    barrier: ReadinessBarrier,
    /// Backends that reported `Ready` in this epoch.
    clients_ready: HashSet<BackendKind>,
    fill_attempted: bool,
    ready_once: bool,
    info: Option<Arc<ApiInfo>>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<BackendMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::info!(
            "Connecting {} to {}",
            self.shared.chain_slug,
            self.request.api_url
        );
        self.start_connect();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = events.recv() => self.handle_backend(message).await,
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }

        self.detach().await;
        tracing::debug!("Connection worker for {} stopped", self.shared.chain_slug);
    }

    fn pair(&self) -> Arc<BackendPair> {
        read(&self.shared.pair).clone()
    }

    fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        let slug = &self.shared.chain_slug;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            if state.status != before.status {
                tracing::info!("{}: {} -> {}", slug, before.status, state.status);
            }
            *state != before
        });
    }

    fn set_status(&self, next: ConnectionStatus) {
        self.update_state(|state| {
            let from = state.status;
            if !state.transition(next) && from != next {
                tracing::debug!("Refused status change {} -> {}", from, next);
            }
        });
    }

    /// Abandon the current readiness cycle and start a new pending one.
    fn new_cycle(&mut self) {
        self.cycle += 1;
        self.barrier.reset();
        self.ready.send_replace(ReadyState::Pending { cycle: self.cycle });
    }

    fn publish_ready(&self, info: Arc<ApiInfo>) {
        self.ready.send_replace(ReadyState::Ready {
            cycle: self.cycle,
            info,
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                if self.status() == ConnectionStatus::Unstable {
                    tracing::debug!(
                        "{} is unstable, connect ignored until recovery",
                        self.shared.chain_slug
                    );
                } else {
                    self.start_connect();
                }
                let _ = reply.send(());
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Recover { reply } => {
                tracing::info!("Recovering connection to {}", self.shared.chain_slug);
                self.disconnect().await;
                self.update_state(|state| {
                    state.retry = 0;
                    state.api_error = None;
                });
                self.start_connect();
                let _ = reply.send(self.cycle);
            }
            Command::UpdateApiUrl { url, reply } => {
                let result = self.update_api_url(url).await;
                let _ = reply.send(result);
            }
        }
    }

    fn start_connect(&mut self) {
        let pair = self.pair();
        if pair.canonical().is_connected() {
            self.set_status(ConnectionStatus::Connected);
            return;
        }

        self.set_status(ConnectionStatus::Connecting);
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        let epoch = self.epoch;
        let internal = self.internal_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let (legacy, dynamic) = tokio::join!(pair.legacy.connect(), pair.dynamic.connect());
            for (kind, result) in [(BackendKind::Legacy, legacy), (BackendKind::Dynamic, dynamic)] {
                if let Err(e) = result {
                    tracing::warn!("{} backend connect failed: {}", kind, e);
                }
            }

            let result = pair.legacy.wait_ready().await.map_err(|e| e.to_string());
            let _ = internal.send(Internal::LegacyReady { epoch, result });
        }));
    }

    /// Detach listeners, stop background steps and disconnect both backends.
    /// Starts a new epoch; call [`rewire`](Self::rewire) to listen again.
    async fn detach(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        for task in [self.connect_task.take(), self.fill_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        let pair = self.pair();
        let pending: Vec<_> = [BackendKind::Legacy, BackendKind::Dynamic]
            .into_iter()
            .filter(|kind| pair.get(*kind).is_connected())
            .map(|kind| pair.get(kind).events())
            .collect();

        let (legacy, dynamic) = tokio::join!(pair.legacy.disconnect(), pair.dynamic.disconnect());
        for (kind, result) in [(BackendKind::Legacy, legacy), (BackendKind::Dynamic, dynamic)] {
            if let Err(e) = result {
                tracing::warn!("{} backend disconnect failed: {}", kind, e);
            }
        }

        // Let the disconnect notifications pass before the next epoch listens.
        for mut rx in pending {
            let drained = tokio::time::timeout(QUIESCE_TIMEOUT, async move {
                loop {
                    match rx.recv().await {
                        Ok(BackendEvent::Disconnected) | Err(RecvError::Closed) => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!("Backend did not report its disconnect in time");
            }
        }

        self.epoch += 1;
        self.clients_ready.clear();
        self.fill_attempted = false;
    }

    fn rewire(&mut self) {
        self.forwarders = wire(&self.pair(), self.epoch, self.events_tx.clone());
    }

    async fn disconnect(&mut self) {
        self.detach().await;
        self.rewire();
        self.new_cycle();
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn update_api_url(&mut self, url: String) -> Result<bool, ChainError> {
        if url == self.request.api_url {
            tracing::debug!("{} already uses {}", self.shared.chain_slug, url);
            return Ok(false);
        }

        let mut request = self.request.clone();
        request.api_url = url.clone();
        let pair = match self.factory.build(&request) {
            Ok(pair) => Arc::new(pair),
            Err(e) => {
                tracing::warn!("Cannot switch {} to {}: {}", self.shared.chain_slug, url, e);
                self.update_state(|state| state.api_error = Some(e.to_string()));
                return Err(e);
            }
        };

        self.detach().await;
        *write(&self.shared.pair) = pair.clone();
        *write(&self.shared.rpc) = Arc::new(CallRegistry::default());
        self.shared.registry.clear();
        self.request = request;
        self.ready_once = false;
        self.info = None;

        self.rewire();
        self.new_cycle();
        self.update_state(|state| {
            state.transition(ConnectionStatus::Disconnected);
            state.api_url = url;
            state.use_light_client = pair.use_light_client;
            state.retry = 0;
            state.api_error = None;
        });
        tracing::info!(
            "{} switched to {}",
            self.shared.chain_slug,
            self.request.api_url
        );

        self.start_connect();
        Ok(true)
    }

    async fn handle_backend(&mut self, message: BackendMessage) {
        if message.epoch != self.epoch {
            tracing::debug!(
                "Dropping {:?} from detached {} backend",
                message.event,
                message.kind
            );
            return;
        }

        let canonical = self.pair().options.canonical;
        match &message.event {
            BackendEvent::Connected if message.kind == canonical => self.on_connected(),
            BackendEvent::Disconnected if message.kind == canonical => {
                self.on_disconnected().await
            }
            BackendEvent::Connected | BackendEvent::Disconnected => {
                tracing::debug!("{} backend: {:?}", message.kind, message.event);
            }
            BackendEvent::Ready => self.on_backend_ready(message.kind),
            BackendEvent::Error(e) => {
                tracing::warn!(
                    "{} {} backend error: {}",
                    self.shared.chain_slug,
                    message.kind,
                    e
                );
            }
        }
    }

    fn on_connected(&mut self) {
        if self.status() == ConnectionStatus::Unstable {
            tracing::debug!("{} is unstable, ignoring connect", self.shared.chain_slug);
            return;
        }

        self.update_state(|state| {
            state.transition(ConnectionStatus::Connected);
            state.retry = 0;
        });
        tracing::info!(
            "Connected to {} at {}",
            self.shared.chain_slug,
            self.request.api_url
        );

        if self.ready_once {
            let settled = self.ready.borrow().is_ready();
            if let Some(info) = self.info.clone().filter(|_| !settled) {
                self.publish_ready(info);
            }
        } else if !self.fill_attempted {
            // Clients keep their metadata across link drops; replay their readiness.
            let mut kinds: Vec<_> = self.clients_ready.iter().copied().collect();
            kinds.sort_by_key(|kind| kind.label());
            for kind in kinds {
                if self.barrier.signal(kind) {
                    self.start_fill();
                }
            }
        }
    }

    async fn on_disconnected(&mut self) {
        if self.status() == ConnectionStatus::Unstable {
            return;
        }

        tracing::info!(
            "Disconnected from {} at {}",
            self.shared.chain_slug,
            self.request.api_url
        );
        self.new_cycle();
        self.update_state(|state| {
            state.transition(ConnectionStatus::Disconnected);
            state.retry += 1;
        });

        let retry = self.state.borrow().retry;
        if retry > self.max_retries {
            tracing::warn!(
                "{} dropped {} times in a row, giving up until recovery",
                self.shared.chain_slug,
                retry
            );
            self.detach().await;
            self.rewire();
            self.set_status(ConnectionStatus::Unstable);
        }
    }

    fn on_backend_ready(&mut self, kind: BackendKind) {
        tracing::debug!("{} {} backend ready", self.shared.chain_slug, kind);
        self.clients_ready.insert(kind);
        if self.barrier.signal(kind) {
            self.start_fill();
        }
    }

    fn start_fill(&mut self) {
        self.fill_attempted = true;
        if let Some(task) = self.fill_task.take() {
            task.abort();
        }

        let pair = self.pair();
        let epoch = self.epoch;
        let cycle = self.cycle;
        let slug = self.shared.chain_slug.clone();
        let registry = self.shared.registry.clone();
        let internal = self.internal_tx.clone();

        self.fill_task = Some(tokio::spawn(async move {
            let result = async {
                let info = fill_api_info(pair.canonical().as_ref(), &slug, &registry).await?;
                let methods = match pair.dynamic.rpc_methods().await {
                    Ok(methods) => methods,
                    Err(e) => {
                        tracing::warn!("Cannot list RPC methods of {}: {}", slug, e);
                        Vec::new()
                    }
                };
                let rpc = rpc_registry(methods, pair.options.extra_rpc, pair.dynamic.clone());
                Ok::<_, ChainError>((info, rpc))
            }
            .await
            .map_err(|e| e.to_string());

            let _ = internal.send(Internal::FillFinished {
                epoch,
                cycle,
                result,
            });
        }));
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::LegacyReady { epoch, result } => {
                if epoch != self.epoch {
                    return;
                }
                match result {
                    Ok(()) => {
                        if matches!(
                            self.status(),
                            ConnectionStatus::Connecting | ConnectionStatus::Connected
                        ) {
                            self.set_status(ConnectionStatus::Connected);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("{} legacy client failed: {}", self.shared.chain_slug, e)
                    }
                }
            }
            Internal::FillFinished {
                epoch,
                cycle,
                result,
            } => {
                if epoch != self.epoch {
                    return;
                }
                self.fill_task = None;

                match result {
                    Ok((info, rpc)) => {
                        let info = Arc::new(info);
                        tracing::info!(
                            "{} ready ({} {}, {} rpc methods)",
                            self.shared.chain_slug,
                            info.spec_name,
                            info.spec_version,
                            rpc.len()
                        );
                        *write(&self.shared.rpc) = Arc::new(rpc);
                        self.info = Some(info.clone());
                        self.ready_once = true;
                        self.update_state(|state| state.api_error = None);

                        // A drop during the fill abandoned its cycle; serve the
                        // current one if the link is back.
                        if cycle == self.cycle || self.status() == ConnectionStatus::Connected {
                            self.publish_ready(info);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load {} chain info: {}", self.shared.chain_slug, e);
                        self.update_state(|state| state.api_error = Some(e.clone()));
                        if cycle == self.cycle {
                            self.ready.send_replace(ReadyState::Failed { cycle, error: e });
                        }
                    }
                }
            }
        }
    }
}
