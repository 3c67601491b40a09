//! Auto-reconnecting transport over subxt's RPC client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use subxt::lightclient::LightClient;
use subxt_rpcs::client::{RpcClient, RpcSubscription};
use subxt_rpcs::rpc_params;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::{
    EVENT_CAPACITY, ProviderEvent, Transport, TransportCallback, TransportKind, lock,
    start_light_client, to_rpc_params,
};
use crate::error::ChainError;

/// How the transport reaches the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connector {
    Ws { url: String },
    /// Embedded smoldot node for a well-known relay chain.
    Light { chain: String },
}

impl Connector {
    async fn open(&self) -> Result<Session, ChainError> {
        match self {
            Connector::Ws { url } => {
                let rpc = if url.starts_with("ws://") {
                    RpcClient::from_insecure_url(url).await
                } else {
                    RpcClient::from_url(url).await
                }
                .map_err(|e| ChainError::Connection(format!("{}: {}", url, e)))?;
                Ok(Session { rpc, _light: None })
            }
            Connector::Light { chain } => {
                let (light, rpc) = start_light_client(chain).await?;
                Ok(Session {
                    rpc,
                    _light: Some(light),
                })
            }
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::Ws { url } => write!(f, "{}", url),
            Connector::Light { chain } => write!(f, "light client ({})", chain),
        }
    }
}

struct Session {
    rpc: RpcClient,
    // Keeps the smoldot node alive for as long as the session.
    _light: Option<LightClient>,
}

struct Inner {
    connector: Connector,
    auto_connect: Duration,
    connect_timeout: Duration,
    session: Mutex<Option<Arc<Session>>>,
    connected: AtomicBool,
    events: broadcast::Sender<ProviderEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn rpc(&self) -> Result<RpcClient, ChainError> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.rpc.clone())
            .ok_or(ChainError::NotConnected)
    }

    fn drop_session(&self) {
        *lock(&self.session) = None;
        for (_, pump) in lock(&self.subscriptions).drain() {
            pump.abort();
        }
    }

    fn report_failure(
        &self,
        first: &mut Option<oneshot::Sender<Result<(), ChainError>>>,
        err: ChainError,
    ) {
        tracing::warn!("Failed to connect to {}: {}", self.connector, err);
        let _ = self.events.send(ProviderEvent::Error(err.to_string()));
        // Every failed dial counts as a drop for the retry limit.
        let _ = self.events.send(ProviderEvent::Disconnected);
        if let Some(tx) = first.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// Socket or light client transport with auto-reconnect.
///
/// After `connect()` a supervisor task keeps the link up: each attempt is
/// bounded by the connect timeout, and a dropped or failed link is retried
/// every auto-connect interval until `disconnect()`. A failed attempt emits
/// `Error` followed by `Disconnected`.
#[derive(Clone)]
pub struct RpcTransport {
    inner: Arc<Inner>,
}

impl RpcTransport {
    pub fn new(connector: Connector, auto_connect: Duration, connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                auto_connect,
                connect_timeout,
                session: Mutex::new(None),
                connected: AtomicBool::new(false),
                events,
                supervisor: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn ws(url: impl Into<String>, auto_connect: Duration, connect_timeout: Duration) -> Self {
        Self::new(Connector::Ws { url: url.into() }, auto_connect, connect_timeout)
    }

    pub fn light(chain: impl Into<String>, auto_connect: Duration, connect_timeout: Duration) -> Self {
        Self::new(
            Connector::Light {
                chain: chain.into(),
            },
            auto_connect,
            connect_timeout,
        )
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }
}

async fn supervise(inner: Arc<Inner>, first: oneshot::Sender<Result<(), ChainError>>) {
    let mut first = Some(first);

    loop {
        match tokio::time::timeout(inner.connect_timeout, inner.connector.open()).await {
            Ok(Ok(session)) => {
                // Liveness: the head subscription ends when the link drops.
                let heads = session
                    .rpc
                    .subscribe::<Value>(
                        "chain_subscribeNewHeads",
                        rpc_params![],
                        "chain_unsubscribeNewHeads",
                    )
                    .await;

                match heads {
                    Ok(heads) => {
                        *lock(&inner.session) = Some(Arc::new(session));
                        inner.connected.store(true, Ordering::SeqCst);
                        tracing::info!("Connected to {}", inner.connector);
                        let _ = inner.events.send(ProviderEvent::Connected);
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Ok(()));
                        }

                        watch_heads(&inner, heads).await;

                        inner.connected.store(false, Ordering::SeqCst);
                        inner.drop_session();
                        tracing::info!("Disconnected from {}", inner.connector);
                        let _ = inner.events.send(ProviderEvent::Disconnected);
                    }
                    Err(e) => inner.report_failure(
                        &mut first,
                        ChainError::Connection(format!("Head subscription failed: {}", e)),
                    ),
                }
            }
            Ok(Err(e)) => inner.report_failure(&mut first, e),
            Err(_) => inner.report_failure(
                &mut first,
                ChainError::Connection(format!("Timed out after {:?}", inner.connect_timeout)),
            ),
        }

        if inner.auto_connect.is_zero() {
            break;
        }
        tracing::debug!("Reconnecting to {} in {:?}", inner.connector, inner.auto_connect);
        tokio::time::sleep(inner.auto_connect).await;
    }
}

async fn watch_heads(inner: &Inner, mut heads: RpcSubscription<Value>) {
    while let Some(head) = heads.next().await {
        if let Err(e) = head {
            tracing::warn!("Head subscription error on {}: {}", inner.connector, e);
            let _ = inner.events.send(ProviderEvent::Error(e.to_string()));
            break;
        }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn kind(&self) -> TransportKind {
        match self.inner.connector {
            Connector::Ws { .. } => TransportKind::Socket,
            Connector::Light { .. } => TransportKind::LightClient,
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    async fn connect(&self) -> Result<(), ChainError> {
        let rx = {
            let mut supervisor = lock(&self.inner.supervisor);
            if let Some(handle) = supervisor.as_ref()
                && !handle.is_finished()
            {
                // Already connected or retrying.
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            *supervisor = Some(tokio::spawn(supervise(self.inner.clone(), tx)));
            rx
        };

        rx.await
            .map_err(|_| ChainError::Connection("Connect attempt abandoned".into()))?
    }

    async fn disconnect(&self) -> Result<(), ChainError> {
        if let Some(handle) = lock(&self.inner.supervisor).take() {
            handle.abort();
        }
        self.inner.drop_session();

        if self.inner.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Disconnected from {}", self.inner.connector);
            let _ = self.inner.events.send(ProviderEvent::Disconnected);
        }
        Ok(())
    }

    async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        let rpc = self.inner.rpc()?;
        let value = rpc.request::<Value>(method, to_rpc_params(params)?).await?;
        Ok(value)
    }

    async fn subscribe(
        &self,
        type_name: &str,
        method: &str,
        unsubscribe: &str,
        params: Vec<Value>,
        callback: TransportCallback,
    ) -> Result<String, ChainError> {
        let rpc = self.inner.rpc()?;
        let mut sub = rpc
            .subscribe::<Value>(method, to_rpc_params(params)?, unsubscribe)
            .await?;

        let id = sub.subscription_id().map(str::to_owned).unwrap_or_else(|| {
            format!(
                "{}-{}",
                type_name,
                self.inner.next_id.fetch_add(1, Ordering::Relaxed)
            )
        });

        let pump = tokio::spawn(async move {
            while let Some(item) = sub.next().await {
                callback(item.map_err(ChainError::from));
            }
        });
        lock(&self.inner.subscriptions).insert(id.clone(), pump);

        tracing::debug!("Subscribed {} ({}) as {}", type_name, method, id);
        Ok(id)
    }

    async fn unsubscribe(
        &self,
        type_name: &str,
        method: &str,
        id: &str,
    ) -> Result<bool, ChainError> {
        let Some(pump) = lock(&self.inner.subscriptions).remove(id) else {
            tracing::debug!("No live subscription {} ({})", id, type_name);
            return Ok(false);
        };

        tracing::debug!("Unsubscribing {} ({}) {}", type_name, method, id);
        let result = match self.inner.rpc() {
            Ok(rpc) => rpc
                .request::<Value>(method, rpc_params![id])
                .await
                .map_err(ChainError::from),
            Err(e) => Err(e),
        };
        pump.abort();
        result.map(|_| true)
    }
}
