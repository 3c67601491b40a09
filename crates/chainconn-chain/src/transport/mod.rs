//! Transport contract and its bridge to subxt's RPC client.
//!
//! A [`Transport`] is the socket-provider side of a connection: it owns the
//! physical link, emits connect/disconnect/error events and carries raw JSON
//! requests and subscriptions. [`TransportRpc`] lets the legacy client run on
//! top of any transport.

mod light;
mod rpc;

pub use light::{fetch_chain_spec, start_light_client};
pub use rpc::{Connector, RpcTransport};

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use serde_json::value::RawValue;
use subxt_rpcs::client::{RawRpcFuture, RawRpcSubscription, RpcClientT, RpcParams};
use tokio::sync::broadcast;

use crate::error::ChainError;

/// Capacity of every event broadcast in the crate.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Link-level events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    LightClient,
}

/// Raw subscription callback: one call per notification or error.
pub type TransportCallback = Arc<dyn Fn(Result<Value, ChainError>) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn is_connected(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<ProviderEvent>;

    async fn connect(&self) -> Result<(), ChainError>;

    async fn disconnect(&self) -> Result<(), ChainError>;

    async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError>;

    /// Start a subscription with `method` and return its id. `unsubscribe`
    /// is the method that cancels it on the node.
    async fn subscribe(
        &self,
        type_name: &str,
        method: &str,
        unsubscribe: &str,
        params: Vec<Value>,
        callback: TransportCallback,
    ) -> Result<String, ChainError>;

    /// Stop a subscription by calling `method` with its id. Returns whether
    /// it was known.
    async fn unsubscribe(&self, type_name: &str, method: &str, id: &str)
    -> Result<bool, ChainError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Split raw JSON-RPC params into positional values.
pub(crate) fn params_from_raw(params: Option<Box<RawValue>>) -> Result<Vec<Value>, serde_json::Error> {
    let Some(raw) = params else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(raw.get())? {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

pub(crate) fn to_rpc_params(params: Vec<Value>) -> Result<RpcParams, ChainError> {
    let mut rpc_params = RpcParams::new();
    for param in params {
        rpc_params.push(param)?;
    }
    Ok(rpc_params)
}

pub(crate) fn to_raw(value: &Value) -> Result<Box<RawValue>, subxt_rpcs::Error> {
    serde_json::value::to_raw_value(value).map_err(subxt_rpcs::Error::Deserialization)
}

pub(crate) fn rpc_error(err: ChainError) -> subxt_rpcs::Error {
    subxt_rpcs::Error::Client(Box::new(err))
}

/// Notification stream fed by a subscription callback.
///
/// Dropping the stream runs the unsubscribe future on the current runtime.
pub(crate) struct CallbackStream {
    rx: mpsc::UnboundedReceiver<Result<Value, ChainError>>,
    on_drop: Option<BoxFuture<'static, ()>>,
}

impl CallbackStream {
    pub(crate) fn channel() -> (
        mpsc::UnboundedSender<Result<Value, ChainError>>,
        mpsc::UnboundedReceiver<Result<Value, ChainError>>,
    ) {
        mpsc::unbounded()
    }

    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Result<Value, ChainError>>,
        on_drop: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(on_drop),
        }
    }
}

impl Stream for CallbackStream {
    type Item = Result<Box<RawValue>, subxt_rpcs::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx.poll_next_unpin(cx).map(|item| {
            item.map(|result| match result {
                Ok(value) => to_raw(&value),
                Err(e) => Err(rpc_error(e)),
            })
        })
    }
}

impl Drop for CallbackStream {
    fn drop(&mut self) {
        if let Some(fut) = self.on_drop.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(fut);
        }
    }
}

/// Exposes a [`Transport`] as a subxt RPC client.
#[derive(Clone)]
pub struct TransportRpc {
    transport: Arc<dyn Transport>,
}

impl TransportRpc {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl RpcClientT for TransportRpc {
    fn request_raw<'a>(
        &'a self,
        method: &'a str,
        params: Option<Box<RawValue>>,
    ) -> RawRpcFuture<'a, Box<RawValue>> {
        Box::pin(async move {
            let params = params_from_raw(params).map_err(subxt_rpcs::Error::Deserialization)?;
            let value = self.transport.send(method, params).await.map_err(rpc_error)?;
            to_raw(&value)
        })
    }

    fn subscribe_raw<'a>(
        &'a self,
        sub: &'a str,
        params: Option<Box<RawValue>>,
        unsub: &'a str,
    ) -> RawRpcFuture<'a, RawRpcSubscription> {
        Box::pin(async move {
            let params = params_from_raw(params).map_err(subxt_rpcs::Error::Deserialization)?;
            let (tx, rx) = CallbackStream::channel();
            let callback: TransportCallback = Arc::new(move |item| {
                let _ = tx.unbounded_send(item);
            });

            let id = self
                .transport
                .subscribe(sub, sub, unsub, params, callback)
                .await
                .map_err(rpc_error)?;

            let transport = self.transport.clone();
            let (type_name, unsub, sub_id) = (sub.to_string(), unsub.to_string(), id.clone());
            let on_drop = async move {
                if let Err(e) = transport.unsubscribe(&type_name, &unsub, &sub_id).await {
                    tracing::debug!("Unsubscribe {} failed: {}", sub_id, e);
                }
            }
            .boxed();

            Ok(RawRpcSubscription {
                stream: Box::pin(CallbackStream::new(rx, on_drop)),
                id: Some(id),
            })
        })
    }
}
