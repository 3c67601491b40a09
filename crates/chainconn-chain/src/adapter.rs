//! Adapter from the transport contract to the JSON-RPC provider contract.
//!
//! The lightweight client expects a provider with a two-valued status,
//! subscriptions described by explicit subscribe/unsubscribe method names and
//! callbacks that receive the subscription handle. [`ProviderAdapter`] layers
//! that contract over any [`Transport`] without changing its semantics.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use serde_json::value::RawValue;
use subxt_rpcs::client::{RawRpcFuture, RawRpcSubscription, RpcClientT};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::ChainError;
use crate::transport::{
    CallbackStream, EVENT_CAPACITY, ProviderEvent, Transport, TransportCallback, lock,
    params_from_raw, rpc_error, to_raw,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Connected,
    Disconnected,
}

/// Subscription request in the provider contract.
#[derive(Debug, Clone)]
pub struct SubscriptionInput {
    /// Notification name.
    pub subname: String,
    pub subscribe: String,
    pub unsubscribe: String,
    pub params: Vec<Value>,
}

type UnsubscribeFn = dyn Fn() -> BoxFuture<'static, Result<(), ChainError>> + Send + Sync;

/// Handle to a live subscription.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    unsubscribe: Arc<UnsubscribeFn>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, unsubscribe: Arc<UnsubscribeFn>) -> Self {
        Self {
            id: id.into(),
            unsubscribe,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn unsubscribe(&self) -> Result<(), ChainError> {
        (self.unsubscribe)().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub type SubscriptionCallback =
    Arc<dyn Fn(Result<Value, ChainError>, Option<&Subscription>) + Send + Sync>;

#[async_trait]
pub trait JsonRpcProvider: Send + Sync {
    fn status(&self) -> ProviderStatus;

    fn events(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Connect. Never fails: outcomes are reported through events.
    async fn connect(&self);

    async fn disconnect(&self) -> Result<(), ChainError>;

    async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError>;

    async fn subscribe(
        &self,
        input: SubscriptionInput,
        callback: SubscriptionCallback,
    ) -> Result<Subscription, ChainError>;
}

struct AdapterInner {
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ProviderEvent>,
    // First receiver, created before the initial event so it is not missed.
    primed: Mutex<Option<broadcast::Receiver<ProviderEvent>>>,
    forward: JoinHandle<()>,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// [`JsonRpcProvider`] over a [`Transport`]. Must be created inside a runtime.
#[derive(Clone)]
pub struct ProviderAdapter {
    inner: Arc<AdapterInner>,
}

impl ProviderAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (events, primed) = broadcast::channel(EVENT_CAPACITY);
        let mut upstream = transport.events();

        if transport.is_connected() {
            let _ = events.send(ProviderEvent::Connected);
        }

        let tx = events.clone();
        let forward = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Provider adapter skipped {} transport events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            inner: Arc::new(AdapterInner {
                transport,
                events,
                primed: Mutex::new(Some(primed)),
                forward,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

#[async_trait]
impl JsonRpcProvider for ProviderAdapter {
    fn status(&self) -> ProviderStatus {
        if self.inner.transport.is_connected() {
            ProviderStatus::Connected
        } else {
            ProviderStatus::Disconnected
        }
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        lock(&self.inner.primed)
            .take()
            .unwrap_or_else(|| self.inner.events.subscribe())
    }

    async fn connect(&self) {
        if let Err(e) = self.inner.transport.connect().await {
            tracing::warn!("Provider connect failed: {}", e);
        }
    }

    async fn disconnect(&self) -> Result<(), ChainError> {
        self.inner.transport.disconnect().await
    }

    async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
        self.inner.transport.send(method, params).await
    }

    async fn subscribe(
        &self,
        input: SubscriptionInput,
        callback: SubscriptionCallback,
    ) -> Result<Subscription, ChainError> {
        let slot: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
        let callback_slot = slot.clone();
        let raw: TransportCallback = Arc::new(move |result: Result<Value, ChainError>| {
            callback(result, callback_slot.get())
        });

        let id = self
            .inner
            .transport
            .subscribe(
                &input.subname,
                &input.subscribe,
                &input.unsubscribe,
                input.params,
                raw,
            )
            .await?;

        let transport = self.inner.transport.clone();
        let subname = input.subname;
        let unsubscribe = input.unsubscribe;
        let sub_id = id.clone();
        let subscription = Subscription::new(
            id,
            Arc::new(move || {
                let transport = transport.clone();
                let subname = subname.clone();
                let unsubscribe = unsubscribe.clone();
                let sub_id = sub_id.clone();
                async move {
                    transport
                        .unsubscribe(&subname, &unsubscribe, &sub_id)
                        .await
                        .map(|_| ())
                }
                .boxed()
            }),
        );

        let _ = slot.set(subscription.clone());
        Ok(subscription)
    }
}

impl RpcClientT for ProviderAdapter {
    fn request_raw<'a>(
        &'a self,
        method: &'a str,
        params: Option<Box<RawValue>>,
    ) -> RawRpcFuture<'a, Box<RawValue>> {
        Box::pin(async move {
            let params = params_from_raw(params).map_err(subxt_rpcs::Error::Deserialization)?;
            let value = self.send(method, params).await.map_err(rpc_error)?;
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
            let callback: SubscriptionCallback =
                Arc::new(move |item: Result<Value, ChainError>, _: Option<&Subscription>| {
                    let _ = tx.unbounded_send(item);
                });

            let input = SubscriptionInput {
                subname: sub.to_string(),
                subscribe: sub.to_string(),
                unsubscribe: unsub.to_string(),
                params,
            };
            let subscription = self.subscribe(input, callback).await.map_err(rpc_error)?;
            let id = subscription.id().to_string();

            let on_drop = async move {
                if let Err(e) = subscription.unsubscribe().await {
                    tracing::debug!("Unsubscribe {} failed: {}", subscription.id(), e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct MockTransport {
        connected: AtomicBool,
        fail_connect: bool,
        events: broadcast::Sender<ProviderEvent>,
        callback: Mutex<Option<TransportCallback>>,
        cancel_with: Mutex<Option<String>>,
        unsubscribed: Mutex<Vec<(String, String, String)>>,
    }

    impl MockTransport {
        fn new(connected: bool, fail_connect: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                fail_connect,
                events,
                callback: Mutex::new(None),
                cancel_with: Mutex::new(None),
                unsubscribed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn events(&self) -> broadcast::Receiver<ProviderEvent> {
            self.events.subscribe()
        }

        async fn connect(&self) -> Result<(), ChainError> {
            if self.fail_connect {
                return Err(ChainError::Connection("refused".into()));
            }
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events.send(ProviderEvent::Connected);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ChainError> {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(ProviderEvent::Disconnected);
            Ok(())
        }

        async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ChainError> {
            Ok(serde_json::json!({ "method": method, "params": params }))
        }

        async fn subscribe(
            &self,
            _type_name: &str,
            _method: &str,
            unsubscribe: &str,
            _params: Vec<Value>,
            callback: TransportCallback,
        ) -> Result<String, ChainError> {
            *self.callback.lock().unwrap() = Some(callback);
            *self.cancel_with.lock().unwrap() = Some(unsubscribe.to_string());
            Ok("sub-1".into())
        }

        async fn unsubscribe(
            &self,
            type_name: &str,
            method: &str,
            id: &str,
        ) -> Result<bool, ChainError> {
            self.unsubscribed.lock().unwrap().push((
                type_name.to_string(),
                method.to_string(),
                id.to_string(),
            ));
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_connect_swallows_transport_error() {
        let transport = MockTransport::new(false, true);
        let adapter = ProviderAdapter::new(transport);
        adapter.connect().await;
        assert_eq!(adapter.status(), ProviderStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_status_projection_and_forwarding() {
        let transport = MockTransport::new(false, false);
        let adapter = ProviderAdapter::new(transport.clone());
        let mut events = adapter.events();

        adapter.connect().await;
        assert_eq!(adapter.status(), ProviderStatus::Connected);
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ProviderEvent::Connected);

        let _ = transport.events.send(ProviderEvent::Error("boom".into()));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ProviderEvent::Error("boom".into()));
    }

    #[tokio::test]
    async fn test_initial_connected_when_transport_is_up() {
        let transport = MockTransport::new(true, false);
        let adapter = ProviderAdapter::new(transport);
        let mut events = adapter.events();
        assert_eq!(events.try_recv().unwrap(), ProviderEvent::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_wraps_callback() {
        let transport = MockTransport::new(true, false);
        let adapter = ProviderAdapter::new(transport.clone());

        let seen: Arc<Mutex<Vec<(Value, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: SubscriptionCallback = Arc::new(
            move |result: Result<Value, ChainError>, sub: Option<&Subscription>| {
                if let Ok(value) = result {
                    seen_cb
                        .lock()
                        .unwrap()
                        .push((value, sub.map(|s| s.id().to_string())));
                }
            },
        );

        let input = SubscriptionInput {
            subname: "chain_newHead".into(),
            subscribe: "chain_subscribeNewHeads".into(),
            unsubscribe: "chain_unsubscribeNewHeads".into(),
            params: vec![],
        };
        let subscription = adapter.subscribe(input, callback).await.unwrap();
        assert_eq!(subscription.id(), "sub-1");

        let raw = transport.callback.lock().unwrap().clone().unwrap();
        raw(Ok(serde_json::json!({"number": "0x1"})));
        assert_eq!(
            seen.lock().unwrap()[0],
            (serde_json::json!({"number": "0x1"}), Some("sub-1".to_string()))
        );

        subscription.unsubscribe().await.unwrap();
        assert_eq!(
            transport.unsubscribed.lock().unwrap()[0],
            (
                "chain_newHead".to_string(),
                "chain_unsubscribeNewHeads".to_string(),
                "sub-1".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_subscribe_hands_unwatch_method_to_transport() {
        let transport = MockTransport::new(true, false);
        let adapter = ProviderAdapter::new(transport.clone());
        let callback: SubscriptionCallback =
            Arc::new(|_: Result<Value, ChainError>, _: Option<&Subscription>| {});

        let input = SubscriptionInput {
            subname: "transactionWatch_v1_watchEvent".into(),
            subscribe: "transactionWatch_v1_submitAndWatch".into(),
            unsubscribe: "transactionWatch_v1_unwatch".into(),
            params: vec![serde_json::json!("0x00")],
        };
        let subscription = adapter.subscribe(input, callback).await.unwrap();
        assert_eq!(
            transport.cancel_with.lock().unwrap().as_deref(),
            Some("transactionWatch_v1_unwatch")
        );

        subscription.unsubscribe().await.unwrap();
        assert_eq!(
            transport.unsubscribed.lock().unwrap()[0].1,
            "transactionWatch_v1_unwatch"
        );
    }

    #[tokio::test]
    async fn test_send_passes_through() {
        let adapter = ProviderAdapter::new(MockTransport::new(true, false));
        let reply = adapter
            .send("system_chain", vec![serde_json::json!(1)])
            .await
            .unwrap();
        assert_eq!(reply["method"], "system_chain");
        assert_eq!(reply["params"][0], 1);
    }
}
