//! In-memory backends for driving the connection state machine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainconn_chain::{
    Backend, BackendEvent, BackendFactory, BackendKind, BackendPair, BootstrapRequest,
    ChainError, api_options,
};
use chainconn_core::{ConnectionConfig, ConnectionState, MetadataItem};
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};

pub const WAIT: Duration = Duration::from_secs(2);

pub const GENESIS: &str = "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("chainconn_chain=debug,info")
        .with_test_writer()
        .try_init();
}

/// Backend that connects instantly and answers the metadata RPCs.
///
/// With `hold_ready` it reports `Connected` but keeps `Ready` back until
/// [`release_ready`](Self::release_ready).
pub struct MockBackend {
    kind: BackendKind,
    events: broadcast::Sender<BackendEvent>,
    connected: AtomicBool,
    rpc_calls: AtomicUsize,
    fail_fill: bool,
    hold_ready: bool,
}

impl MockBackend {
    pub fn new(kind: BackendKind, fail_fill: bool, hold_ready: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            kind,
            events,
            connected: AtomicBool::new(false),
            rpc_calls: AtomicUsize::new(0),
            fail_fill,
            hold_ready,
        }
    }

    pub fn release_ready(&self) {
        self.emit(BackendEvent::Ready);
    }

    /// Emit `event` as if the underlying link produced it.
    pub fn emit(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            BackendEvent::Disconnected => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        let _ = self.events.send(event);
    }

    pub fn rpc_calls(&self) -> usize {
        self.rpc_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ChainError> {
        if !self.is_connected() {
            self.emit(BackendEvent::Connected);
            if !self.hold_ready {
                self.emit(BackendEvent::Ready);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChainError> {
        if self.is_connected() {
            self.emit(BackendEvent::Disconnected);
        }
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), ChainError> {
        Ok(())
    }

    async fn rpc(&self, method: &str, _params: Vec<Value>) -> Result<Value, ChainError> {
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
        match method {
            "state_getRuntimeVersion" if self.fail_fill => {
                Err(ChainError::Rpc("runtime version unavailable".into()))
            }
            "state_getRuntimeVersion" => Ok(json!({
                "specName": "polkadot",
                "specVersion": 1002000,
                "transactionVersion": 26
            })),
            "chain_getBlockHash" => Ok(json!(GENESIS)),
            "state_getMetadata" => Ok(json!("0x6d657461")),
            "system_chain" => Ok(json!("Polkadot")),
            "system_name" => Ok(json!("Parity Polkadot")),
            "system_version" => Ok(json!("1.15.2")),
            "system_properties" => Ok(json!({
                "ss58Format": 0,
                "tokenDecimals": 10,
                "tokenSymbol": "DOT"
            })),
            "rpc_methods" => Ok(json!({
                "methods": ["system_chain", "system_name", "chain_getBlockHash"]
            })),
            other => Err(ChainError::Rpc(format!("Method not found: {}", other))),
        }
    }
}

/// Factory handing out fresh mock pairs and keeping the last one.
///
/// Backend options are resolved from the chain slug like the real factory.
#[derive(Default)]
pub struct MockFactory {
    fail_fill: bool,
    hold_ready: Option<BackendKind>,
    builds: AtomicUsize,
    urls: Mutex<Vec<String>>,
    pinned: Mutex<Vec<Option<MetadataItem>>>,
    last: Mutex<Option<(Arc<MockBackend>, Arc<MockBackend>)>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_fill: true,
            ..Default::default()
        })
    }

    /// Pairs whose `kind` backend holds back `Ready`.
    pub fn holding_ready(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            hold_ready: Some(kind),
            ..Default::default()
        })
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Pinned metadata of every build request, in order.
    pub fn pinned(&self) -> Vec<Option<MetadataItem>> {
        self.pinned.lock().unwrap().clone()
    }

    pub fn legacy(&self) -> Arc<MockBackend> {
        self.last.lock().unwrap().as_ref().unwrap().0.clone()
    }

    pub fn dynamic(&self) -> Arc<MockBackend> {
        self.last.lock().unwrap().as_ref().unwrap().1.clone()
    }
}

impl BackendFactory for MockFactory {
    fn build(&self, request: &BootstrapRequest) -> Result<BackendPair, ChainError> {
        if request.api_url.is_empty() {
            return Err(ChainError::Connection("empty url".into()));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.api_url.clone());
        self.pinned.lock().unwrap().push(request.metadata.clone());

        let backend = |kind| {
            Arc::new(MockBackend::new(
                kind,
                self.fail_fill,
                self.hold_ready == Some(kind),
            ))
        };
        let legacy = backend(BackendKind::Legacy);
        let dynamic = backend(BackendKind::Dynamic);
        *self.last.lock().unwrap() = Some((legacy.clone(), dynamic.clone()));

        Ok(BackendPair {
            legacy,
            dynamic,
            use_light_client: false,
            options: api_options(&request.chain_slug, &request.config.chain_groups),
        })
    }
}

pub fn request(api_url: &str) -> BootstrapRequest {
    request_for("polkadot", api_url)
}

pub fn request_for(chain_slug: &str, api_url: &str) -> BootstrapRequest {
    BootstrapRequest {
        chain_slug: chain_slug.into(),
        api_url: api_url.into(),
        config: ConnectionConfig::default(),
        metadata: None,
    }
}

/// Wait until the observed state satisfies `f`.
pub async fn wait_state(
    rx: &mut watch::Receiver<ConnectionState>,
    f: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(WAIT, rx.wait_for(f))
        .await
        .expect("timed out waiting for connection state")
        .expect("connection worker stopped")
        .clone()
}
