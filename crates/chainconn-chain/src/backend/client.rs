//! subxt-based backends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chainconn_core::MetadataItem;
use futures::future::FutureExt;
use parity_scale_codec::Decode;
use scale_info::{PortableRegistry, TypeDef};
use subxt::backend::chain_head::{ChainHeadBackend, ChainHeadBackendBuilder};
use subxt::client::RuntimeVersion;
use subxt::utils::H256;
use subxt::{Metadata, OnlineClient, PolkadotConfig};
use subxt_rpcs::client::RpcClient;
use subxt_rpcs::rpc_params;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{
    Backend, BackendEvent, BackendKind, FieldMeta, StorageCallback, StorageKey, TxMeta, Value,
    same_ident,
};
use crate::adapter::{JsonRpcProvider, ProviderAdapter, Subscription};
use crate::error::ChainError;
use crate::metadata::{RuntimeVersionReply, decode_hex};
use crate::transport::{EVENT_CAPACITY, ProviderEvent, Transport, TransportRpc, lock};

type Client = OnlineClient<PolkadotConfig>;

/// What the backend talks through.
enum Link {
    Transport(Arc<dyn Transport>),
    Adapter(ProviderAdapter),
}

impl Link {
    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        match self {
            Link::Transport(t) => t.events(),
            Link::Adapter(a) => a.events(),
        }
    }

    async fn connect(&self) -> Result<(), ChainError> {
        match self {
            Link::Transport(t) => t.connect().await,
            Link::Adapter(a) => {
                a.connect().await;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), ChainError> {
        match self {
            Link::Transport(t) => t.disconnect().await,
            Link::Adapter(a) => a.disconnect().await,
        }
    }

    async fn send(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ChainError> {
        match self {
            Link::Transport(t) => t.send(method, params).await,
            Link::Adapter(a) => a.send(method, params).await,
        }
    }
}

#[derive(Clone)]
enum ClientState {
    Idle,
    Building,
    Ready(Client),
    Failed(String),
}

struct Shared {
    kind: BackendKind,
    link: Link,
    metadata: Option<MetadataItem>,
    events: broadcast::Sender<BackendEvent>,
    connected: Arc<AtomicBool>,
    client: watch::Sender<ClientState>,
    build: Mutex<Option<JoinHandle<()>>>,
    next_sub: AtomicU64,
}

/// [`Backend`] over a subxt [`OnlineClient`].
///
/// The legacy variant runs subxt's legacy RPC backend over the transport; the
/// dynamic variant runs the chain-head backend over the provider adapter.
/// Either way the client is built once the link is up, and `Ready` is emitted
/// when it has loaded metadata.
pub struct SubxtBackend {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl Drop for SubxtBackend {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(build) = lock(&self.shared.build).take() {
            build.abort();
        }
    }
}

impl SubxtBackend {
    /// Legacy client over `transport`. `metadata` is used instead of a
    /// download when it matches the node's genesis hash and spec version.
    pub fn legacy(transport: Arc<dyn Transport>, metadata: Option<MetadataItem>) -> Self {
        Self::new(BackendKind::Legacy, Link::Transport(transport), metadata)
    }

    /// Lightweight client over the provider adapter.
    pub fn dynamic(adapter: ProviderAdapter) -> Self {
        Self::new(BackendKind::Dynamic, Link::Adapter(adapter), None)
    }

    fn new(kind: BackendKind, link: Link, metadata: Option<MetadataItem>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (client, _) = watch::channel(ClientState::Idle);
        let connected = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(pump_link_events(
            kind,
            link.events(),
            events.clone(),
            connected.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                kind,
                link,
                metadata,
                events,
                connected,
                client,
                build: Mutex::new(None),
                next_sub: AtomicU64::new(1),
            }),
            pump,
        }
    }

    fn client(&self) -> Result<Client, ChainError> {
        match &*self.shared.client.borrow() {
            ClientState::Ready(client) => Ok(client.clone()),
            _ => Err(ChainError::NotReady(format!(
                "{} client has no metadata yet",
                self.shared.kind
            ))),
        }
    }

    fn ensure_client(&self) {
        let start = self.shared.client.send_if_modified(|state| {
            if matches!(state, ClientState::Idle | ClientState::Failed(_)) {
                *state = ClientState::Building;
                true
            } else {
                false
            }
        });

        if start {
            let task = tokio::spawn(build_client(self.shared.clone()));
            if let Some(old) = lock(&self.shared.build).replace(task) {
                old.abort();
            }
        }
    }
}

async fn pump_link_events(
    kind: BackendKind,
    mut link_events: broadcast::Receiver<ProviderEvent>,
    events: broadcast::Sender<BackendEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let event = match link_events.recv().await {
            Ok(ProviderEvent::Connected) => {
                connected.store(true, Ordering::SeqCst);
                BackendEvent::Connected
            }
            Ok(ProviderEvent::Disconnected) => {
                connected.store(false, Ordering::SeqCst);
                BackendEvent::Disconnected
            }
            Ok(ProviderEvent::Error(e)) => BackendEvent::Error(e),
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("{} backend skipped {} link events", kind, n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        tracing::debug!("{} backend event: {:?}", kind, event);
        let _ = events.send(event);
    }
}

async fn build_client(shared: Arc<Shared>) {
    // Metadata can only be loaded over a live link.
    let mut events = shared.events.subscribe();
    while !shared.connected.load(Ordering::SeqCst) {
        match events.recv().await {
            Ok(BackendEvent::Connected) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }

    let start = std::time::Instant::now();
    let result = match &shared.link {
        Link::Transport(transport) => build_legacy(transport.clone(), shared.metadata.as_ref()).await,
        Link::Adapter(adapter) => build_dynamic(adapter.clone()).await,
    };

    match result {
        Ok(client) => {
            tracing::info!(
                "{} client ready (spec {}) in {:?}",
                shared.kind,
                client.runtime_version().spec_version,
                start.elapsed()
            );
            shared.client.send_replace(ClientState::Ready(client));
            let _ = shared.events.send(BackendEvent::Ready);
        }
        Err(e) => {
            tracing::warn!("Failed to build {} client: {}", shared.kind, e);
            shared.client.send_replace(ClientState::Failed(e.to_string()));
            let _ = shared.events.send(BackendEvent::Error(e.to_string()));
        }
    }
}

async fn build_legacy(
    transport: Arc<dyn Transport>,
    pinned: Option<&MetadataItem>,
) -> Result<Client, ChainError> {
    let rpc = RpcClient::new(TransportRpc::new(transport));

    if let Some(item) = pinned {
        match pinned_parts(&rpc, item).await {
            Ok(Some((genesis, version, metadata))) => {
                tracing::debug!("Using pinned metadata {}", item.key());
                return Ok(Client::from_rpc_client_with(
                    genesis, version, metadata, rpc,
                )?);
            }
            Ok(None) => tracing::debug!("Pinned metadata {} does not match node", item.key()),
            Err(e) => tracing::warn!("Ignoring pinned metadata {}: {}", item.key(), e),
        }
    }

    Ok(Client::from_rpc_client(rpc).await?)
}

/// Genesis hash, runtime version and metadata from a pinned item, if the
/// node runs that exact runtime.
async fn pinned_parts(
    rpc: &RpcClient,
    item: &MetadataItem,
) -> Result<Option<(H256, RuntimeVersion, Metadata)>, ChainError> {
    let Some((genesis, version)) = pinned_runtime(rpc, item).await? else {
        return Ok(None);
    };
    let metadata_bytes = decode_hex("metadata", &item.hex_value, None)?;
    let metadata = Metadata::decode(&mut &metadata_bytes[..])?;
    Ok(Some((genesis, version, metadata)))
}

/// The node's genesis hash and runtime version, if they match `item`.
async fn pinned_runtime(
    rpc: &RpcClient,
    item: &MetadataItem,
) -> Result<Option<(H256, RuntimeVersion)>, ChainError> {
    let genesis: String = rpc
        .request("chain_getBlockHash", rpc_params![0u32])
        .await?;
    let version: RuntimeVersionReply = rpc
        .request("state_getRuntimeVersion", rpc_params![])
        .await?;

    if !genesis.eq_ignore_ascii_case(&item.genesis_hash) || version.spec_version != item.spec_version {
        return Ok(None);
    }

    let genesis_bytes = decode_hex("genesis hash", &genesis, Some(32))?;
    Ok(Some((
        H256::from_slice(&genesis_bytes),
        RuntimeVersion {
            spec_version: version.spec_version,
            transaction_version: version.transaction_version,
        },
    )))
}

async fn build_dynamic(adapter: ProviderAdapter) -> Result<Client, ChainError> {
    let rpc = RpcClient::new(adapter);
    let backend: ChainHeadBackend<PolkadotConfig> =
        ChainHeadBackendBuilder::default().build_with_background_driver(rpc);
    Ok(Client::from_backend(Arc::new(backend)).await?)
}

/// Variant types other than `Option`.
fn is_tagged_union(types: &PortableRegistry, type_id: u32) -> bool {
    types.resolve(type_id).is_some_and(|ty| {
        matches!(ty.type_def, TypeDef::Variant(_)) && ty.path.ident().as_deref() != Some("Option")
    })
}

fn resolve_pallet(metadata: &Metadata, pallet: &str) -> Result<String, ChainError> {
    metadata
        .pallets()
        .find(|p| same_ident(p.name(), pallet))
        .map(|p| p.name().to_string())
        .ok_or_else(|| ChainError::UnknownApi(format!("pallet {}", pallet)))
}

fn resolve_storage(metadata: &Metadata, pallet: &str, entry: &str) -> Result<(String, String), ChainError> {
    let pallet_name = resolve_pallet(metadata, pallet)?;
    let entry_name = metadata
        .pallet_by_name(&pallet_name)
        .and_then(|p| p.storage())
        .and_then(|s| s.entries().iter().find(|e| same_ident(e.name(), entry)))
        .map(|e| e.name().to_string())
        .ok_or_else(|| ChainError::UnknownApi(format!("query.{}.{}", pallet, entry)))?;
    Ok((pallet_name, entry_name))
}

async fn fetch_storage(
    client: &Client,
    at: Option<H256>,
    pallet: &str,
    entry: &str,
    keys: Vec<Value>,
) -> Result<Option<Value>, ChainError> {
    let address = subxt::dynamic::storage(pallet, entry, keys);
    let storage = match at {
        Some(hash) => client.storage().at(hash),
        None => client.storage().at_latest().await?,
    };

    match storage.fetch(&address).await? {
        Some(thunk) => Ok(Some(thunk.to_value()?.remove_context())),
        None => Ok(None),
    }
}

#[async_trait]
impl Backend for SubxtBackend {
    fn kind(&self) -> BackendKind {
        self.shared.kind
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ChainError> {
        let result = self.shared.link.connect().await;
        // The build waits for the link, so start it even if this attempt failed.
        self.ensure_client();
        result
    }

    async fn disconnect(&self) -> Result<(), ChainError> {
        if let Some(build) = lock(&self.shared.build).take() {
            build.abort();
        }
        self.shared.client.send_replace(ClientState::Idle);
        self.shared.link.disconnect().await
    }

    async fn wait_ready(&self) -> Result<(), ChainError> {
        let mut rx = self.shared.client.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, ClientState::Ready(_) | ClientState::Failed(_)))
            .await
            .map_err(|_| ChainError::NotReady(format!("{} backend dropped", self.shared.kind)))?;

        if let ClientState::Failed(e) = &*state {
            return Err(ChainError::NotReady(e.clone()));
        }
        Ok(())
    }

    async fn rpc(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ChainError> {
        self.shared.link.send(method, params).await
    }

    async fn tx_metadata(&self, pallet: &str, call: &str) -> Result<TxMeta, ChainError> {
        let client = self.client()?;
        let metadata = client.metadata();

        let pallet_name = resolve_pallet(&metadata, pallet)?;
        let variant = metadata
            .pallet_by_name(&pallet_name)
            .and_then(|p| p.call_variants())
            .and_then(|variants| variants.iter().find(|v| same_ident(&v.name, call)))
            .ok_or_else(|| ChainError::UnknownApi(format!("tx.{}.{}", pallet, call)))?;

        let fields = variant
            .fields
            .iter()
            .map(|field| FieldMeta {
                name: field.name.clone(),
                type_id: field.ty.id,
                tagged_union: is_tagged_union(metadata.types(), field.ty.id),
            })
            .collect();

        Ok(TxMeta {
            pallet: pallet_name,
            call: variant.name.clone(),
            fields,
        })
    }

    async fn decode_field(&self, type_id: u32, bytes: &[u8]) -> Result<Value, ChainError> {
        let client = self.client()?;
        let metadata = client.metadata();
        let value = subxt::ext::scale_value::scale::decode_as_type(
            &mut &bytes[..],
            type_id,
            metadata.types(),
        )
        .map_err(|e| ChainError::InvalidData(format!("Cannot decode type {}: {}", type_id, e)))?;
        Ok(value.remove_context())
    }

    async fn encode_call(
        &self,
        pallet: &str,
        call: &str,
        args: Vec<Value>,
    ) -> Result<Vec<u8>, ChainError> {
        let client = self.client()?;
        let payload = subxt::dynamic::tx(pallet, call, args);
        Ok(client.tx().call_data(&payload)?)
    }

    async fn query_storage(
        &self,
        pallet: &str,
        entry: &str,
        key: StorageKey,
    ) -> Result<Option<Value>, ChainError> {
        let client = self.client()?;
        let (pallet, entry) = resolve_storage(&client.metadata(), pallet, entry)?;
        fetch_storage(&client, None, &pallet, &entry, key.into_values()).await
    }

    async fn subscribe_storage(
        &self,
        pallet: &str,
        entry: &str,
        key: StorageKey,
        callback: StorageCallback,
    ) -> Result<Subscription, ChainError> {
        let client = self.client()?;
        let (pallet, entry) = resolve_storage(&client.metadata(), pallet, entry)?;
        let keys = key.into_values();
        let mut blocks = client.blocks().subscribe_finalized().await?;

        let id = format!(
            "{}.{}#{}",
            pallet,
            entry,
            self.shared.next_sub.fetch_add(1, Ordering::Relaxed)
        );
        tracing::debug!("Watching storage {}", id);

        // Re-read on every finalized block, report only changes.
        let task = tokio::spawn(async move {
            let mut last: Option<Option<Value>> = None;
            while let Some(block) = blocks.next().await {
                let hash = match block {
                    Ok(block) => block.hash(),
                    Err(e) => {
                        callback(Err(e.into()));
                        continue;
                    }
                };
                match fetch_storage(&client, Some(hash), &pallet, &entry, keys.clone()).await {
                    Ok(value) => {
                        if last.as_ref() != Some(&value) {
                            callback(Ok(value.clone()));
                            last = Some(value);
                        }
                    }
                    Err(e) => callback(Err(e)),
                }
            }
        });

        let task = Arc::new(Mutex::new(Some(task)));
        Ok(Subscription::new(
            id,
            Arc::new(move || {
                if let Some(task) = lock(&task).take() {
                    task.abort();
                }
                futures::future::ready(Ok::<(), ChainError>(())).boxed()
            }),
        ))
    }

    async fn constant(&self, pallet: &str, name: &str) -> Result<Value, ChainError> {
        let client = self.client()?;
        let metadata = client.metadata();

        let pallet_name = resolve_pallet(&metadata, pallet)?;
        let constant_name = metadata
            .pallet_by_name(&pallet_name)
            .and_then(|p| p.constants().find(|c| same_ident(c.name(), name)))
            .map(|c| c.name().to_string())
            .ok_or_else(|| ChainError::UnknownApi(format!("consts.{}.{}", pallet, name)))?;

        let address = subxt::dynamic::constant(pallet_name, constant_name);
        let value = client.constants().at(&address)?;
        Ok(value.to_value()?.remove_context())
    }

    async fn runtime_call(
        &self,
        api: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ChainError> {
        let client = self.client()?;

        let (api_name, method_name) = {
            let metadata = client.metadata();
            let runtime_api = metadata
                .runtime_api_traits()
                .find(|t| same_ident(t.name(), api))
                .ok_or_else(|| ChainError::UnknownApi(format!("call.{}", api)))?;
            let runtime_method = runtime_api
                .methods()
                .find(|m| same_ident(m.name(), method))
                .ok_or_else(|| ChainError::UnknownApi(format!("call.{}.{}", api, method)))?;
            (
                runtime_api.name().to_string(),
                runtime_method.name().to_string(),
            )
        };

        let payload = subxt::dynamic::runtime_api_call(api_name, method_name, args);
        let value = client.runtime_api().at_latest().await?.call(payload).await?;
        Ok(value.to_value()?.remove_context())
    }
}
