//! Backend clients behind one connection.
//!
//! Two structurally different clients serve a connection: the legacy
//! metadata-driven client and the lightweight chain-head client. Both are
//! reached through the [`Backend`] trait so the state machine can treat them
//! uniformly.

mod client;

pub use client::SubxtBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::adapter::Subscription;
use crate::error::ChainError;

pub use subxt::dynamic::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Metadata-driven client over the legacy RPC methods.
    Legacy,
    /// Lightweight client over the chain-head RPC methods.
    Dynamic,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Legacy => "legacy",
            BackendKind::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connected,
    Disconnected,
    /// Metadata loaded; typed calls can be served.
    Ready,
    Error(String),
}

/// Shape of one call argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: Option<String>,
    pub type_id: u32,
    /// Whether the wire shape is a variant (tagged union).
    pub tagged_union: bool,
}

/// Call metadata resolved against the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMeta {
    /// Pallet name as spelled in the metadata.
    pub pallet: String,
    /// Call name as spelled in the metadata.
    pub call: String,
    pub fields: Vec<FieldMeta>,
}

/// Storage key in the shape the query function expects.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageKey {
    /// Plain storage value.
    None,
    /// One key, passed bare.
    Bare(Value),
    /// Several keys of a multi-key map.
    Tuple(Vec<Value>),
}

impl StorageKey {
    /// A single key collapses to a bare key.
    pub fn from_args(mut keys: Vec<Value>) -> Self {
        match keys.len() {
            0 => StorageKey::None,
            1 => match keys.pop() {
                Some(key) => StorageKey::Bare(key),
                None => StorageKey::None,
            },
            _ => StorageKey::Tuple(keys),
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            StorageKey::None => Vec::new(),
            StorageKey::Bare(key) => vec![key],
            StorageKey::Tuple(keys) => keys,
        }
    }
}

pub type StorageCallback = Arc<dyn Fn(Result<Option<Value>, ChainError>) + Send + Sync>;

#[derive(Deserialize)]
struct RpcMethods {
    methods: Vec<String>,
}

/// One backend client.
///
/// The dynamic surfaces default to [`ChainError::Unsupported`].
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn events(&self) -> broadcast::Receiver<BackendEvent>;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), ChainError>;

    async fn disconnect(&self) -> Result<(), ChainError>;

    /// Resolves once the client has loaded metadata.
    async fn wait_ready(&self) -> Result<(), ChainError>;

    async fn rpc(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ChainError>;

    /// RPC methods the node exposes.
    async fn rpc_methods(&self) -> Result<Vec<String>, ChainError> {
        let reply = self.rpc("rpc_methods", Vec::new()).await?;
        let methods: RpcMethods = serde_json::from_value(reply)?;
        Ok(methods.methods)
    }

    async fn tx_metadata(&self, pallet: &str, call: &str) -> Result<TxMeta, ChainError> {
        Err(ChainError::Unsupported(format!("tx.{}.{}", pallet, call)))
    }

    /// Decode SCALE bytes as the given type.
    async fn decode_field(&self, type_id: u32, _bytes: &[u8]) -> Result<Value, ChainError> {
        Err(ChainError::Unsupported(format!("decode type {}", type_id)))
    }

    async fn encode_call(
        &self,
        pallet: &str,
        call: &str,
        _args: Vec<Value>,
    ) -> Result<Vec<u8>, ChainError> {
        Err(ChainError::Unsupported(format!("tx.{}.{}", pallet, call)))
    }

    async fn query_storage(
        &self,
        pallet: &str,
        entry: &str,
        _key: StorageKey,
    ) -> Result<Option<Value>, ChainError> {
        Err(ChainError::Unsupported(format!("query.{}.{}", pallet, entry)))
    }

    async fn subscribe_storage(
        &self,
        pallet: &str,
        entry: &str,
        _key: StorageKey,
        _callback: StorageCallback,
    ) -> Result<Subscription, ChainError> {
        Err(ChainError::Unsupported(format!("query.{}.{}", pallet, entry)))
    }

    async fn constant(&self, pallet: &str, name: &str) -> Result<Value, ChainError> {
        Err(ChainError::Unsupported(format!("consts.{}.{}", pallet, name)))
    }

    async fn runtime_call(
        &self,
        api: &str,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<Value, ChainError> {
        Err(ChainError::Unsupported(format!("call.{}.{}", api, method)))
    }
}

/// Compare identifiers across naming styles: `batchAll`, `batch_all` and
/// `BatchAll` are the same name.
pub fn same_ident(a: &str, b: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect()
    };
    normalize(a) == normalize(b)
}
