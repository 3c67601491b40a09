//! Dynamically addressed call surfaces.
//!
//! Each surface is a [`ProxyChain`] whose executor binds the collected path
//! to a backend function: RPC methods by registry lookup, extrinsics, storage
//! queries, constants and runtime calls by pallet and item name.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parity_scale_codec::{Compact, Encode};
use subxt::ext::scale_value::{Composite, Primitive, ValueDef};

use crate::adapter::Subscription;
use crate::backend::{Backend, StorageCallback, StorageKey, TxMeta, Value, same_ident};
use crate::codec::{UintWidth, WideUint, encode_uint};
use crate::config::SignedExtension;
use crate::error::ChainError;
use crate::proxy::{CallRegistry, ProxyChain, new_proxy_chain};

/// Depth of pallet/item surfaces: the factory call, then two names.
pub const ITEM_DEPTH: usize = 3;

const BATCH_CALLS: &[&str] = &["batch", "batchAll", "forceBatch"];

/// A node RPC method bound to the backend that serves it.
#[derive(Clone)]
pub struct RpcMethod {
    name: String,
    backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethod").field("name", &self.name).finish()
    }
}

impl RpcMethod {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(
        &self,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ChainError> {
        self.backend.rpc(&self.name, params).await
    }
}

/// Registry of callable RPC methods: what the node reports plus extras.
pub fn rpc_registry(
    methods: impl IntoIterator<Item = String>,
    extra: &[&str],
    backend: Arc<dyn Backend>,
) -> CallRegistry<RpcMethod> {
    let mut registry = CallRegistry::new("_");
    for name in methods
        .into_iter()
        .chain(extra.iter().map(|s| s.to_string()))
    {
        registry.insert(name.clone(), RpcMethod::new(name, backend.clone()));
    }
    registry
}

pub fn rpc_chain(
    registry: Arc<CallRegistry<RpcMethod>>,
    depth: usize,
) -> ProxyChain<Result<RpcMethod, ChainError>> {
    new_proxy_chain(
        Box::new(move |segments| {
            registry
                .get(&segments)
                .cloned()
                .ok_or_else(|| ChainError::UnknownApi(format!("rpc.{}", registry.key(&segments))))
        }),
        depth,
    )
}

/// One positional extrinsic argument.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Value(Value),
    /// SCALE bytes of the field's type.
    Encoded(Vec<u8>),
    Number(WideUint),
}

impl From<Value> for CallArg {
    fn from(v: Value) -> Self {
        CallArg::Value(v)
    }
}

impl From<WideUint> for CallArg {
    fn from(v: WideUint) -> Self {
        CallArg::Number(v)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    /// Application id for chains that sign one into every transaction.
    pub app_id: Option<WideUint>,
}

/// Encoded call plus the signed extension data it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallData {
    pub call_data: Vec<u8>,
    /// `(identifier, SCALE bytes)` per extra signed extension.
    pub extensions: Vec<(String, Vec<u8>)>,
}

/// An extrinsic bound to a pallet and call name.
#[derive(Clone)]
pub struct TxFn {
    backend: Arc<dyn Backend>,
    pallet: String,
    call: String,
    signed_extensions: &'static [SignedExtension],
}

impl TxFn {
    pub fn new(
        backend: Arc<dyn Backend>,
        pallet: impl Into<String>,
        call: impl Into<String>,
        signed_extensions: &'static [SignedExtension],
    ) -> Self {
        Self {
            backend,
            pallet: pallet.into(),
            call: call.into(),
            signed_extensions,
        }
    }

    pub fn pallet(&self) -> &str {
        &self.pallet
    }

    pub fn call_name(&self) -> &str {
        &self.call
    }

    pub async fn meta(&self) -> Result<TxMeta, ChainError> {
        self.backend.tx_metadata(&self.pallet, &self.call).await
    }

    /// Normalize `args` and build the call.
    ///
    /// Batch calls accept `{ call: X }` wrappers; tagged-union fields accept
    /// SCALE bytes or hex; numbers are normalized to native integers.
    pub async fn call(&self, args: Vec<CallArg>, options: TxOptions) -> Result<CallData, ChainError> {
        let meta = self.meta().await?;
        if args.len() != meta.fields.len() {
            return Err(ChainError::InvalidData(format!(
                "tx.{}.{} takes {} arguments, got {}",
                meta.pallet,
                meta.call,
                meta.fields.len(),
                args.len()
            )));
        }

        let mut args = args;
        if is_batch(&meta)
            && let Some(CallArg::Value(first)) = args.first_mut()
        {
            let calls = std::mem::replace(first, Value::bool(false));
            *first = flatten_batch(calls);
            if let Some(encoded) = encoded_batch(first) {
                args[0] = CallArg::Encoded(encoded);
            }
        }

        let mut values = Vec::with_capacity(args.len());
        for (arg, field) in args.into_iter().zip(&meta.fields) {
            let value = match arg {
                CallArg::Number(n) => n.to_value()?,
                CallArg::Encoded(bytes) => {
                    if field.tagged_union || is_batch(&meta) {
                        self.backend.decode_field(field.type_id, &bytes).await?
                    } else {
                        Value::from_bytes(bytes)
                    }
                }
                CallArg::Value(v) => match hex_bytes(&v) {
                    Some(bytes) if field.tagged_union => {
                        self.backend.decode_field(field.type_id, &bytes).await?
                    }
                    _ => v,
                },
            };
            values.push(value);
        }

        let call_data = self
            .backend
            .encode_call(&meta.pallet, &meta.call, values)
            .await?;

        let mut extensions = Vec::with_capacity(self.signed_extensions.len());
        for ext in self.signed_extensions {
            match ext {
                SignedExtension::CheckAppId => {
                    let app_id = options.app_id.clone().unwrap_or(WideUint::Native(0));
                    extensions.push((
                        ext.identifier().to_string(),
                        encode_uint(&app_id, UintWidth::U32, true)?,
                    ));
                }
            }
        }

        tracing::debug!(
            "Built tx.{}.{} ({} bytes)",
            meta.pallet,
            meta.call,
            call_data.len()
        );
        Ok(CallData {
            call_data,
            extensions,
        })
    }
}

fn is_batch(meta: &TxMeta) -> bool {
    same_ident(&meta.pallet, "utility") && BATCH_CALLS.iter().any(|c| same_ident(&meta.call, c))
}

/// Unwrap `{ call: X }` items of a sequence to bare `X`.
fn flatten_batch(calls: Value) -> Value {
    match calls.value {
        ValueDef::Composite(Composite::Unnamed(items)) => {
            Value::unnamed_composite(items.into_iter().map(unwrap_call))
        }
        value => Value { value, context: () },
    }
}

fn unwrap_call(item: Value) -> Value {
    match item.value {
        ValueDef::Composite(Composite::Named(mut fields))
            if fields.len() == 1 && fields[0].0 == "call" =>
        {
            match fields.pop() {
                Some((_, call)) => call,
                None => Value::named_composite(fields),
            }
        }
        value => Value { value, context: () },
    }
}

/// A sequence of hex-encoded calls as the SCALE bytes of the sequence.
fn encoded_batch(calls: &Value) -> Option<Vec<u8>> {
    let ValueDef::Composite(Composite::Unnamed(items)) = &calls.value else {
        return None;
    };
    if items.is_empty() {
        return None;
    }

    let mut out = Compact(items.len() as u32).encode();
    for item in items {
        out.extend(hex_bytes(item)?);
    }
    Some(out)
}

fn hex_bytes(value: &Value) -> Option<Vec<u8>> {
    match &value.value {
        ValueDef::Primitive(Primitive::String(s)) => {
            let digits = s.strip_prefix("0x")?;
            hex::decode(digits).ok()
        }
        _ => None,
    }
}

pub fn tx_chain(
    backend: Arc<dyn Backend>,
    signed_extensions: &'static [SignedExtension],
) -> ProxyChain<TxFn> {
    new_proxy_chain(
        Box::new(move |segments| {
            let (pallet, call) = pair_of(segments);
            TxFn::new(backend, pallet, call, signed_extensions)
        }),
        ITEM_DEPTH,
    )
}

/// One positional query argument.
#[derive(Clone)]
pub enum QueryArg {
    Key(Value),
    /// Subscribe instead of reading once. Only valid last.
    Callback(StorageCallback),
}

impl From<Value> for QueryArg {
    fn from(v: Value) -> Self {
        QueryArg::Key(v)
    }
}

#[derive(Debug)]
pub enum QueryResult {
    Value(Option<Value>),
    Subscription(Subscription),
}

/// A storage entry bound to a pallet and entry name.
#[derive(Clone)]
pub struct QueryFn {
    backend: Arc<dyn Backend>,
    pallet: String,
    entry: String,
}

impl QueryFn {
    pub fn new(backend: Arc<dyn Backend>, pallet: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            backend,
            pallet: pallet.into(),
            entry: entry.into(),
        }
    }

    /// Read, or subscribe when the last argument is a callback.
    pub async fn call(&self, args: Vec<QueryArg>) -> Result<QueryResult, ChainError> {
        let mut keys = Vec::with_capacity(args.len());
        let mut callback = None;
        let last = args.len().saturating_sub(1);

        for (i, arg) in args.into_iter().enumerate() {
            match arg {
                QueryArg::Key(key) => keys.push(key),
                QueryArg::Callback(cb) if i == last => callback = Some(cb),
                QueryArg::Callback(_) => {
                    return Err(ChainError::InvalidData(format!(
                        "query.{}.{}: callback must be the last argument",
                        self.pallet, self.entry
                    )));
                }
            }
        }

        let key = StorageKey::from_args(keys);
        match callback {
            Some(cb) => Ok(QueryResult::Subscription(
                self.backend
                    .subscribe_storage(&self.pallet, &self.entry, key, cb)
                    .await?,
            )),
            None => Ok(QueryResult::Value(
                self.backend
                    .query_storage(&self.pallet, &self.entry, key)
                    .await?,
            )),
        }
    }

    pub async fn fetch(&self, keys: Vec<Value>) -> Result<Option<Value>, ChainError> {
        self.backend
            .query_storage(&self.pallet, &self.entry, StorageKey::from_args(keys))
            .await
    }
}

pub fn query_chain(backend: Arc<dyn Backend>) -> ProxyChain<QueryFn> {
    new_proxy_chain(
        Box::new(move |segments| {
            let (pallet, entry) = pair_of(segments);
            QueryFn::new(backend, pallet, entry)
        }),
        ITEM_DEPTH,
    )
}

pub type ConstFuture = BoxFuture<'static, Result<Value, ChainError>>;

pub fn consts_chain(backend: Arc<dyn Backend>) -> ProxyChain<ConstFuture> {
    new_proxy_chain(
        Box::new(move |segments| {
            let (pallet, name) = pair_of(segments);
            async move { backend.constant(&pallet, &name).await }.boxed()
        }),
        ITEM_DEPTH,
    )
}

/// A runtime API method.
#[derive(Clone)]
pub struct RuntimeCallFn {
    backend: Arc<dyn Backend>,
    api: String,
    method: String,
}

impl RuntimeCallFn {
    pub fn new(backend: Arc<dyn Backend>, api: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            backend,
            api: api.into(),
            method: method.into(),
        }
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, ChainError> {
        self.backend.runtime_call(&self.api, &self.method, args).await
    }
}

pub fn runtime_call_chain(backend: Arc<dyn Backend>) -> ProxyChain<RuntimeCallFn> {
    new_proxy_chain(
        Box::new(move |segments| {
            let (api, method) = pair_of(segments);
            RuntimeCallFn::new(backend, api, method)
        }),
        ITEM_DEPTH,
    )
}

fn pair_of(segments: Vec<String>) -> (String, String) {
    let mut it = segments.into_iter();
    (it.next().unwrap_or_default(), it.next().unwrap_or_default())
}
