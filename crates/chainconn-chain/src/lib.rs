//! Resilient connections to Substrate-based chains.
//!
//! Each chain is served by one transport shared between a legacy subxt
//! client and a chain-head client, joined into a single lifecycle by a
//! [`SubstrateApi`] handle.

pub mod adapter;
pub mod backend;
pub mod bootstrap;
pub mod calls;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod metadata;
pub mod provider;
pub mod proxy;
pub mod readiness;
pub mod transport;

pub use adapter::{JsonRpcProvider, ProviderAdapter, ProviderStatus, Subscription};
pub use backend::{Backend, BackendEvent, BackendKind, SubxtBackend, Value};
pub use bootstrap::{BackendFactory, BackendPair, BootstrapRequest, SubxtBackendFactory};
pub use calls::{
    CallArg, CallData, QueryArg, QueryFn, QueryResult, RpcMethod, RuntimeCallFn, TxFn, TxOptions,
};
pub use codec::{UintWidth, WideUint, encode_uint};
pub use config::{ApiOptions, SignedExtension, api_options};
pub use connection::SubstrateApi;
pub use error::*;
pub use metadata::{export_metadata, fill_api_info, normalize_properties};
pub use provider::{Provider, create_provider};
pub use proxy::{Access, CallRegistry, ProxyChain, new_proxy_chain, path_segments};
pub use readiness::{ReadinessBarrier, ReadyState};
pub use transport::{Transport, TransportKind};
