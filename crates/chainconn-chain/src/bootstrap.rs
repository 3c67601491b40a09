//! Dual-client bootstrapper.
//!
//! Builds the transport and both backend clients for one chain and wires
//! their event streams into the connection worker.

use std::sync::Arc;

use chainconn_core::{ConnectionConfig, MetadataItem};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::ProviderAdapter;
use crate::backend::{Backend, BackendEvent, BackendKind, SubxtBackend};
use crate::config::{ApiOptions, api_options};
use crate::error::ChainError;
use crate::provider::create_provider;

/// Everything needed to build the backends of one chain.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub chain_slug: String,
    pub api_url: String,
    pub config: ConnectionConfig,
    /// Pinned metadata for the legacy client.
    pub metadata: Option<MetadataItem>,
}

/// The two backends serving one connection.
#[derive(Clone)]
pub struct BackendPair {
    pub legacy: Arc<dyn Backend>,
    pub dynamic: Arc<dyn Backend>,
    pub use_light_client: bool,
    pub options: ApiOptions,
}

impl BackendPair {
    pub fn get(&self, kind: BackendKind) -> &Arc<dyn Backend> {
        match kind {
            BackendKind::Legacy => &self.legacy,
            BackendKind::Dynamic => &self.dynamic,
        }
    }

    /// Backend whose connection events and metadata are authoritative.
    pub fn canonical(&self) -> &Arc<dyn Backend> {
        self.get(self.options.canonical)
    }
}

/// Builds backend pairs. Seam for tests.
pub trait BackendFactory: Send + Sync {
    fn build(&self, request: &BootstrapRequest) -> Result<BackendPair, ChainError>;
}

/// Production factory: one transport shared by a legacy subxt client and a
/// chain-head subxt client behind the provider adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubxtBackendFactory;

impl BackendFactory for SubxtBackendFactory {
    fn build(&self, request: &BootstrapRequest) -> Result<BackendPair, ChainError> {
        let provider = create_provider(&request.api_url, &request.config)?;
        let options = api_options(&request.chain_slug, &request.config.chain_groups);

        tracing::debug!(
            "Building backends for {} (group {:?}, canonical {})",
            request.chain_slug,
            options.group,
            options.canonical
        );

        let legacy = SubxtBackend::legacy(provider.transport.clone(), request.metadata.clone());
        let dynamic = SubxtBackend::dynamic(ProviderAdapter::new(provider.transport));

        Ok(BackendPair {
            legacy: Arc::new(legacy),
            dynamic: Arc::new(dynamic),
            use_light_client: provider.use_light_client,
            options,
        })
    }
}

/// A backend event tagged with the pair generation it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub epoch: u64,
    pub kind: BackendKind,
    pub event: BackendEvent,
}

/// Forward both backends' events to `tx`.
///
/// Receivers are taken before returning so no event emitted after this call
/// is missed. Abort the handles to detach.
pub fn wire(
    pair: &BackendPair,
    epoch: u64,
    tx: mpsc::UnboundedSender<BackendMessage>,
) -> Vec<JoinHandle<()>> {
    [BackendKind::Legacy, BackendKind::Dynamic]
        .into_iter()
        .map(|kind| {
            let mut events = pair.get(kind).events();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if tx.send(BackendMessage { epoch, kind, event }).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("{} backend listener skipped {} events", kind, n);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect()
}
