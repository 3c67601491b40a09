//! Provider factory: picks a transport from the endpoint URL scheme.

use std::sync::Arc;

use chainconn_core::ConnectionConfig;

use crate::error::ChainError;
use crate::transport::{RpcTransport, Transport};

/// Path segment some light client URLs carry after the scheme.
const SUBSTRATE_CONNECT: &str = "substrate-connect/";

/// A transport plus how it was chosen.
#[derive(Clone)]
pub struct Provider {
    pub transport: Arc<dyn Transport>,
    pub use_light_client: bool,
}

/// Build the transport for `api_url`. Performs no I/O.
///
/// `light://substrate-connect/<chain>` and `light://<chain>` select the light
/// client; anything else is treated as a socket URL.
pub fn create_provider(api_url: &str, config: &ConnectionConfig) -> Result<Provider, ChainError> {
    if let Some(rest) = api_url.strip_prefix(config.light_client_prefix.as_str()) {
        let chain = rest.strip_prefix(SUBSTRATE_CONNECT).unwrap_or(rest);
        if chain.is_empty() {
            return Err(ChainError::InvalidData(format!(
                "Light client URL without chain: {}",
                api_url
            )));
        }

        tracing::debug!("Using light client provider for {}", chain);
        return Ok(Provider {
            transport: Arc::new(RpcTransport::light(
                chain,
                config.auto_connect(),
                config.connect_timeout(),
            )),
            use_light_client: true,
        });
    }

    tracing::debug!("Using socket provider for {}", api_url);
    Ok(Provider {
        transport: Arc::new(RpcTransport::ws(
            api_url,
            config.auto_connect(),
            config.connect_timeout(),
        )),
        use_light_client: false,
    })
}
