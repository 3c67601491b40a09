//! Light client startup using smoldot.
//!
//! Provides trustless connections to well-known relay chains without relying
//! on centralized RPC endpoints. The chain spec is fetched over HTTP, then the
//! embedded node joins the P2P network and serves JSON-RPC locally.

use subxt::lightclient::LightClient;
use subxt_rpcs::client::RpcClient;

use crate::config::light_client_spec_url;
use crate::error::ChainError;

/// Fetch a chain spec from a URL.
pub async fn fetch_chain_spec(url: &str) -> Result<String, ChainError> {
    tracing::debug!("Fetching chain spec from {}", url);

    let start = std::time::Instant::now();
    let response = reqwest::get(url)
        .await
        .map_err(|e| ChainError::LightClient(format!("Failed to fetch chain spec: {}", e)))?;

    if !response.status().is_success() {
        return Err(ChainError::LightClient(format!(
            "Failed to fetch chain spec from {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let spec = response
        .text()
        .await
        .map_err(|e| ChainError::LightClient(format!("Failed to read chain spec: {}", e)))?;

    tracing::debug!(
        "Fetched chain spec ({} bytes) in {:?}",
        spec.len(),
        start.elapsed()
    );

    Ok(spec)
}

/// Start a light client for `chain` and return it with an RPC client over it.
///
/// The returned [`LightClient`] must be kept alive for as long as the RPC
/// client is used.
pub async fn start_light_client(chain: &str) -> Result<(LightClient, RpcClient), ChainError> {
    let url = light_client_spec_url(chain)
        .ok_or_else(|| ChainError::LightClient(format!("No chain spec known for {}", chain)))?;

    tracing::info!("Fetching {} chain spec...", chain);
    let spec = fetch_chain_spec(url).await?;

    tracing::info!("Starting smoldot light client for {}...", chain);
    let start = std::time::Instant::now();
    let (client, rpc) = LightClient::relay_chain(spec.as_str()).map_err(|e| {
        ChainError::LightClient(format!("Failed to start {} light client: {}", chain, e))
    })?;
    tracing::debug!("Light client for {} started in {:?}", chain, start.elapsed());

    Ok((client, rpc.into()))
}
