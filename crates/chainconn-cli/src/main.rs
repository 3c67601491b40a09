//! Chain connection CLI - connect to a Substrate chain, report its identity
//! and issue RPC calls through the managed connection.

use std::path::PathBuf;

use chainconn_chain::{BootstrapRequest, SubstrateApi};
use chainconn_core::{ConnectionStatus, MetadataItem};
use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Connect to a Substrate chain and inspect it.
#[derive(Parser, Debug)]
#[command(name = "chainconn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Chain slug, used for chain groups and logging
    #[arg(short, long, default_value = "polkadot")]
    chain: String,

    /// Endpoint URL: ws(s)://, http(s):// or light://substrate-connect/<chain>
    #[arg(short, long, default_value = "wss://rpc.polkadot.io")]
    url: String,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// RPC method to call once ready, e.g. `system.health`
    #[arg(long)]
    rpc: Option<String>,

    /// JSON array of RPC parameters
    #[arg(long, default_value = "[]", requires = "rpc")]
    params: String,

    /// Pinned metadata file written by `--export-metadata`
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Write the connected runtime's metadata to this file once ready
    #[arg(long)]
    export_metadata: Option<PathBuf>,

    /// Keep running and log connection changes until interrupted
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    color_eyre::install()?;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("chainconn=info".parse()?)
        .add_directive("chainconn_chain=info".parse()?)
        .add_directive("chainconn_core=info".parse()?);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => chainconn_core::load_config_from(path),
        None => chainconn_core::load_config(),
    }
    .unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Default::default()
    });

    let params: Vec<serde_json::Value> =
        serde_json::from_str(&args.params).wrap_err("--params must be a JSON array")?;

    let metadata = match &args.metadata {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            let item: MetadataItem =
                serde_json::from_str(&json).wrap_err("Invalid metadata file")?;
            tracing::info!("Pinning metadata {}", item.key());
            Some(item)
        }
        None => None,
    };

    let connect_timeout = config.connect_timeout();
    let api = SubstrateApi::new(BootstrapRequest {
        chain_slug: args.chain.clone(),
        api_url: args.url.clone(),
        config,
        metadata,
    })?;

    let info = tokio::time::timeout(connect_timeout, api.is_ready())
        .await
        .map_err(|_| eyre!("{} not ready after {:?}", args.url, connect_timeout))??;
    println!("{}", serde_json::to_string_pretty(&*info)?);

    if let Some(path) = &args.export_metadata {
        let item = api.export_metadata().await?;
        std::fs::write(path, serde_json::to_string_pretty(&item)?)
            .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Exported metadata {} to {}", item.key(), path.display());
    }

    if let Some(path) = &args.rpc {
        let method = api.rpc_method(path)?;
        let result = method.call(params).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if args.watch {
        watch(&api).await?;
    }

    api.destroy().await?;
    Ok(())
}

/// Log state changes until Ctrl-C. Recovers when the connection turns unstable.
async fn watch(api: &SubstrateApi) -> Result<()> {
    let mut state = api.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, disconnecting");
                return Ok(());
            }
            changed = state.changed() => {
                changed.wrap_err("connection worker stopped")?;
                let snapshot = state.borrow_and_update().clone();
                tracing::info!(
                    "{} {} (retry {})",
                    api.chain_slug(),
                    snapshot.status,
                    snapshot.retry
                );
                if let Some(error) = &snapshot.api_error {
                    tracing::warn!("{}", error);
                }

                if snapshot.status == ConnectionStatus::Unstable {
                    match api.recover_connect().await {
                        Ok(info) => tracing::info!("Recovered {} ({})", info.system_chain, info.spec_version),
                        Err(e) => tracing::error!("Recovery failed: {}", e),
                    }
                }
            }
        }
    }
}
