//! Chain metadata filler.
//!
//! Runs once both backends are ready: reads the chain's identity and
//! properties from the canonical backend, normalizes them and writes the
//! shared registry.

use chainconn_core::{
    ApiInfo, ChainProperties, ChainRegistry, DEFAULT_SS58_PREFIX, DEFAULT_TOKEN_DECIMALS,
    DEFAULT_TOKEN_SYMBOL, DefaultFormatBalance, MetadataItem,
};
use serde::Deserialize;

use crate::backend::Backend;
use crate::error::ChainError;

/// `state_getRuntimeVersion` reply, fields we use.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RuntimeVersionReply {
    #[serde(default)]
    pub spec_name: String,
    pub spec_version: u32,
    #[serde(default)]
    pub transaction_version: u32,
}

/// Chains report either one value or one per token.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// `system_properties` reply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProperties {
    #[serde(alias = "ss58Prefix")]
    ss58_format: Option<u16>,
    token_decimals: Option<OneOrMany<u32>>,
    token_symbol: Option<OneOrMany<String>>,
}

/// Normalize a `system_properties` reply.
///
/// SS58 comes from the properties, then `ss58_fallback`, then the generic
/// prefix. Missing or empty decimals and symbols get single-token defaults.
pub fn normalize_properties(
    raw: &serde_json::Value,
    ss58_fallback: Option<u16>,
) -> Result<ChainProperties, ChainError> {
    let raw: RawProperties = if raw.is_null() {
        RawProperties::default()
    } else {
        serde_json::from_value(raw.clone())?
    };

    let token_decimals = raw
        .token_decimals
        .map(OneOrMany::into_vec)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_TOKEN_DECIMALS]);

    let token_symbol = raw
        .token_symbol
        .map(OneOrMany::into_vec)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_TOKEN_SYMBOL.to_string()]);

    Ok(ChainProperties {
        ss58_format: raw
            .ss58_format
            .or(ss58_fallback)
            .unwrap_or(DEFAULT_SS58_PREFIX),
        token_decimals,
        token_symbol,
    })
}

async fn rpc_string(backend: &dyn Backend, method: &str) -> Result<String, ChainError> {
    let value = backend.rpc(method, Vec::new()).await?;
    serde_json::from_value(value)
        .map_err(|e| ChainError::InvalidData(format!("{} returned {}", method, e)))
}

/// SS58 prefix from the `System::SS58Prefix` constant, if the backend has it.
async fn ss58_constant(backend: &dyn Backend) -> Option<u16> {
    match backend.constant("System", "SS58Prefix").await {
        Ok(value) => value.as_u128().and_then(|v| u16::try_from(v).ok()),
        Err(e) => {
            tracing::debug!("No SS58Prefix constant: {}", e);
            None
        }
    }
}

/// Query identity and properties from `backend`, write them to `registry`
/// and return the assembled [`ApiInfo`].
pub async fn fill_api_info(
    backend: &dyn Backend,
    chain_slug: &str,
    registry: &ChainRegistry,
) -> Result<ApiInfo, ChainError> {
    let version: RuntimeVersionReply =
        serde_json::from_value(backend.rpc("state_getRuntimeVersion", Vec::new()).await?)?;

    let (system_chain, system_name, system_version) = futures::try_join!(
        rpc_string(backend, "system_chain"),
        rpc_string(backend, "system_name"),
        rpc_string(backend, "system_version"),
    )?;

    let raw_properties = backend.rpc("system_properties", Vec::new()).await?;
    let has_ss58 = raw_properties
        .get("ss58Format")
        .or_else(|| raw_properties.get("ss58Prefix"))
        .is_some_and(|v| !v.is_null());
    let ss58_fallback = if has_ss58 {
        None
    } else {
        ss58_constant(backend).await
    };
    let properties = normalize_properties(&raw_properties, ss58_fallback)?;

    registry.set_chain_properties(properties.clone());

    tracing::info!(
        "{}: {} {} v{} (ss58 {}, {} {})",
        chain_slug,
        system_chain,
        version.spec_name,
        version.spec_version,
        properties.ss58_format,
        properties.decimals(),
        properties.symbol()
    );

    Ok(ApiInfo {
        chain_slug: chain_slug.to_string(),
        spec_name: version.spec_name,
        spec_version: version.spec_version.to_string(),
        system_chain,
        system_name,
        system_version,
        default_format_balance: DefaultFormatBalance {
            decimals: properties.token_decimals.clone(),
            unit: properties.symbol().to_string(),
        },
        properties,
    })
}

/// Decode a `0x`-prefixed hex string, checking its length when `len` is set.
pub(crate) fn decode_hex(what: &str, value: &str, len: Option<usize>) -> Result<Vec<u8>, ChainError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::InvalidData(format!("{} is not 0x-prefixed: {}", what, value)))?;
    let bytes = hex::decode(digits)
        .map_err(|e| ChainError::InvalidData(format!("Invalid {} hex: {}", what, e)))?;
    match len {
        Some(len) if bytes.len() != len => Err(ChainError::InvalidData(format!(
            "{} has {} bytes, expected {}",
            what,
            bytes.len(),
            len
        ))),
        _ => Ok(bytes),
    }
}

/// Snapshot the runtime `backend` is connected to: genesis hash, spec
/// version and SCALE-encoded metadata, ready to pin on a later connect.
pub async fn export_metadata(backend: &dyn Backend) -> Result<MetadataItem, ChainError> {
    let genesis_hash: String = serde_json::from_value(
        backend
            .rpc("chain_getBlockHash", vec![serde_json::json!(0)])
            .await?,
    )?;
    decode_hex("genesis hash", &genesis_hash, Some(32))?;

    let version: RuntimeVersionReply =
        serde_json::from_value(backend.rpc("state_getRuntimeVersion", Vec::new()).await?)?;

    let hex_value = rpc_string(backend, "state_getMetadata").await?;
    let metadata = decode_hex("metadata", &hex_value, None)?;

    tracing::debug!(
        "Exported metadata {}-{} ({} bytes)",
        genesis_hash,
        version.spec_version,
        metadata.len()
    );

    Ok(MetadataItem {
        genesis_hash: genesis_hash.to_lowercase(),
        spec_version: version.spec_version,
        hex_value,
    })
}
