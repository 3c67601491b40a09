//! Per-chain backend options and light client chain specs.
//!
//! Chains outside every group get the defaults: metadata from the legacy
//! client, no extra RPC methods, no extra signed extensions.

use chainconn_core::{ChainGroup, ChainGroups};

use crate::backend::BackendKind;

/// Extra signed data some chains require on every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedExtension {
    /// Avail application id, compact-encoded.
    CheckAppId,
}

impl SignedExtension {
    pub fn identifier(&self) -> &'static str {
        match self {
            SignedExtension::CheckAppId => "CheckAppId",
        }
    }
}

/// Construction options for the backends of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOptions {
    pub group: Option<ChainGroup>,
    /// Backend whose connection events and metadata are authoritative.
    pub canonical: BackendKind,
    /// RPC methods registered on top of what the node reports.
    pub extra_rpc: &'static [&'static str],
    pub signed_extensions: &'static [SignedExtension],
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            group: None,
            canonical: BackendKind::Legacy,
            extra_rpc: &[],
            signed_extensions: &[],
        }
    }
}

const ACALA_RPC: &[&str] = &["evm_call", "evm_estimateResources"];

const TURING_RPC: &[&str] = &[
    "automationTime_generateTaskId",
    "automationTime_getTimeAutomationFees",
    "automationTime_queryFeeDetails",
];

const AVAIL_EXTENSIONS: &[SignedExtension] = &[SignedExtension::CheckAppId];

/// Resolve backend options for a chain.
pub fn api_options(chain_slug: &str, groups: &ChainGroups) -> ApiOptions {
    match groups.group_of(chain_slug) {
        Some(ChainGroup::Acala) => ApiOptions {
            group: Some(ChainGroup::Acala),
            extra_rpc: ACALA_RPC,
            ..Default::default()
        },
        Some(ChainGroup::Turing) => ApiOptions {
            group: Some(ChainGroup::Turing),
            extra_rpc: TURING_RPC,
            ..Default::default()
        },
        Some(group @ (ChainGroup::Avail | ChainGroup::Goldberg)) => ApiOptions {
            group: Some(group),
            canonical: BackendKind::Dynamic,
            extra_rpc: &[],
            signed_extensions: AVAIL_EXTENSIONS,
        },
        None => ApiOptions::default(),
    }
}

/// Get the relay chain spec URL for a light client chain name.
///
/// Accepts the names used by well-known light client URLs
/// (`polkadot`, `ksmcc3`, `westend2`, `paseo`) as well as plain network names.
pub fn light_client_spec_url(chain: &str) -> Option<&'static str> {
    match chain {
        "polkadot" => Some(
            "https://raw.githubusercontent.com/paritytech/subxt/master/artifacts/demo_chain_specs/polkadot.json",
        ),
        "ksmcc3" | "kusama" => {
            Some("https://raw.githubusercontent.com/nickvntaele/chainspecs/main/kusama.json")
        }
        "westend2" | "westend" => {
            Some("https://raw.githubusercontent.com/nickvntaele/chainspecs/main/westend.json")
        }
        "paseo" => Some("https://raw.githubusercontent.com/nickvntaele/chainspecs/main/paseo.json"),
        _ => None,
    }
}
