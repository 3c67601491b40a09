//! Core domain types for chain connections.

use serde::{Deserialize, Serialize};

use crate::registry::ChainProperties;

/// Default SS58 prefix (generic Substrate).
pub const DEFAULT_SS58_PREFIX: u16 = 42;

/// Default token decimals when the chain reports none.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 12;

/// Default token symbol when the chain reports none.
pub const DEFAULT_TOKEN_SYMBOL: &str = "UNIT";

/// Externally observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Too many consecutive drops. Left only through an explicit recovery.
    Unstable,
}

impl ConnectionStatus {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Disconnected, Unstable)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Unstable)
                | (Unstable, Disconnected)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Get display label.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Unstable => "Unstable",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Snapshot of a connection, published on every change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive disconnects since the last successful connect.
    pub retry: u32,
    pub api_url: String,
    pub use_light_client: bool,
    /// Message of the last failed readiness step, if any.
    pub api_error: Option<String>,
}

impl ConnectionState {
    pub fn new(api_url: impl Into<String>, use_light_client: bool) -> Self {
        Self {
            api_url: api_url.into(),
            use_light_client,
            ..Default::default()
        }
    }

    /// Apply a status change if the edge is allowed. Returns whether the status changed.
    pub fn transition(&mut self, next: ConnectionStatus) -> bool {
        if self.status == next || !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

/// A previously downloaded runtime metadata blob, pinned to one runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    /// Genesis hash, 0x-prefixed hex.
    pub genesis_hash: String,
    pub spec_version: u32,
    /// SCALE-encoded metadata, 0x-prefixed hex.
    pub hex_value: String,
}

impl MetadataItem {
    /// Cache key in the `{genesis}-{specVersion}` form.
    pub fn key(&self) -> String {
        format!("{}-{}", self.genesis_hash, self.spec_version)
    }
}

/// Default formatting hints for balances on this chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultFormatBalance {
    pub decimals: Vec<u32>,
    pub unit: String,
}

/// Chain identity and properties gathered once a connection is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiInfo {
    pub chain_slug: String,
    pub spec_name: String,
    pub spec_version: String,
    pub system_chain: String,
    pub system_name: String,
    pub system_version: String,
    pub properties: ChainProperties,
    pub default_format_balance: DefaultFormatBalance,
}
