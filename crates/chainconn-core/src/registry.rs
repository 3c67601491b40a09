//! Chain properties and the registry shared between a connection and its callers.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use crate::types::{DEFAULT_SS58_PREFIX, DEFAULT_TOKEN_DECIMALS, DEFAULT_TOKEN_SYMBOL};

/// Normalized chain properties consumed by formatting and display logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProperties {
    pub ss58_format: u16,
    /// One entry per token, native token first.
    pub token_decimals: Vec<u32>,
    /// One entry per token, native token first.
    pub token_symbol: Vec<String>,
}

impl Default for ChainProperties {
    fn default() -> Self {
        Self {
            ss58_format: DEFAULT_SS58_PREFIX,
            token_decimals: vec![DEFAULT_TOKEN_DECIMALS],
            token_symbol: vec![DEFAULT_TOKEN_SYMBOL.to_string()],
        }
    }
}

impl ChainProperties {
    /// Native token decimals.
    pub fn decimals(&self) -> u32 {
        self.token_decimals
            .first()
            .copied()
            .unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }

    /// Native token symbol.
    pub fn symbol(&self) -> &str {
        self.token_symbol
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_TOKEN_SYMBOL)
    }
}

/// Thread-safe holder for the properties of one chain.
///
/// Cloning shares the same underlying slot.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    inner: Arc<RwLock<Option<ChainProperties>>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chain_properties(&self, properties: ChainProperties) {
        match self.inner.write() {
            Ok(mut slot) => *slot = Some(properties),
            Err(poisoned) => *poisoned.into_inner() = Some(properties),
        }
    }

    /// Properties set by the last successful metadata fill, if any.
    pub fn chain_properties(&self) -> Option<ChainProperties> {
        match self.inner.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn chain_ss58(&self) -> u16 {
        self.chain_properties()
            .map(|p| p.ss58_format)
            .unwrap_or(DEFAULT_SS58_PREFIX)
    }

    pub fn chain_decimals(&self) -> Vec<u32> {
        self.chain_properties().unwrap_or_default().token_decimals
    }

    pub fn chain_tokens(&self) -> Vec<String> {
        self.chain_properties().unwrap_or_default().token_symbol
    }

    pub fn clear(&self) {
        match self.inner.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}
