//! Error types for chain operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Failed to connect to chain: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Subxt error: {0}")]
    Subxt(#[from] subxt::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] subxt::error::DecodeError),

    #[error("Codec error: {0}")]
    Codec(#[from] parity_scale_codec::Error),

    #[error("Light client error: {0}")]
    LightClient(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Client not ready: {0}")]
    NotReady(String),

    #[error("Unknown api: {0}")]
    UnknownApi(String),

    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("Path has {got} segments, expected {expected}")]
    IncompletePath { expected: usize, got: usize },

    #[error("Value does not fit in {0}")]
    Overflow(&'static str),
}

impl From<subxt_rpcs::Error> for ChainError {
    fn from(err: subxt_rpcs::Error) -> Self {
        ChainError::Rpc(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::InvalidData(err.to_string())
    }
}
