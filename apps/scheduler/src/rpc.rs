use alloy::primitives::{Address, B256, U256};
use alloy::transports::{RpcError, TransportErrorKind};
use serde::Deserialize;
use thiserror::Error;

/// Failure surface shared by the chain and bundler clients. `Rpc` carries the
/// JSON-RPC error object's `data` field verbatim; bundlers use it to signal
/// entry-point validation failures (AA2x codes and revert payloads).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),
    #[error("rpc transport: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}{}", .data.as_deref().map(|d| format!(" (data: {d})")).unwrap_or_default())]
    Rpc {
        code: i64,
        message: String,
        data: Option<String>,
    },
    #[error("malformed rpc response: {0}")]
    Decode(String),
    #[error("request encoding: {0}")]
    Encode(String),
    #[error("timed out waiting for user operation receipt")]
    ReceiptTimeout,
    #[error("cancelled")]
    Cancelled,
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        match err {
            RpcError::ErrorResp(payload) => ClientError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
                data: payload.data.map(|d| d.get().to_string()),
            },
            RpcError::SerError(e) => ClientError::Encode(e.to_string()),
            RpcError::DeserError { err, .. } => ClientError::Decode(err.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<alloy::contract::Error> for ClientError {
    fn from(err: alloy::contract::Error) -> Self {
        match err {
            alloy::contract::Error::TransportError(e) => e.into(),
            other => ClientError::Decode(other.to_string()),
        }
    }
}

/// Result of `eth_estimateUserOperationGas`. The paymaster limits are only
/// present when the op carries a paymaster.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// Result of `eth_getUserOperationReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: B256,
    #[serde(default)]
    pub entry_point: Option<Address>,
    #[serde(default)]
    pub sender: Option<Address>,
    #[serde(default)]
    pub nonce: Option<U256>,
    pub success: bool,
    #[serde(default)]
    pub actual_gas_cost: Option<U256>,
    #[serde(default)]
    pub actual_gas_used: Option<U256>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Current fee-market snapshot: the latest block's base fee plus the
/// bundler's priority-fee suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub base_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}
