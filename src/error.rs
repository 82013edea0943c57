use crate::jsonrpc::JsonRpcError;
use crate::pending::RequestKind;
use serde_json::json;

// EIP-1193 provider errors
const USER_REJECTED: i64 = 4001;
const UNAUTHORIZED: i64 = 4100;
const UNSUPPORTED_METHOD: i64 = 4200;
// EIP-5792
const UNSUPPORTED_CHAIN: i64 = 5710;
// JSON-RPC / EIP-1474
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const RESOURCE_UNAVAILABLE: i64 = -32002;
const TRANSACTION_REJECTED: i64 = -32003;
// ERC-4337
const PAYMASTER_REJECTED: i64 = -32501;

pub type WalletResult<T> = Result<T, WalletError>;

/// Errors reported to the page (or the UI) by the broker and the operation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("User denied {0} request")]
    UserDenied(RequestKind),
    #[error("No account configured")]
    NoAccount,
    #[error("Insufficient funds for intrinsic gas")]
    LowFunds,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("Account is not connected: {0}")]
    AccountNotConnected(String),
    #[error("Calls are empty")]
    EmptyBatch,
    #[error("Another request is already pending approval")]
    RequestPending,
    #[error("Approval request timed out")]
    Timeout,
    #[error("Paymaster error: {0:#}")]
    Paymaster(anyhow::Error),
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Execution failed: {0}")]
    Unknown(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WalletError {
    pub fn code(&self) -> i64 {
        match self {
            WalletError::UserDenied(_) | WalletError::Timeout => USER_REJECTED,
            WalletError::NoAccount | WalletError::AccountNotConnected(_) => UNAUTHORIZED,
            WalletError::UnsupportedMethod(_) => UNSUPPORTED_METHOD,
            WalletError::UnsupportedChain(_) => UNSUPPORTED_CHAIN,
            WalletError::UnsupportedVersion(_)
            | WalletError::EmptyBatch
            | WalletError::InvalidParams(_) => INVALID_PARAMS,
            WalletError::RequestPending => RESOURCE_UNAVAILABLE,
            WalletError::LowFunds => TRANSACTION_REJECTED,
            WalletError::Paymaster(_) => PAYMASTER_REJECTED,
            WalletError::Unknown(_) | WalletError::Internal(_) => INTERNAL_ERROR,
        }
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        let data = match self {
            WalletError::Timeout => Some(json!({ "reason": "timeout" })),
            _ => None,
        };
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

pub(crate) fn invalid_params(msg: impl Into<String>) -> WalletError {
    WalletError::InvalidParams(msg.into())
}
