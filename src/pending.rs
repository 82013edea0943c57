use crate::jsonrpc::RequestId;
use ethers::types::{transaction::eip712::TypedData, Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Who is asking: the page origin and its favicon, as reported by the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub origin: Option<String>,
    pub icon: Option<String>,
}

impl Caller {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: Some(origin.to_string()),
            icon: None,
        }
    }
}

/// `eth_sendTransaction` parameter object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    #[serde(default)]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub nonce: Option<U256>,
}

/// `wallet_requestPermissions` / `wallet_revokePermissions` parameter: capability name to caveats.
pub type PermissionRequest = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletCall {
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub data: Option<Bytes>,
}

/// `wallet_sendCalls` parameter object (EIP-5792 v1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBatch {
    pub version: String,
    pub chain_id: String,
    pub from: Address,
    pub calls: Vec<WalletCall>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

impl CallBatch {
    /// `capabilities[chainId].paymasterService`, when the page asked for sponsorship.
    pub fn paymaster_service(&self, chain_hex: &str) -> Option<PaymasterService> {
        let svc = self
            .capabilities
            .as_ref()?
            .get(chain_hex)?
            .get("paymasterService")?;
        serde_json::from_value(svc.clone()).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymasterService {
    pub url: String,
    #[serde(default)]
    pub context: Option<Value>,
}

/// EIP-5792 v1 status of a submitted batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallsStatus {
    Pending,
    Confirmed { receipts: Vec<Value> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    AccountAccess,
    PersonalSign,
    SendTransaction,
    RequestPermissions,
    SignTypedData,
    SendCalls,
    ShowCallsStatus,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::AccountAccess => "connection",
            RequestKind::PersonalSign => "personal sign",
            RequestKind::SendTransaction => "transaction",
            RequestKind::RequestPermissions => "permission",
            RequestKind::SignTypedData => "typed data sign",
            RequestKind::SendCalls => "wallet send calls",
            RequestKind::ShowCallsStatus => "calls status",
        })
    }
}

/// What the page is waiting on.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    AccountAccess,
    PersonalSign { message: Bytes },
    SendTransaction { transaction: TransactionRequest },
    RequestPermissions { request: PermissionRequest },
    SignTypedData { payload: Box<TypedData> },
    SendCalls { batch: CallBatch },
    ShowCallsStatus { status: CallsStatus },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::AccountAccess => RequestKind::AccountAccess,
            RequestPayload::PersonalSign { .. } => RequestKind::PersonalSign,
            RequestPayload::SendTransaction { .. } => RequestKind::SendTransaction,
            RequestPayload::RequestPermissions { .. } => RequestKind::RequestPermissions,
            RequestPayload::SignTypedData { .. } => RequestKind::SignTypedData,
            RequestPayload::SendCalls { .. } => RequestKind::SendCalls,
            RequestPayload::ShowCallsStatus { .. } => RequestKind::ShowCallsStatus,
        }
    }
}

/// The single request awaiting a user decision.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PendingRequest {
    pub id: RequestId,
    pub caller: Caller,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

impl PendingRequest {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

/// The UI's answer to a pending request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow(Approval),
    Deny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Approval {
    /// Approve as shown. For account access this exposes the wallet's own addresses.
    #[default]
    Confirm,
    /// Approve account access exposing exactly these addresses.
    Accounts(Vec<Address>),
}
