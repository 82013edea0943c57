use crate::jsonrpc::{JsonRpcResponse, RequestId};
use crate::pending::PendingRequest;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROVIDER_NAME: &str = "wen";
pub const PROVIDER_RDNS: &str = "sh.scope.wen";
const PROVIDER_ICON: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0iaHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmciIHZpZXdCb3g9IjAgMCAzMiAzMiI+PHJlY3Qgd2lkdGg9IjMyIiBoZWlnaHQ9IjMyIiByeD0iOCIvPjwvc3ZnPg==";

/// The approval surface. Called synchronously when a request is parked and when the
/// slot is cleared, so implementations must not block.
pub trait ApprovalUi: Send + Sync {
    fn request_shown(&self, request: &PendingRequest);

    fn request_closed(&self, _id: &RequestId) {}
}

/// Page-facing side of the connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, response: JsonRpcResponse) -> Result<()>;

    /// Out-of-band event (provider announcement, state change).
    async fn notify(&self, event: Value) -> Result<()>;
}

/// EIP-6963 provider info.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl ProviderInfo {
    /// A new instance id on every call.
    pub fn new() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: PROVIDER_NAME.to_string(),
            icon: PROVIDER_ICON.to_string(),
            rdns: PROVIDER_RDNS.to_string(),
        }
    }
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self::new()
    }
}
