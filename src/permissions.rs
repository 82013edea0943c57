use crate::pending::PermissionRequest;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ETH_ACCOUNTS: &str = "eth_accounts";

/// EIP-2255 permission object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPermission {
    pub id: String,
    pub parent_capability: String,
    pub invoker: String,
    pub caveats: Vec<Caveat>,
    /// Unix milliseconds.
    pub date: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Caveat {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

/// Per-origin connections and granted permissions. In memory only.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PermissionState {
    connections: BTreeMap<String, Vec<Address>>,
    permissions: BTreeMap<String, Vec<WalletPermission>>,
}

impl PermissionState {
    /// Addresses exposed to `origin`; empty when it never connected.
    pub fn accounts(&self, origin: &str) -> Vec<Address> {
        self.connections.get(origin).cloned().unwrap_or_default()
    }

    /// Whether any origin has been shown `account`.
    pub fn is_connected(&self, account: Address) -> bool {
        self.connections
            .values()
            .any(|accounts| accounts.contains(&account))
    }

    pub fn connect(&mut self, origin: &str, accounts: Vec<Address>) {
        self.connections.insert(origin.to_string(), accounts);
    }

    pub fn permissions(&self, origin: &str) -> Vec<WalletPermission> {
        self.permissions.get(origin).cloned().unwrap_or_default()
    }

    /// Records one permission per requested capability, replacing earlier grants of the
    /// same capability. Granting `eth_accounts` also connects `accounts`.
    pub fn grant(
        &mut self,
        origin: &str,
        request: &PermissionRequest,
        accounts: &[Address],
    ) -> Vec<WalletPermission> {
        let date = now_millis();
        let granted: Vec<WalletPermission> = request
            .keys()
            .map(|capability| WalletPermission {
                id: uuid::Uuid::new_v4().to_string(),
                parent_capability: capability.clone(),
                invoker: origin.to_string(),
                caveats: caveats_for(capability, accounts),
                date,
            })
            .collect();

        let existing = self.permissions.entry(origin.to_string()).or_default();
        existing.retain(|p| !request.contains_key(&p.parent_capability));
        existing.extend(granted.iter().cloned());

        if request.contains_key(ETH_ACCOUNTS) {
            self.connect(origin, accounts.to_vec());
        }
        granted
    }

    /// Drops `origin`'s grants of the named capabilities. Revoking `eth_accounts`
    /// disconnects the origin. Other origins are untouched.
    pub fn revoke(&mut self, origin: &str, request: &PermissionRequest) {
        if let Some(existing) = self.permissions.get_mut(origin) {
            existing.retain(|p| !request.contains_key(&p.parent_capability));
            if existing.is_empty() {
                self.permissions.remove(origin);
            }
        }
        if request.contains_key(ETH_ACCOUNTS) {
            self.connections.remove(origin);
        }
    }
}

fn caveats_for(capability: &str, accounts: &[Address]) -> Vec<Caveat> {
    if capability != ETH_ACCOUNTS {
        return Vec::new();
    }
    vec![Caveat {
        kind: "restrictReturnedAccounts".into(),
        value: json!(accounts),
    }]
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
