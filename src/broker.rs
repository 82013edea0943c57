use crate::bundler::{BundlerApi, BundlerClient};
use crate::chain::{ChainClient, RpcChain};
use crate::config::WalletConfig;
use crate::delegation::{DelegationError, DelegationManager};
use crate::encoding::{fmt_address, fmt_bytes, fmt_h256, parse_bytes, parse_h256, parse_u256_quantity};
use crate::error::{invalid_params, WalletError, WalletResult};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::pending::{
    Approval, CallBatch, Caller, Decision, PendingRequest, PermissionRequest, RequestKind,
    RequestPayload, TransactionRequest,
};
use crate::permissions::{PermissionState, WalletPermission};
use crate::pipeline::Pipeline;
use crate::signer::SigningBackend;
use crate::storage::SecretStore;
use crate::transport::ApprovalUi;
use anyhow::{anyhow, bail, Context};
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

struct ActiveRequest {
    request: PendingRequest,
    resolver: oneshot::Sender<Decision>,
}

#[derive(Default)]
struct ProviderState {
    active: Option<ActiveRequest>,
    permissions: PermissionState,
}

/// What the UI renders: the parked request plus per-origin state.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub active_request: Option<PendingRequest>,
    #[serde(flatten)]
    pub permissions: PermissionState,
}

/// Accepts EIP-1193 calls from untrusted pages and routes every sensitive one through a
/// single approval slot.
pub struct Broker {
    config: Arc<WalletConfig>,
    signer: SigningBackend,
    pipeline: Arc<Pipeline>,
    delegation: DelegationManager,
    ui: Arc<dyn ApprovalUi>,
    state: Mutex<ProviderState>,
}

impl Broker {
    pub fn new(
        config: Arc<WalletConfig>,
        chain: Arc<dyn ChainClient>,
        bundler: Arc<dyn BundlerApi>,
        store: Arc<dyn SecretStore>,
        ui: Arc<dyn ApprovalUi>,
    ) -> Self {
        let signer = SigningBackend::new(store, config.chain_id);
        let pipeline = Pipeline::new(config.clone(), chain.clone(), bundler, signer.clone());
        Self::with_pipeline(config, Arc::new(pipeline), ui)
    }

    pub fn with_pipeline(
        config: Arc<WalletConfig>,
        pipeline: Arc<Pipeline>,
        ui: Arc<dyn ApprovalUi>,
    ) -> Self {
        let signer = pipeline.signer().clone();
        let delegation =
            DelegationManager::new(pipeline.chain().clone(), signer.clone(), config.clone());
        Self {
            config,
            signer,
            pipeline,
            delegation,
            ui,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Broker over the configured node and bundler. Refuses to start when the node
    /// reports a different chain than the config.
    pub async fn connect(
        config: WalletConfig,
        store: Arc<dyn SecretStore>,
        ui: Arc<dyn ApprovalUi>,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .context("invalid rpc url")?
            .interval(config.receipt_poll);
        let chain = Arc::new(RpcChain::new(Arc::new(provider), config.receipt_poll));

        let remote_chain_id = chain.chain_id().await?;
        if remote_chain_id != config.chain_id {
            bail!(
                "RPC chainId mismatch: config expects {}, but RPC reports {}. Refusing to run.",
                config.chain_id,
                remote_chain_id
            );
        }

        let bundler = Arc::new(BundlerClient::new(config.bundler_url.clone()));
        match bundler.supported_entry_points().await {
            Ok(entry_points) if !entry_points.contains(&config.entry_point) => {
                tracing::warn!(
                    entry_point = %fmt_address(config.entry_point),
                    "bundler does not list the configured entry point"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "could not query bundler entry points"),
        }

        Ok(Self::new(Arc::new(config), chain, bundler, store, ui))
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn delegation(&self) -> &DelegationManager {
        &self.delegation
    }

    fn lock_state(&self) -> MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs one page call to completion, including any wait for the user.
    pub async fn handle(&self, caller: &Caller, request: &JsonRpcRequest) -> WalletResult<Value> {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| RequestId::String(uuid::Uuid::new_v4().to_string()));
        tracing::debug!(id = %id, method = %request.method, origin = ?caller.origin, "inbound call");

        match request.method.as_str() {
            "eth_chainId" => Ok(json!(self.config.chain_hex())),
            "eth_accounts" => {
                let accounts = match caller.origin.as_deref() {
                    Some(origin) => self.lock_state().permissions.accounts(origin),
                    None => Vec::new(),
                };
                Ok(addresses_json(&accounts))
            }
            "eth_requestAccounts" => {
                require_origin(caller)?;
                self.suspend(id, caller, RequestPayload::AccountAccess).await
            }
            "personal_sign" => {
                let message = parse_personal_message(request.param(0))?;
                self.suspend(id, caller, RequestPayload::PersonalSign { message })
                    .await
            }
            "eth_sendTransaction" => {
                let transaction: TransactionRequest = param(request, 0, "transaction")?;
                if let Some(from) = transaction.from {
                    if !self.signer.addresses()?.contains(&from) {
                        return Err(WalletError::AccountNotConnected(fmt_address(from)));
                    }
                }
                self.suspend(id, caller, RequestPayload::SendTransaction { transaction })
                    .await
            }
            "eth_signTypedData_v4" => {
                let payload = parse_typed_data(request.param(1))?;
                self.suspend(
                    id,
                    caller,
                    RequestPayload::SignTypedData {
                        payload: Box::new(payload),
                    },
                )
                .await
            }
            "wallet_getPermissions" => {
                let origin = require_origin(caller)?;
                let permissions = self.lock_state().permissions.permissions(origin);
                Ok(json!(permissions))
            }
            "wallet_requestPermissions" => {
                require_origin(caller)?;
                let request: PermissionRequest = param(request, 0, "permission request")?;
                if request.is_empty() {
                    return Err(invalid_params("no permissions requested"));
                }
                self.suspend(id, caller, RequestPayload::RequestPermissions { request })
                    .await
            }
            "wallet_revokePermissions" => {
                let origin = require_origin(caller)?;
                let request: PermissionRequest = param(request, 0, "permission request")?;
                self.lock_state().permissions.revoke(origin, &request);
                tracing::info!(origin, capabilities = ?request.keys().collect::<Vec<_>>(), "permissions revoked");
                Ok(Value::Null)
            }
            "wallet_getCapabilities" => {
                let account: Address = param(request, 0, "account")?;
                self.capabilities(account).await
            }
            "wallet_sendCalls" => {
                let batch: CallBatch = param(request, 0, "call batch")?;
                self.check_batch(&batch)?;
                self.suspend(id, caller, RequestPayload::SendCalls { batch })
                    .await
            }
            "wallet_getCallsStatus" => {
                let op_hash = op_hash_param(request)?;
                let status = self.pipeline.calls_status(op_hash).await?;
                Ok(json!(status))
            }
            "wallet_showCallsStatus" => {
                let op_hash = op_hash_param(request)?;
                self.ensure_idle()?;
                let status = self.pipeline.calls_status(op_hash).await?;
                self.suspend(id, caller, RequestPayload::ShowCallsStatus { status })
                    .await
            }
            other => Err(WalletError::UnsupportedMethod(other.to_string())),
        }
    }

    /// [`Broker::handle`] wrapped in a JSON-RPC envelope carrying the caller's id.
    pub async fn respond(&self, caller: &Caller, request: JsonRpcRequest) -> JsonRpcResponse {
        match self.handle(caller, &request).await {
            Ok(result) => JsonRpcResponse::result(request.id, result),
            Err(err) => {
                if !matches!(err, WalletError::UserDenied(_)) {
                    tracing::warn!(method = %request.method, code = err.code(), error = %err, "call failed");
                }
                JsonRpcResponse::error(request.id, err.to_rpc_error())
            }
        }
    }

    fn ensure_idle(&self) -> WalletResult<()> {
        match &self.lock_state().active {
            Some(active) => {
                tracing::warn!(pending = %active.request.id, "rejecting call while another request is pending");
                Err(WalletError::RequestPending)
            }
            None => Ok(()),
        }
    }

    /// Parks `payload` in the approval slot and waits for the user's decision.
    async fn suspend(
        &self,
        id: RequestId,
        caller: &Caller,
        payload: RequestPayload,
    ) -> WalletResult<Value> {
        let kind = payload.kind();
        let request = PendingRequest {
            id: id.clone(),
            caller: caller.clone(),
            payload,
        };

        let rx = {
            let mut state = self.lock_state();
            if let Some(active) = &state.active {
                tracing::warn!(id = %id, pending = %active.request.id, "rejecting call while another request is pending");
                return Err(WalletError::RequestPending);
            }
            let (tx, rx) = oneshot::channel();
            state.active = Some(ActiveRequest {
                request: request.clone(),
                resolver: tx,
            });
            rx
        };
        let mut slot = SlotGuard {
            broker: self,
            id: &id,
            armed: true,
        };

        tracing::info!(id = %id, kind = %kind, origin = ?caller.origin, "request parked");
        self.ui.request_shown(&request);

        let decision = self.wait_for_decision(&id, rx).await;
        slot.armed = false;

        match decision? {
            Decision::Deny if kind == RequestKind::ShowCallsStatus => Ok(Value::Null),
            Decision::Deny => {
                tracing::info!(id = %id, kind = %kind, "request denied");
                Err(WalletError::UserDenied(kind))
            }
            Decision::Allow(approval) => {
                tracing::info!(id = %id, kind = %kind, "request approved");
                self.execute(caller, request.payload, approval).await
            }
        }
    }

    async fn wait_for_decision(
        &self,
        id: &RequestId,
        mut rx: oneshot::Receiver<Decision>,
    ) -> WalletResult<Decision> {
        let closed = || WalletError::Internal(anyhow!("approval channel closed"));
        let Some(timeout) = self.config.approval_timeout else {
            return rx.await.map_err(|_| closed());
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(decision) => decision.map_err(|_| closed()),
            Err(_) => {
                if self.clear_slot(id) {
                    tracing::warn!(id = %id, "approval timed out");
                    return Err(WalletError::Timeout);
                }
                // resolve() already took the slot; its send is about to land
                rx.await.map_err(|_| closed())
            }
        }
    }

    /// Clears the slot when it still holds `id`.
    fn clear_slot(&self, id: &RequestId) -> bool {
        let cleared = {
            let mut state = self.lock_state();
            let holds_id = state
                .active
                .as_ref()
                .map(|active| &active.request.id == id)
                .unwrap_or(false);
            if holds_id {
                state.active = None;
            }
            holds_id
        };
        if cleared {
            self.ui.request_closed(id);
        }
        cleared
    }

    /// Approves the pending request `id`. Returns `false` (and changes nothing) when `id`
    /// is not the live request.
    pub fn allow(&self, id: &RequestId, approval: Approval) -> bool {
        self.resolve(id, Decision::Allow(approval))
    }

    pub fn deny(&self, id: &RequestId) -> bool {
        self.resolve(id, Decision::Deny)
    }

    fn resolve(&self, id: &RequestId, decision: Decision) -> bool {
        let active = {
            let mut state = self.lock_state();
            let holds_id = state
                .active
                .as_ref()
                .map(|active| &active.request.id == id)
                .unwrap_or(false);
            if holds_id {
                state.active.take()
            } else {
                None
            }
        };

        match active {
            Some(active) => {
                self.ui.request_closed(id);
                active.resolver.send(decision).is_ok()
            }
            None => {
                tracing::warn!(id = %id, "ignoring decision for a request that is not pending");
                false
            }
        }
    }

    async fn execute(
        &self,
        caller: &Caller,
        payload: RequestPayload,
        approval: Approval,
    ) -> WalletResult<Value> {
        match payload {
            RequestPayload::AccountAccess => {
                let origin = require_origin(caller)?;
                let accounts = match approval {
                    Approval::Accounts(accounts) => accounts,
                    Approval::Confirm => self.signer.addresses()?,
                };
                if accounts.is_empty() {
                    return Err(WalletError::NoAccount);
                }
                self.lock_state()
                    .permissions
                    .connect(origin, accounts.clone());
                tracing::info!(origin, accounts = accounts.len(), "origin connected");
                Ok(addresses_json(&accounts))
            }
            RequestPayload::PersonalSign { message } => {
                let sig = self.signer.personal_sign(&message).await?;
                Ok(json!(signature_hex(&sig)))
            }
            RequestPayload::SendTransaction { transaction } => {
                let hash = self.pipeline.submit_transaction(&transaction).await?;
                Ok(json!(fmt_h256(hash)))
            }
            RequestPayload::RequestPermissions { request } => {
                let origin = require_origin(caller)?;
                let accounts = self.signer.addresses()?;
                let granted: Vec<WalletPermission> =
                    self.lock_state()
                        .permissions
                        .grant(origin, &request, &accounts);
                tracing::info!(origin, granted = granted.len(), "permissions granted");
                Ok(json!(granted))
            }
            RequestPayload::SignTypedData { payload } => {
                let sig = self.signer.sign_typed_data(&payload).await?;
                Ok(json!(signature_hex(&sig)))
            }
            RequestPayload::SendCalls { batch } => {
                let op_hash = self.pipeline.send_calls(&batch).await?;
                Ok(json!(fmt_h256(op_hash)))
            }
            RequestPayload::ShowCallsStatus { .. } => Ok(Value::Null),
        }
    }

    /// `wallet_sendCalls` preconditions, checked before anything is parked.
    fn check_batch(&self, batch: &CallBatch) -> WalletResult<()> {
        if batch.version != "1.0" {
            return Err(WalletError::UnsupportedVersion(batch.version.clone()));
        }
        let chain_matches = parse_u256_quantity(&batch.chain_id)
            .map(|id| id == U256::from(self.config.chain_id))
            .unwrap_or(false);
        if !chain_matches {
            return Err(WalletError::UnsupportedChain(batch.chain_id.clone()));
        }
        let connected = self.lock_state().permissions.is_connected(batch.from);
        if !connected || !self.signer.addresses()?.contains(&batch.from) {
            return Err(WalletError::AccountNotConnected(fmt_address(batch.from)));
        }
        if batch.calls.is_empty() {
            return Err(WalletError::EmptyBatch);
        }
        if batch.calls.iter().any(|call| call.to.is_none()) {
            return Err(invalid_params("Create transactions are not supported"));
        }
        Ok(())
    }

    /// EIP-5792 capabilities: only the wallet's own account, and only while it delegates
    /// to the known smart-account implementation.
    async fn capabilities(&self, account: Address) -> WalletResult<Value> {
        if !self.signer.addresses()?.contains(&account) {
            return Ok(json!({}));
        }
        match self.delegation.delegation_status(account).await? {
            Some(target) if target == self.config.account_implementation => Ok(json!({
                self.config.chain_hex(): {
                    "atomicBatch": { "supported": true },
                    "paymasterService": { "supported": true }
                }
            })),
            _ => Ok(json!({})),
        }
    }

    pub fn provider_state(&self) -> ProviderSnapshot {
        let state = self.lock_state();
        ProviderSnapshot {
            active_request: state.active.as_ref().map(|active| active.request.clone()),
            permissions: state.permissions.clone(),
        }
    }

    pub fn wallet_address(&self) -> WalletResult<Option<Address>> {
        Ok(self.signer.addresses()?.first().copied())
    }

    /// Replaces (or with `None` clears) the stored recovery phrase. An invalid phrase
    /// leaves the previous one in place.
    pub fn set_mnemonic(&self, phrase: Option<String>) -> WalletResult<Option<Address>> {
        let store = self.signer.store();
        let previous = store.load_mnemonic()?;
        store.save_mnemonic(phrase)?;
        match self.wallet_address() {
            Ok(address) => {
                tracing::info!(address = ?address.map(fmt_address), "wallet phrase updated");
                Ok(address)
            }
            Err(err) => {
                store.save_mnemonic(previous)?;
                Err(err)
            }
        }
    }

    /// Delegates the wallet's account to the configured smart-account implementation.
    pub async fn delegate(&self, calldata: Bytes, sponsored: bool) -> Result<H256, DelegationError> {
        let result = self
            .delegation
            .delegate(self.config.account_implementation, calldata, sponsored)
            .await;
        log_delegation("delegate", &result);
        result
    }

    pub async fn undelegate(&self, sponsored: bool) -> Result<H256, DelegationError> {
        let result = self.delegation.undelegate(sponsored).await;
        log_delegation("undelegate", &result);
        result
    }

    /// Personal signature requested by the wallet UI itself; no approval step.
    pub async fn sign_message(&self, message: &[u8]) -> WalletResult<Signature> {
        self.signer.personal_sign(message).await
    }
}

/// Frees the approval slot when a parked call is dropped before a decision arrives.
struct SlotGuard<'a> {
    broker: &'a Broker,
    id: &'a RequestId,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.broker.clear_slot(self.id) {
            tracing::info!(id = %self.id, "caller went away; pending request dropped");
        }
    }
}

fn log_delegation(action: &'static str, result: &Result<H256, DelegationError>) {
    match result {
        Ok(hash) => tracing::info!(action, tx = %fmt_h256(*hash), "delegation complete"),
        Err(err) => tracing::warn!(action, kind = err.kind(), error = %err, "delegation failed"),
    }
}

fn require_origin(caller: &Caller) -> WalletResult<&str> {
    caller
        .origin
        .as_deref()
        .ok_or_else(|| invalid_params("caller origin is required"))
}

fn param<T: DeserializeOwned>(request: &JsonRpcRequest, i: usize, what: &str) -> WalletResult<T> {
    serde_json::from_value(request.param(i).clone())
        .map_err(|e| invalid_params(format!("invalid {what}: {e}")))
}

fn op_hash_param(request: &JsonRpcRequest) -> WalletResult<H256> {
    let raw = request
        .param(0)
        .as_str()
        .ok_or_else(|| invalid_params("expected a call bundle id"))?;
    parse_h256(raw).map_err(|e| invalid_params(format!("invalid call bundle id: {e}")))
}

/// `personal_sign` messages arrive hex-encoded; plain text is accepted as UTF-8.
fn parse_personal_message(v: &Value) -> WalletResult<Bytes> {
    let raw = v
        .as_str()
        .ok_or_else(|| invalid_params("personal_sign expects a message string"))?;
    if raw.starts_with("0x") {
        if let Ok(bytes) = parse_bytes(raw) {
            return Ok(bytes);
        }
    }
    Ok(Bytes::from(raw.as_bytes().to_vec()))
}

/// Typed data is usually sent as a JSON string, sometimes as an object.
fn parse_typed_data(v: &Value) -> WalletResult<TypedData> {
    let parsed = match v {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| invalid_params(format!("invalid typed data: {e}")))
}

fn addresses_json(accounts: &[Address]) -> Value {
    json!(accounts.iter().copied().map(fmt_address).collect::<Vec<_>>())
}

fn signature_hex(sig: &Signature) -> String {
    fmt_bytes(&Bytes::from(sig.to_vec()))
}
