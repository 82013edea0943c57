use crate::bundler::{BundlerApi, UserOperationReceipt};
use crate::chain::{CallRequest, ChainClient, ExecutionError};
use crate::codec::{encode_execute_batch, hash_operation, pack_user_operation, unpack_user_operation};
use crate::config::{GasEstimation, WalletConfig};
use crate::encoding::{fmt_address, fmt_bytes, fmt_h256, fmt_u256};
use crate::error::{invalid_params, WalletError, WalletResult};
use crate::jsonrpc::{JsonRpcError, METHOD_NOT_FOUND};
use crate::paymaster::{PaymasterApi, PaymasterClient};
use crate::pending::{CallBatch, CallsStatus, PaymasterService, TransactionRequest};
use crate::signer::SigningBackend;
use crate::types::{Execution, GasLimits, PaymasterFields, UnpackedUserOperation, UserOperation};
use anyhow::anyhow;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const FALLBACK_CALL_GAS_LIMIT: u128 = 1_000_000;
pub const FALLBACK_VERIFICATION_GAS_LIMIT: u128 = 1_000_000;
pub const FALLBACK_PRE_VERIFICATION_GAS: u64 = 100_000;

/// 65-byte ECDSA-shaped placeholder signature bundlers accept during gas estimation.
const STUB_SIGNATURE: [u8; 65] = {
    let mut sig = [0u8; 65];
    let mut i = 0;
    while i < 15 {
        sig[i] = 0xff;
        i += 1;
    }
    sig[15] = 0xf0;
    sig[31] = 0x07;
    i = 32;
    while i < 64 {
        sig[i] = 0xaa;
        i += 1;
    }
    sig[64] = 0x1c;
    sig
};

/// Builds the paymaster client for a `paymasterService` capability.
pub type PaymasterConnector =
    Arc<dyn Fn(&PaymasterService) -> Arc<dyn PaymasterApi> + Send + Sync>;

/// Builds, signs and submits ERC-4337 operations for the wallet's account, and sends
/// plain transactions on its behalf.
pub struct Pipeline {
    config: Arc<WalletConfig>,
    chain: Arc<dyn ChainClient>,
    bundler: Arc<dyn BundlerApi>,
    signer: SigningBackend,
    connect_paymaster: PaymasterConnector,
    account_locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<WalletConfig>,
        chain: Arc<dyn ChainClient>,
        bundler: Arc<dyn BundlerApi>,
        signer: SigningBackend,
    ) -> Self {
        Self {
            config,
            chain,
            bundler,
            signer,
            connect_paymaster: Arc::new(|svc: &PaymasterService| {
                Arc::new(PaymasterClient::new(svc.url.clone(), svc.context.clone()))
                    as Arc<dyn PaymasterApi>
            }),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_paymaster_connector(mut self, connector: PaymasterConnector) -> Self {
        self.connect_paymaster = connector;
        self
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn signer(&self) -> &SigningBackend {
        &self.signer
    }

    /// Unsigned operation (`signature` empty) executing `executions` as one Kernel batch.
    pub async fn build_operation(
        &self,
        owner: Address,
        executions: &[Execution],
        nonce_key: U256,
        paymaster: Option<&dyn PaymasterApi>,
    ) -> WalletResult<UserOperation> {
        let entry_point = self.config.entry_point;
        let chain_id = self.config.chain_id;

        let call_data = encode_execute_batch(executions)?;
        let nonce = self
            .chain
            .entry_point_nonce(entry_point, owner, nonce_key)
            .await?;
        let fees = self.chain.estimate_fees().await?;
        tracing::info!(
            sender = %fmt_address(owner),
            nonce = %nonce,
            max_fee_per_gas = fees.max_fee_per_gas,
            max_priority_fee_per_gas = fees.max_priority_fee_per_gas,
            calls = executions.len(),
            "building user operation"
        );

        let mut op = UnpackedUserOperation {
            sender: owner,
            nonce,
            call_data,
            call_gas_limit: FALLBACK_CALL_GAS_LIMIT,
            verification_gas_limit: FALLBACK_VERIFICATION_GAS_LIMIT,
            pre_verification_gas: U256::from(FALLBACK_PRE_VERIFICATION_GAS),
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            paymaster: None,
            signature: Bytes::from(STUB_SIGNATURE.to_vec()),
        };

        let mut stub_is_final = false;
        let mut stub_reported_verification_gas = false;
        if let Some(pm) = paymaster {
            let stub = pm
                .get_paymaster_stub_data(&op, entry_point, chain_id)
                .await
                .map_err(WalletError::Paymaster)?;
            tracing::info!(paymaster = %fmt_address(stub.paymaster), is_final = stub.is_final, "paymaster stub data");
            stub_is_final = stub.is_final;
            stub_reported_verification_gas = stub.verification_gas_limit.is_some();
            op.paymaster = Some(PaymasterFields {
                paymaster: stub.paymaster,
                verification_gas_limit: stub.verification_gas_limit.unwrap_or(0),
                post_op_gas_limit: stub.post_op_gas_limit.unwrap_or(0),
                data: stub.paymaster_data,
            });
        }

        let gas = self.estimate_gas(&op).await?;
        op.call_gas_limit = gas.call_gas_limit;
        op.verification_gas_limit = gas.verification_gas_limit;
        op.pre_verification_gas = gas.pre_verification_gas;
        if let Some(fields) = op.paymaster.as_mut() {
            match gas.paymaster_verification_gas_limit {
                Some(limit) => fields.verification_gas_limit = limit,
                None if !stub_reported_verification_gas => {
                    return Err(WalletError::Paymaster(anyhow!(
                        "paymaster did not report a verification gas limit"
                    )));
                }
                None => {}
            }
        }
        op.signature = Bytes::new();

        if let (Some(pm), false) = (paymaster, stub_is_final) {
            let data = pm
                .get_paymaster_data(&op, entry_point, chain_id)
                .await
                .map_err(WalletError::Paymaster)?;
            tracing::info!(paymaster = %fmt_address(data.paymaster), "paymaster data");
            if let Some(fields) = op.paymaster.as_mut() {
                fields.paymaster = data.paymaster;
                fields.data = data.paymaster_data;
                if let Some(limit) = data.verification_gas_limit {
                    fields.verification_gas_limit = limit;
                }
                if let Some(limit) = data.post_op_gas_limit {
                    fields.post_op_gas_limit = limit;
                }
            }
        }

        Ok(pack_user_operation(&op))
    }

    async fn estimate_gas(&self, op: &UnpackedUserOperation) -> WalletResult<GasLimits> {
        if self.config.gas_estimation == GasEstimation::Fixed {
            return Ok(fallback_gas_limits());
        }

        match self
            .bundler
            .estimate_user_operation_gas(op, self.config.entry_point)
            .await
        {
            Ok(gas) => {
                tracing::info!(
                    call_gas_limit = gas.call_gas_limit,
                    verification_gas_limit = gas.verification_gas_limit,
                    pre_verification_gas = %gas.pre_verification_gas,
                    "bundler gas estimate"
                );
                Ok(gas)
            }
            Err(err) if is_method_not_found(&err) => {
                tracing::warn!("bundler does not support gas estimation; using fixed limits");
                Ok(fallback_gas_limits())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn operation_hash(&self, op: &UserOperation) -> H256 {
        hash_operation(self.config.chain_id, self.config.entry_point, op)
    }

    /// Signs the packed operation and hands its unpacked form to the bundler.
    pub async fn sign_and_submit(&self, mut op: UserOperation) -> WalletResult<H256> {
        let hash = self.operation_hash(&op);
        op.signature = self.signer.sign_operation_hash(hash).await?;

        let unpacked = unpack_user_operation(&op)?;
        let submitted = self
            .bundler
            .send_user_operation(&unpacked, self.config.entry_point)
            .await?;
        if submitted != hash {
            tracing::warn!(
                local = %fmt_h256(hash),
                bundler = %fmt_h256(submitted),
                "bundler returned a different user operation hash"
            );
        }
        tracing::info!(op_hash = %fmt_h256(submitted), sender = %fmt_address(op.sender), "user operation submitted");
        Ok(submitted)
    }

    /// Hash of the bundle transaction that included `op_hash`. Best effort: polling stops
    /// at the configured timeout, on the first error, or when the future is dropped.
    pub async fn await_inclusion(&self, op_hash: H256) -> Option<H256> {
        let poll = async {
            loop {
                match self.bundler.get_user_operation_receipt(op_hash).await {
                    Ok(Some(receipt)) => return Some(receipt.receipt.transaction_hash),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(op_hash = %fmt_h256(op_hash), error = %err, "receipt poll failed");
                        return None;
                    }
                }
                tokio::time::sleep(self.config.receipt_poll).await;
            }
        };

        match tokio::time::timeout(self.config.receipt_timeout, poll).await {
            Ok(tx_hash) => tx_hash,
            Err(_) => {
                tracing::warn!(op_hash = %fmt_h256(op_hash), "timed out waiting for inclusion");
                None
            }
        }
    }

    /// `wallet_sendCalls` once approved: one operation for the whole batch.
    ///
    /// Nonce read through bundler submission runs under a per-sender lock, so two
    /// batches from the same account never sign the same nonce.
    pub async fn send_calls(&self, batch: &CallBatch) -> WalletResult<H256> {
        let executions = batch
            .calls
            .iter()
            .map(|call| {
                Ok(Execution {
                    target: call
                        .to
                        .ok_or_else(|| invalid_params("Create transactions are not supported"))?,
                    value: call.value.unwrap_or_default(),
                    call_data: call.data.clone().unwrap_or_default(),
                })
            })
            .collect::<WalletResult<Vec<_>>>()?;

        let paymaster = batch
            .paymaster_service(&self.config.chain_hex())
            .map(|svc| (self.connect_paymaster)(&svc));

        let lock = self.account_lock(batch.from);
        let _guard = lock.lock().await;

        let op = self
            .build_operation(batch.from, &executions, U256::zero(), paymaster.as_deref())
            .await?;
        self.sign_and_submit(op).await
    }

    fn account_lock(&self, account: Address) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .account_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(account).or_default().clone()
    }

    /// EIP-5792 v1 status for an operation hash returned by `wallet_sendCalls`.
    pub async fn calls_status(&self, op_hash: H256) -> WalletResult<CallsStatus> {
        let receipt = self.bundler.get_user_operation_receipt(op_hash).await?;
        Ok(match receipt {
            None => CallsStatus::Pending,
            Some(receipt) => CallsStatus::Confirmed {
                receipts: vec![receipt_json(&receipt)],
            },
        })
    }

    /// `eth_sendTransaction` once approved. Missing fees, gas and nonce are filled from the chain.
    pub async fn submit_transaction(&self, request: &TransactionRequest) -> WalletResult<H256> {
        let from = self.signer.address()?;
        let to = request
            .to
            .ok_or_else(|| invalid_params("Create transactions are not supported"))?;
        let value = request.value.unwrap_or_default();
        let data = request.data.clone().unwrap_or_default();

        let (max_fee, max_priority_fee) =
            match (request.max_fee_per_gas, request.max_priority_fee_per_gas, request.gas_price) {
                (Some(max), Some(priority), _) => (max, priority),
                (_, _, Some(price)) if !price.is_zero() => (price, price),
                _ => {
                    let fees = self.chain.estimate_fees().await?;
                    (
                        U256::from(fees.max_fee_per_gas),
                        U256::from(fees.max_priority_fee_per_gas),
                    )
                }
            };

        let gas = match request.gas {
            Some(gas) if !gas.is_zero() => gas,
            _ => {
                self.chain
                    .estimate_gas(&CallRequest {
                        from: Some(from),
                        to,
                        data: Some(data.clone()),
                        value: Some(value),
                        authorization_list: None,
                    })
                    .await
                    .map_err(classify_execution)?
            }
        };
        let nonce = match request.nonce {
            Some(nonce) => nonce,
            None => self.chain.transaction_count(from).await?,
        };

        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .gas(gas)
            .nonce(nonce)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(max_priority_fee)
            .chain_id(self.config.chain_id)
            .into();
        let raw = self.signer.sign_transaction(&tx)?;
        let hash = self
            .chain
            .send_raw_transaction(raw)
            .await
            .map_err(classify_execution)?;
        tracing::info!(tx = %fmt_h256(hash), from = %fmt_address(from), "transaction sent");
        Ok(hash)
    }
}

fn fallback_gas_limits() -> GasLimits {
    GasLimits {
        call_gas_limit: FALLBACK_CALL_GAS_LIMIT,
        verification_gas_limit: FALLBACK_VERIFICATION_GAS_LIMIT,
        pre_verification_gas: U256::from(FALLBACK_PRE_VERIFICATION_GAS),
        paymaster_verification_gas_limit: None,
    }
}

fn is_method_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<JsonRpcError>()
        .map(|e| e.code == METHOD_NOT_FOUND)
        .unwrap_or(false)
}

/// Node execution failures become `LowFunds` (intrinsic gas) or `Unknown`; anything
/// that is not a node execution error stays internal.
fn classify_execution(err: anyhow::Error) -> WalletError {
    match err.downcast_ref::<ExecutionError>() {
        Some(exec) if exec.is_intrinsic_gas_too_low() => {
            tracing::warn!(error = %exec, "transaction below intrinsic gas");
            WalletError::LowFunds
        }
        Some(exec) => WalletError::Unknown(exec.message.clone()),
        None => WalletError::Internal(err),
    }
}

fn receipt_json(op_receipt: &UserOperationReceipt) -> Value {
    let receipt = &op_receipt.receipt;
    let success = match receipt.status {
        Some(status) => status.as_u64() == 1,
        None => op_receipt.success,
    };
    json!({
        "logs": receipt.logs.iter().map(|log| json!({
            "address": fmt_address(log.address),
            "topics": log.topics.iter().map(|t| fmt_h256(*t)).collect::<Vec<_>>(),
            "data": fmt_bytes(&log.data),
        })).collect::<Vec<_>>(),
        "status": if success { "0x1" } else { "0x0" },
        "blockHash": receipt.block_hash.map(fmt_h256),
        "blockNumber": receipt.block_number.map(|n| fmt_u256(U256::from(n.as_u64()))),
        "gasUsed": receipt.gas_used.map(fmt_u256),
        "transactionHash": fmt_h256(receipt.transaction_hash),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::{InclusionReceipt, ReceiptLog};
    use crate::codec::unpack_paymaster_and_data;
    use crate::pending::WalletCall;
    use crate::testing::{FakeBundler, FakeChain, FakePaymaster, TEST_MNEMONIC};
    use crate::storage::MemoryStore;
    use ethers::types::U64;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<FakeChain>,
        bundler: Arc<FakeBundler>,
        pipeline: Arc<Pipeline>,
        owner: Address,
    }

    fn fixture_with(config: WalletConfig, paymaster: Option<Arc<FakePaymaster>>) -> Fixture {
        let config = Arc::new(config);
        let chain = Arc::new(FakeChain::new(config.chain_id));
        let bundler = Arc::new(FakeBundler::new(&config, chain.ep_nonce.clone()));
        let signer = SigningBackend::new(
            Arc::new(MemoryStore::new(Some(TEST_MNEMONIC.to_string()))),
            config.chain_id,
        );
        let owner = signer.address().unwrap();
        let mut pipeline = Pipeline::new(config, chain.clone(), bundler.clone(), signer);
        if let Some(pm) = paymaster {
            pipeline = pipeline.with_paymaster_connector(Arc::new(move |_svc: &PaymasterService| {
                pm.clone() as Arc<dyn PaymasterApi>
            }));
        }
        Fixture {
            chain,
            bundler,
            pipeline: Arc::new(pipeline),
            owner,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(WalletConfig::default(), None)
    }

    fn execution() -> Execution {
        Execution {
            target: Address::repeat_byte(0x0c),
            value: U256::from(1u64),
            call_data: Bytes::from(vec![0xab, 0xcd]),
        }
    }

    fn batch(owner: Address, capabilities: Option<Value>) -> CallBatch {
        CallBatch {
            version: "1.0".into(),
            chain_id: WalletConfig::default().chain_hex(),
            from: owner,
            calls: vec![WalletCall {
                to: Some(Address::repeat_byte(0x0c)),
                value: None,
                data: Some(Bytes::from(vec![0x01])),
            }],
            capabilities,
        }
    }

    #[tokio::test]
    async fn build_uses_bundler_estimate_and_chain_fees() {
        let f = fixture();
        let op = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), None)
            .await
            .unwrap();
        let unpacked = unpack_user_operation(&op).unwrap();

        let estimate = f.bundler.estimate_result();
        assert_eq!(unpacked.call_gas_limit, estimate.call_gas_limit);
        assert_eq!(unpacked.verification_gas_limit, estimate.verification_gas_limit);
        assert_eq!(unpacked.max_fee_per_gas, f.chain.fees.max_fee_per_gas);
        assert!(op.paymaster_and_data.is_empty());
        assert!(op.signature.is_empty());
        assert!(op.init_code.is_empty());

        // estimation ran with the 65-byte stub signature
        let estimated = f.bundler.estimated.lock().unwrap();
        assert_eq!(estimated[0].signature.len(), 65);
    }

    #[tokio::test]
    async fn unsupported_estimation_falls_back_to_fixed_limits() {
        let f = fixture();
        f.bundler.set_estimate_error(JsonRpcError {
            code: METHOD_NOT_FOUND,
            message: "method not found".into(),
            data: None,
        });
        let op = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), None)
            .await
            .unwrap();
        let unpacked = unpack_user_operation(&op).unwrap();
        assert_eq!(unpacked.call_gas_limit, FALLBACK_CALL_GAS_LIMIT);
        assert_eq!(unpacked.verification_gas_limit, FALLBACK_VERIFICATION_GAS_LIMIT);
        assert_eq!(
            unpacked.pre_verification_gas,
            U256::from(FALLBACK_PRE_VERIFICATION_GAS)
        );
    }

    #[tokio::test]
    async fn other_estimation_errors_abort_the_build() {
        let f = fixture();
        f.bundler.set_estimate_error(JsonRpcError {
            code: -32500,
            message: "AA23 reverted".into(),
            data: None,
        });
        let err = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Internal(_)));
    }

    #[tokio::test]
    async fn fixed_mode_never_asks_the_bundler() {
        let f = fixture_with(
            WalletConfig {
                gas_estimation: GasEstimation::Fixed,
                ..WalletConfig::default()
            },
            None,
        );
        f.pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), None)
            .await
            .unwrap();
        assert!(f.bundler.estimated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn paymaster_runs_stub_estimate_then_final_data() {
        let pm = Arc::new(FakePaymaster::sponsoring(Address::repeat_byte(0x99)));
        let f = fixture_with(WalletConfig::default(), Some(pm.clone()));
        let op = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), Some(pm.as_ref()))
            .await
            .unwrap();

        assert_eq!(
            *pm.calls.lock().unwrap(),
            vec!["pm_getPaymasterStubData", "pm_getPaymasterData"]
        );
        // the estimate saw the stub paymaster fields
        assert!(f.bundler.estimated.lock().unwrap()[0].paymaster.is_some());

        let fields = unpack_paymaster_and_data(&op.paymaster_and_data)
            .unwrap()
            .unwrap();
        assert_eq!(fields.paymaster, Address::repeat_byte(0x99));
        assert_eq!(fields.data, pm.final_data());
        assert_eq!(fields.post_op_gas_limit, 1);
    }

    #[tokio::test]
    async fn failing_paymaster_stub_is_a_paymaster_error() {
        let pm = Arc::new(FakePaymaster::failing_stub());
        let f = fixture_with(WalletConfig::default(), Some(pm.clone()));
        let err = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), Some(pm.as_ref()))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Paymaster(_)));
        assert_ne!(err.code(), WalletError::LowFunds.code());
        assert!(f.bundler.estimated.lock().unwrap().is_empty());
        assert!(f.bundler.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn nonce_read_failure_aborts_before_signing() {
        let f = fixture();
        *f.chain.fail_nonce.lock().unwrap() = true;
        let err = f.pipeline.send_calls(&batch(f.owner, None)).await.unwrap_err();
        assert!(matches!(err, WalletError::Internal(_)));
        assert!(f.bundler.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submitted_operation_is_signed_over_its_hash() {
        let f = fixture();
        let op = f
            .pipeline
            .build_operation(f.owner, &[execution()], U256::zero(), None)
            .await
            .unwrap();
        let expected = f.pipeline.operation_hash(&op);
        let op_hash = f.pipeline.sign_and_submit(op).await.unwrap();
        assert_eq!(op_hash, expected);

        let sent = f.bundler.sent.lock().unwrap();
        let sig = ethers::types::Signature::try_from(sent[0].signature.as_ref()).unwrap();
        sig.verify(expected.as_bytes(), f.owner).unwrap();
    }

    #[tokio::test]
    async fn concurrent_batches_for_one_account_get_distinct_nonces() {
        let f = fixture();
        let a = {
            let p = f.pipeline.clone();
            let b = batch(f.owner, None);
            tokio::spawn(async move { p.send_calls(&b).await })
        };
        let b = {
            let p = f.pipeline.clone();
            let b = batch(f.owner, None);
            tokio::spawn(async move { p.send_calls(&b).await })
        };
        let (ha, hb) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_ne!(ha, hb);

        let mut nonces: Vec<U256> = f
            .bundler
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|op| op.nonce)
            .collect();
        nonces.sort();
        assert_eq!(nonces, vec![U256::zero(), U256::one()]);
    }

    #[tokio::test]
    async fn send_calls_uses_requested_paymaster_service() {
        let pm = Arc::new(FakePaymaster::sponsoring(Address::repeat_byte(0x77)));
        let f = fixture_with(WalletConfig::default(), Some(pm.clone()));
        let chain_hex = WalletConfig::default().chain_hex();
        let caps = json!({ chain_hex: { "paymasterService": { "url": "https://pm.example" } } });
        f.pipeline.send_calls(&batch(f.owner, Some(caps))).await.unwrap();

        let sent = f.bundler.sent.lock().unwrap();
        assert_eq!(
            sent[0].paymaster.as_ref().map(|p| p.paymaster),
            Some(Address::repeat_byte(0x77))
        );
    }

    #[tokio::test]
    async fn await_inclusion_returns_bundle_hash_or_none() {
        let f = fixture_with(
            WalletConfig {
                receipt_poll: Duration::from_millis(5),
                receipt_timeout: Duration::from_millis(50),
                ..WalletConfig::default()
            },
            None,
        );
        assert_eq!(f.pipeline.await_inclusion(H256::repeat_byte(1)).await, None);

        let tx_hash = H256::repeat_byte(0x42);
        f.bundler.set_receipt(UserOperationReceipt {
            user_op_hash: H256::repeat_byte(1),
            success: true,
            receipt: InclusionReceipt {
                transaction_hash: tx_hash,
                ..Default::default()
            },
        });
        assert_eq!(
            f.pipeline.await_inclusion(H256::repeat_byte(1)).await,
            Some(tx_hash)
        );

        *f.bundler.fail_receipt.lock().unwrap() = true;
        assert_eq!(f.pipeline.await_inclusion(H256::repeat_byte(1)).await, None);
    }

    #[tokio::test]
    async fn calls_status_maps_receipt() {
        let f = fixture();
        assert_eq!(
            f.pipeline.calls_status(H256::zero()).await.unwrap(),
            CallsStatus::Pending
        );

        f.bundler.set_receipt(UserOperationReceipt {
            user_op_hash: H256::zero(),
            success: true,
            receipt: InclusionReceipt {
                transaction_hash: H256::repeat_byte(0x0f),
                block_hash: Some(H256::repeat_byte(0x0b)),
                block_number: Some(U64::from(255)),
                gas_used: Some(U256::from(21_000u64)),
                status: Some(U64::from(0)),
                logs: vec![ReceiptLog {
                    address: Address::repeat_byte(0x01),
                    topics: vec![H256::repeat_byte(0x02)],
                    data: Bytes::from(vec![0x03]),
                }],
            },
        });
        let CallsStatus::Confirmed { receipts } = f.pipeline.calls_status(H256::zero()).await.unwrap()
        else {
            panic!("expected confirmed");
        };
        let r = &receipts[0];
        assert_eq!(r["status"], "0x0");
        assert_eq!(r["blockNumber"], "0xff");
        assert_eq!(r["gasUsed"], "0x5208");
        assert_eq!(r["logs"][0]["data"], "0x03");
        assert_eq!(
            r["transactionHash"],
            fmt_h256(H256::repeat_byte(0x0f))
        );
    }

    #[tokio::test]
    async fn plain_transaction_is_signed_and_broadcast() {
        let f = fixture();
        let hash = f
            .pipeline
            .submit_transaction(&TransactionRequest {
                to: Some(Address::repeat_byte(0x05)),
                value: Some(U256::from(10u64)),
                ..Default::default()
            })
            .await
            .unwrap();
        let raw = f.chain.sent_raw.lock().unwrap();
        assert_eq!(raw.len(), 1);
        // EIP-1559 envelope
        assert_eq!(raw[0][0], 0x02);
        assert_eq!(hash, H256(ethers::utils::keccak256(&raw[0])));
    }

    fn failing_estimate(f: &Fixture, message: &str) {
        *f.chain.estimate_gas_error.lock().unwrap() = Some(ExecutionError {
            code: -32000,
            message: message.into(),
        });
    }

    fn transfer() -> TransactionRequest {
        TransactionRequest {
            to: Some(Address::repeat_byte(0x05)),
            value: Some(U256::from(10u64)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn intrinsic_gas_failure_is_low_funds() {
        let f = fixture();
        failing_estimate(&f, "intrinsic gas too low");
        let err = f.pipeline.submit_transaction(&transfer()).await.unwrap_err();
        assert!(matches!(err, WalletError::LowFunds), "{err:?}");
        assert_eq!(err.code(), -32003);
        assert!(f.chain.sent_raw.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_execution_failures_are_unknown() {
        let f = fixture();
        failing_estimate(&f, "insufficient funds for gas * price + value");
        let err = f.pipeline.submit_transaction(&transfer()).await.unwrap_err();
        match err {
            WalletError::Unknown(message) => assert!(message.contains("insufficient funds")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn contract_creation_is_refused() {
        let f = fixture();
        let err = f
            .pipeline
            .submit_transaction(&TransactionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidParams(_)));
    }
}
