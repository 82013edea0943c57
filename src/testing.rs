//! In-process fakes for the chain, bundler and paymaster collaborators.

use crate::broker::Broker;
use crate::bundler::{BundlerApi, UserOperationReceipt};
use crate::chain::{CallRequest, ChainClient, ExecutionError, RelayRequest};
use crate::codec::{hash_operation, pack_user_operation};
use crate::config::WalletConfig;
use crate::jsonrpc::JsonRpcError;
use crate::paymaster::{PaymasterApi, PaymasterResponse};
use crate::pending::PendingRequest;
use crate::storage::MemoryStore;
use crate::transport::ApprovalUi;
use crate::types::{FeeEstimate, GasLimits, UnpackedUserOperation};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

pub struct FakeChain {
    pub chain_id: u64,
    pub fees: FeeEstimate,
    pub code: Mutex<HashMap<Address, Bytes>>,
    pub tx_count: Mutex<U256>,
    /// EntryPoint nonce; the fake bundler bumps it on every accepted operation.
    pub ep_nonce: Arc<AtomicU64>,
    pub fail_nonce: Mutex<bool>,
    pub estimate_gas_error: Mutex<Option<ExecutionError>>,
    pub relay_result: Mutex<Option<H256>>,
    /// Status of every mined receipt; `None` means nothing is ever mined.
    pub receipt_status: Mutex<Option<u64>>,
    pub estimates: Mutex<Vec<CallRequest>>,
    pub relayed: Mutex<Vec<RelayRequest>>,
    pub sent_raw: Mutex<Vec<Bytes>>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            fees: FeeEstimate {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000_000,
            },
            code: Mutex::new(HashMap::new()),
            tx_count: Mutex::new(U256::zero()),
            ep_nonce: Arc::new(AtomicU64::new(0)),
            fail_nonce: Mutex::new(false),
            estimate_gas_error: Mutex::new(None),
            relay_result: Mutex::new(None),
            receipt_status: Mutex::new(Some(1)),
            estimates: Mutex::new(Vec::new()),
            relayed: Mutex::new(Vec::new()),
            sent_raw: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn transaction_count(&self, _address: Address) -> Result<U256> {
        Ok(*self.tx_count.lock().unwrap())
    }

    async fn entry_point_nonce(
        &self,
        _entry_point: Address,
        _sender: Address,
        _key: U256,
    ) -> Result<U256> {
        if *self.fail_nonce.lock().unwrap() {
            return Err(anyhow!("EntryPoint.getNonce failed"));
        }
        Ok(U256::from(self.ep_nonce.load(Ordering::SeqCst)))
    }

    async fn estimate_fees(&self) -> Result<FeeEstimate> {
        Ok(self.fees)
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256> {
        self.estimates.lock().unwrap().push(call.clone());
        match self.estimate_gas_error.lock().unwrap().clone() {
            Some(err) => Err(anyhow::Error::new(err).context("eth_estimateGas failed")),
            None => Ok(U256::from(60_000u64)),
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let hash = H256(keccak256(&raw));
        self.sent_raw.lock().unwrap().push(raw);
        Ok(hash)
    }

    async fn relay_transaction(&self, request: &RelayRequest) -> Result<Option<H256>> {
        self.relayed.lock().unwrap().push(request.clone());
        Ok(*self.relay_result.lock().unwrap())
    }

    async fn wait_for_receipt(
        &self,
        hash: H256,
        _timeout: Duration,
    ) -> Result<Option<TransactionReceipt>> {
        Ok(self
            .receipt_status
            .lock()
            .unwrap()
            .map(|status| TransactionReceipt {
                transaction_hash: hash,
                status: Some(U64::from(status)),
                ..Default::default()
            }))
    }
}

pub struct FakeBundler {
    chain_id: u64,
    entry_point: Address,
    nonce: Arc<AtomicU64>,
    estimate: Mutex<std::result::Result<GasLimits, JsonRpcError>>,
    receipt: Mutex<Option<UserOperationReceipt>>,
    pub fail_receipt: Mutex<bool>,
    pub estimated: Mutex<Vec<UnpackedUserOperation>>,
    pub sent: Mutex<Vec<UnpackedUserOperation>>,
}

impl FakeBundler {
    /// `nonce` is shared with [`FakeChain::ep_nonce`].
    pub fn new(config: &WalletConfig, nonce: Arc<AtomicU64>) -> Self {
        Self {
            chain_id: config.chain_id,
            entry_point: config.entry_point,
            nonce,
            estimate: Mutex::new(Ok(GasLimits {
                call_gas_limit: 120_000,
                verification_gas_limit: 90_000,
                pre_verification_gas: U256::from(48_916u64),
                paymaster_verification_gas_limit: None,
            })),
            receipt: Mutex::new(None),
            fail_receipt: Mutex::new(false),
            estimated: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn estimate_result(&self) -> GasLimits {
        self.estimate.lock().unwrap().clone().unwrap()
    }

    pub fn set_estimate_error(&self, err: JsonRpcError) {
        *self.estimate.lock().unwrap() = Err(err);
    }

    pub fn set_receipt(&self, receipt: UserOperationReceipt) {
        *self.receipt.lock().unwrap() = Some(receipt);
    }
}

#[async_trait]
impl BundlerApi for FakeBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &UnpackedUserOperation,
        _entry_point: Address,
    ) -> Result<GasLimits> {
        self.estimated.lock().unwrap().push(op.clone());
        let estimate = self.estimate.lock().unwrap().clone();
        estimate.map_err(anyhow::Error::new)
    }

    async fn send_user_operation(
        &self,
        op: &UnpackedUserOperation,
        _entry_point: Address,
    ) -> Result<H256> {
        // leaves room for a racing submission to read the same nonce
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.sent.lock().unwrap().push(op.clone());
        self.nonce.fetch_add(1, Ordering::SeqCst);
        Ok(hash_operation(
            self.chain_id,
            self.entry_point,
            &pack_user_operation(op),
        ))
    }

    async fn get_user_operation_receipt(
        &self,
        _op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        if *self.fail_receipt.lock().unwrap() {
            return Err(anyhow!("bundler unavailable"));
        }
        Ok(self.receipt.lock().unwrap().clone())
    }

    async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        Ok(vec![self.entry_point])
    }
}

pub struct FakePaymaster {
    paymaster: Address,
    fail_stub: bool,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakePaymaster {
    pub fn sponsoring(paymaster: Address) -> Self {
        Self {
            paymaster,
            fail_stub: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_stub() -> Self {
        Self {
            paymaster: Address::zero(),
            fail_stub: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn final_data(&self) -> Bytes {
        Bytes::from(vec![0xfe; 8])
    }
}

#[async_trait]
impl PaymasterApi for FakePaymaster {
    async fn get_paymaster_stub_data(
        &self,
        _op: &UnpackedUserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<PaymasterResponse> {
        self.calls.lock().unwrap().push("pm_getPaymasterStubData");
        if self.fail_stub {
            return Err(anyhow!("pm_getPaymasterStubData RPC failed: policy rejected"));
        }
        Ok(PaymasterResponse {
            paymaster: self.paymaster,
            paymaster_data: Bytes::from(vec![0u8; 8]),
            verification_gas_limit: Some(50_000),
            post_op_gas_limit: Some(0),
            is_final: false,
        })
    }

    async fn get_paymaster_data(
        &self,
        _op: &UnpackedUserOperation,
        _entry_point: Address,
        _chain_id: u64,
    ) -> Result<PaymasterResponse> {
        self.calls.lock().unwrap().push("pm_getPaymasterData");
        Ok(PaymasterResponse {
            paymaster: self.paymaster,
            paymaster_data: self.final_data(),
            verification_gas_limit: None,
            post_op_gas_limit: Some(1),
            is_final: false,
        })
    }
}

/// Forwards every parked request to the test body.
pub struct RecordingUi {
    shown: mpsc::UnboundedSender<PendingRequest>,
}

impl ApprovalUi for RecordingUi {
    fn request_shown(&self, request: &PendingRequest) {
        let _ = self.shown.send(request.clone());
    }
}

pub struct Harness {
    pub config: Arc<WalletConfig>,
    pub chain: Arc<FakeChain>,
    pub bundler: Arc<FakeBundler>,
    pub broker: Arc<Broker>,
    pub shown: mpsc::UnboundedReceiver<PendingRequest>,
    /// The account derived from [`TEST_MNEMONIC`].
    pub account: Address,
}

pub fn harness() -> Harness {
    harness_with(WalletConfig::default())
}

pub fn harness_with(config: WalletConfig) -> Harness {
    let config = Arc::new(config);
    let chain = Arc::new(FakeChain::new(config.chain_id));
    let bundler = Arc::new(FakeBundler::new(&config, chain.ep_nonce.clone()));
    let (tx, shown) = mpsc::unbounded_channel();
    let broker = Broker::new(
        config.clone(),
        chain.clone(),
        bundler.clone(),
        Arc::new(MemoryStore::new(Some(TEST_MNEMONIC.to_string()))),
        Arc::new(RecordingUi { shown: tx }),
    );
    let account = broker
        .wallet_address()
        .unwrap()
        .expect("test phrase derives an account");
    Harness {
        config,
        chain,
        bundler,
        broker: Arc::new(broker),
        shown,
        account,
    }
}
