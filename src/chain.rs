use crate::types::{Authorization, FeeEstimate};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::abi::AbiParser;
use ethers::contract::Contract;
use ethers::providers::{Middleware, MiddlewareError, ProviderError, RpcError};
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Chain reads and writes the pipeline and the delegation manager depend on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn get_code(&self, address: Address) -> Result<Bytes>;

    /// Pending transaction count.
    async fn transaction_count(&self, address: Address) -> Result<U256>;

    /// `EntryPoint.getNonce(sender, key)`.
    async fn entry_point_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256>;

    async fn estimate_fees(&self) -> Result<FeeEstimate>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;

    /// `wallet_sendTransaction`: a node-side relayer pays for a transaction carrying
    /// pre-signed authorizations. `None` when the relayer declined.
    async fn relay_transaction(&self, request: &RelayRequest) -> Result<Option<H256>>;

    /// `None` when no receipt showed up within `timeout`.
    async fn wait_for_receipt(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>>;
}

/// `eth_estimateGas` argument, including an EIP-7702 authorization list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_list: Option<Vec<Authorization>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub authorization_list: Vec<Authorization>,
    pub data: Bytes,
    pub to: Address,
}

/// A JSON-RPC error returned by the node while executing or estimating a transaction.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("execution error {code}: {message}")]
pub struct ExecutionError {
    pub code: i64,
    pub message: String,
}

const INTRINSIC_GAS_PATTERNS: &[&str] = &[
    "intrinsic gas too low",
    "transaction gas limit below intrinsic gas",
    "intrinsic gas exceeds gas limit",
];

impl ExecutionError {
    /// Gas limit below the intrinsic cost of the transaction.
    pub fn is_intrinsic_gas_too_low(&self) -> bool {
        let message = self.message.to_lowercase();
        INTRINSIC_GAS_PATTERNS.iter().any(|p| message.contains(p))
    }
}

/// [`ChainClient`] over any ethers middleware stack.
#[derive(Debug)]
pub struct RpcChain<M> {
    client: Arc<M>,
    poll_interval: Duration,
}

impl<M: Middleware + 'static> RpcChain<M> {
    pub fn new(client: Arc<M>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    fn node_error(err: M::Error, what: &'static str) -> anyhow::Error {
        match MiddlewareError::as_error_response(&err) {
            Some(resp) => anyhow::Error::new(ExecutionError {
                code: resp.code,
                message: resp.message.clone(),
            })
            .context(what),
            None => anyhow!("{what}: {err}"),
        }
    }
}

fn provider_error(err: ProviderError, what: &'static str) -> anyhow::Error {
    match RpcError::as_error_response(&err) {
        Some(resp) => anyhow::Error::new(ExecutionError {
            code: resp.code,
            message: resp.message.clone(),
        })
        .context(what),
        None => anyhow!("{what}: {err}"),
    }
}

fn to_u128(v: U256, what: &str) -> Result<u128> {
    if v > U256::from(u128::MAX) {
        return Err(anyhow!("{what} does not fit in 128 bits: {v}"));
    }
    Ok(v.as_u128())
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for RpcChain<M> {
    async fn chain_id(&self) -> Result<u64> {
        let id = self
            .client
            .get_chainid()
            .await
            .map_err(|e| Self::node_error(e, "eth_chainId failed"))?;
        Ok(id.as_u64())
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .map_err(|e| Self::node_error(e, "eth_getCode failed"))
    }

    async fn transaction_count(&self, address: Address) -> Result<U256> {
        self.client
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| Self::node_error(e, "eth_getTransactionCount failed"))
    }

    async fn entry_point_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U256,
    ) -> Result<U256> {
        let abi = AbiParser::default().parse(&[
            "function getNonce(address sender, uint192 key) view returns (uint256 nonce)",
        ])?;
        let ep = Contract::new(entry_point, abi, self.client.clone());
        let nonce: U256 = ep
            .method("getNonce", (sender, key))?
            .call()
            .await
            .context("EntryPoint.getNonce failed")?;
        Ok(nonce)
    }

    async fn estimate_fees(&self) -> Result<FeeEstimate> {
        let (max_fee, max_priority) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(|e| Self::node_error(e, "fee estimation failed"))?;
        Ok(FeeEstimate {
            max_fee_per_gas: to_u128(max_fee, "maxFeePerGas")?,
            max_priority_fee_per_gas: to_u128(max_priority, "maxPriorityFeePerGas")?,
        })
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256> {
        self.client
            .provider()
            .request("eth_estimateGas", [call])
            .await
            .map_err(|e| provider_error(e, "eth_estimateGas failed"))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let pending = self
            .client
            .send_raw_transaction(raw)
            .await
            .map_err(|e| Self::node_error(e, "eth_sendRawTransaction failed"))?;
        Ok(pending.tx_hash())
    }

    async fn relay_transaction(&self, request: &RelayRequest) -> Result<Option<H256>> {
        self.client
            .provider()
            .request("wallet_sendTransaction", [request])
            .await
            .map_err(|e| provider_error(e, "wallet_sendTransaction failed"))
    }

    async fn wait_for_receipt(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>> {
        let poll = async {
            loop {
                match self.client.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(tx = ?hash, error = %e, "receipt poll error");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(receipt) => Ok(Some(receipt)),
            Err(_) => Ok(None),
        }
    }
}
