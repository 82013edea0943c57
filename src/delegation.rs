use crate::chain::{CallRequest, ChainClient, ExecutionError, RelayRequest};
use crate::codec::delegation_target;
use crate::config::WalletConfig;
use crate::encoding::{fmt_address, fmt_h256};
use crate::error::WalletError;
use crate::signer::SigningBackend;
use crate::types::Eip7702Transaction;
use anyhow::{anyhow, Result};
use ethers::types::{Address, Bytes, H256, U256, U64};
use std::sync::Arc;

/// Failure of a delegate / undelegate flow, in the categories the UI distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("no account configured")]
    NoAccount,
    #[error("insufficient funds to cover intrinsic gas")]
    LowFunds,
    #[error("timed out waiting for the delegation transaction")]
    Timeout,
    #[error("delegation failed: {0}")]
    Unknown(String),
}

impl DelegationError {
    pub fn kind(&self) -> &'static str {
        match self {
            DelegationError::NoAccount => "NO_ACCOUNT",
            DelegationError::LowFunds => "LOW_FUNDS",
            DelegationError::Timeout => "TIMEOUT",
            DelegationError::Unknown(_) => "UNKNOWN",
        }
    }
}

fn classify(err: anyhow::Error) -> DelegationError {
    if let Some(WalletError::NoAccount) = err.downcast_ref::<WalletError>() {
        return DelegationError::NoAccount;
    }
    match err.downcast_ref::<ExecutionError>() {
        Some(exec) if exec.is_intrinsic_gas_too_low() => DelegationError::LowFunds,
        _ => DelegationError::Unknown(format!("{err:#}")),
    }
}

/// Points the wallet's own account at smart-account code (EIP-7702) or clears it.
pub struct DelegationManager {
    chain: Arc<dyn ChainClient>,
    signer: SigningBackend,
    config: Arc<WalletConfig>,
}

impl DelegationManager {
    pub fn new(chain: Arc<dyn ChainClient>, signer: SigningBackend, config: Arc<WalletConfig>) -> Self {
        Self {
            chain,
            signer,
            config,
        }
    }

    /// Delegates to `implementation` and runs `calldata` against the account in the same
    /// transaction. Resolves once the transaction is included.
    ///
    /// Sponsored: a node-side relayer sends the transaction, so the authorization carries
    /// the current nonce. Self-paid: the account sends it and bumps its own nonce before
    /// the authorization is processed, so the authorization carries nonce + 1.
    pub async fn delegate(
        &self,
        implementation: Address,
        calldata: Bytes,
        sponsored: bool,
    ) -> Result<H256, DelegationError> {
        let account = match self.signer.address() {
            Ok(account) => account,
            Err(WalletError::NoAccount) => return Err(DelegationError::NoAccount),
            Err(err) => return Err(DelegationError::Unknown(err.to_string())),
        };

        let tx_hash = self
            .send_delegation(account, implementation, calldata, sponsored)
            .await
            .map_err(classify)?;
        tracing::info!(
            account = %fmt_address(account),
            implementation = %fmt_address(implementation),
            sponsored,
            tx = %fmt_h256(tx_hash),
            "delegation transaction sent"
        );

        let receipt = self
            .chain
            .wait_for_receipt(tx_hash, self.config.receipt_timeout)
            .await
            .map_err(classify)?;
        match receipt {
            None => Err(DelegationError::Timeout),
            Some(r) if r.status == Some(U64::zero()) => Err(DelegationError::Unknown(format!(
                "delegation transaction {} reverted",
                fmt_h256(tx_hash)
            ))),
            Some(_) => Ok(tx_hash),
        }
    }

    /// Clears the account's delegation (authorization to the zero address, no calldata).
    pub async fn undelegate(&self, sponsored: bool) -> Result<H256, DelegationError> {
        self.delegate(Address::zero(), Bytes::new(), sponsored).await
    }

    async fn send_delegation(
        &self,
        account: Address,
        implementation: Address,
        calldata: Bytes,
        sponsored: bool,
    ) -> Result<H256> {
        let chain_id = self.config.chain_id;
        let nonce = self.chain.transaction_count(account).await?.as_u64();

        if sponsored {
            let auth = self
                .signer
                .sign_authorization(chain_id, implementation, nonce)?;
            return self
                .chain
                .relay_transaction(&RelayRequest {
                    authorization_list: vec![auth],
                    data: calldata,
                    to: account,
                })
                .await?
                .ok_or_else(|| anyhow!("relayer returned no transaction hash"));
        }

        let auth = self
            .signer
            .sign_authorization(chain_id, implementation, nonce + 1)?;
        let fees = self.chain.estimate_fees().await?;
        let gas_limit = self
            .chain
            .estimate_gas(&CallRequest {
                from: Some(account),
                to: account,
                data: Some(calldata.clone()),
                value: None,
                authorization_list: Some(vec![auth]),
            })
            .await?;

        let tx = Eip7702Transaction {
            chain_id,
            nonce: U256::from(nonce),
            max_priority_fee_per_gas: U256::from(fees.max_priority_fee_per_gas),
            max_fee_per_gas: U256::from(fees.max_fee_per_gas),
            gas_limit,
            to: account,
            value: U256::zero(),
            data: calldata,
            authorization_list: vec![auth],
        };
        let raw = self.signer.sign_eip7702(&tx)?;
        self.chain.send_raw_transaction(raw).await
    }

    /// Current delegation target of `account`, `None` for plain accounts.
    pub async fn delegation_status(&self, account: Address) -> Result<Option<Address>> {
        let code = self.chain.get_code(account).await?;
        Ok(delegation_target(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{FakeChain, TEST_MNEMONIC};
    use crate::types::EIP7702_TX_TYPE;

    fn manager(phrase: Option<&str>) -> (DelegationManager, Arc<FakeChain>) {
        let config = Arc::new(WalletConfig::default());
        let chain = Arc::new(FakeChain::new(config.chain_id));
        let signer = SigningBackend::new(
            Arc::new(MemoryStore::new(phrase.map(str::to_string))),
            config.chain_id,
        );
        (DelegationManager::new(chain.clone(), signer, config), chain)
    }

    fn implementation() -> Address {
        WalletConfig::default().account_implementation
    }

    #[tokio::test]
    async fn missing_phrase_is_no_account() {
        let (m, chain) = manager(None);
        let err = m.delegate(implementation(), Bytes::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), "NO_ACCOUNT");
        assert!(chain.sent_raw.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_paid_authorization_uses_next_nonce() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        *chain.tx_count.lock().unwrap() = U256::from(7u64);

        let hash = m
            .delegate(implementation(), Bytes::from(vec![0x01]), false)
            .await
            .unwrap();

        let estimates = chain.estimates.lock().unwrap();
        let auth = estimates[0].authorization_list.as_ref().unwrap()[0];
        assert_eq!(auth.nonce, U256::from(8u64));
        assert_eq!(auth.contract_address, implementation());

        let raw = chain.sent_raw.lock().unwrap();
        assert_eq!(raw[0][0], EIP7702_TX_TYPE);
        assert_eq!(hash, H256(ethers::utils::keccak256(&raw[0])));
    }

    #[tokio::test]
    async fn sponsored_authorization_uses_current_nonce() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        *chain.tx_count.lock().unwrap() = U256::from(7u64);
        *chain.relay_result.lock().unwrap() = Some(H256::repeat_byte(0x33));

        let hash = m.delegate(implementation(), Bytes::new(), true).await.unwrap();
        assert_eq!(hash, H256::repeat_byte(0x33));

        let relayed = chain.relayed.lock().unwrap();
        assert_eq!(relayed[0].authorization_list[0].nonce, U256::from(7u64));
        assert_eq!(relayed[0].to, m.signer.address().unwrap());
        assert!(chain.sent_raw.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn relayer_without_hash_is_unknown() {
        let (m, _chain) = manager(Some(TEST_MNEMONIC));
        let err = m.delegate(implementation(), Bytes::new(), true).await.unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN");
    }

    #[tokio::test]
    async fn intrinsic_gas_failure_is_low_funds() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        *chain.estimate_gas_error.lock().unwrap() = Some(ExecutionError {
            code: -32000,
            message: "intrinsic gas too low".into(),
        });
        let err = m.delegate(implementation(), Bytes::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), "LOW_FUNDS");

        *chain.estimate_gas_error.lock().unwrap() = Some(ExecutionError {
            code: 3,
            message: "execution reverted".into(),
        });
        let err = m.delegate(implementation(), Bytes::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN");
    }

    #[tokio::test]
    async fn missing_or_reverted_receipt() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        *chain.receipt_status.lock().unwrap() = None;
        let err = m.delegate(implementation(), Bytes::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), "TIMEOUT");

        *chain.receipt_status.lock().unwrap() = Some(0);
        let err = m.delegate(implementation(), Bytes::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN");
    }

    #[tokio::test]
    async fn undelegate_authorizes_zero_address() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        m.undelegate(false).await.unwrap();
        let estimates = chain.estimates.lock().unwrap();
        assert_eq!(
            estimates[0].authorization_list.as_ref().unwrap()[0].contract_address,
            Address::zero()
        );
        assert_eq!(estimates[0].data, Some(Bytes::new()));
    }

    #[tokio::test]
    async fn status_reads_delegation_pointer() {
        let (m, chain) = manager(Some(TEST_MNEMONIC));
        let account = m.signer.address().unwrap();
        assert_eq!(m.delegation_status(account).await.unwrap(), None);

        let mut code = vec![0xef, 0x01, 0x00];
        code.extend_from_slice(implementation().as_bytes());
        chain.code.lock().unwrap().insert(account, Bytes::from(code));
        assert_eq!(
            m.delegation_status(account).await.unwrap(),
            Some(implementation())
        );
    }
}
