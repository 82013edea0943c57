use crate::error::{WalletError, WalletResult};
use crate::storage::SecretStore;
use crate::types::{Authorization, Eip7702Transaction};
use anyhow::anyhow;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{Address, Bytes, Signature, H256, U256, U64};
use std::sync::Arc;

/// Key operations over the stored recovery phrase.
///
/// The key is derived again on every call (BIP-39 English, `m/44'/60'/0'/0/0`); nothing
/// about it is cached, so concurrent calls are independent.
#[derive(Clone)]
pub struct SigningBackend {
    store: Arc<dyn SecretStore>,
    chain_id: u64,
}

impl SigningBackend {
    pub fn new(store: Arc<dyn SecretStore>, chain_id: u64) -> Self {
        Self { store, chain_id }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    fn wallet(&self) -> WalletResult<LocalWallet> {
        let phrase = self.store.load_mnemonic()?.ok_or(WalletError::NoAccount)?;
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(phrase.as_str())
            .build()
            .map_err(|e| anyhow!("failed to derive key from recovery phrase: {e}"))?;
        Ok(wallet.with_chain_id(self.chain_id))
    }

    pub fn address(&self) -> WalletResult<Address> {
        Ok(self.wallet()?.address())
    }

    /// The wallet's own addresses; empty when no phrase is stored.
    pub fn addresses(&self) -> WalletResult<Vec<Address>> {
        match self.wallet() {
            Ok(w) => Ok(vec![w.address()]),
            Err(WalletError::NoAccount) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// EIP-191 `personal_sign`.
    pub async fn personal_sign(&self, message: &[u8]) -> WalletResult<Signature> {
        let wallet = self.wallet()?;
        let sig = wallet
            .sign_message(message)
            .await
            .map_err(|e| anyhow!("personal_sign failed: {e}"))?;
        Ok(sig)
    }

    /// EIP-712 v4.
    pub async fn sign_typed_data(&self, payload: &TypedData) -> WalletResult<Signature> {
        let wallet = self.wallet()?;
        let sig = wallet
            .sign_typed_data(payload)
            .await
            .map_err(|e| anyhow!("eth_signTypedData_v4 failed: {e}"))?;
        Ok(sig)
    }

    /// UserOperation signature: EIP-191 over the 32-byte operation hash, which is what
    /// ECDSA validators on the smart account recover against.
    pub async fn sign_operation_hash(&self, hash: H256) -> WalletResult<Bytes> {
        let sig = self.personal_sign(hash.as_bytes()).await?;
        Ok(Bytes::from(sig.to_vec()))
    }

    /// Raw secp256k1 signature over `hash`, `v` in {27, 28}.
    pub fn sign_hash(&self, hash: H256) -> WalletResult<Signature> {
        let wallet = self.wallet()?;
        let sig = wallet
            .sign_hash(hash)
            .map_err(|e| anyhow!("signing failed: {e}"))?;
        Ok(sig)
    }

    /// EIP-7702 authorization delegating this account's code to `contract_address`.
    pub fn sign_authorization(
        &self,
        chain_id: u64,
        contract_address: Address,
        nonce: u64,
    ) -> WalletResult<Authorization> {
        let sig = self.sign_hash(Authorization::signing_hash(chain_id, contract_address, nonce))?;
        Ok(Authorization {
            contract_address,
            chain_id: U256::from(chain_id),
            nonce: U256::from(nonce),
            r: sig.r,
            s: sig.s,
            y_parity: U64::from(y_parity(&sig)?),
        })
    }

    /// Signs an EIP-1559 (or legacy) transaction and returns the raw envelope.
    pub fn sign_transaction(&self, tx: &TypedTransaction) -> WalletResult<Bytes> {
        let wallet = self.wallet()?;
        let sig = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| anyhow!("transaction signing failed: {e}"))?;
        Ok(tx.rlp_signed(&sig))
    }

    /// Signs a type-4 transaction and returns the raw envelope.
    pub fn sign_eip7702(&self, tx: &Eip7702Transaction) -> WalletResult<Bytes> {
        let sig = self.sign_hash(tx.sighash())?;
        Ok(tx.rlp_signed(y_parity(&sig)?, sig.r, sig.s))
    }
}

fn y_parity(sig: &Signature) -> WalletResult<u8> {
    match sig.v {
        27 | 28 => Ok((sig.v - 27) as u8),
        0 | 1 => Ok(sig.v as u8),
        v => Err(anyhow!("unexpected signature v {v}").into()),
    }
}
