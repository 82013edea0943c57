use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{keccak256, rlp::RlpStream};
use serde::{Deserialize, Serialize};

/// ERC-4337 UserOperation (EntryPoint v0.7 packed layout).
///
/// `account_gas_limits` is `verificationGasLimit ‖ callGasLimit` and `gas_fees` is
/// `maxPriorityFeePerGas ‖ maxFeePerGas`, each half a 16-byte big-endian integer.
/// `paymaster_and_data` is empty or
/// `paymaster ‖ paymasterVerificationGasLimit ‖ paymasterPostOpGasLimit ‖ paymasterData`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub account_gas_limits: [u8; 32],
    pub pre_verification_gas: U256,
    pub gas_fees: [u8; 32],
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Discrete gas and paymaster fields, the shape bundlers and paymasters accept over JSON-RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnpackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub call_data: Bytes,
    pub call_gas_limit: u128,
    pub verification_gas_limit: u128,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub paymaster: Option<PaymasterFields>,
    pub signature: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: u128,
    pub post_op_gas_limit: u128,
    pub data: Bytes,
}

/// One atomic call inside a batched smart-account execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub target: Address,
    pub value: U256,
    pub call_data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasLimits {
    pub call_gas_limit: u128,
    pub verification_gas_limit: u128,
    pub pre_verification_gas: U256,
    /// Only reported when the estimated operation carries a paymaster.
    pub paymaster_verification_gas_limit: Option<u128>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeEstimate {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Signed EIP-7702 authorization tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    #[serde(rename = "address")]
    pub contract_address: Address,
    pub chain_id: U256,
    pub nonce: U256,
    pub r: U256,
    pub s: U256,
    pub y_parity: ethers::types::U64,
}

impl Authorization {
    /// Digest the authority signs: `keccak256(0x05 ‖ rlp([chain_id, address, nonce]))`.
    pub fn signing_hash(chain_id: u64, contract_address: Address, nonce: u64) -> H256 {
        let mut rlp = RlpStream::new_list(3);
        rlp.append(&chain_id);
        rlp.append(&contract_address);
        rlp.append(&nonce);

        let mut msg = vec![AUTHORIZATION_MAGIC];
        msg.extend_from_slice(&rlp.out());
        H256(keccak256(msg))
    }

    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.chain_id);
        s.append(&self.contract_address);
        s.append(&self.nonce);
        s.append(&self.y_parity.as_u64());
        s.append(&self.r);
        s.append(&self.s);
    }
}

const AUTHORIZATION_MAGIC: u8 = 0x05;
pub const EIP7702_TX_TYPE: u8 = 0x04;

/// Unsigned EIP-7702 (type 4) transaction. The access list is always empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eip7702Transaction {
    pub chain_id: u64,
    pub nonce: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub authorization_list: Vec<Authorization>,
}

impl Eip7702Transaction {
    fn rlp_fields(&self, s: &mut RlpStream) {
        s.append(&self.chain_id);
        s.append(&self.nonce);
        s.append(&self.max_priority_fee_per_gas);
        s.append(&self.max_fee_per_gas);
        s.append(&self.gas_limit);
        s.append(&self.to);
        s.append(&self.value);
        s.append(&self.data.to_vec());
        s.begin_list(0);
        s.begin_list(self.authorization_list.len());
        for auth in &self.authorization_list {
            auth.rlp_append(s);
        }
    }

    /// `keccak256(0x04 ‖ rlp(unsigned fields))`
    pub fn sighash(&self) -> H256 {
        let mut s = RlpStream::new_list(10);
        self.rlp_fields(&mut s);
        let mut payload = vec![EIP7702_TX_TYPE];
        payload.extend_from_slice(&s.out());
        H256(keccak256(payload))
    }

    /// Typed envelope ready for `eth_sendRawTransaction`. `y_parity` must be 0 or 1.
    pub fn rlp_signed(&self, y_parity: u8, r: U256, s_val: U256) -> Bytes {
        let mut s = RlpStream::new_list(13);
        self.rlp_fields(&mut s);
        s.append(&y_parity);
        s.append(&r);
        s.append(&s_val);
        let mut out = vec![EIP7702_TX_TYPE];
        out.extend_from_slice(&s.out());
        Bytes::from(out)
    }
}
