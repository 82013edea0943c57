use crate::types::{Execution, PaymasterFields, UnpackedUserOperation, UserOperation};
use anyhow::{bail, Result};
use ethers::abi::{encode, AbiParser, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// Kernel v3 execution mode: call type batch (`0x01`), default exec type, no selector or context.
pub const BATCH_EXEC_MODE: [u8; 32] = {
    let mut mode = [0u8; 32];
    mode[0] = 0x01;
    mode
};

/// Code prefix of an EIP-7702 delegated account.
pub const DELEGATION_PREFIX: [u8; 3] = [0xef, 0x01, 0x00];

const PAYMASTER_HEADER_LEN: usize = 20 + 16 + 16;

/// Two 16-byte big-endian integers in one word, `high` first.
pub fn pack_u128_pair(high: u128, low: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&high.to_be_bytes());
    out[16..].copy_from_slice(&low.to_be_bytes());
    out
}

pub fn unpack_u128_pair(packed: &[u8; 32]) -> (u128, u128) {
    let mut high = [0u8; 16];
    let mut low = [0u8; 16];
    high.copy_from_slice(&packed[..16]);
    low.copy_from_slice(&packed[16..]);
    (u128::from_be_bytes(high), u128::from_be_bytes(low))
}

pub fn pack_paymaster_and_data(pm: Option<&PaymasterFields>) -> Bytes {
    let Some(pm) = pm else {
        return Bytes::new();
    };
    let mut out = Vec::with_capacity(PAYMASTER_HEADER_LEN + pm.data.len());
    out.extend_from_slice(pm.paymaster.as_bytes());
    out.extend_from_slice(&pm.verification_gas_limit.to_be_bytes());
    out.extend_from_slice(&pm.post_op_gas_limit.to_be_bytes());
    out.extend_from_slice(pm.data.as_ref());
    Bytes::from(out)
}

pub fn unpack_paymaster_and_data(blob: &[u8]) -> Result<Option<PaymasterFields>> {
    if blob.is_empty() {
        return Ok(None);
    }
    if blob.len() < PAYMASTER_HEADER_LEN {
        bail!(
            "paymasterAndData must be empty or at least {PAYMASTER_HEADER_LEN} bytes, got {}",
            blob.len()
        );
    }

    let mut verification = [0u8; 16];
    let mut post_op = [0u8; 16];
    verification.copy_from_slice(&blob[20..36]);
    post_op.copy_from_slice(&blob[36..52]);

    Ok(Some(PaymasterFields {
        paymaster: Address::from_slice(&blob[..20]),
        verification_gas_limit: u128::from_be_bytes(verification),
        post_op_gas_limit: u128::from_be_bytes(post_op),
        data: Bytes::from(blob[PAYMASTER_HEADER_LEN..].to_vec()),
    }))
}

/// Packs discrete gas and paymaster fields into the on-chain layout. `initCode` is
/// always empty: accounts are already deployed (or delegated).
pub fn pack_user_operation(op: &UnpackedUserOperation) -> UserOperation {
    UserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: Bytes::new(),
        call_data: op.call_data.clone(),
        account_gas_limits: pack_u128_pair(op.verification_gas_limit, op.call_gas_limit),
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: pack_u128_pair(op.max_priority_fee_per_gas, op.max_fee_per_gas),
        paymaster_and_data: pack_paymaster_and_data(op.paymaster.as_ref()),
        signature: op.signature.clone(),
    }
}

pub fn unpack_user_operation(op: &UserOperation) -> Result<UnpackedUserOperation> {
    if !op.init_code.is_empty() {
        bail!("initCode is not supported; the account must already be deployed");
    }
    let (verification_gas_limit, call_gas_limit) = unpack_u128_pair(&op.account_gas_limits);
    let (max_priority_fee_per_gas, max_fee_per_gas) = unpack_u128_pair(&op.gas_fees);

    Ok(UnpackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        call_data: op.call_data.clone(),
        call_gas_limit,
        verification_gas_limit,
        pre_verification_gas: op.pre_verification_gas,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        paymaster: unpack_paymaster_and_data(&op.paymaster_and_data)?,
        signature: op.signature.clone(),
    })
}

/// EntryPoint v0.7 `getUserOpHash`:
/// `keccak256(abi.encode(keccak256(abi.encode(packed fields)), entryPoint, chainId))`.
pub fn hash_operation(chain_id: u64, entry_point: Address, op: &UserOperation) -> H256 {
    let inner = encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::FixedBytes(op.account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.to_vec()),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ]);

    let outer = encode(&[
        Token::FixedBytes(keccak256(inner).to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]);

    H256(keccak256(outer))
}

/// `abi.encode((address,uint256,bytes)[])`, the batch execution calldata Kernel decodes.
pub fn encode_executions(executions: &[Execution]) -> Bytes {
    let items = executions
        .iter()
        .map(|e| {
            Token::Tuple(vec![
                Token::Address(e.target),
                Token::Uint(e.value),
                Token::Bytes(e.call_data.to_vec()),
            ])
        })
        .collect();
    Bytes::from(encode(&[Token::Array(items)]))
}

/// Smart-account calldata: `execute(bytes32 execMode, bytes executionCalldata)` in batch mode.
pub fn encode_execute_batch(executions: &[Execution]) -> Result<Bytes> {
    let execute = AbiParser::default()
        .parse_function("function execute(bytes32 execMode, bytes executionCalldata)")?;
    let data = execute.encode_input(&[
        Token::FixedBytes(BATCH_EXEC_MODE.to_vec()),
        Token::Bytes(encode_executions(executions).to_vec()),
    ])?;
    Ok(Bytes::from(data))
}

/// The implementation an EIP-7702 delegated account points at, if `code` is a delegation pointer.
pub fn delegation_target(code: &[u8]) -> Option<Address> {
    if code.len() != DELEGATION_PREFIX.len() + 20 || !code.starts_with(&DELEGATION_PREFIX) {
        return None;
    }
    Some(Address::from_slice(&code[DELEGATION_PREFIX.len()..]))
}
