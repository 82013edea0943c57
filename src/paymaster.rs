use crate::bundler::rpc_call;
use crate::encoding::{self, parse_bytes, parse_u128_quantity, user_op_to_json};
use crate::types::UnpackedUserOperation;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;
use std::str::FromStr;

/// ERC-7677 paymaster web service (EntryPoint v0.7 fields).
#[async_trait]
pub trait PaymasterApi: Send + Sync {
    /// Placeholder sponsorship used while estimating gas.
    async fn get_paymaster_stub_data(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<PaymasterResponse>;

    /// Final sponsorship for an operation whose gas limits are settled.
    async fn get_paymaster_data(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<PaymasterResponse>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PaymasterResponse {
    pub paymaster: Address,
    pub paymaster_data: Bytes,
    pub verification_gas_limit: Option<u128>,
    pub post_op_gas_limit: Option<u128>,
    /// Stub data that is already final; `pm_getPaymasterData` can be skipped.
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct PaymasterClient {
    url: String,
    context: Value,
    http: reqwest::Client,
}

impl PaymasterClient {
    /// `context` is forwarded verbatim (for example a sponsorship policy id).
    pub fn new(url: String, context: Option<Value>) -> Self {
        Self {
            url,
            context: context.unwrap_or_else(|| serde_json::json!({})),
            http: reqwest::Client::new(),
        }
    }

    async fn call(
        &self,
        method: &str,
        op: &UnpackedUserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<PaymasterResponse> {
        let params = build_params(op, entry_point, chain_id, &self.context);
        let res = rpc_call(&self.http, &self.url, method, params)
            .await
            .with_context(|| format!("{method} RPC failed"))?;
        parse_v07_response(&res)
    }
}

#[async_trait]
impl PaymasterApi for PaymasterClient {
    async fn get_paymaster_stub_data(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<PaymasterResponse> {
        self.call("pm_getPaymasterStubData", op, entry_point, chain_id)
            .await
    }

    async fn get_paymaster_data(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<PaymasterResponse> {
        self.call("pm_getPaymasterData", op, entry_point, chain_id)
            .await
    }
}

fn build_params(
    op: &UnpackedUserOperation,
    entry_point: Address,
    chain_id: u64,
    context: &Value,
) -> Value {
    serde_json::json!([
        user_op_to_json(op),
        encoding::fmt_address(entry_point),
        encoding::fmt_u256(U256::from(chain_id)),
        context
    ])
}

fn parse_v07_response(result: &Value) -> Result<PaymasterResponse> {
    // ERC-7677 puts the fields at the top level; some providers nest them per entry point.
    let fields = if result.get("paymaster").is_some() {
        result
    } else {
        result
            .get("entrypointV07Response")
            .or_else(|| result.get("entryPointV07Response"))
            .ok_or_else(|| {
                anyhow!(
                    "missing paymaster (expected top-level paymaster or entrypointV07Response.paymaster)"
                )
            })?
    };

    let paymaster = fields
        .get("paymaster")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing paymaster field"))?;
    let paymaster = Address::from_str(paymaster).context("invalid paymaster address")?;

    let paymaster_data = match fields.get("paymasterData").and_then(|x| x.as_str()) {
        Some(s) => parse_bytes(s).context("invalid hex in paymasterData")?,
        None => Bytes::new(),
    };

    Ok(PaymasterResponse {
        paymaster,
        paymaster_data,
        verification_gas_limit: optional_quantity(fields, "paymasterVerificationGasLimit")?,
        post_op_gas_limit: optional_quantity(fields, "paymasterPostOpGasLimit")?,
        is_final: result
            .get("isFinal")
            .and_then(|x| x.as_bool())
            .unwrap_or(false),
    })
}

fn optional_quantity(v: &Value, key: &str) -> Result<Option<u128>> {
    match v.get(key) {
        Some(Value::String(s)) => Ok(Some(
            parse_u128_quantity(s).with_context(|| format!("invalid {key}"))?,
        )),
        Some(Value::Number(n)) => Ok(n.as_u64().map(u128::from)),
        _ => Ok(None),
    }
}
