use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u128_quantity, parse_u256_quantity, user_op_to_json};
use crate::jsonrpc::JsonRpcError;
use crate::types::{GasLimits, UnpackedUserOperation};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ERC-4337 bundler RPC surface used by the operation pipeline.
#[async_trait]
pub trait BundlerApi: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
    ) -> Result<GasLimits>;

    async fn send_user_operation(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
    ) -> Result<H256>;

    /// One poll; `None` while the operation is not yet included.
    async fn get_user_operation_receipt(&self, op_hash: H256)
        -> Result<Option<UserOperationReceipt>>;

    async fn supported_entry_points(&self) -> Result<Vec<Address>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    #[serde(default)]
    pub success: bool,
    pub receipt: InclusionReceipt,
}

/// The bundle transaction receipt, trimmed to what wallets show.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionReceipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<H256>,
    #[serde(default)]
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        rpc_call(&self.http, &self.url, method, params).await
    }
}

#[async_trait]
impl BundlerApi for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
    ) -> Result<GasLimits> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_limits(&res)
    }

    async fn send_user_operation(
        &self,
        op: &UnpackedUserOperation,
        entry_point: Address,
    ) -> Result<H256> {
        let params = serde_json::json!([user_op_to_json(op), fmt_address(entry_point)]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([fmt_h256(op_hash)]);
        let res = self
            .rpc("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        let receipt = serde_json::from_value(res).context("malformed user operation receipt")?;
        Ok(Some(receipt))
    }

    async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await
            .context("eth_supportedEntryPoints failed")?;
        serde_json::from_value(res).context("malformed eth_supportedEntryPoints result")
    }
}

/// Plain JSON-RPC POST. Error objects in the response body come back as a typed
/// [`JsonRpcError`] so callers can inspect the code.
pub(crate) async fn rpc_call(
    http: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value> {
    let req = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let resp = http
        .post(url)
        .json(&req)
        .send()
        .await
        .with_context(|| format!("POST {url} failed"))?;

    let status = resp.status();
    let body: Value = resp.json().await.context("failed to decode JSON")?;

    if let Some(err) = body.get("error") {
        let err: JsonRpcError = serde_json::from_value(err.clone())
            .map_err(|_| anyhow!("RPC error: {err}"))?;
        return Err(err.into());
    }

    if !status.is_success() {
        return Err(anyhow!("HTTP {}: {}", status, body));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| anyhow!("missing result field"))
}

fn parse_u128_field(v: &Value, key: &str) -> Result<u128> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u128_quantity(s)
}

fn parse_gas_limits(res: &Value) -> Result<GasLimits> {
    let pre_verification_gas = res
        .get("preVerificationGas")
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field preVerificationGas"))?;

    Ok(GasLimits {
        call_gas_limit: parse_u128_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u128_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_u256_quantity(pre_verification_gas)?,
        paymaster_verification_gas_limit: match res.get("paymasterVerificationGasLimit") {
            Some(Value::String(s)) => Some(parse_u128_quantity(s)?),
            _ => None,
        },
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Usually a bare string; some providers wrap it in an object.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn parse_userop_hash_accepts_bare_and_wrapped() {
        let expected = parse_h256(HASH).unwrap();
        for res in [
            json!(HASH),
            json!({ "result": HASH }),
            json!({ "userOpHash": HASH }),
            json!({ "userOperationHash": HASH }),
        ] {
            assert_eq!(parse_userop_hash(&res).unwrap(), expected);
        }
    }

    #[test]
    fn parse_userop_hash_rejects_unknown_shape() {
        let res = json!({ "foo": "bar" });
        assert!(parse_userop_hash(&res).is_err());
    }

    #[test]
    fn gas_estimate_reads_v07_fields() {
        let res = json!({
            "callGasLimit": "0x12c9b5",
            "verificationGasLimit": "0x114fc",
            "preVerificationGas": "0xbf14",
            "paymasterVerificationGasLimit": "0x7530"
        });
        let limits = parse_gas_limits(&res).unwrap();
        assert_eq!(limits.call_gas_limit, 0x12c9b5);
        assert_eq!(limits.verification_gas_limit, 0x114fc);
        assert_eq!(limits.pre_verification_gas, U256::from(0xbf14u64));
        assert_eq!(limits.paymaster_verification_gas_limit, Some(0x7530));

        let res = json!({ "callGasLimit": "0x1", "verificationGasLimit": "0x2" });
        assert!(parse_gas_limits(&res).is_err());
    }

    #[test]
    fn receipt_deserializes_from_bundler_shape() {
        let receipt: UserOperationReceipt = serde_json::from_value(json!({
            "userOpHash": HASH,
            "success": true,
            "actualGasUsed": "0x1",
            "receipt": {
                "transactionHash": HASH,
                "blockHash": HASH,
                "blockNumber": "0x10",
                "gasUsed": "0x5208",
                "status": "0x1",
                "cumulativeGasUsed": "0x5208",
                "logs": [{
                    "address": "0x0000000071727de22e5e9d8baf0edac6f37da032",
                    "topics": [HASH],
                    "data": "0x",
                    "logIndex": "0x0"
                }]
            }
        }))
        .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.receipt.block_number, Some(U64::from(16)));
        assert_eq!(receipt.receipt.logs.len(), 1);
    }
}
