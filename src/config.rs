use anyhow::{anyhow, bail, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

pub const DEFAULT_CHAIN_ID: u64 = 911_867;
pub const DEFAULT_RPC_URL: &str = "https://odyssey.ithaca.xyz";
pub const DEFAULT_BUNDLER_URL: &str = "https://public.pimlico.io/v2/911867/rpc";
/// ERC-4337 EntryPoint v0.7.
pub const DEFAULT_ENTRY_POINT: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";
/// Kernel v3 implementation the wallet delegates to.
pub const DEFAULT_ACCOUNT_IMPLEMENTATION: &str = "0x21523eaa06791d2524eb2788af8aa0e1cfbb61b7";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasEstimation {
    /// `eth_estimateUserOperationGas`, falling back to fixed limits when unsupported.
    #[default]
    Bundler,
    /// Fixed conservative limits only.
    Fixed,
}

/// On-disk shape of the wallet config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfigRaw {
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub rpc: Option<String>,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub account_implementation: Option<String>,
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub receipt_poll_millis: Option<u64>,
    #[serde(default)]
    pub receipt_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub gas_estimation: Option<GasEstimation>,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    pub account_implementation: Address,
    /// `None` waits for the user indefinitely.
    pub approval_timeout: Option<Duration>,
    pub receipt_poll: Duration,
    pub receipt_timeout: Duration,
    pub gas_estimation: GasEstimation,
    pub store_path: PathBuf,
}

/// Command-line / environment values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub rpc: Option<String>,
    pub bundler: Option<String>,
    pub store_path: Option<PathBuf>,
    pub approval_timeout_seconds: Option<u64>,
}

impl WalletConfig {
    /// `eth_chainId` / EIP-5792 form of the chain id.
    pub fn chain_hex(&self) -> String {
        format!("0x{:x}", self.chain_id)
    }

    pub fn from_raw(raw: WalletConfigRaw, overrides: ConfigOverrides) -> Result<Self> {
        let chain_id = raw.chain_id.unwrap_or(DEFAULT_CHAIN_ID);
        if chain_id == 0 {
            bail!("chainId must be > 0");
        }

        let rpc_url = resolve_url(
            overrides.rpc,
            raw.rpc_env_var.as_deref(),
            raw.rpc,
            DEFAULT_RPC_URL,
        );
        let bundler_url = resolve_url(
            overrides.bundler,
            raw.bundler_env_var.as_deref(),
            raw.bundler,
            DEFAULT_BUNDLER_URL,
        );
        if rpc_url.trim().is_empty() {
            bail!("rpc url is empty");
        }
        if bundler_url.trim().is_empty() {
            bail!("bundler url is empty");
        }
        for url in [&rpc_url, &bundler_url] {
            if looks_like_embedded_key(url) {
                tracing::warn!("RPC URL looks like it may contain an API key; consider using rpcEnvVar / bundlerEnvVar instead of committing it.");
            }
        }

        let entry_point = parse_addr(raw.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT))
            .context("invalid entryPoint address")?;
        let account_implementation = parse_addr(
            raw.account_implementation
                .as_deref()
                .unwrap_or(DEFAULT_ACCOUNT_IMPLEMENTATION),
        )
        .context("invalid accountImplementation address")?;

        let approval_timeout_seconds = overrides
            .approval_timeout_seconds
            .or(raw.approval_timeout_seconds)
            .unwrap_or(0);

        Ok(Self {
            chain_id,
            rpc_url,
            bundler_url,
            entry_point,
            account_implementation,
            approval_timeout: (approval_timeout_seconds > 0)
                .then(|| Duration::from_secs(approval_timeout_seconds)),
            receipt_poll: Duration::from_millis(raw.receipt_poll_millis.unwrap_or(1500).max(100)),
            receipt_timeout: Duration::from_secs(raw.receipt_timeout_seconds.unwrap_or(120).max(1)),
            gas_estimation: raw.gas_estimation.unwrap_or_default(),
            store_path: overrides
                .store_path
                .or(raw.store_path)
                .unwrap_or_else(default_store_path),
        })
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            rpc_url: DEFAULT_RPC_URL.to_string(),
            bundler_url: DEFAULT_BUNDLER_URL.to_string(),
            entry_point: Address::from_str(DEFAULT_ENTRY_POINT).unwrap_or_default(),
            account_implementation: Address::from_str(DEFAULT_ACCOUNT_IMPLEMENTATION)
                .unwrap_or_default(),
            approval_timeout: None,
            receipt_poll: Duration::from_millis(1500),
            receipt_timeout: Duration::from_secs(120),
            gas_estimation: GasEstimation::Bundler,
            store_path: default_store_path(),
        }
    }
}

/// Reads the config file (when given) and applies overrides.
pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<WalletConfig> {
    let raw = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read wallet config at {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse wallet config at {}", path.display()))?
        }
        None => WalletConfigRaw::default(),
    };
    WalletConfig::from_raw(raw, overrides)
}

fn resolve_url(
    override_url: Option<String>,
    env_var: Option<&str>,
    file_url: Option<String>,
    default: &str,
) -> String {
    override_url
        .or_else(|| env_var.and_then(|k| env::var(k).ok()))
        .or(file_url)
        .unwrap_or_else(|| default.to_string())
}

fn looks_like_embedded_key(url: &str) -> bool {
    url.contains("alchemy.com/v2/") || url.contains("infura.io/v3/") || url.contains("apikey=")
}

fn default_store_path() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".wen").join("wallet.json"),
        None => PathBuf::from(".wen").join("wallet.json"),
    }
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: serde_json::Value) -> WalletConfigRaw {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn defaults_target_odyssey_and_entry_point_v07() {
        let cfg = WalletConfig::from_raw(WalletConfigRaw::default(), Default::default()).unwrap();
        assert_eq!(cfg.chain_id, 911_867);
        assert_eq!(cfg.chain_hex(), "0xde9fb");
        assert_eq!(cfg.entry_point, parse_addr(DEFAULT_ENTRY_POINT).unwrap());
        assert_eq!(cfg.approval_timeout, None);
        assert_eq!(cfg.gas_estimation, GasEstimation::Bundler);
    }

    #[test]
    fn overrides_beat_file_values() {
        let cfg = WalletConfig::from_raw(
            raw(json!({
                "chainId": 31337,
                "rpc": "http://file",
                "bundler": "http://bundler",
                "approvalTimeoutSeconds": 30,
                "gasEstimation": "fixed"
            })),
            ConfigOverrides {
                rpc: Some("http://cli".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.rpc_url, "http://cli");
        assert_eq!(cfg.bundler_url, "http://bundler");
        assert_eq!(cfg.approval_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.gas_estimation, GasEstimation::Fixed);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(WalletConfig::from_raw(raw(json!({"chainId": 0})), Default::default()).is_err());
        assert!(WalletConfig::from_raw(raw(json!({"rpc": " "})), Default::default()).is_err());
        assert!(
            WalletConfig::from_raw(raw(json!({"entryPoint": "0x1234"})), Default::default())
                .is_err()
        );
    }

    #[test]
    fn load_reads_camel_case_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wen.json");
        fs::write(
            &path,
            r#"{ "chainId": 10, "storePath": "/tmp/wen-test.json", "receiptPollMillis": 250 }"#,
        )
        .unwrap();
        let cfg = load_config(Some(&path), Default::default()).unwrap();
        assert_eq!(cfg.chain_id, 10);
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/wen-test.json"));
        assert_eq!(cfg.receipt_poll, Duration::from_millis(250));
    }
}
