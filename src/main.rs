use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::signers::coins_bip39::{English, Mnemonic};
use ethers::types::Bytes;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use wen_wallet::config::{load_config, ConfigOverrides, WalletConfig};
use wen_wallet::encoding::{fmt_address, fmt_h256, parse_bytes, parse_h256};
use wen_wallet::jsonrpc::RequestId;
use wen_wallet::pending::{CallBatch, PendingRequest, WalletCall};
use wen_wallet::server::{serve, ChannelTransport};
use wen_wallet::storage::{FileStore, SecretStore};
use wen_wallet::transport::ApprovalUi;
use wen_wallet::Broker;

// Machine-readable output goes to stdout; everything for humans goes to stderr.
macro_rules! outln {
    ($json:expr, $($arg:tt)*) => {{
        if $json {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(
    name = "wen",
    version,
    about = "wen wallet: EIP-1193 request broker, ERC-4337 operations and EIP-7702 delegation"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Wallet config file (JSON). Defaults are used for anything it leaves out.
    #[arg(long, global = true, env = "WEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the chain RPC URL.
    #[arg(long, global = true, env = "WEN_RPC_URL")]
    rpc: Option<String>,

    /// Override the ERC-4337 bundler URL.
    #[arg(long, global = true, env = "WEN_BUNDLER_URL")]
    bundler: Option<String>,

    /// Secret store file holding the recovery phrase.
    #[arg(long, global = true, env = "WEN_STORE")]
    store: Option<PathBuf>,

    /// Seconds a page request may wait for approval. 0 waits forever.
    #[arg(long, global = true, env = "WEN_APPROVAL_TIMEOUT_SECONDS")]
    approval_timeout_seconds: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the wallet address and its delegation status.
    Account(AccountArgs),

    /// Run the request broker over stdin/stdout (line-delimited JSON).
    Serve,

    /// Delegate the account to the configured smart-account implementation (EIP-7702).
    Delegate(DelegateArgs),

    /// Clear the account's delegation.
    Undelegate(UndelegateArgs),

    /// Build, sign and submit a batch of calls as one UserOperation.
    SendCalls(SendCallsArgs),

    /// EIP-5792 status of a submitted batch.
    CallsStatus(CallsStatusArgs),
}

#[derive(Args, Debug)]
struct AccountArgs {
    /// Generate a new recovery phrase into the secret store. Never printed.
    #[arg(long, default_value_t = false)]
    generate: bool,

    /// Read a recovery phrase from this environment variable into the secret store.
    #[arg(long, conflicts_with = "generate")]
    import_env: Option<String>,

    /// Replace an existing phrase.
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Print a single JSON object to stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct DelegateArgs {
    /// Relay through the node's `wallet_sendTransaction` sponsor instead of paying gas.
    #[arg(long, default_value_t = false)]
    sponsored: bool,

    /// Calldata executed against the account in the delegation transaction.
    #[arg(long)]
    calldata: Option<String>,
}

#[derive(Args, Debug)]
struct UndelegateArgs {
    #[arg(long, default_value_t = false)]
    sponsored: bool,
}

#[derive(Args, Debug)]
struct SendCallsArgs {
    /// JSON file: `{ "calls": [{ "to", "value", "data" }], "capabilities": {...} }`.
    file: PathBuf,

    /// Sponsor gas through an ERC-7677 paymaster web service.
    #[arg(long, env = "WEN_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Do not wait for the operation to be included.
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct CallsStatusArgs {
    /// Operation hash returned by `send-calls`.
    op_hash: String,
}

#[derive(Debug, Deserialize)]
struct CallsFile {
    calls: Vec<WalletCall>,
    #[serde(default)]
    capabilities: Option<Value>,
}

/// Nothing is ever parked outside `serve`; a parked request here is a bug.
struct HeadlessUi;

impl ApprovalUi for HeadlessUi {
    fn request_shown(&self, request: &PendingRequest) {
        tracing::warn!(id = %request.id, kind = %request.kind(), "no approval UI attached");
    }

    fn request_closed(&self, _id: &RequestId) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // stdout carries protocol / script output only
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(
        cli.common.config.as_deref(),
        ConfigOverrides {
            rpc: cli.common.rpc.clone(),
            bundler: cli.common.bundler.clone(),
            store_path: cli.common.store.clone(),
            approval_timeout_seconds: cli.common.approval_timeout_seconds,
        },
    )?;

    match cli.cmd {
        Command::Account(args) => cmd_account(config, args).await,
        Command::Serve => cmd_serve(config).await,
        Command::Delegate(args) => cmd_delegate(config, args).await,
        Command::Undelegate(args) => cmd_undelegate(config, args).await,
        Command::SendCalls(args) => cmd_send_calls(config, args).await,
        Command::CallsStatus(args) => cmd_calls_status(config, args).await,
    }
}

fn open_store(config: &WalletConfig) -> Arc<dyn SecretStore> {
    Arc::new(FileStore::new(config.store_path.clone()))
}

async fn headless_broker(config: WalletConfig) -> Result<Broker> {
    let store = open_store(&config);
    Broker::connect(config, store, Arc::new(HeadlessUi)).await
}

fn generate_phrase() -> Result<String> {
    let mnemonic = Mnemonic::<English>::new_with_count(&mut OsRng, 12)
        .map_err(|e| anyhow!("failed to generate recovery phrase: {e}"))?;
    Ok(mnemonic.to_phrase())
}

async fn cmd_account(config: WalletConfig, args: AccountArgs) -> Result<()> {
    let store_path = config.store_path.clone();
    let broker = headless_broker(config).await?;

    let new_phrase = if args.generate {
        Some(generate_phrase()?)
    } else if let Some(var) = args.import_env.as_deref() {
        let phrase = std::env::var(var)
            .map_err(|_| anyhow!("missing recovery phrase env var '{var}'"))?;
        Some(phrase.trim().to_string())
    } else {
        None
    };

    if let Some(phrase) = new_phrase {
        if broker.wallet_address()?.is_some() && !args.force {
            bail!(
                "a recovery phrase is already stored at {}; pass --force to replace it",
                store_path.display()
            );
        }
        broker.set_mnemonic(Some(phrase))?;
        outln!(args.json, "saved recovery phrase to {}", store_path.display());
    }

    let address = broker
        .wallet_address()?
        .ok_or_else(|| anyhow!("no recovery phrase stored; run `wen account --generate`"))?;
    let delegation = broker.delegation().delegation_status(address).await?;
    let implementation = broker.config().account_implementation;

    if args.json {
        let out = json!({
            "address": fmt_address(address),
            "delegation": delegation.map(fmt_address),
            "smartAccount": delegation == Some(implementation),
            "store": store_path.display().to_string(),
        });
        println!("{out}");
        return Ok(());
    }

    println!("chainId:        {}", broker.config().chain_id);
    println!("address:        {}", fmt_address(address));
    match delegation {
        Some(target) => println!("delegation:     {}", fmt_address(target)),
        None => println!("delegation:     none"),
    }
    println!("smartAccount:   {}", delegation == Some(implementation));
    Ok(())
}

async fn cmd_serve(config: WalletConfig) -> Result<()> {
    let store = open_store(&config);
    let (transport, outbound) = ChannelTransport::new();
    let broker = Broker::connect(config, store, Arc::new(transport.clone())).await?;
    tracing::info!(
        chain_id = broker.config().chain_id,
        address = ?broker.wallet_address()?.map(fmt_address),
        "serving provider on stdio"
    );
    serve(
        Arc::new(broker),
        transport,
        outbound,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}

async fn cmd_delegate(config: WalletConfig, args: DelegateArgs) -> Result<()> {
    let calldata = match args.calldata.as_deref() {
        Some(s) => parse_bytes(s).context("invalid --calldata")?,
        None => Bytes::new(),
    };
    let broker = headless_broker(config).await?;
    let hash = broker
        .delegate(calldata, args.sponsored)
        .await
        .map_err(|e| anyhow!("{}: {e}", e.kind()))?;
    println!("{}", fmt_h256(hash));
    Ok(())
}

async fn cmd_undelegate(config: WalletConfig, args: UndelegateArgs) -> Result<()> {
    let broker = headless_broker(config).await?;
    let hash = broker
        .undelegate(args.sponsored)
        .await
        .map_err(|e| anyhow!("{}: {e}", e.kind()))?;
    println!("{}", fmt_h256(hash));
    Ok(())
}

async fn cmd_send_calls(config: WalletConfig, args: SendCallsArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let file: CallsFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.file.display()))?;
    let chain_hex = config.chain_hex();

    let broker = headless_broker(config).await?;
    let from = broker
        .wallet_address()?
        .ok_or_else(|| anyhow!("no recovery phrase stored; run `wen account --generate`"))?;

    let capabilities = match args.paymaster_url {
        Some(url) => Some(json!({ chain_hex.clone(): { "paymasterService": { "url": url } } })),
        None => file.capabilities,
    };
    let batch = CallBatch {
        version: "1.0".into(),
        chain_id: chain_hex,
        from,
        calls: file.calls,
        capabilities,
    };
    if batch.calls.is_empty() {
        bail!("{} contains no calls", args.file.display());
    }

    let op_hash = broker.pipeline().send_calls(&batch).await?;
    outln!(args.json, "userOpHash:     {}", fmt_h256(op_hash));

    let tx_hash = if args.no_wait {
        None
    } else {
        outln!(args.json, "waiting for inclusion...");
        broker.pipeline().await_inclusion(op_hash).await
    };
    match tx_hash {
        Some(tx) => outln!(args.json, "txHash:         {}", fmt_h256(tx)),
        None if !args.no_wait => outln!(args.json, "not included yet; check `wen calls-status`"),
        None => {}
    }

    if args.json {
        let out = json!({
            "userOpHash": fmt_h256(op_hash),
            "txHash": tx_hash.map(fmt_h256),
        });
        println!("{out}");
    }
    Ok(())
}

async fn cmd_calls_status(config: WalletConfig, args: CallsStatusArgs) -> Result<()> {
    let op_hash = parse_h256(&args.op_hash).context("invalid operation hash")?;
    let broker = headless_broker(config).await?;
    let status = broker.pipeline().calls_status(op_hash).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
