use crate::broker::{Broker, ProviderSnapshot};
use crate::encoding::fmt_address;
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::pending::{Approval, Caller, PendingRequest};
use crate::transport::{ApprovalUi, ProviderInfo, Transport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const PARSE_ERROR: i64 = -32700;

/// Methods whose success can change the accounts an origin sees.
const CHANGES_ACCOUNTS: &[&str] = &[
    "eth_requestAccounts",
    "wallet_requestPermissions",
    "wallet_revokePermissions",
];

/// EIP-1193 `accountsChanged` for one origin.
fn accounts_changed(origin: &str, accounts: &[Address]) -> Value {
    json!({
        "event": "accountsChanged",
        "origin": origin,
        "data": accounts.iter().copied().map(fmt_address).collect::<Vec<_>>(),
    })
}

/// One line written to the page / UI side.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Announce { info: ProviderInfo },
    Approval { request: PendingRequest },
    Closed { id: RequestId },
    Response { response: JsonRpcResponse },
    State { state: ProviderSnapshot },
    Event { event: Value },
}

/// One line read from the page / UI side.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inbound {
    Call {
        #[serde(default)]
        origin: Option<String>,
        #[serde(default)]
        icon: Option<String>,
        request: JsonRpcRequest,
    },
    Decision {
        id: RequestId,
        allow: bool,
        #[serde(default)]
        accounts: Option<Vec<Address>>,
    },
    State,
}

/// Outbound side of the line protocol. Doubles as the broker's approval UI: parked
/// requests are written out as `approval` lines.
#[derive(Clone, Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, msg: Outbound) -> Result<()> {
        self.tx.send(msg).map_err(|_| anyhow!("transport closed"))
    }
}

impl ApprovalUi for ChannelTransport {
    fn request_shown(&self, request: &PendingRequest) {
        if self
            .push(Outbound::Approval {
                request: request.clone(),
            })
            .is_err()
        {
            tracing::warn!(id = %request.id, "approval request not delivered; transport closed");
        }
    }

    fn request_closed(&self, id: &RequestId) {
        let _ = self.push(Outbound::Closed { id: id.clone() });
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, response: JsonRpcResponse) -> Result<()> {
        self.push(Outbound::Response { response })
    }

    async fn notify(&self, event: Value) -> Result<()> {
        self.push(Outbound::Event { event })
    }
}

/// Runs the line-delimited JSON protocol until `reader` reaches EOF. Calls still in
/// flight at that point are abandoned.
pub async fn serve<R, W>(
    broker: Arc<Broker>,
    transport: ChannelTransport,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_task = tokio::spawn(write_lines(writer, outbound));

    let info = ProviderInfo::new();
    tracing::info!(uuid = %info.uuid, name = %info.name, "provider announced");
    transport.push(Outbound::Announce { info })?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read from transport")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let inbound = match serde_json::from_str::<Inbound>(line) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "malformed inbound line");
                let error = JsonRpcError {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {e}"),
                    data: None,
                };
                transport.send(JsonRpcResponse::error(None, error)).await?;
                continue;
            }
        };

        match inbound {
            Inbound::Call {
                origin,
                icon,
                request,
            } => {
                let broker = broker.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    let changes_accounts = CHANGES_ACCOUNTS.contains(&request.method.as_str());
                    let caller = Caller { origin, icon };
                    let response = broker.respond(&caller, request).await;
                    let succeeded = response.error.is_none();
                    if let Err(e) = transport.send(response).await {
                        tracing::warn!(error = %e, "response not delivered");
                    }
                    if let (true, true, Some(origin)) = (changes_accounts, succeeded, caller.origin) {
                        let accounts = broker.provider_state().permissions.accounts(&origin);
                        let event = accounts_changed(&origin, &accounts);
                        if let Err(e) = transport.notify(event).await {
                            tracing::warn!(error = %e, "accountsChanged not delivered");
                        }
                    }
                });
            }
            Inbound::Decision {
                id,
                allow,
                accounts,
            } => {
                let resolved = if allow {
                    broker.allow(&id, accounts.map(Approval::Accounts).unwrap_or_default())
                } else {
                    broker.deny(&id)
                };
                tracing::debug!(id = %id, allow, resolved, "decision received");
            }
            Inbound::State => {
                transport.push(Outbound::State {
                    state: broker.provider_state(),
                })?;
            }
        }
    }

    tracing::info!("transport input closed");
    writer_task.abort();
    Ok(())
}

async fn write_lines<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let mut line = serde_json::to_string(&msg).context("failed to encode outbound line")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write to transport")?;
        writer.flush().await.context("failed to flush transport")?;
    }
    Ok(())
}
