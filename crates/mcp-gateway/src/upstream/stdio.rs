//! STDIO transport: spawns an upstream MCP server as a child process and
//! speaks newline-delimited JSON-RPC over its stdin/stdout. Stderr is
//! drained into the gateway's logs. The transport's lifetime is tied to
//! the process; closing it terminates and reaps the child.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::error::{TransportError, TransportResult};
use crate::protocol::{
    CallToolParams, CallToolResult, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestInfo,
    ToolInfo, method,
};
use crate::upstream::rpc::{RpcClient, parse_call_result, parse_tools_result};
use crate::upstream::{RpcTransport, Transport, TransportStatus, upstream_error};

/// Buffered outbound requests to the child's stdin.
const OUTBOUND_BUFFER: usize = 64;

/// Grace period for reaping the child after kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Child-process upstream transport.
pub struct StdioTransport {
    name: String,
    command: String,
    args: Vec<String>,
    preinstalled: bool,
    call_timeout: Duration,
    status: Arc<RwLock<TransportStatus>>,
    live: Mutex<Option<Live>>,
}

struct Live {
    rpc: Arc<RpcClient>,
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl Live {
    fn abort_tasks(&self) {
        self.reader.abort();
        self.writer.abort();
        self.stderr.abort();
    }
}

impl StdioTransport {
    /// Build a transport for `command + args`. No process is spawned here.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        preinstalled: bool,
        call_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            preinstalled,
            call_timeout,
            status: Arc::new(RwLock::new(TransportStatus::New)),
            live: Mutex::new(None),
        }
    }

    async fn set_status(&self, status: TransportStatus) {
        *self.status.write().await = status;
    }

    async fn rpc(&self) -> TransportResult<Arc<RpcClient>> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| Arc::clone(&live.rpc))
            .ok_or_else(|| TransportError::not_connected(&self.name))
    }

    async fn ensure_connected(&self) -> TransportResult<Arc<RpcClient>> {
        if self.status.read().await.is_ready() {
            return self.rpc().await;
        }
        self.connect().await?;
        self.rpc().await
    }

    async fn spawn(&self) -> TransportResult<Live> {
        // Provisioning failure is reported distinctly from connect failure.
        if !self.preinstalled {
            probe_command(&self.command)?;
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::connect(format!("spawn '{}': {e}", self.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::connect("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::connect("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::connect("child stderr not captured"))?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<JsonRpcRequest>(OUTBOUND_BUFFER);
        let rpc = RpcClient::new(&self.name, outbound_tx, self.call_timeout);

        let writer_name = self.name.clone();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(request) = outbound_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&request) else {
                    continue;
                };
                line.push('\n');
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    tracing::warn!(upstream = %writer_name, error = %err, "stdin write failed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_rpc = Arc::clone(&rpc);
        let reader_status = Arc::clone(&self.status);
        let reader_name = self.name.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(response) => reader_rpc.dispatch(response).await,
                            Err(err) => {
                                tracing::warn!(
                                    upstream = %reader_name,
                                    error = %err,
                                    "unparseable stdout line, dropped"
                                );
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            tracing::warn!(upstream = %reader_name, "child stdout closed");
            *reader_status.write().await = TransportStatus::Failed;
            reader_rpc.fail_all().await;
        });

        let stderr_name = self.name.clone();
        let stderr = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(upstream = %stderr_name, "stderr: {line}");
            }
        });

        let live = Live { rpc: Arc::clone(&rpc), child, reader, writer, stderr };

        let init = rpc
            .request(
                method::INITIALIZE,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-gateway",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await;
        match init {
            Ok(response) => {
                if let Some(error) = &response.error {
                    live.abort_tasks();
                    return Err(upstream_error(error));
                }
            }
            Err(err) => {
                live.abort_tasks();
                return Err(TransportError::connect(format!("initialize failed: {err}")));
            }
        }
        if let Err(err) = rpc.notify(method::INITIALIZED, serde_json::json!({})).await {
            live.abort_tasks();
            return Err(err);
        }

        Ok(live)
    }

    async fn do_call(&self, params: &CallToolParams) -> TransportResult<CallToolResult> {
        let rpc = self.rpc().await?;
        let response = rpc
            .request(
                method::TOOLS_CALL,
                serde_json::json!({"name": params.name, "arguments": params.arguments}),
            )
            .await?;
        parse_call_result(&response)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> TransportStatus {
        *self.status.read().await
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut live = self.live.lock().await;
        if let Some(mut previous) = live.take() {
            previous.abort_tasks();
            let _ = previous.child.start_kill();
        }
        self.set_status(TransportStatus::Connecting).await;

        match self.spawn().await {
            Ok(fresh) => {
                *live = Some(fresh);
                self.set_status(TransportStatus::Ready).await;
                tracing::info!(upstream = %self.name, command = %self.command, "stdio transport connected");
                Ok(())
            }
            Err(err) => {
                self.set_status(TransportStatus::Failed).await;
                Err(err)
            }
        }
    }

    async fn fetch_tools(&self) -> TransportResult<Vec<ToolInfo>> {
        let rpc = self.ensure_connected().await?;
        let response = rpc.request(method::TOOLS_LIST, serde_json::json!({})).await?;
        parse_tools_result(&response)
    }

    async fn call_tools(
        &self,
        params: CallToolParams,
        _request_info: &RequestInfo,
    ) -> TransportResult<CallToolResult> {
        self.ensure_connected().await?;
        match self.do_call(&params).await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(upstream = %self.name, error = %err, "respawning after failure");
                self.connect().await?;
                self.do_call(&params).await
            }
            other => other,
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.set_status(TransportStatus::Closing).await;
        if let Some(mut live) = self.live.lock().await.take() {
            live.rpc.fail_all().await;
            live.abort_tasks();
            let _ = live.child.start_kill();
            // Reap the child so it does not linger as a zombie.
            let _ = tokio::time::timeout(REAP_TIMEOUT, live.child.wait()).await;
        }
        self.set_status(TransportStatus::Closed).await;
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for StdioTransport {
    async fn rpc_handle(&self) -> TransportResult<Arc<RpcClient>> {
        self.ensure_connected().await
    }
}

/// Best-effort PATH probe of the command binary. A missing binary is an
/// install failure, not a connect failure; no installer is invoked.
fn probe_command(command: &str) -> TransportResult<()> {
    if command.contains('/') {
        if Path::new(command).is_file() {
            return Ok(());
        }
        return Err(TransportError::install(format!("command not found: {command}")));
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        if dir.join(command).is_file() {
            return Ok(());
        }
    }
    Err(TransportError::install(format!("command not found on PATH: {command}")))
}
