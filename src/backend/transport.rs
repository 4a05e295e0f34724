//! The transport seam: a narrow capability set every backend session
//! satisfies, plus the production factory that builds rmcp client sessions
//! over a spawned child process, streamable HTTP, or legacy SSE.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::*,
    service::RunningService,
    transport::sse_client::SseClientTransport,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::guard;
use crate::document::{ServerConfig, TransportKind};

/// Timeout applied to each forwarded request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which MCP capabilities a backend advertised at initialize time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub tools: bool,
    pub prompts: bool,
    pub resources: bool,
}

#[cfg(test)]
impl CapabilitySnapshot {
    pub fn all() -> Self {
        Self {
            tools: true,
            prompts: true,
            resources: true,
        }
    }
}

/// A live MCP session to one backend.
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn capabilities(&self) -> CapabilitySnapshot;
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn call_tool(&self, tool: &str, arguments: Option<JsonObject>) -> Result<CallToolResult>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>>;
    async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult>;
    async fn list_resources(&self) -> Result<Vec<Resource>>;
    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult>;
    async fn close(&self) -> Result<()>;
}

/// Opens transports. The manager is the only caller; tests substitute mocks.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, name: &str, config: &ServerConfig) -> Result<Box<dyn McpTransport>>;
}

/// Production factory: spawns child processes or connects HTTP/SSE endpoints
/// and performs the MCP initialize exchange.
pub struct RmcpFactory;

impl RmcpFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RmcpFactory {
    /// The manager has already interpolated `${VAR}` references and run the
    /// SSRF preflight by the time a config reaches this factory.
    async fn open(&self, name: &str, config: &ServerConfig) -> Result<Box<dyn McpTransport>> {
        let session = match config.effective_transport() {
            TransportKind::Stdio => RmcpSession::open_stdio(name, config).await?,
            TransportKind::StreamableHttp => RmcpSession::open_streamable_http(name, config).await?,
            TransportKind::Sse => RmcpSession::open_sse(name, config).await?,
        };
        Ok(Box::new(session))
    }
}

/// An rmcp client session plus, for stdio backends, the child process handle
/// retained for process-group cleanup.
pub struct RmcpSession {
    name: String,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    child: RwLock<Option<tokio::process::Child>>,
    capabilities: CapabilitySnapshot,
}

impl RmcpSession {
    fn snapshot_capabilities(service: &RunningService<rmcp::RoleClient, ()>) -> CapabilitySnapshot {
        match service.peer_info() {
            Some(info) => CapabilitySnapshot {
                tools: info.capabilities.tools.is_some(),
                prompts: info.capabilities.prompts.is_some(),
                resources: info.capabilities.resources.is_some(),
            },
            None => CapabilitySnapshot::default(),
        }
    }

    async fn open_stdio(name: &str, config: &ServerConfig) -> Result<Self> {
        let program = config
            .command
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("stdio backend '{name}' missing command"))?;

        let mut cmd = Command::new(program);
        cmd.args(&config.args)
            .env_clear()
            .envs(guard::base_env())
            .envs(guard::sanitize_env(&config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // Each child in its own process group for clean kill-group cleanup
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn backend '{name}'"))?;

        let pid = child.id();
        debug!(backend = %name, pid = ?pid, "spawned child process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdout from backend '{name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to capture stdin from backend '{name}'"))?;

        // rmcp accepts (AsyncRead, AsyncWrite) tuples as IntoTransport
        let service = ().serve((stdout, stdin)).await.with_context(|| {
            format!("failed MCP handshake with backend '{name}'")
        })?;

        let capabilities = Self::snapshot_capabilities(&service);
        if let Some(peer) = service.peer_info() {
            info!(
                backend = %name,
                pid = ?pid,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP handshake complete"
            );
        }

        Ok(Self {
            name: name.to_string(),
            service: RwLock::new(Some(service)),
            child: RwLock::new(Some(child)),
            capabilities,
        })
    }

    async fn open_streamable_http(name: &str, config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{name}' missing url"))?;

        let transport_config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
        let transport =
            StreamableHttpClientTransport::with_client(reqwest::Client::default(), transport_config);

        let service = ().serve(transport).await.with_context(|| {
            format!("failed MCP handshake with HTTP backend '{name}' at {url}")
        })?;

        let capabilities = Self::snapshot_capabilities(&service);
        if let Some(peer) = service.peer_info() {
            info!(
                backend = %name,
                url = %url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "HTTP MCP handshake complete"
            );
        }

        Ok(Self {
            name: name.to_string(),
            service: RwLock::new(Some(service)),
            child: RwLock::new(None),
            capabilities,
        })
    }

    async fn open_sse(name: &str, config: &ServerConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{name}' missing url"))?;

        let transport = SseClientTransport::start(url.to_string())
            .await
            .with_context(|| format!("failed to connect SSE backend '{name}' at {url}"))?;

        let service = ().serve(transport).await.with_context(|| {
            format!("failed MCP handshake with SSE backend '{name}' at {url}")
        })?;

        let capabilities = Self::snapshot_capabilities(&service);
        info!(backend = %name, url = %url, "SSE MCP handshake complete");

        Ok(Self {
            name: name.to_string(),
            service: RwLock::new(Some(service)),
            child: RwLock::new(None),
            capabilities,
        })
    }

    /// Kill the child's entire process group (unix only). Falls back to
    /// killing just the child elsewhere.
    async fn kill_child(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Negative PID targets the whole group.
            // Safety: libc::kill is safe to call with any PID value
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(backend = %self.name, pid, "sent SIGTERM to process group");
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                warn!(backend = %self.name, pid, "failed to signal process group, killing child directly");
            }
        }

        let _ = child.kill().await;
    }

}

#[async_trait]
impl McpTransport for RmcpSession {
    fn capabilities(&self) -> CapabilitySnapshot {
        self.capabilities
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tool listing on backend '{}' failed: {e}", self.name))
    }

    async fn call_tool(&self, tool: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool.to_string().into(),
            arguments,
            task: None,
        };

        debug!(backend = %self.name, tool = %tool, "forwarding tool call");

        tokio::time::timeout(REQUEST_TIMEOUT, service.call_tool(params))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "tool call '{}' on backend '{}' timed out after {:?}",
                    tool,
                    self.name,
                    REQUEST_TIMEOUT
                )
            })?
            .map_err(|e| {
                anyhow::anyhow!("tool call '{}' on backend '{}' failed: {e}", tool, self.name)
            })
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        service
            .list_all_prompts()
            .await
            .map_err(|e| anyhow::anyhow!("prompt listing on backend '{}' failed: {e}", self.name))
    }

    async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        let params = GetPromptRequestParams {
            meta: None,
            name: prompt.to_string().into(),
            arguments,
        };
        service.get_prompt(params).await.map_err(|e| {
            anyhow::anyhow!("prompt '{}' on backend '{}' failed: {e}", prompt, self.name)
        })
    }

    async fn list_resources(&self) -> Result<Vec<Resource>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        service
            .list_all_resources()
            .await
            .map_err(|e| anyhow::anyhow!("resource listing on backend '{}' failed: {e}", self.name))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("backend '{}' session closed", self.name))?;

        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string().into(),
        };
        service.read_resource(params).await.map_err(|e| {
            anyhow::anyhow!("resource '{}' on backend '{}' failed: {e}", uri, self.name)
        })
    }

    async fn close(&self) -> Result<()> {
        // Cancel the rmcp service first (closes the transport gracefully)
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling service");
        }

        if let Some(mut child) = self.child.write().await.take() {
            self.kill_child(&mut child).await;
        }

        debug!(backend = %self.name, "transport closed");
        Ok(())
    }
}
