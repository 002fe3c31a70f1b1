//! Transport sessions: one live connection to one backend server.
//!
//! [`TransportSession`] is the seam between the host and the wire protocol.
//! [`RmcpSession`] implements it over `rmcp` for both subprocess (stdio) and
//! streaming HTTP transports; tests substitute their own [`Connector`].

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult, JsonObject,
        Prompt, RawResource, ReadResourceRequestParam, ReadResourceResult, Tool,
    },
    service::{Peer, RunningService, ServiceError},
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{
    config::{ServerDescriptor, TransportDescriptor},
    handler::{HostClientHandler, RefreshRequest},
};
use crate::{
    error::{McpError, McpResult},
    inventory::{PromptDescriptor, ResourceDescriptor, ServerInventory, ToolDescriptor},
};

/// Capability tags that make discovery of that kind mandatory.
pub const CAPABILITY_PROMPTS: &str = "prompts";
pub const CAPABILITY_RESOURCES: &str = "resources";

/// An initialized connection to one backend server.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn server_id(&self) -> &str;

    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>>;

    async fn list_resources(&self) -> McpResult<Vec<RawResource>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult>;

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult>;

    /// Release the transport. Calling it twice is a no-op.
    async fn close(&self) -> McpResult<()>;
}

/// Opens transport sessions from server descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the protocol handshake.
    ///
    /// `refresh_tx` receives a request whenever the server announces that its
    /// tool, prompt or resource list changed.
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    ) -> McpResult<Arc<dyn TransportSession>>;
}

/// List everything a session offers and build its descriptors.
///
/// Tools are always listed. Prompts and resources are listed too; a failure
/// there only fails discovery when the server declares that capability.
pub async fn discover_inventory(
    session: &dyn TransportSession,
    descriptor: &ServerDescriptor,
) -> McpResult<ServerInventory> {
    let server_id = descriptor.id.as_str();
    let declares = |cap: &str| descriptor.capabilities.iter().any(|c| c == cap);

    let tools = session.list_tools().await?;
    debug!(server_id = %server_id, count = tools.len(), "Discovered tools");

    let prompts = match session.list_prompts().await {
        Ok(prompts) => prompts,
        Err(e) if !declares(CAPABILITY_PROMPTS) => {
            debug!(server_id = %server_id, error = %e, "No prompts");
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    let resources = match session.list_resources().await {
        Ok(resources) => resources,
        Err(e) if !declares(CAPABILITY_RESOURCES) => {
            debug!(server_id = %server_id, error = %e, "No resources");
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    Ok(ServerInventory {
        tools: tools
            .into_iter()
            .map(|tool| {
                let timeout = descriptor.tool_timeout(&tool.name);
                ToolDescriptor::new(server_id, tool).with_timeout(timeout)
            })
            .collect(),
        prompts: prompts
            .into_iter()
            .map(|prompt| PromptDescriptor::new(server_id, prompt))
            .collect(),
        resources: resources
            .into_iter()
            .map(|resource| ResourceDescriptor::new(server_id, resource))
            .collect(),
    })
}

type HostService = RunningService<RoleClient, HostClientHandler>;

/// A session backed by an `rmcp` client service.
pub struct RmcpSession {
    server_id: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<HostService>>,
}

impl RmcpSession {
    fn new(server_id: impl Into<String>, service: HostService) -> Self {
        Self {
            server_id: server_id.into(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }

    fn map_error(&self, operation: &str, err: ServiceError) -> McpError {
        map_service_error(&self.server_id, operation, err)
    }
}

#[async_trait]
impl TransportSession for RmcpSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| self.map_error("tools/list", e))
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.peer
            .list_all_prompts()
            .await
            .map_err(|e| self.map_error("prompts/list", e))
    }

    async fn list_resources(&self) -> McpResult<Vec<RawResource>> {
        let resources = self
            .peer
            .list_all_resources()
            .await
            .map_err(|e| self.map_error("resources/list", e))?;
        Ok(resources.into_iter().map(|r| r.raw).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };
        self.peer
            .call_tool(request)
            .await
            .map_err(|e| self.map_error("tools/call", e))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult> {
        let request = GetPromptRequestParam {
            name: name.to_string(),
            arguments,
        };
        self.peer
            .get_prompt(request)
            .await
            .map_err(|e| self.map_error("prompts/get", e))
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let request = ReadResourceRequestParam {
            uri: uri.to_string(),
        };
        self.peer
            .read_resource(request)
            .await
            .map_err(|e| self.map_error("resources/read", e))
    }

    async fn close(&self) -> McpResult<()> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        let reason = service.cancel().await.map_err(|e| {
            McpError::Transport(format!("close session '{}': {}", self.server_id, e))
        })?;
        debug!(server_id = %self.server_id, reason = ?reason, "Session closed");
        Ok(())
    }
}

/// Classify an `rmcp` failure: protocol error replies mean the backend
/// rejected the call, transport failures mean it went away.
pub fn map_service_error(server_id: &str, operation: &str, err: ServiceError) -> McpError {
    match err {
        ServiceError::McpError(data) => McpError::ToolExecution {
            server_id: server_id.to_string(),
            reason: format!("{}: {}", operation, data.message),
        },
        ServiceError::Timeout { timeout } => McpError::OperationTimeout {
            server_id: server_id.to_string(),
            operation: operation.to_string(),
            timeout,
        },
        e @ (ServiceError::TransportClosed
        | ServiceError::TransportSend(_)
        | ServiceError::Cancelled { .. }) => McpError::ServerDisconnected {
            server_id: server_id.to_string(),
            reason: format!("{}: {}", operation, e),
        },
        other => McpError::Transport(format!("{} on '{}': {}", operation, server_id, other)),
    }
}

/// Connects over `rmcp` transports.
#[derive(Debug, Clone, Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    ) -> McpResult<Arc<dyn TransportSession>> {
        let handler = HostClientHandler::new(&descriptor.id).with_refresh_channel(refresh_tx);
        info!(
            server_id = %descriptor.id,
            transport = descriptor.transport.kind(),
            "Connecting to server"
        );

        let service = match &descriptor.transport {
            TransportDescriptor::Stdio {
                command,
                args,
                envs,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| McpError::Transport(format!("create stdio transport: {}", e)))?;

                handler.serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })?
            }

            TransportDescriptor::Streamable {
                url,
                token,
                headers,
                timeout_secs,
            } => {
                let timeout = timeout_secs.map(Duration::from_secs);
                let http_client = build_http_client(token, headers, timeout)?;
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                handler.serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })?
            }
        };

        info!(server_id = %descriptor.id, "Connected to server");
        Ok(Arc::new(RmcpSession::new(&descriptor.id, service)))
    }
}

/// Default headers for every request: bearer token plus custom headers.
fn build_request_headers(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
) -> McpResult<reqwest::header::HeaderMap> {
    let mut headers = reqwest::header::HeaderMap::new();

    if let Some(tok) = token {
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", tok)
                .parse()
                .map_err(|e| McpError::Transport(format!("auth token: {}", e)))?,
        );
    }

    for (key, value) in custom_headers {
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::Transport(format!("header name: {}", e)))?,
            value
                .parse()
                .map_err(|e| McpError::Transport(format!("header value: {}", e)))?,
        );
    }

    Ok(headers)
}

fn build_http_client(
    token: &Option<String>,
    custom_headers: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> McpResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let req_headers = build_request_headers(token, custom_headers)?;
    if !req_headers.is_empty() {
        builder = builder.default_headers(req_headers);
    }

    builder
        .build()
        .map_err(|e| McpError::Transport(format!("build HTTP client: {}", e)))
}
