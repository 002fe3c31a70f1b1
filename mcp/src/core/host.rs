//! Host facade wiring the call path.
//!
//! A call flows through name resolution in the [`CapabilityRegistry`]
//! (narrowed by the caller's [`SecurityContext`]), then to the owning
//! server's session, borrowed from the [`SessionManager`] so that concurrent
//! unregistration waits for it.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use rmcp::model::{CallToolResult, GetPromptResult, JsonObject, ReadResourceResult};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    config::{HostConfig, ServerDescriptor},
    lifecycle::{ServerInfo, SessionManager},
    metrics::{HostMetrics, MetricsSnapshot},
    session::{Connector, RmcpConnector},
};
use crate::{
    cache::TestResultCache,
    error::{McpError, McpResult},
    inventory::{CapabilityRegistry, PromptDescriptor, ResourceDescriptor, ToolDescriptor},
    routing::MessageRouter,
    security::{SecurityContext, SecurityFilter},
};

pub struct McpHost {
    sessions: SessionManager,
    cache: Arc<TestResultCache>,
}

impl McpHost {
    /// Create an empty host. Servers are added with [`Self::register`].
    pub fn new(connector: Arc<dyn Connector>, config: &HostConfig) -> McpResult<Self> {
        let cache = TestResultCache::from_config(&config.cache)?;
        Ok(Self::with_cache(connector, config, Arc::new(cache)))
    }

    pub fn with_cache(
        connector: Arc<dyn Connector>,
        config: &HostConfig,
        cache: Arc<TestResultCache>,
    ) -> Self {
        let sessions = SessionManager::new(
            connector,
            Arc::new(CapabilityRegistry::new()),
            Arc::new(MessageRouter::new()),
            Arc::new(HostMetrics::new()),
            config.registration_timeout(),
        );
        Self { sessions, cache }
    }

    /// Build a host over `rmcp` transports and register every configured server.
    pub async fn from_config(config: HostConfig) -> McpResult<Self> {
        Self::from_config_with_connector(config, Arc::new(RmcpConnector::new())).await
    }

    /// Register every configured server concurrently. Fails only when a
    /// server marked `required` could not be registered, in which case the
    /// servers that did register are shut down again.
    pub async fn from_config_with_connector(
        config: HostConfig,
        connector: Arc<dyn Connector>,
    ) -> McpResult<Self> {
        config.validate()?;
        let host = Self::new(connector, &config)?;

        let required: HashSet<&str> = config
            .servers
            .iter()
            .filter(|s| s.required)
            .map(|s| s.id.as_str())
            .collect();

        let outcomes = host.sessions.register_all(config.servers.clone()).await;
        let mut failed_required = Vec::new();
        for (id, result) in outcomes {
            let Err(e) = result else { continue };
            if required.contains(id.as_str()) {
                error!(server_id = %id, error = %e, "Required server failed to register");
                failed_required.push(format!("{}: {}", id, e));
            } else {
                warn!(server_id = %id, error = %e, "Optional server failed to register");
            }
        }

        if !failed_required.is_empty() {
            host.shutdown().await;
            return Err(McpError::ConnectionFailed(format!(
                "required servers failed to register: {}",
                failed_required.join("; ")
            )));
        }

        info!(servers = host.sessions.len(), "Host started");
        Ok(host)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.sessions.registry()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        self.sessions.router()
    }

    pub fn metrics(&self) -> &Arc<HostMetrics> {
        self.sessions.metrics()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics().snapshot()
    }

    pub fn cache(&self) -> &Arc<TestResultCache> {
        &self.cache
    }

    pub async fn register(&self, descriptor: ServerDescriptor) -> McpResult<()> {
        self.sessions.register(descriptor).await
    }

    pub async fn unregister(&self, server_id: &str) -> McpResult<()> {
        self.sessions.unregister(server_id).await
    }

    /// Unregister every server; returns how many failed to close cleanly.
    pub async fn shutdown(&self) -> usize {
        self.sessions.shutdown_all().await
    }

    /// Server id that `name` resolves to for this caller.
    pub fn resolve(&self, name: &str, ctx: Option<&SecurityContext>) -> McpResult<String> {
        self.registry()
            .resolve(name, ctx)
            .inspect_err(|e| self.metrics().record_resolution_error(e))
    }

    /// Call a tool by prefixed or short name. Never fails over: a short name
    /// must resolve to exactly one permitted server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<CallToolResult> {
        let arguments = to_arguments(arguments)?;
        let descriptor = self
            .registry()
            .resolve_tool(name, ctx)
            .inspect_err(|e| self.metrics().record_resolution_error(e))?;
        self.execute_tool(descriptor, arguments).await
    }

    /// Call a tool on the server picked by weighted failover.
    ///
    /// Candidates are narrowed to the caller's allow-list before selection.
    /// `PermissionDenied` means servers provide the tool but none of them is
    /// permitted.
    pub async fn call_tool_routed(
        &self,
        tool_name: &str,
        arguments: Value,
        required_capabilities: Option<&[String]>,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<CallToolResult> {
        let arguments = to_arguments(arguments)?;
        let server_id = self
            .router()
            .select_server_for_tool_where(tool_name, required_capabilities, |server_id| {
                SecurityFilter::permits(server_id, ctx)
            })
            .ok_or_else(|| self.unroutable(tool_name, ctx))
            .inspect_err(|e| self.metrics().record_resolution_error(e))?;

        debug!(tool = %tool_name, server_id = %server_id, "Routed tool call");
        let descriptor = self
            .registry()
            .get_tool(&server_id, tool_name)
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;
        self.execute_tool(descriptor, arguments).await
    }

    fn unroutable(&self, tool_name: &str, ctx: Option<&SecurityContext>) -> McpError {
        let providers = self.registry().servers_for_tool(tool_name);
        let any_permitted = providers
            .iter()
            .any(|server_id| SecurityFilter::permits(server_id, ctx));
        if providers.is_empty() || any_permitted {
            McpError::ToolNotFound(tool_name.to_string())
        } else {
            McpError::PermissionDenied {
                name: tool_name.to_string(),
                servers: providers,
            }
        }
    }

    async fn execute_tool(
        &self,
        descriptor: ToolDescriptor,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        let registration = self
            .sessions
            .registration(&descriptor.server_id)
            .ok_or_else(|| McpError::ServerNotFound(descriptor.server_id.clone()))?;
        let session = registration.acquire().await?;

        let qualified = descriptor.qualified_name();
        self.metrics().record_call_start(&qualified);
        let started = Instant::now();

        let result = bounded(
            &descriptor.server_id,
            "tools/call",
            descriptor.timeout,
            session.call_tool(&descriptor.name, arguments),
        )
        .await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics()
            .record_call_end(&qualified, result.is_ok(), elapsed_ms);
        if let Err(e) = &result {
            warn!(tool = %qualified, error = %e, "Tool call failed");
        }
        result
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<GetPromptResult> {
        let arguments = to_arguments(arguments)?;
        let descriptor = self
            .registry()
            .resolve_prompt(name, ctx)
            .inspect_err(|e| self.metrics().record_resolution_error(e))?;

        let registration = self
            .sessions
            .registration(&descriptor.server_id)
            .ok_or_else(|| McpError::ServerNotFound(descriptor.server_id.clone()))?;
        let session = registration.acquire().await?;
        bounded(
            &descriptor.server_id,
            "prompts/get",
            registration.descriptor().operation_timeout(),
            session.get_prompt(&descriptor.name, arguments),
        )
        .await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<ReadResourceResult> {
        let descriptor = self
            .registry()
            .resolve_resource(uri, ctx)
            .inspect_err(|e| self.metrics().record_resolution_error(e))?;

        let registration = self
            .sessions
            .registration(&descriptor.server_id)
            .ok_or_else(|| McpError::ServerNotFound(descriptor.server_id.clone()))?;
        let session = registration.acquire().await?;
        bounded(
            &descriptor.server_id,
            "resources/read",
            registration.descriptor().operation_timeout(),
            session.read_resource(&descriptor.uri),
        )
        .await
    }

    pub fn list_tools(&self, ctx: Option<&SecurityContext>) -> Vec<ToolDescriptor> {
        self.registry().list_tools(ctx)
    }

    pub fn list_prompts(&self, ctx: Option<&SecurityContext>) -> Vec<PromptDescriptor> {
        self.registry().list_prompts(ctx)
    }

    pub fn list_resources(&self, ctx: Option<&SecurityContext>) -> Vec<ResourceDescriptor> {
        self.registry().list_resources(ctx)
    }

    /// Registered servers the caller may address, sorted by id.
    pub fn list_servers(&self, ctx: Option<&SecurityContext>) -> Vec<ServerInfo> {
        SecurityFilter::narrow(self.sessions.server_ids(), ctx)
            .iter()
            .filter_map(|id| self.sessions.server_info(id))
            .collect()
    }
}

/// Call arguments must be a JSON object or null.
fn to_arguments(arguments: Value) -> McpResult<Option<JsonObject>> {
    match arguments {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(McpError::InvalidArguments(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn bounded<T, F>(
    server_id: &str,
    operation: &str,
    timeout: Option<Duration>,
    fut: F,
) -> McpResult<T>
where
    F: Future<Output = McpResult<T>>,
{
    let Some(timeout) = timeout else {
        return fut.await;
    };
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(McpError::OperationTimeout {
                server_id: server_id.to_string(),
                operation: operation.to_string(),
                timeout,
            })
        })
}
