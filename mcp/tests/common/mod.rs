//! Common test utilities for host integration tests.
//!
//! [`FakeConnector`] hands out in-process [`FakeSession`]s whose catalog,
//! latency and failure behavior are scripted per server id.

#![allow(dead_code)]

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use mcp_host::{
    Connector, McpError, McpResult, RefreshRequest, ServerDescriptor, TransportSession,
};
use parking_lot::Mutex;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, JsonObject, Prompt, PromptMessage,
    PromptMessageRole, RawResource, ReadResourceResult, ResourceContents, Tool,
};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// How a scripted tool call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// The server answers with a protocol error
    Execution,
    /// The server goes away mid-call
    Disconnect,
}

/// Scripted behavior of one fake backend.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub connect_delay: Duration,
    pub list_delay: Duration,
    pub call_delay: Duration,
    pub refuse_connect: bool,
    pub call_failure: Option<CallFailure>,
    pub fail_close: bool,
}

impl FakeServer {
    pub fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn prompts(mut self, prompts: &[&str]) -> Self {
        self.prompts = prompts.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn call_failure(mut self, failure: CallFailure) -> Self {
        self.call_failure = Some(failure);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

type Catalog = Arc<Mutex<HashMap<String, FakeServer>>>;

#[derive(Default)]
pub struct FakeConnector {
    catalog: Catalog,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    refresh_senders: Mutex<HashMap<String, mpsc::Sender<RefreshRequest>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script (or re-script) a server. Live sessions see the change on their
    /// next listing.
    pub fn set_server(&self, server_id: &str, server: FakeServer) {
        self.catalog.lock().insert(server_id.to_string(), server);
    }

    /// Every session opened for `server_id`, oldest first.
    pub fn sessions_for(&self, server_id: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect()
    }

    pub fn last_session(&self, server_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions_for(server_id).pop()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver a list-changed notification as the server's client handler
    /// would. Returns false when the host gave no refresh channel.
    pub fn announce_list_changed(&self, server_id: &str) -> bool {
        self.refresh_senders
            .lock()
            .get(server_id)
            .is_some_and(|tx| tx.try_send(RefreshRequest::new(server_id)).is_ok())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        refresh_tx: Option<mpsc::Sender<RefreshRequest>>,
    ) -> McpResult<Arc<dyn TransportSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .catalog
            .lock()
            .get(&descriptor.id)
            .cloned()
            .unwrap_or_default();

        if script.refuse_connect {
            return Err(McpError::ConnectionFailed(format!(
                "{} refused the connection",
                descriptor.id
            )));
        }

        let session = Arc::new(FakeSession {
            server_id: descriptor.id.clone(),
            catalog: Arc::clone(&self.catalog),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            calls_started: AtomicUsize::new(0),
            calls_finished: AtomicUsize::new(0),
        });
        // Recorded before the handshake delay so a timed-out attempt is visible
        self.sessions.lock().push(Arc::clone(&session));
        if let Some(tx) = refresh_tx {
            self.refresh_senders.lock().insert(descriptor.id.clone(), tx);
        }

        tokio::time::sleep(script.connect_delay).await;
        Ok(session)
    }
}

pub struct FakeSession {
    server_id: String,
    catalog: Catalog,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    calls_started: AtomicUsize,
    calls_finished: AtomicUsize,
}

impl FakeSession {
    fn script(&self) -> FakeServer {
        self.catalog
            .lock()
            .get(&self.server_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn calls_started(&self) -> usize {
        self.calls_started.load(Ordering::SeqCst)
    }

    pub fn calls_finished(&self) -> usize {
        self.calls_finished.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::ServerDisconnected {
                server_id: self.server_id.clone(),
                reason: "session closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.ensure_open()?;
        tokio::time::sleep(self.script().list_delay).await;
        Ok(self.script().tools.iter().map(|t| make_tool(t)).collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.ensure_open()?;
        Ok(self.script().prompts.iter().map(|p| make_prompt(p)).collect())
    }

    async fn list_resources(&self) -> McpResult<Vec<RawResource>> {
        self.ensure_open()?;
        Ok(self
            .script()
            .resources
            .iter()
            .map(|u| make_resource(u))
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        self.ensure_open()?;
        let script = self.script();
        self.calls_started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(script.call_delay).await;
        self.calls_finished.fetch_add(1, Ordering::SeqCst);

        match script.call_failure {
            Some(CallFailure::Execution) => Err(McpError::ToolExecution {
                server_id: self.server_id.clone(),
                reason: format!("{} rejected the call", name),
            }),
            Some(CallFailure::Disconnect) => Err(McpError::ServerDisconnected {
                server_id: self.server_id.clone(),
                reason: "process exited".to_string(),
            }),
            None => {
                let args = arguments.map(|a| a.len()).unwrap_or(0);
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "{}:{}:{}",
                    self.server_id, name, args
                ))]))
            }
        }
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult> {
        self.ensure_open()?;
        Ok(GetPromptResult {
            description: Some(format!("{} from {}", name, self.server_id)),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::User,
                format!("{}:{}", self.server_id, name),
            )],
        })
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.ensure_open()?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(
                format!("{}:{}", self.server_id, uri),
                uri,
            )],
        })
    }

    async fn close(&self) -> McpResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.script().fail_close {
            return Err(McpError::Transport(format!(
                "{} failed to exit cleanly",
                self.server_id
            )));
        }
        Ok(())
    }
}

pub fn make_tool(name: &str) -> Tool {
    Tool {
        name: Cow::Owned(name.to_string()),
        title: None,
        description: Some(Cow::Owned(format!("Test tool: {}", name))),
        input_schema: Arc::new(serde_json::Map::new()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

pub fn make_prompt(name: &str) -> Prompt {
    Prompt {
        name: name.to_string(),
        title: None,
        description: Some(format!("Test prompt: {}", name)),
        arguments: None,
        icons: None,
    }
}

pub fn make_resource(uri: &str) -> RawResource {
    RawResource {
        uri: uri.to_string(),
        name: uri.to_string(),
        title: None,
        description: None,
        mime_type: Some("text/plain".to_string()),
        size: None,
        icons: None,
    }
}

/// Descriptor for a fake server. The transport is never dialed.
pub fn descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor::stdio(id, "fake-mcp-server", vec![])
}

/// Text of the first content block of a tool result.
pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}
