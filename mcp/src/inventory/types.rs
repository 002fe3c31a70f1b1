//! Descriptor types for discovered capabilities.

use std::{fmt, sync::Arc, time::Duration};

use rmcp::model::{JsonObject, Prompt, RawResource, Tool};
use serde::{Deserialize, Serialize};

use crate::security::ServerOwned;

/// Owning server plus the name the server reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub server_id: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(server_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            name: name.into(),
        }
    }

    /// The `{server_id}-{name}` form callers use to disambiguate.
    pub fn prefixed(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.server_id, self.name)
    }
}

/// Something the registry can index and resolve by name.
pub trait IndexedCapability: ServerOwned + Clone {
    /// Name as reported by the owning server.
    fn short_name(&self) -> &str;

    /// Fully-qualified form, if this kind of capability has one.
    fn prefixed_name(&self) -> Option<&str>;
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub prefixed_name: String,
    pub server_id: String,
    pub tool: Tool,
    /// Per-call bound; `None` leaves it to the transport
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    pub fn new(server_id: impl Into<String>, tool: Tool) -> Self {
        let qualified = QualifiedName::new(server_id, tool.name.to_string());
        Self {
            prefixed_name: qualified.prefixed(),
            name: qualified.name,
            server_id: qualified.server_id,
            tool,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input_schema(&self) -> Arc<JsonObject> {
        Arc::clone(&self.tool.input_schema)
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.server_id, &self.name)
    }
}

impl ServerOwned for ToolDescriptor {
    fn owner(&self) -> &str {
        &self.server_id
    }
}

impl IndexedCapability for ToolDescriptor {
    fn short_name(&self) -> &str {
        &self.name
    }

    fn prefixed_name(&self) -> Option<&str> {
        Some(&self.prefixed_name)
    }
}

#[derive(Debug, Clone)]
pub struct PromptDescriptor {
    pub name: String,
    pub prefixed_name: String,
    pub server_id: String,
    pub prompt: Prompt,
}

impl PromptDescriptor {
    pub fn new(server_id: impl Into<String>, prompt: Prompt) -> Self {
        let qualified = QualifiedName::new(server_id, prompt.name.clone());
        Self {
            prefixed_name: qualified.prefixed(),
            name: qualified.name,
            server_id: qualified.server_id,
            prompt,
        }
    }
}

impl ServerOwned for PromptDescriptor {
    fn owner(&self) -> &str {
        &self.server_id
    }
}

impl IndexedCapability for PromptDescriptor {
    fn short_name(&self) -> &str {
        &self.name
    }

    fn prefixed_name(&self) -> Option<&str> {
        Some(&self.prefixed_name)
    }
}

/// Resources are addressed by URI only.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub server_id: String,
    pub resource: RawResource,
}

impl ResourceDescriptor {
    pub fn new(server_id: impl Into<String>, resource: RawResource) -> Self {
        Self {
            uri: resource.uri.clone(),
            server_id: server_id.into(),
            resource,
        }
    }
}

impl ServerOwned for ResourceDescriptor {
    fn owner(&self) -> &str {
        &self.server_id
    }
}

impl IndexedCapability for ResourceDescriptor {
    fn short_name(&self) -> &str {
        &self.uri
    }

    fn prefixed_name(&self) -> Option<&str> {
        None
    }
}

/// Everything discovered on one server in one pass.
#[derive(Debug, Clone, Default)]
pub struct ServerInventory {
    pub tools: Vec<ToolDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
}

impl ServerInventory {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.prompts.iter().map(|p| p.name.clone()).collect()
    }
}
