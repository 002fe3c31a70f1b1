//! Capability registry and name resolution.
//!
//! Descriptors are indexed three ways:
//! - By fully-qualified (prefixed) name, the unambiguous fast path
//! - By short name, collecting every server that reports it
//! - By server, for wholesale replacement and removal
//!
//! A server's descriptors are installed and removed under a single write lock,
//! so readers never observe half of a server's inventory.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::types::{
    IndexedCapability, PromptDescriptor, QualifiedName, ResourceDescriptor, ServerInventory,
    ToolDescriptor,
};
use crate::{
    error::{McpError, McpResult},
    security::{SecurityContext, SecurityFilter},
};

/// One kind of capability (tools, prompts or resources) indexed by name.
#[derive(Debug)]
struct NameIndex<D> {
    entries: HashMap<QualifiedName, D>,
    by_prefixed: HashMap<String, QualifiedName>,
    by_name: HashMap<String, BTreeSet<String>>,
    by_server: HashMap<String, BTreeSet<String>>,
}

impl<D> Default for NameIndex<D> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_prefixed: HashMap::new(),
            by_name: HashMap::new(),
            by_server: HashMap::new(),
        }
    }
}

impl<D: IndexedCapability> NameIndex<D> {
    fn insert(&mut self, descriptor: D) {
        let key = QualifiedName::new(descriptor.owner(), descriptor.short_name());

        if let Some(prefixed) = descriptor.prefixed_name() {
            match self.by_prefixed.get(prefixed) {
                Some(existing) if existing != &key => {
                    warn!(
                        prefixed = %prefixed,
                        kept = %existing.server_id,
                        skipped = %key.server_id,
                        "Prefixed name collision; keeping first registration"
                    );
                }
                _ => {
                    self.by_prefixed.insert(prefixed.to_string(), key.clone());
                }
            }
        }

        self.by_name
            .entry(key.name.clone())
            .or_default()
            .insert(key.server_id.clone());
        self.by_server
            .entry(key.server_id.clone())
            .or_default()
            .insert(key.name.clone());
        self.entries.insert(key, descriptor);
    }

    fn remove_server(&mut self, server_id: &str) -> usize {
        let Some(names) = self.by_server.remove(server_id) else {
            return 0;
        };

        let mut freed_prefixes = Vec::new();
        for name in &names {
            let key = QualifiedName::new(server_id, name.as_str());
            if let Some(descriptor) = self.entries.remove(&key) {
                if let Some(prefixed) = descriptor.prefixed_name() {
                    if self.by_prefixed.get(prefixed) == Some(&key) {
                        self.by_prefixed.remove(prefixed);
                        freed_prefixes.push(prefixed.to_string());
                    }
                }
            }
            if let Some(servers) = self.by_name.get_mut(name) {
                servers.remove(server_id);
                if servers.is_empty() {
                    self.by_name.remove(name);
                }
            }
        }

        // A freed prefixed name may still belong to a colliding descriptor
        for prefixed in freed_prefixes {
            let heir = self
                .entries
                .iter()
                .filter(|(_, d)| d.prefixed_name() == Some(prefixed.as_str()))
                .map(|(k, _)| k.clone())
                .min();
            if let Some(heir) = heir {
                self.by_prefixed.insert(prefixed, heir);
            }
        }

        names.len()
    }

    fn resolve(
        &self,
        name: &str,
        ctx: Option<&SecurityContext>,
        not_found: fn(String) -> McpError,
    ) -> McpResult<D> {
        if let Some(key) = self.by_prefixed.get(name) {
            if let Some(descriptor) = self.entries.get(key) {
                SecurityFilter::check(name, &key.server_id, ctx)?;
                return Ok(descriptor.clone());
            }
        }

        let raw: Vec<&str> = self
            .by_name
            .get(name)
            .map(|servers| servers.iter().map(String::as_str).collect())
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(not_found(name.to_string()));
        }

        let candidates = SecurityFilter::narrow(raw.clone(), ctx);
        match candidates.as_slice() {
            [] => Err(McpError::PermissionDenied {
                name: name.to_string(),
                servers: raw.iter().map(|s| s.to_string()).collect(),
            }),
            [server_id] => self
                .entries
                .get(&QualifiedName::new(*server_id, name))
                .cloned()
                .ok_or_else(|| not_found(name.to_string())),
            _ => Err(McpError::Ambiguous {
                name: name.to_string(),
                servers: candidates.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    fn list(&self, ctx: Option<&SecurityContext>) -> Vec<D> {
        let mut keys: Vec<&QualifiedName> = self.entries.keys().collect();
        keys.sort();
        let all = keys
            .into_iter()
            .filter_map(|k| self.entries.get(k).cloned())
            .collect();
        SecurityFilter::narrow(all, ctx)
    }

    fn for_server(&self, server_id: &str) -> Vec<D> {
        self.by_server
            .get(server_id)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| {
                        self.entries
                            .get(&QualifiedName::new(server_id, n.as_str()))
                            .cloned()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn servers_for(&self, name: &str) -> Vec<String> {
        self.by_name
            .get(name)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    tools: NameIndex<ToolDescriptor>,
    prompts: NameIndex<PromptDescriptor>,
    resources: NameIndex<ResourceDescriptor>,
    servers: BTreeSet<String>,
}

impl RegistryState {
    fn remove(&mut self, server_id: &str) -> RegistryCounts {
        self.servers.remove(server_id);
        RegistryCounts {
            tools: self.tools.remove_server(server_id),
            prompts: self.prompts.remove_server(server_id),
            resources: self.resources.remove_server(server_id),
        }
    }
}

/// Index of every tool, prompt and resource across registered servers.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a server's full inventory, replacing anything it had before.
    pub fn install_server(&self, server_id: &str, inventory: ServerInventory) -> RegistryCounts {
        let mut state = self.state.write();
        let replaced = state.remove(server_id);
        if !replaced.is_empty() {
            debug!(
                server_id = %server_id,
                tools = replaced.tools,
                prompts = replaced.prompts,
                resources = replaced.resources,
                "Discarding previous inventory"
            );
        }

        let mut counts = RegistryCounts::default();
        for tool in inventory.tools {
            if tool.server_id == server_id {
                state.tools.insert(tool);
                counts.tools += 1;
            }
        }
        for prompt in inventory.prompts {
            if prompt.server_id == server_id {
                state.prompts.insert(prompt);
                counts.prompts += 1;
            }
        }
        for resource in inventory.resources {
            if resource.server_id == server_id {
                state.resources.insert(resource);
                counts.resources += 1;
            }
        }
        state.servers.insert(server_id.to_string());
        counts
    }

    /// Remove every descriptor owned by `server_id`. Returns what was removed.
    pub fn remove_server(&self, server_id: &str) -> Option<RegistryCounts> {
        let mut state = self.state.write();
        if !state.servers.contains(server_id) {
            return None;
        }
        Some(state.remove(server_id))
    }

    pub fn contains_server(&self, server_id: &str) -> bool {
        self.state.read().servers.contains(server_id)
    }

    pub fn resolve_tool(
        &self,
        name: &str,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<ToolDescriptor> {
        self.state
            .read()
            .tools
            .resolve(name, ctx, McpError::ToolNotFound)
    }

    pub fn resolve_prompt(
        &self,
        name: &str,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<PromptDescriptor> {
        self.state
            .read()
            .prompts
            .resolve(name, ctx, McpError::PromptNotFound)
    }

    pub fn resolve_resource(
        &self,
        uri: &str,
        ctx: Option<&SecurityContext>,
    ) -> McpResult<ResourceDescriptor> {
        self.state
            .read()
            .resources
            .resolve(uri, ctx, McpError::ResourceNotFound)
    }

    /// Server id a name resolves to; see [`Self::resolve_tool`].
    pub fn resolve(&self, name: &str, ctx: Option<&SecurityContext>) -> McpResult<String> {
        self.resolve_tool(name, ctx).map(|d| d.server_id)
    }

    /// Fetch one server's descriptor for `name` without resolution.
    pub fn get_tool(&self, server_id: &str, name: &str) -> Option<ToolDescriptor> {
        self.state
            .read()
            .tools
            .entries
            .get(&QualifiedName::new(server_id, name))
            .cloned()
    }

    pub fn list_tools(&self, ctx: Option<&SecurityContext>) -> Vec<ToolDescriptor> {
        self.state.read().tools.list(ctx)
    }

    pub fn list_prompts(&self, ctx: Option<&SecurityContext>) -> Vec<PromptDescriptor> {
        self.state.read().prompts.list(ctx)
    }

    pub fn list_resources(&self, ctx: Option<&SecurityContext>) -> Vec<ResourceDescriptor> {
        self.state.read().resources.list(ctx)
    }

    pub fn tools_for_server(&self, server_id: &str) -> Vec<ToolDescriptor> {
        self.state.read().tools.for_server(server_id)
    }

    pub fn prompts_for_server(&self, server_id: &str) -> Vec<PromptDescriptor> {
        self.state.read().prompts.for_server(server_id)
    }

    /// Every server reporting a tool with this short name, sorted.
    pub fn servers_for_tool(&self, name: &str) -> Vec<String> {
        self.state.read().tools.servers_for(name)
    }

    pub fn counts(&self) -> RegistryCounts {
        let state = self.state.read();
        RegistryCounts {
            tools: state.tools.len(),
            prompts: state.prompts.len(),
            resources: state.resources.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
}

impl RegistryCounts {
    pub fn is_empty(&self) -> bool {
        self.tools == 0 && self.prompts == 0 && self.resources == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, sync::Arc};

    use rmcp::model::{Prompt, RawResource, Tool};

    use super::*;

    fn create_test_tool(name: &str) -> Tool {
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

    fn create_test_prompt(name: &str) -> Prompt {
        Prompt {
            name: name.to_string(),
            title: None,
            description: Some(format!("Test prompt: {}", name)),
            arguments: None,
            icons: None,
        }
    }

    fn create_test_resource(uri: &str) -> RawResource {
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

    fn inventory(server_id: &str, tools: &[&str], prompts: &[&str]) -> ServerInventory {
        ServerInventory {
            tools: tools
                .iter()
                .map(|t| ToolDescriptor::new(server_id, create_test_tool(t)))
                .collect(),
            prompts: prompts
                .iter()
                .map(|p| PromptDescriptor::new(server_id, create_test_prompt(p)))
                .collect(),
            resources: Vec::new(),
        }
    }

    #[test]
    fn test_unique_short_name_resolves() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send", "read"], &[]));

        assert_eq!(registry.resolve("send", None).unwrap(), "A");
        let d = registry.resolve_tool("read", None).unwrap();
        assert_eq!(d.prefixed_name, "A-read");
    }

    #[test]
    fn test_shared_short_name_is_ambiguous() {
        let registry = CapabilityRegistry::new();
        registry.install_server("B", inventory("B", &["send"], &[]));
        registry.install_server("A", inventory("A", &["send"], &[]));

        match registry.resolve("send", None) {
            Err(McpError::Ambiguous { name, servers }) => {
                assert_eq!(name, "send");
                assert_eq!(servers, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_prefixed_name_never_ambiguous() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &[]));
        registry.install_server("B", inventory("B", &["send"], &[]));

        assert_eq!(registry.resolve("A-send", None).unwrap(), "A");
        assert_eq!(registry.resolve("B-send", None).unwrap(), "B");
    }

    #[test]
    fn test_prefixed_match_wins_over_short_name() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &[]));
        // Server C literally reports a tool named "A-send"
        registry.install_server("C", inventory("C", &["A-send"], &[]));

        assert_eq!(registry.resolve("A-send", None).unwrap(), "A");
        assert_eq!(registry.resolve("C-A-send", None).unwrap(), "C");
    }

    #[test]
    fn test_unknown_name_not_found() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &[]));

        match registry.resolve("delete", None) {
            Err(McpError::ToolNotFound(name)) => assert_eq!(name, "delete"),
            other => panic!("expected ToolNotFound, got {:?}", other),
        }
        assert!(matches!(
            registry.resolve_prompt("send", None),
            Err(McpError::PromptNotFound(_))
        ));
    }

    #[test]
    fn test_context_narrows_ambiguity() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &[]));
        registry.install_server("B", inventory("B", &["send"], &[]));

        let ctx = SecurityContext::new("agent").allow("B");
        assert_eq!(registry.resolve("send", Some(&ctx)).unwrap(), "B");
    }

    #[test]
    fn test_context_denies_instead_of_not_found() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &[]));

        let ctx = SecurityContext::new("agent").allow("B");
        match registry.resolve("send", Some(&ctx)) {
            Err(McpError::PermissionDenied { name, servers }) => {
                assert_eq!(name, "send");
                assert_eq!(servers, vec!["A".to_string()]);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
        assert!(matches!(
            registry.resolve("A-send", Some(&ctx)),
            Err(McpError::PermissionDenied { .. })
        ));
        assert!(matches!(
            registry.resolve("nothing", Some(&ctx)),
            Err(McpError::ToolNotFound(_))
        ));
    }

    #[test]
    fn test_remove_server_purges_everything() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send", "read"], &["greet"]));
        registry.install_server("B", inventory("B", &["send"], &[]));

        let removed = registry.remove_server("A").unwrap();
        assert_eq!(removed.tools, 2);
        assert_eq!(removed.prompts, 1);

        assert_eq!(registry.resolve("send", None).unwrap(), "B");
        assert!(matches!(
            registry.resolve("read", None),
            Err(McpError::ToolNotFound(_))
        ));
        assert!(matches!(
            registry.resolve("A-send", None),
            Err(McpError::ToolNotFound(_))
        ));
        assert!(registry.prompts_for_server("A").is_empty());
        assert!(!registry.contains_server("A"));
        assert!(registry.remove_server("A").is_none());
    }

    #[test]
    fn test_install_replaces_wholesale() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["old", "kept"], &[]));
        registry.install_server("A", inventory("A", &["kept", "new"], &[]));

        let names: Vec<String> = registry
            .tools_for_server("A")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["kept".to_string(), "new".to_string()]);
        assert!(registry.resolve("old", None).is_err());
        assert_eq!(registry.counts().tools, 2);
    }

    #[test]
    fn test_install_ignores_foreign_descriptors() {
        let registry = CapabilityRegistry::new();
        let mut inv = inventory("A", &["send"], &[]);
        inv.tools
            .push(ToolDescriptor::new("B", create_test_tool("sneaky")));
        let counts = registry.install_server("A", inv);
        assert_eq!(counts.tools, 1);
        assert!(registry.resolve("sneaky", None).is_err());
    }

    #[test]
    fn test_prefixed_collision_keeps_first_and_recovers() {
        let registry = CapabilityRegistry::new();
        registry.install_server("a", inventory("a", &["b-c"], &[]));
        registry.install_server("a-b", inventory("a-b", &["c"], &[]));

        assert_eq!(registry.resolve("a-b-c", None).unwrap(), "a");
        registry.remove_server("a");
        assert_eq!(registry.resolve("a-b-c", None).unwrap(), "a-b");
    }

    #[test]
    fn test_prompt_and_resource_resolution() {
        let registry = CapabilityRegistry::new();
        let mut inv = inventory("docs", &[], &["summarize"]);
        inv.resources.push(ResourceDescriptor::new(
            "docs",
            create_test_resource("file:///readme.md"),
        ));
        registry.install_server("docs", inv);

        assert_eq!(
            registry.resolve_prompt("summarize", None).unwrap().server_id,
            "docs"
        );
        assert_eq!(
            registry.resolve_prompt("docs-summarize", None).unwrap().name,
            "summarize"
        );
        assert_eq!(
            registry
                .resolve_resource("file:///readme.md", None)
                .unwrap()
                .server_id,
            "docs"
        );
        assert!(matches!(
            registry.resolve_resource("file:///missing", None),
            Err(McpError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_list_filtered_by_context() {
        let registry = CapabilityRegistry::new();
        registry.install_server("A", inventory("A", &["send"], &["p"]));
        registry.install_server("B", inventory("B", &["send", "read"], &[]));

        assert_eq!(registry.list_tools(None).len(), 3);
        let ctx = SecurityContext::new("agent").allow("B");
        let tools = registry.list_tools(Some(&ctx));
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.server_id == "B"));
        assert!(registry.list_prompts(Some(&ctx)).is_empty());
        assert_eq!(
            registry.servers_for_tool("send"),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_install_and_resolve() {
        let registry = Arc::new(CapabilityRegistry::new());
        let mut handles = vec![];

        for i in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let id = format!("server-{}", i);
                registry.install_server(&id, inventory(&id, &["shared", "own"], &[]));
                let _ = registry.resolve(&format!("{}-own", id), None);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.counts().tools, 20);
        match registry.resolve("shared", None) {
            Err(McpError::Ambiguous { servers, .. }) => assert_eq!(servers.len(), 10),
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }
}
