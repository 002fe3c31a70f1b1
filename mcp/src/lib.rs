//! Model Context Protocol (MCP) tool-provider host.
//!
//! Registers many backend MCP servers at once and presents their tools,
//! prompts and resources as one namespace.
//!
//! ## Modules
//!
//! - [`core`]: Host facade, configuration, transport sessions and lifecycle
//! - [`inventory`]: Capability registry and name resolution
//! - [`routing`]: Weighted primary/backup routing
//! - [`security`]: Per-caller server allow-lists
//! - [`cache`]: TTL cache for component test results

pub mod error;
pub mod security;

pub mod cache;
pub mod core;
pub mod inventory;
pub mod routing;

pub use cache::{
    CacheKey, CacheStore, CachedTestResult, FileCacheStore, MemoryCacheStore, TestResultCache,
    TestType,
};
pub use core::{
    config, CacheConfig, Connector, HostClientHandler, HostConfig, HostMetrics, McpHost,
    MetricsSnapshot, RefreshRequest, RmcpConnector, ServerDescriptor, ServerInfo, SessionManager,
    TransportDescriptor, TransportSession,
};
pub use error::{McpError, McpResult};
pub use inventory::{
    CapabilityRegistry, PromptDescriptor, QualifiedName, ResourceDescriptor, ServerInventory,
    ToolDescriptor,
};
pub use routing::{MessageRouter, RoutingTable};
pub use security::{CallerId, SecurityContext, SecurityFilter, ServerOwned};
