//! Core host infrastructure: configuration, transport sessions, lifecycle
//! management and the [`McpHost`] facade.

pub mod config;
pub mod handler;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod session;

pub use config::{
    CacheConfig, ConfigValidationError, HostConfig, ServerDescriptor, ToolConfig,
    TransportDescriptor, PRIMARY_WEIGHT,
};
pub use handler::{HostClientHandler, RefreshRequest};
pub use host::McpHost;
pub use lifecycle::{ServerInfo, ServerRegistration, SessionLease, SessionManager};
pub use metrics::{
    HostMetrics, LatencySnapshot, LatencyStats, MetricsSnapshot, RegistrationOutcome,
};
pub use session::{
    discover_inventory, map_service_error, Connector, RmcpConnector, RmcpSession,
    TransportSession, CAPABILITY_PROMPTS, CAPABILITY_RESOURCES,
};
