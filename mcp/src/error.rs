//! Host error types.
//!
//! Every fallible operation in the crate returns [`McpResult`]. Resolution
//! errors (`ToolNotFound`, `Ambiguous`, `PermissionDenied`) are caller
//! correctable and are never retried internally.

use std::time::Duration;

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Registration of '{server_id}' timed out after {timeout:?}")]
    RegistrationTimeout {
        server_id: String,
        timeout: Duration,
    },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Ambiguous name '{name}' exists on servers: {servers:?}; use a prefixed name")]
    Ambiguous { name: String, servers: Vec<String> },

    #[error("Permission denied for '{name}' on servers: {servers:?}")]
    PermissionDenied { name: String, servers: Vec<String> },

    #[error("Operation '{operation}' on '{server_id}' timed out after {timeout:?}")]
    OperationTimeout {
        server_id: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend went away (process exited, stream closed) while serving a request.
    #[error("Server disconnected: {server_id}: {reason}")]
    ServerDisconnected { server_id: String, reason: String },

    /// The backend answered the request with a protocol-level error.
    #[error("Tool execution failed on '{server_id}': {reason}")]
    ToolExecution { server_id: String, reason: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl McpError {
    /// True for errors the caller can fix by changing the request
    /// (name, arguments, permissions) rather than by retrying.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            McpError::ToolNotFound(_)
                | McpError::PromptNotFound(_)
                | McpError::ResourceNotFound(_)
                | McpError::Ambiguous { .. }
                | McpError::PermissionDenied { .. }
                | McpError::InvalidArguments(_)
        )
    }

    /// True when the backend crashed or the stream closed, as opposed to the
    /// backend rejecting the call.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, McpError::ServerDisconnected { .. })
    }
}
