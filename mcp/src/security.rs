//! Caller security context and candidate narrowing.
//!
//! A [`SecurityContext`] carries the allow-list of server ids a caller may
//! address. No context at all means no restriction.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

/// Identifier of the agent or end user a call is executed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self("anonymous".to_string())
    }
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-caller allow-list of server ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub caller_id: CallerId,
    pub allowed_servers: BTreeSet<String>,
}

impl SecurityContext {
    pub fn new(caller_id: impl Into<CallerId>) -> Self {
        Self {
            caller_id: caller_id.into(),
            allowed_servers: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn allow(mut self, server_id: impl Into<String>) -> Self {
        self.allowed_servers.insert(server_id.into());
        self
    }

    #[must_use]
    pub fn allow_all<I, S>(mut self, server_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_servers
            .extend(server_ids.into_iter().map(Into::into));
        self
    }

    pub fn is_allowed(&self, server_id: &str) -> bool {
        self.allowed_servers.contains(server_id)
    }
}

/// Anything owned by a single backend server.
pub trait ServerOwned {
    fn owner(&self) -> &str;
}

impl ServerOwned for String {
    fn owner(&self) -> &str {
        self
    }
}

impl ServerOwned for &str {
    fn owner(&self) -> &str {
        self
    }
}

/// Narrows resolution candidates to what a caller may use.
pub struct SecurityFilter;

impl SecurityFilter {
    pub fn permits(server_id: &str, ctx: Option<&SecurityContext>) -> bool {
        ctx.map_or(true, |ctx| ctx.is_allowed(server_id))
    }

    /// Drop every candidate whose owning server is outside the allow-list.
    pub fn narrow<T: ServerOwned>(candidates: Vec<T>, ctx: Option<&SecurityContext>) -> Vec<T> {
        let Some(ctx) = ctx else {
            return candidates;
        };
        candidates
            .into_iter()
            .filter(|c| ctx.is_allowed(c.owner()))
            .collect()
    }

    /// Fail with `PermissionDenied` if `server_id` is outside the allow-list.
    pub fn check(name: &str, server_id: &str, ctx: Option<&SecurityContext>) -> McpResult<()> {
        if Self::permits(server_id, ctx) {
            Ok(())
        } else {
            Err(McpError::PermissionDenied {
                name: name.to_string(),
                servers: vec![server_id.to_string()],
            })
        }
    }
}
