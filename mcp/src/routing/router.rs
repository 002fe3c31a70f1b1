//! Weighted-failover message router.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::{
    core::config::PRIMARY_WEIGHT,
    error::{McpError, McpResult},
};

/// Dual-indexed routing state.
///
/// `tool_routes` and `server_tools` always agree: a direct route points at a
/// server whose tool set contains the tool. A name can be provided without a
/// direct route once its owner has been removed. Prompts follow the same rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingTable {
    tool_routes: HashMap<String, String>,
    server_tools: HashMap<String, BTreeSet<String>>,
    tool_capabilities: HashMap<String, Vec<String>>,
    prompt_routes: HashMap<String, String>,
    server_prompts: HashMap<String, BTreeSet<String>>,
    server_capabilities: HashMap<String, BTreeSet<String>>,
    server_weights: BTreeMap<String, f64>,
}

impl RoutingTable {
    pub fn direct_route(&self, tool_name: &str) -> Option<&str> {
        self.tool_routes.get(tool_name).map(String::as_str)
    }

    pub fn prompt_route(&self, prompt_name: &str) -> Option<&str> {
        self.prompt_routes.get(prompt_name).map(String::as_str)
    }

    pub fn server_tools(&self, server_id: &str) -> Option<&BTreeSet<String>> {
        self.server_tools.get(server_id)
    }

    pub fn weight(&self, server_id: &str) -> Option<f64> {
        self.server_weights.get(server_id).copied()
    }

    pub fn contains_server(&self, server_id: &str) -> bool {
        self.server_weights.contains_key(server_id)
    }

    pub fn server_count(&self) -> usize {
        self.server_weights.len()
    }

    /// Check that every route is backed by its server's provided set and
    /// every providing server is registered.
    pub fn is_consistent(&self) -> bool {
        let routes_backed = |routes: &HashMap<String, String>,
                             provided: &HashMap<String, BTreeSet<String>>| {
            routes.iter().all(|(name, server)| {
                provided
                    .get(server)
                    .is_some_and(|names| names.contains(name))
            })
        };

        routes_backed(&self.tool_routes, &self.server_tools)
            && routes_backed(&self.prompt_routes, &self.server_prompts)
            && self
                .server_tools
                .keys()
                .chain(self.server_prompts.keys())
                .all(|s| self.server_weights.contains_key(s))
    }

    fn is_primary(&self, server_id: &str) -> bool {
        self.weight(server_id) == Some(PRIMARY_WEIGHT)
    }

    /// Lowest-id primary other than `except` that provides `name`.
    fn primary_heir(
        &self,
        provided: &HashMap<String, BTreeSet<String>>,
        name: &str,
        except: &str,
    ) -> Option<String> {
        self.server_weights
            .iter()
            .filter(|(server, weight)| server.as_str() != except && **weight == PRIMARY_WEIGHT)
            .find(|(server, _)| provided.get(*server).is_some_and(|n| n.contains(name)))
            .map(|(server, _)| server.clone())
    }

    /// Hand the routes `server_id` owns to another primary provider, if any.
    fn hand_over_routes(&mut self, server_id: &str) {
        let owned_tools: Vec<String> = self
            .tool_routes
            .iter()
            .filter(|(_, owner)| owner.as_str() == server_id)
            .map(|(tool, _)| tool.clone())
            .collect();
        for tool in owned_tools {
            if let Some(heir) = self.primary_heir(&self.server_tools, &tool, server_id) {
                self.set_tool_route(&tool, &heir);
            }
        }

        let owned_prompts: Vec<String> = self
            .prompt_routes
            .iter()
            .filter(|(_, owner)| owner.as_str() == server_id)
            .map(|(prompt, _)| prompt.clone())
            .collect();
        for prompt in owned_prompts {
            if let Some(heir) = self.primary_heir(&self.server_prompts, &prompt, server_id) {
                self.prompt_routes.insert(prompt, heir);
            }
        }
    }

    fn set_tool_route(&mut self, tool: &str, server_id: &str) {
        self.tool_routes
            .insert(tool.to_string(), server_id.to_string());
        let caps = self
            .server_capabilities
            .get(server_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        self.tool_capabilities.insert(tool.to_string(), caps);
    }

    fn add_tools(&mut self, server_id: &str, tools: &[String]) {
        for tool in tools {
            self.server_tools
                .entry(server_id.to_string())
                .or_default()
                .insert(tool.clone());

            let take_over = match self.tool_routes.get(tool) {
                None => true,
                Some(owner) => {
                    owner != server_id && !self.is_primary(owner) && self.is_primary(server_id)
                }
            };
            if take_over {
                self.set_tool_route(tool, server_id);
            }
        }
    }

    fn add_prompts(&mut self, server_id: &str, prompts: &[String]) {
        for prompt in prompts {
            self.server_prompts
                .entry(server_id.to_string())
                .or_default()
                .insert(prompt.clone());

            let take_over = match self.prompt_routes.get(prompt) {
                None => true,
                Some(owner) => {
                    owner != server_id && !self.is_primary(owner) && self.is_primary(server_id)
                }
            };
            if take_over {
                self.prompt_routes
                    .insert(prompt.clone(), server_id.to_string());
            }
        }
    }

    /// Drop the server's provided sets and every route pointing at it.
    fn remove_routes(&mut self, server_id: &str) {
        self.server_tools.remove(server_id);
        self.server_prompts.remove(server_id);

        let tool_routes = &mut self.tool_routes;
        let tool_capabilities = &mut self.tool_capabilities;
        tool_routes.retain(|tool, owner| {
            let keep = owner.as_str() != server_id;
            if !keep {
                tool_capabilities.remove(tool);
            }
            keep
        });
        self.prompt_routes
            .retain(|_, owner| owner.as_str() != server_id);
    }
}

/// Maps tool/prompt names to serving backends and picks between primary and
/// backup servers.
#[derive(Debug, Default)]
pub struct MessageRouter {
    table: RwLock<RoutingTable>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-declare) a server's capability tags and weight.
    pub fn register_server<I, S>(
        &self,
        server_id: &str,
        capabilities: I,
        weight: f64,
    ) -> McpResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_weight(server_id, weight)?;
        let mut table = self.table.write();
        table.server_capabilities.insert(
            server_id.to_string(),
            capabilities.into_iter().map(Into::into).collect(),
        );
        table.server_weights.insert(server_id.to_string(), weight);
        debug!(server_id = %server_id, weight, "Registered route target");
        Ok(())
    }

    /// Add direct routes for a registered server's tools and prompts.
    pub fn add_routes(
        &self,
        server_id: &str,
        tools: &[String],
        prompts: &[String],
    ) -> McpResult<()> {
        let mut table = self.table.write();
        if !table.contains_server(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }
        table.add_tools(server_id, tools);
        table.add_prompts(server_id, prompts);
        Ok(())
    }

    /// Replace a server's routes wholesale after re-discovery.
    pub fn replace_routes(
        &self,
        server_id: &str,
        tools: &[String],
        prompts: &[String],
    ) -> McpResult<()> {
        let mut table = self.table.write();
        if !table.contains_server(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }
        table.remove_routes(server_id);
        table.add_tools(server_id, tools);
        table.add_prompts(server_id, prompts);
        Ok(())
    }

    /// Pick the server that should serve `tool_name`.
    ///
    /// A direct route to a primary (weight 1.0) always wins. Otherwise the
    /// highest-weight backup that provides the tool and declares every
    /// required capability is chosen, lowest id first on ties. With no
    /// eligible backup the direct route is used whatever its weight.
    pub fn select_server_for_tool(
        &self,
        tool_name: &str,
        required_capabilities: Option<&[String]>,
    ) -> Option<String> {
        self.select_server_for_tool_where(tool_name, required_capabilities, |_| true)
    }

    /// [`select_server_for_tool`](Self::select_server_for_tool) over the
    /// servers `permit` accepts.
    ///
    /// Candidates are narrowed before evaluation. When the direct route is
    /// narrowed away and no backup qualifies, the lowest-id permitted primary
    /// that provides the tool stands in for it.
    pub fn select_server_for_tool_where<P>(
        &self,
        tool_name: &str,
        required_capabilities: Option<&[String]>,
        permit: P,
    ) -> Option<String>
    where
        P: Fn(&str) -> bool,
    {
        let table = self.table.read();
        let direct = table.tool_routes.get(tool_name);
        let permitted_direct = direct.filter(|server| permit(server.as_str()));

        if let Some(server) = permitted_direct {
            if table.is_primary(server) {
                return Some(server.clone());
            }
        }

        let provides = |server: &str| {
            table
                .server_tools
                .get(server)
                .is_some_and(|tools| tools.contains(tool_name))
        };

        let mut best: Option<(&str, f64)> = None;
        for (server, weight) in &table.server_weights {
            let eligible = *weight < PRIMARY_WEIGHT
                && provides(server.as_str())
                && permit(server.as_str());
            if !eligible {
                continue;
            }
            if let Some(required) = required_capabilities {
                let declared = table.server_capabilities.get(server);
                let covered = required
                    .iter()
                    .all(|cap| declared.is_some_and(|d| d.contains(cap)));
                if !covered {
                    continue;
                }
            }
            // server_weights iterates in id order, so strict > keeps the lowest id
            if best.map_or(true, |(_, w)| *weight > w) {
                best = Some((server, *weight));
            }
        }

        if let Some((server, _)) = best {
            return Some(server.to_string());
        }
        if let Some(server) = permitted_direct {
            return Some(server.clone());
        }
        if direct.is_none() {
            return None;
        }
        table
            .server_weights
            .iter()
            .filter(|(_, weight)| **weight == PRIMARY_WEIGHT)
            .find(|(server, _)| provides(server.as_str()) && permit(server.as_str()))
            .map(|(server, _)| server.clone())
    }

    pub fn route_for_prompt(&self, prompt_name: &str) -> Option<String> {
        self.table.read().prompt_route(prompt_name).map(str::to_string)
    }

    /// Change a server's weight. A server raised to primary takes over direct
    /// routes currently held by backups. A primary lowered below 1.0 hands
    /// its routes to another primary provider when there is one.
    pub fn update_weight(&self, server_id: &str, weight: f64) -> McpResult<()> {
        validate_weight(server_id, weight)?;
        let mut table = self.table.write();
        let Some(current) = table.server_weights.get_mut(server_id) else {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        };
        let previous = std::mem::replace(current, weight);

        if weight == PRIMARY_WEIGHT {
            let tools: Vec<String> = table
                .server_tools
                .get(server_id)
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            let prompts: Vec<String> = table
                .server_prompts
                .get(server_id)
                .map(|p| p.iter().cloned().collect())
                .unwrap_or_default();
            table.add_tools(server_id, &tools);
            table.add_prompts(server_id, &prompts);
        } else if previous == PRIMARY_WEIGHT {
            table.hand_over_routes(server_id);
        }

        debug!(server_id = %server_id, previous, weight, "Updated routing weight");
        Ok(())
    }

    pub fn update_capabilities<I, S>(&self, server_id: &str, capabilities: I) -> McpResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = self.table.write();
        if !table.contains_server(server_id) {
            return Err(McpError::ServerNotFound(server_id.to_string()));
        }
        let caps: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let routed: Vec<String> = table
            .tool_routes
            .iter()
            .filter(|(_, s)| s.as_str() == server_id)
            .map(|(t, _)| t.clone())
            .collect();
        for tool in routed {
            table
                .tool_capabilities
                .insert(tool, caps.iter().cloned().collect());
        }
        table.server_capabilities.insert(server_id.to_string(), caps);
        Ok(())
    }

    /// Remove a server and every route pointing at it. Returns false when the
    /// server was unknown.
    pub fn remove_server(&self, server_id: &str) -> bool {
        let mut table = self.table.write();
        if table.server_weights.remove(server_id).is_none() {
            return false;
        }
        table.server_capabilities.remove(server_id);
        table.remove_routes(server_id);
        debug!(server_id = %server_id, "Removed route target");
        true
    }

    pub fn tool_capabilities(&self, tool_name: &str) -> Vec<String> {
        self.table
            .read()
            .tool_capabilities
            .get(tool_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn server_capabilities(&self, server_id: &str) -> Option<BTreeSet<String>> {
        self.table.read().server_capabilities.get(server_id).cloned()
    }

    pub fn weight(&self, server_id: &str) -> Option<f64> {
        self.table.read().weight(server_id)
    }

    /// Point-in-time copy of the routing table.
    pub fn snapshot(&self) -> RoutingTable {
        self.table.read().clone()
    }
}

fn validate_weight(server_id: &str, weight: f64) -> McpResult<()> {
    if weight.is_finite() && (0.0..=PRIMARY_WEIGHT).contains(&weight) {
        Ok(())
    } else {
        Err(McpError::Config(format!(
            "server '{}': weight {} must be within [0.0, 1.0]",
            server_id, weight
        )))
    }
}
