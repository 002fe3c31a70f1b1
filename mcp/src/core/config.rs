//! Host configuration types and validation.
//!
//! Server descriptors are validated before any I/O is attempted, so a malformed
//! descriptor is always rejected as `McpError::Config`.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{cache::TestType, error::McpError};

/// Routing weight of a primary (direct) server.
pub const PRIMARY_WEIGHT: f64 = 1.0;

/// Whole seconds covering `duration`, rounding any fraction up.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Servers registered at startup
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,

    /// Default bound on handshake + discovery (seconds)
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,

    /// Verification result cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            registration_timeout_secs: default_registration_timeout(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerDescriptor {
    /// Unique server id, also the prefix of qualified tool names
    pub id: String,

    #[serde(flatten)]
    pub transport: TransportDescriptor,

    /// Declared capability tags ("tools", "prompts", "resources", ...)
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Routing weight: 1.0 is a primary route, anything lower is a backup
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Overrides `HostConfig::registration_timeout_secs` for this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_timeout_secs: Option<u64>,

    /// Upper bound for each tool/prompt call on this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,

    /// Whether host startup fails if this server cannot be registered
    #[serde(default)]
    pub required: bool,

    /// Per-tool overrides keyed by the tool name the server reports
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolConfig>,
}

/// Per-tool configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportDescriptor {
    /// Spawn a subprocess and speak the protocol over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    /// Connect to a streaming HTTP endpoint.
    Streamable {
        url: String,
        /// Bearer token for the Authorization header
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// HTTP request timeout (seconds)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl TransportDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportDescriptor::Stdio { .. } => "stdio",
            TransportDescriptor::Streamable { .. } => "streamable",
        }
    }
}

impl fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDescriptor::Stdio {
                command,
                args,
                envs,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &envs.keys().collect::<Vec<_>>())
                .finish(),
            TransportDescriptor::Streamable {
                url,
                token,
                headers,
                timeout_secs,
            } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .field("timeout_secs", timeout_secs)
                .finish(),
        }
    }
}

/// Verification result cache configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory of the durable tier; memory-only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Default TTL overrides per test type (seconds)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ttl_overrides: HashMap<TestType, u64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigValidationError {
    #[error("server id must not be empty")]
    EmptyId,

    #[error("server id '{0}' must not contain whitespace")]
    InvalidId(String),

    #[error("server '{0}': stdio command must not be empty")]
    EmptyCommand(String),

    #[error("server '{server}': invalid url '{url}': {reason}")]
    InvalidUrl {
        server: String,
        url: String,
        reason: String,
    },

    #[error("server '{server}': invalid header '{header}'")]
    InvalidHeader { server: String, header: String },

    #[error("server '{server}': weight {weight} must be within [0.0, 1.0]")]
    InvalidWeight { server: String, weight: f64 },

    #[error("server '{server}': {field} must be greater than zero")]
    ZeroTimeout { server: String, field: String },

    #[error("duplicate server id '{0}'")]
    DuplicateId(String),
}

impl From<ConfigValidationError> for McpError {
    fn from(e: ConfigValidationError) -> Self {
        McpError::Config(e.to_string())
    }
}

impl ServerDescriptor {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            id,
            TransportDescriptor::Stdio {
                command: command.into(),
                args,
                envs: HashMap::new(),
            },
        )
    }

    pub fn streamable(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            id,
            TransportDescriptor::Streamable {
                url: url.into(),
                token: None,
                headers: HashMap::new(),
                timeout_secs: None,
            },
        )
    }

    pub fn with_transport(id: impl Into<String>, transport: TransportDescriptor) -> Self {
        Self {
            id: id.into(),
            transport,
            capabilities: default_capabilities(),
            weight: default_weight(),
            registration_timeout_secs: None,
            operation_timeout_secs: None,
            required: false,
            tools: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_secs = Some(ceil_secs(timeout).max(1));
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = Some(ceil_secs(timeout).max(1));
        self
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn is_primary(&self) -> bool {
        self.weight == PRIMARY_WEIGHT
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    /// Timeout for one tool: per-tool override, then the server-wide bound.
    pub fn tool_timeout(&self, tool_name: &str) -> Option<Duration> {
        self.tools
            .get(tool_name)
            .and_then(|cfg| cfg.timeout_secs)
            .map(Duration::from_secs)
            .or_else(|| self.operation_timeout())
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigValidationError::EmptyId);
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(ConfigValidationError::InvalidId(self.id.clone()));
        }
        if !self.weight.is_finite() || !(0.0..=PRIMARY_WEIGHT).contains(&self.weight) {
            return Err(ConfigValidationError::InvalidWeight {
                server: self.id.clone(),
                weight: self.weight,
            });
        }

        let timeouts = [
            ("registration_timeout_secs", self.registration_timeout_secs),
            ("operation_timeout_secs", self.operation_timeout_secs),
        ];
        for (field, value) in timeouts {
            if value == Some(0) {
                return Err(ConfigValidationError::ZeroTimeout {
                    server: self.id.clone(),
                    field: field.to_string(),
                });
            }
        }
        for (tool, cfg) in &self.tools {
            if cfg.timeout_secs == Some(0) {
                return Err(ConfigValidationError::ZeroTimeout {
                    server: self.id.clone(),
                    field: format!("tools.{}.timeout_secs", tool),
                });
            }
        }

        match &self.transport {
            TransportDescriptor::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ConfigValidationError::EmptyCommand(self.id.clone()));
                }
            }
            TransportDescriptor::Streamable {
                url,
                headers,
                timeout_secs,
                ..
            } => {
                let parsed = url::Url::parse(url).map_err(|e| ConfigValidationError::InvalidUrl {
                    server: self.id.clone(),
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigValidationError::InvalidUrl {
                        server: self.id.clone(),
                        url: url.clone(),
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
                for (name, value) in headers {
                    let valid = reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_ok()
                        && reqwest::header::HeaderValue::from_str(value).is_ok();
                    if !valid {
                        return Err(ConfigValidationError::InvalidHeader {
                            server: self.id.clone(),
                            header: name.clone(),
                        });
                    }
                }
                if *timeout_secs == Some(0) {
                    return Err(ConfigValidationError::ZeroTimeout {
                        server: self.id.clone(),
                        field: "timeout_secs".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl HostConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: &str) -> Result<Self, McpError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigValidationError::DuplicateId(server.id.clone()));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_registration_timeout() -> u64 {
    30
}

fn default_capabilities() -> Vec<String> {
    vec!["tools".to_string()]
}

fn default_weight() -> f64 {
    PRIMARY_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_minimal_config() {
        let yaml = r#"
servers:
  - id: "files"
    protocol: stdio
    command: "mcp-server-files"
"#;

        let config: HostConfig = serde_yaml::from_str(yaml).expect("Failed to parse YAML");
        assert_eq!(config.servers.len(), 1);
        let server = &config.servers[0];
        assert_eq!(server.id, "files");
        assert_eq!(server.weight, 1.0);
        assert!(server.is_primary());
        assert_eq!(server.capabilities, vec!["tools".to_string()]);
        assert!(!server.required);
        assert_eq!(config.registration_timeout_secs, 30);
        assert!(config.cache.directory.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
registration_timeout_secs: 10
cache:
  directory: "/var/cache/mcp-host"
  ttl_overrides:
    functional: 60
servers:
  - id: "mail-primary"
    protocol: streamable
    url: "https://mail.example.com/mcp"
    token: "secret"
    headers:
      X-Tenant: "acme"
    timeout_secs: 20
    capabilities: ["tools", "prompts"]
    required: true
    operation_timeout_secs: 15
    tools:
      send:
        timeout_secs: 5
  - id: "mail-backup"
    protocol: stdio
    command: "mail-mcp"
    args: ["--offline"]
    envs:
      MAIL_DIR: "/tmp/mail"
    weight: 0.4
    registration_timeout_secs: 3
"#;

        let config: HostConfig = serde_yaml::from_str(yaml).expect("Failed to parse YAML");
        assert!(config.validate().is_ok());
        assert_eq!(config.registration_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.ttl_overrides.get(&TestType::Functional), Some(&60));

        let primary = &config.servers[0];
        assert!(primary.required);
        assert_eq!(primary.capabilities.len(), 2);
        assert_eq!(primary.tool_timeout("send"), Some(Duration::from_secs(5)));
        assert_eq!(primary.tool_timeout("other"), Some(Duration::from_secs(15)));
        match &primary.transport {
            TransportDescriptor::Streamable {
                url,
                token,
                headers,
                timeout_secs,
            } => {
                assert_eq!(url, "https://mail.example.com/mcp");
                assert_eq!(token.as_deref(), Some("secret"));
                assert_eq!(headers.get("X-Tenant").map(String::as_str), Some("acme"));
                assert_eq!(*timeout_secs, Some(20));
            }
            _ => panic!("Expected Streamable transport"),
        }

        let backup = &config.servers[1];
        assert_eq!(backup.weight, 0.4);
        assert!(!backup.is_primary());
        assert_eq!(backup.registration_timeout_secs, Some(3));
        assert_eq!(backup.tool_timeout("send"), None);
        match &backup.transport {
            TransportDescriptor::Stdio { command, args, envs } => {
                assert_eq!(command, "mail-mcp");
                assert_eq!(args, &vec!["--offline".to_string()]);
                assert_eq!(envs.get("MAIL_DIR").map(String::as_str), Some("/tmp/mail"));
            }
            _ => panic!("Expected Stdio transport"),
        }
    }

    #[test]
    fn test_missing_transport_fields_rejected_by_serde() {
        let yaml = r#"
id: "broken"
protocol: streamable
"#;
        assert!(serde_yaml::from_str::<ServerDescriptor>(yaml).is_err());

        let yaml = r#"
protocol: stdio
command: "x"
"#;
        assert!(serde_yaml::from_str::<ServerDescriptor>(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_descriptors() {
        let empty_id = ServerDescriptor::stdio("", "cmd", vec![]);
        assert_eq!(empty_id.validate(), Err(ConfigValidationError::EmptyId));

        let spaced = ServerDescriptor::stdio("my server", "cmd", vec![]);
        assert!(matches!(
            spaced.validate(),
            Err(ConfigValidationError::InvalidId(_))
        ));

        let no_command = ServerDescriptor::stdio("a", "  ", vec![]);
        assert!(matches!(
            no_command.validate(),
            Err(ConfigValidationError::EmptyCommand(_))
        ));

        let bad_url = ServerDescriptor::streamable("a", "not a url");
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigValidationError::InvalidUrl { .. })
        ));

        let ftp = ServerDescriptor::streamable("a", "ftp://example.com/mcp");
        assert!(matches!(
            ftp.validate(),
            Err(ConfigValidationError::InvalidUrl { .. })
        ));

        for weight in [-0.1, f64::NAN] {
            let d = ServerDescriptor::stdio("a", "cmd", vec![]).with_weight(weight);
            assert!(matches!(
                d.validate(),
                Err(ConfigValidationError::InvalidWeight { .. })
            ));
        }
        let heavy = ServerDescriptor::stdio("a", "cmd", vec![]).with_weight(1.5);
        assert_eq!(
            heavy.validate(),
            Err(ConfigValidationError::InvalidWeight {
                server: "a".to_string(),
                weight: 1.5,
            })
        );

        let mut zero = ServerDescriptor::stdio("a", "cmd", vec![]);
        zero.operation_timeout_secs = Some(0);
        assert!(matches!(
            zero.validate(),
            Err(ConfigValidationError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_headers() {
        let mut d = ServerDescriptor::streamable("a", "http://localhost:3000/mcp");
        if let TransportDescriptor::Streamable { headers, .. } = &mut d.transport {
            headers.insert("bad header".to_string(), "v".to_string());
        }
        assert!(matches!(
            d.validate(),
            Err(ConfigValidationError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = HostConfig {
            servers: vec![
                ServerDescriptor::stdio("a", "cmd", vec![]),
                ServerDescriptor::stdio("a", "cmd2", vec![]),
            ],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateId("a".to_string()))
        );
    }

    #[test]
    fn test_debug_masks_secrets() {
        let mut d = ServerDescriptor::streamable("a", "http://localhost:3000/mcp");
        if let TransportDescriptor::Streamable { token, headers, .. } = &mut d.transport {
            *token = Some("super-secret".to_string());
            headers.insert("X-Api-Key".to_string(), "key-123".to_string());
        }
        let rendered = format!("{:?}", d.transport);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("key-123"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn test_timeout_builders_round_fractions_up() {
        let d = ServerDescriptor::stdio("a", "cmd", vec![])
            .with_operation_timeout(Duration::from_millis(1500))
            .with_registration_timeout(Duration::from_millis(200));
        assert_eq!(d.operation_timeout_secs, Some(2));
        assert_eq!(d.registration_timeout_secs, Some(1));

        let exact = ServerDescriptor::stdio("a", "cmd", vec![])
            .with_operation_timeout(Duration::from_secs(3))
            .with_registration_timeout(Duration::ZERO);
        assert_eq!(exact.operation_timeout_secs, Some(3));
        assert_eq!(exact.registration_timeout_secs, Some(1));
        assert_eq!(ceil_secs(Duration::from_nanos(1)), 1);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }

    #[test]
    fn test_config_error_conversion() {
        let err: McpError = ConfigValidationError::EmptyId.into();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[tokio::test]
    async fn test_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.yaml");
        tokio::fs::write(
            &path,
            "servers:\n  - id: a\n    protocol: stdio\n    command: x\n    weight: 2.0\n",
        )
        .await
        .unwrap();

        let result = HostConfig::from_file(path.to_str().unwrap()).await;
        assert!(matches!(result, Err(McpError::Config(_))));
    }
}
