use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::error::{McpError, Result};
use crate::security::TrustLevel;

/// Root MCP configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Servers keyed by their unique name
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
    #[serde(default)]
    pub defaults: McpDefaults,
}

impl McpConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| McpError::InvalidConfig(format!("Invalid MCP config: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            McpError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }
}

/// Values applied to every server that does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpDefaults {
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Additional connect attempts after the first one fails
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

impl Default for McpDefaults {
    fn default() -> Self {
        Self {
            trust_level: TrustLevel::default(),
            call_timeout_ms: default_call_timeout(),
            retries: default_retries(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

fn default_call_timeout() -> u64 {
    60000 // 60 seconds
}

fn default_retries() -> u32 {
    2
}

fn default_max_result_chars() -> usize {
    50_000
}

fn default_true() -> bool {
    true
}

/// Declared transport for a server. `Auto` lets the selector decide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Auto,
    Stdio,
    #[serde(alias = "streamable-http", alias = "streamable_http")]
    Http,
    Sse,
}

/// Single MCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Whether this server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: TransportType,
    /// Command to spawn for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Endpoint URL for HTTP and SSE servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Additional headers, passed through untouched
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_result_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_filter: Option<ToolFilter>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportType::Auto,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            trust_level: None,
            max_result_chars: None,
            call_timeout_ms: None,
            tool_filter: None,
        }
    }
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Self::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the per-call policy values against the shared defaults
    pub fn settings(&self, defaults: &McpDefaults) -> EndpointSettings {
        EndpointSettings {
            trust_level: self.trust_level.unwrap_or(defaults.trust_level),
            max_result_chars: self.max_result_chars.unwrap_or(defaults.max_result_chars),
            call_timeout_ms: self.call_timeout_ms.unwrap_or(defaults.call_timeout_ms),
        }
    }
}

/// Effective per-endpoint policy after defaults are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSettings {
    pub trust_level: TrustLevel,
    pub max_result_chars: usize,
    pub call_timeout_ms: u64,
}

/// Allow/deny list for discovered tools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<HashSet<String>>,
}

impl ToolFilter {
    /// Deny wins; a non-empty allow list admits only its members.
    pub fn allows(&self, tool_name: &str) -> bool {
        if let Some(deny) = &self.deny {
            if deny.contains(tool_name) {
                return false;
            }
        }

        match &self.allow {
            Some(allow) if !allow.is_empty() => allow.contains(tool_name),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Option<HashSet<String>> {
        Some(items.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_parse_config_with_defaults() {
        let config = McpConfig::from_json_str(
            r#"{
                "servers": {
                    "fs": { "command": "npx", "args": ["-y", "server-filesystem"] },
                    "web": { "url": "http://localhost:3000/mcp", "trust_level": "sanitize" }
                },
                "defaults": { "retries": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.defaults.retries, 5);
        assert_eq!(config.defaults.call_timeout_ms, 60000);
        assert_eq!(config.defaults.trust_level, TrustLevel::Untrusted);

        let fs = &config.servers["fs"];
        assert!(fs.enabled);
        assert_eq!(fs.transport, TransportType::Auto);
        assert_eq!(fs.command.as_deref(), Some("npx"));

        let web = config.servers["web"].settings(&config.defaults);
        assert_eq!(web.trust_level, TrustLevel::Sanitize);
        assert_eq!(web.max_result_chars, 50_000);
    }

    #[test]
    fn test_transport_aliases() {
        let config = McpConfig::from_json_str(
            r#"{ "servers": {
                "a": { "transport": "streamable-http", "url": "http://a" },
                "b": { "transport": "sse", "url": "http://b/sse" }
            } }"#,
        )
        .unwrap();

        assert_eq!(config.servers["a"].transport, TransportType::Http);
        assert_eq!(config.servers["b"].transport, TransportType::Sse);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = McpConfig::from_json_str(r#"{ "servers": { "a": { "transport": "pigeon" } } }"#)
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, r#"{ "servers": { "x": { "enabled": false } } }"#).unwrap();

        let config = McpConfig::load(&path).unwrap();
        assert!(!config.servers["x"].enabled);

        let missing = McpConfig::load(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(McpError::InvalidConfig(_))));
    }

    #[test]
    fn test_filter_deny_wins() {
        let filter = ToolFilter {
            allow: names(&["read", "write"]),
            deny: names(&["write"]),
        };
        assert!(filter.allows("read"));
        assert!(!filter.allows("write"));
        assert!(!filter.allows("delete"));
    }

    #[test]
    fn test_filter_empty_allow_admits_all() {
        let filter = ToolFilter {
            allow: names(&[]),
            deny: None,
        };
        assert!(filter.allows("anything"));
        assert!(ToolFilter::default().allows("anything"));
    }
}
