//! Exposes discovered MCP tools as uniquely named, callable descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::McpClient;
use crate::config::ToolFilter;
use crate::error::Result;
use crate::security::{apply_trust_policy, TrustLevel};
use crate::types::{McpCallResult, McpContentItem, McpTool};

/// Content block handed back to the caller of a bridged tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgedContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgedResult {
    pub content: Vec<BridgedContent>,
    pub is_error: bool,
}

impl BridgedResult {
    /// All text blocks joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                BridgedContent::Text { text } => Some(text.as_str()),
                BridgedContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An MCP tool re-exposed under a namespaced name
#[derive(Clone)]
pub struct BridgedTool {
    pub qualified_name: String,
    pub display_label: String,
    pub description: String,
    pub parameters: Value,
    pub server: String,
    pub operation: String,
    client: Arc<McpClient>,
    trust_level: TrustLevel,
    max_result_chars: usize,
}

impl std::fmt::Debug for BridgedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedTool")
            .field("qualified_name", &self.qualified_name)
            .field("server", &self.server)
            .field("operation", &self.operation)
            .field("trust_level", &self.trust_level)
            .finish()
    }
}

impl BridgedTool {
    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    /// Call the underlying tool and return its output after the trust policy.
    ///
    /// A failure reported by the tool itself comes back as an error-flagged
    /// result; transport problems and cancellation are returned as `Err`.
    pub async fn invoke(
        &self,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<BridgedResult> {
        debug!(
            "Executing MCP tool: {} (server: {}, tool: {})",
            self.qualified_name, self.server, self.operation
        );

        let raw = self.client.call_tool(&self.operation, args, cancel).await?;
        let safe = apply_trust_policy(raw, self.trust_level, self.max_result_chars);
        let result = to_bridged_result(safe);

        if result.is_error {
            let detail = result.text();
            let detail = if detail.is_empty() {
                "no details provided".to_string()
            } else {
                detail
            };
            return Ok(BridgedResult {
                content: vec![BridgedContent::Text {
                    text: format!("MCP tool '{}' failed: {}", self.qualified_name, detail),
                }],
                is_error: true,
            });
        }

        Ok(result)
    }
}

fn to_bridged_result(result: McpCallResult) -> BridgedResult {
    let content = result
        .content
        .into_iter()
        .map(|item| match item {
            McpContentItem::Text { text } => BridgedContent::Text { text },
            McpContentItem::Image { data, mime_type } => BridgedContent::Image { data, mime_type },
            McpContentItem::Resource { resource } => BridgedContent::Text {
                text: match resource.text {
                    Some(text) => format!("[Resource {}]: {}", resource.uri, text),
                    None => format!("[Resource {}]", resource.uri),
                },
            },
            McpContentItem::Unsupported => BridgedContent::Text {
                text: "[unsupported content]".to_string(),
            },
        })
        .collect();

    BridgedResult {
        content,
        is_error: result.is_error,
    }
}

/// Lower-case, collapse runs outside `[a-z0-9_]` into `_`, trim underscores
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            normalized.push(c);
            in_run = false;
        } else if !in_run {
            normalized.push('_');
            in_run = true;
        }
    }
    normalized.trim_matches('_').to_string()
}

pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("mcp_{}_{}", normalize_name(server), normalize_name(tool))
}

/// Guarantee a top-level `"type": "object"` in a tool's input schema
pub fn normalize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut map = map.clone();
            if !map.contains_key("type") {
                map.insert("type".to_string(), json!("object"));
            }
            Value::Object(map)
        }
        _ => json!({ "type": "object", "properties": {} }),
    }
}

/// Builds one set of bridged tools with names unique across all servers
#[derive(Default)]
pub struct ToolBridge {
    used_names: HashSet<String>,
    tools: Vec<BridgedTool>,
}

impl ToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridge the tools of one connected server
    pub fn add_server(
        &mut self,
        client: &Arc<McpClient>,
        tools: &[McpTool],
        filter: Option<&ToolFilter>,
    ) -> usize {
        let settings = client.settings();
        let mut added = 0;

        for tool in tools {
            if let Some(filter) = filter {
                if !filter.allows(&tool.name) {
                    debug!("Tool '{}' on '{}' filtered out", tool.name, tool.server);
                    continue;
                }
            }

            let name = self.unique_name(qualified_name(&tool.server, &tool.name));
            let description = tool
                .description
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("Tool '{}' from MCP server '{}'", tool.name, tool.server));

            self.tools.push(BridgedTool {
                qualified_name: name,
                display_label: format!("{} ({})", tool.name, tool.server),
                description,
                parameters: normalize_schema(&tool.input_schema),
                server: tool.server.clone(),
                operation: tool.name.clone(),
                client: client.clone(),
                trust_level: settings.trust_level,
                max_result_chars: settings.max_result_chars,
            });
            added += 1;
        }

        added
    }

    fn unique_name(&mut self, base: String) -> String {
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.used_names.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        if candidate != base {
            debug!("Tool name '{}' already taken, using '{}'", base, candidate);
        }
        self.used_names.insert(candidate.clone());
        candidate
    }

    pub fn finish(self) -> Vec<BridgedTool> {
        self.tools
    }
}
