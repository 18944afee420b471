//! Client-side bridge to MCP (Model Context Protocol) tool servers.
//!
//! Connects to the configured servers over stdio, streamable HTTP or legacy
//! SSE, applies a trust policy to everything they return, and exposes their
//! tools under collision-free `mcp_{server}_{tool}` names.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod security;
pub mod transports;
pub mod types;

pub use bridge::{BridgedContent, BridgedResult, BridgedTool, ToolBridge};
pub use client::McpClient;
pub use config::*;
pub use error::{McpError, Result};
pub use manager::McpServerManager;
pub use protocol::*;
pub use security::{apply_trust_policy, sanitize_text, truncate_text, TrustLevel};
pub use transports::*;
pub use types::*;
