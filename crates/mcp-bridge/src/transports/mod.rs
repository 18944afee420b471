pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::config::{McpServerConfig, TransportType};
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;

/// Concrete transport used for a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
    Sse,
}

impl TransportKind {
    /// Calls allowed in flight at once. A stdio pipe cannot interleave
    /// requests safely; HTTP transports multiplex.
    pub fn max_concurrent_calls(&self) -> usize {
        match self {
            TransportKind::Stdio => 1,
            TransportKind::StreamableHttp => 4,
            TransportKind::Sse => 2,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::StreamableHttp => write!(f, "streamable_http"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

/// Pick the transport for a server.
///
/// An explicit tag wins, then a spawn command, then a URL. Stdio is the
/// fallback when nothing is configured.
pub fn select_transport(config: &McpServerConfig) -> TransportKind {
    match config.transport {
        TransportType::Stdio => TransportKind::Stdio,
        TransportType::Http => TransportKind::StreamableHttp,
        TransportType::Sse => TransportKind::Sse,
        TransportType::Auto => {
            if config.command.is_some() {
                TransportKind::Stdio
            } else if config.url.is_some() {
                TransportKind::StreamableHttp
            } else {
                TransportKind::Stdio
            }
        }
    }
}

/// Builds transports for connect attempts
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        server: &str,
        config: &McpServerConfig,
        kind: TransportKind,
    ) -> Result<Box<dyn McpTransport>>;
}

/// Factory producing real stdio, streamable HTTP and SSE transports
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        server: &str,
        config: &McpServerConfig,
        kind: TransportKind,
    ) -> Result<Box<dyn McpTransport>> {
        match kind {
            TransportKind::Stdio => {
                let command = config.command.clone().ok_or_else(|| {
                    McpError::InvalidConfig(format!(
                        "server '{}' uses the stdio transport but has no command",
                        server
                    ))
                })?;
                Ok(Box::new(StdioTransport::new(
                    command,
                    config.args.clone(),
                    config.env.clone(),
                    config.cwd.clone(),
                )))
            }
            TransportKind::StreamableHttp => {
                let url = require_url(server, config, kind)?;
                let headers = build_headers(&config.headers)?;
                Ok(Box::new(StreamableHttpTransport::new(url, headers)))
            }
            TransportKind::Sse => {
                let url = require_url(server, config, kind)?;
                let headers = build_headers(&config.headers)?;
                Ok(Box::new(SseTransport::new(url, headers)))
            }
        }
    }
}

fn require_url(server: &str, config: &McpServerConfig, kind: TransportKind) -> Result<String> {
    config.url.clone().ok_or_else(|| {
        McpError::InvalidConfig(format!(
            "server '{}' uses the {} transport but has no url",
            server, kind
        ))
    })
}

pub(crate) fn build_headers(configured: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in configured {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::InvalidConfig(format!("Invalid header name: {}", e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| McpError::InvalidConfig(format!("Invalid header value: {}", e)))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

/// Queue of inbound messages filled by a transport's reader task.
///
/// Receiving from the channel is cancel safe, so the session loop can poll
/// with a short timeout without losing partially read data.
pub(crate) struct Inbox {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<String> {
        self.tx.clone()
    }

    /// Wait briefly for the next message; `Ok(None)` when nothing arrived
    pub(crate) async fn receive(&self) -> Result<Option<String>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(tokio::time::Duration::from_millis(100), rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                warn!("MCP message channel closed");
                Err(McpError::Disconnected)
            }
            Err(_) => Ok(None),
        }
    }

    /// Drop anything left over from a previous session
    pub(crate) async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}
