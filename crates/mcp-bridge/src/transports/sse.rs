use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header::HeaderMap, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::Inbox;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;

const ENDPOINT_TIMEOUT_MS: u64 = 10000;

/// Legacy HTTP+SSE transport: a long-lived GET event stream for responses and
/// a POST endpoint, announced by the server, for requests.
pub struct SseTransport {
    url: String,
    headers: HeaderMap,
    client: Client,
    connected: Arc<AtomicBool>,
    inbox: Inbox,
    sse_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    endpoint_url: parking_lot::Mutex<Option<String>>,
}

impl SseTransport {
    pub fn new(url: String, headers: HeaderMap) -> Self {
        Self {
            url,
            headers,
            client: Client::new(),
            connected: Arc::new(AtomicBool::new(false)),
            inbox: Inbox::new(),
            sse_handle: parking_lot::Mutex::new(None),
            endpoint_url: parking_lot::Mutex::new(None),
        }
    }
}

/// Resolve the `endpoint` event payload against the stream URL
fn resolve_endpoint(base: &str, endpoint: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| McpError::InvalidConfig(format!("Invalid SSE url '{}': {}", base, e)))?;
    let resolved = base.join(endpoint.trim()).map_err(|e| {
        McpError::Protocol(format!("Invalid SSE endpoint '{}': {}", endpoint, e))
    })?;
    Ok(resolved.to_string())
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> Result<()> {
        info!("Connecting to MCP SSE endpoint: {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(McpError::Connection(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        self.inbox.drain().await;
        let message_tx = self.inbox.sender();
        let connected = self.connected.clone();
        let url = self.url.clone();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        debug!("SSE event: {}", event.event);
                        if event.event == "endpoint" {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        } else if (event.event == "message" || event.event.is_empty())
                            && message_tx.send(event.data).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("SSE stream error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            warn!("SSE stream ended for {}", url);
        });

        let endpoint = match tokio::time::timeout(
            tokio::time::Duration::from_millis(ENDPOINT_TIMEOUT_MS),
            endpoint_rx,
        )
        .await
        {
            Ok(Ok(endpoint)) => endpoint,
            _ => {
                handle.abort();
                return Err(McpError::Connection(format!(
                    "SSE server at {} did not announce a message endpoint",
                    self.url
                )));
            }
        };

        let post_url = match resolve_endpoint(&self.url, &endpoint) {
            Ok(url) => url,
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        };
        debug!("Got endpoint: {}", post_url);

        *self.endpoint_url.lock() = Some(post_url);
        if let Some(previous) = self.sse_handle.lock().replace(handle) {
            previous.abort();
        }
        self.connected.store(true, Ordering::SeqCst);

        info!("MCP SSE transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting MCP SSE transport");

        self.connected.store(false, Ordering::SeqCst);
        self.endpoint_url.lock().take();

        if let Some(handle) = self.sse_handle.lock().take() {
            handle.abort();
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let post_url = self
            .endpoint_url
            .lock()
            .clone()
            .ok_or(McpError::Disconnected)?;

        let response = self
            .client
            .post(&post_url)
            .headers(self.headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "POST failed: {} - {}",
                status, body
            )));
        }

        debug!("Sent message via POST to {}", post_url);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        self.inbox.receive().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
