use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Inbox;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport: every message is POSTed to one URL and the reply
/// comes back either as a JSON body or as an event stream on that response.
pub struct StreamableHttpTransport {
    url: String,
    headers: HeaderMap,
    client: Client,
    connected: AtomicBool,
    session_id: parking_lot::Mutex<Option<String>>,
    inbox: Inbox,
    streams: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    pub fn new(url: String, headers: HeaderMap) -> Self {
        Self {
            url,
            headers,
            client: Client::new(),
            connected: AtomicBool::new(false),
            session_id: parking_lot::Mutex::new(None),
            inbox: Inbox::new(),
            streams: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn track_stream(&self, handle: JoinHandle<()>) {
        let mut streams = self.streams.lock();
        streams.retain(|h| !h.is_finished());
        streams.push(handle);
    }
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("text/event-stream")
}

/// Queue a JSON body, splitting batch arrays into single messages
async fn enqueue_body(tx: &mpsc::Sender<String>, body: &str) -> Result<()> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(());
    }

    if body.starts_with('[') {
        let batch: Vec<Value> = serde_json::from_str(body)?;
        for message in batch {
            tx.send(message.to_string())
                .await
                .map_err(|_| McpError::Disconnected)?;
        }
        return Ok(());
    }

    tx.send(body.to_string())
        .await
        .map_err(|_| McpError::Disconnected)
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&self) -> Result<()> {
        info!("Using MCP streamable HTTP endpoint: {}", self.url);
        // The session itself is negotiated by the initialize request.
        self.inbox.drain().await;
        self.session_id.lock().take();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting MCP streamable HTTP transport");

        self.connected.store(false, Ordering::SeqCst);
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }

        let session = self.session_id.lock().take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                debug!("Failed to end MCP HTTP session: {}", e);
            }
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "POST failed: {} - {}",
                status, body
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let tx = self.inbox.sender();
        if is_event_stream(&content_type) {
            let handle = tokio::spawn(async move {
                let mut stream = response.bytes_stream().eventsource();
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) if event.event == "message" || event.event.is_empty() => {
                            if let Err(e) = enqueue_body(&tx, &event.data).await {
                                warn!("Dropping MCP HTTP stream message: {}", e);
                                break;
                            }
                        }
                        Ok(event) => debug!("Ignoring SSE event: {}", event.event),
                        Err(e) => {
                            warn!("MCP HTTP event stream error: {}", e);
                            break;
                        }
                    }
                }
            });
            self.track_stream(handle);
        } else {
            let body = response.text().await?;
            enqueue_body(&tx, &body).await?;
        }

        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        self.inbox.receive().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
