use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{McpError, Result};
use crate::protocol::models::*;
use crate::types::{McpCallResult, McpTool};

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn send(&self, message: String) -> Result<()>;
    /// Next inbound message, or `None` if nothing arrived within a short poll
    async fn receive(&self) -> Result<Option<String>>;
    fn is_connected(&self) -> bool;
}

/// Pending request waiting for response
struct PendingRequest {
    sender: oneshot::Sender<Result<JsonRpcResponse>>,
}

type PendingMap = RwLock<HashMap<u64, PendingRequest>>;

/// JSON-RPC session over a single transport
pub struct McpProtocolClient {
    transport: Arc<dyn McpTransport>,
    next_id: AtomicU64,
    pending_requests: Arc<PendingMap>,
    message_handler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl McpProtocolClient {
    pub fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport: Arc::from(transport),
            next_id: AtomicU64::new(1),
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
            message_handler: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Cancelled once the receive loop stops, for whatever reason
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await?;
        self.start_message_handler();
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        if let Some(handler) = self.message_handler.lock().take() {
            handler.abort();
        }

        // Dropping the senders wakes every waiter with `Disconnected`
        self.pending_requests.write().await.clear();
        self.closed.cancel();

        self.transport.disconnect().await
    }

    fn start_message_handler(&self) {
        let transport = self.transport.clone();
        let pending_requests = self.pending_requests.clone();
        let closed = self.closed.clone();

        let handler = tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(Some(message)) => {
                        debug!("Received message: {}", message);
                        match Self::handle_message(&message, &pending_requests).await {
                            Ok(Some(reply)) => {
                                if let Err(e) = transport.send(reply).await {
                                    warn!("Failed to answer server request: {}", e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Failed to handle message: {}", e),
                        }
                    }
                    Ok(None) => {
                        if !transport.is_connected() {
                            warn!("MCP transport is no longer connected");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Transport error: {}", e);
                        break;
                    }
                }
            }

            pending_requests.write().await.clear();
            closed.cancel();
        });

        if let Some(previous) = self.message_handler.lock().replace(handler) {
            previous.abort();
        }
    }

    /// Route one inbound message. Returns a reply for server-initiated requests.
    async fn handle_message(message: &str, pending_requests: &PendingMap) -> Result<Option<String>> {
        let value: Value = serde_json::from_str(message)?;
        let method = value.get("method").and_then(Value::as_str).map(str::to_string);
        let id = value.get("id").cloned();

        match (method, id) {
            (None, Some(_)) => {
                let response: JsonRpcResponse = serde_json::from_value(value)?;
                let mut pending = pending_requests.write().await;
                match pending.remove(&response.id) {
                    Some(request) => {
                        let _ = request.sender.send(Ok(response));
                    }
                    None => debug!("Dropping response for unknown request {}", response.id),
                }
                Ok(None)
            }
            (Some(method), Some(id)) => {
                let reply = if method == "ping" {
                    json!({ "jsonrpc": "2.0", "id": id, "result": {} })
                } else {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": format!("Method not found: {}", method) }
                    })
                };
                Ok(Some(reply.to_string()))
            }
            (Some(method), None) => {
                debug!("Received notification: {}", method);
                Ok(None)
            }
            (None, None) => Err(McpError::Protocol("Unknown message type".to_string())),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.transport
            .send(serde_json::to_string(&notification)?)
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_requests.write().await;
            pending.insert(id, PendingRequest { sender: tx });
        }

        if let Err(e) = self.transport.send(request_json).await {
            self.pending_requests.write().await.remove(&id);
            return Err(e);
        }

        let wait = tokio::time::timeout(tokio::time::Duration::from_millis(timeout_ms), rx);
        let outcome = match cancel {
            Some(token) => tokio::select! {
                outcome = wait => outcome,
                _ = token.cancelled() => {
                    self.pending_requests.write().await.remove(&id);
                    let params = serde_json::to_value(McpCancelledParams {
                        request_id: id,
                        reason: Some("Canceled by caller".to_string()),
                    })?;
                    if let Err(e) = self.send_notification("notifications/cancelled", Some(params)).await {
                        debug!("Failed to notify server about cancellation: {}", e);
                    }
                    return Err(McpError::Cancelled(format!("{} (request {})", method, id)));
                }
            },
            None => wait.await,
        };

        match outcome {
            Ok(Ok(Ok(response))) => {
                if let Some(error) = response.error {
                    Err(McpError::Protocol(format!(
                        "{}: {}",
                        error.code, error.message
                    )))
                } else {
                    Ok(response)
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                self.pending_requests.write().await.remove(&id);
                Err(McpError::Timeout(format!(
                    "Request {} ({}) timed out after {}ms",
                    id, method, timeout_ms
                )))
            }
        }
    }

    fn take_result(response: JsonRpcResponse) -> Result<Value> {
        response
            .result
            .ok_or_else(|| McpError::Protocol("Missing result".to_string()))
    }

    pub async fn initialize(&self, timeout_ms: u64) -> Result<McpInitializeResult> {
        let request = McpInitializeRequest::default();
        let params = serde_json::to_value(request)?;

        let response = self
            .send_request("initialize", Some(params), timeout_ms, None)
            .await?;
        let result: McpInitializeResult = serde_json::from_value(Self::take_result(response)?)?;

        self.send_notification("notifications/initialized", None)
            .await?;

        Ok(result)
    }

    /// List every tool, following pagination cursors
    pub async fn list_tools(&self, server: &str, timeout_ms: u64) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(_) => Some(serde_json::to_value(McpToolListRequest {
                    cursor: cursor.clone(),
                })?),
                None => None,
            };
            let response = self
                .send_request("tools/list", params, timeout_ms, None)
                .await?;
            let page: McpToolListResult = serde_json::from_value(Self::take_result(response)?)?;

            tools.extend(page.tools.into_iter().map(|t| McpTool {
                server: server.to_string(),
                name: t.name,
                description: t.description,
                input_schema: t.input_schema.unwrap_or_else(|| json!({})),
            }));

            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                Some(_) => {
                    warn!("MCP server '{}' repeated tools/list cursor, stopping", server);
                    break;
                }
                None => break,
            }
        }

        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout_ms: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<McpCallResult> {
        let request = McpToolCallRequest {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let params = serde_json::to_value(request)?;

        let response = self
            .send_request("tools/call", Some(params), timeout_ms, cancel)
            .await?;

        Ok(serde_json::from_value(Self::take_result(response)?)?)
    }

    pub async fn ping(&self, timeout_ms: u64) -> Result<()> {
        self.send_request("ping", None, timeout_ms, None).await?;
        Ok(())
    }
}

impl Drop for McpProtocolClient {
    fn drop(&mut self) {
        // The receive loop owns a transport handle; stopping it releases the transport
        if let Some(handler) = self.message_handler.get_mut().take() {
            handler.abort();
        }
        self.closed.cancel();
    }
}
