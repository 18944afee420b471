//! In-process fake MCP server plugged in through `TransportFactory`

#![allow(dead_code)]

use async_trait::async_trait;
use mcp_bridge::{
    McpConfig, McpError, McpServerConfig, McpServerManager, McpTransport, Result, TransportFactory,
    TransportKind,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Behaviour and counters of one fake server
pub struct FakeServer {
    pub tools: Vec<Value>,
    pub call_delay: Duration,
    pub connect_delay: Duration,
    pub fail_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub active_calls: AtomicUsize,
    pub max_active_calls: AtomicUsize,
    pub released: AtomicUsize,
    pub cancelled: parking_lot::Mutex<Vec<u64>>,
    live: parking_lot::Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            tools: vec![
                json!({ "name": "echo", "description": "Echo arguments", "inputSchema": { "type": "object" } }),
                json!({ "name": "html", "description": "Return markup" }),
                json!({ "name": "fail", "inputSchema": { "properties": {} } }),
            ],
            call_delay: Duration::from_millis(0),
            connect_delay: Duration::from_millis(0),
            fail_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            max_active_calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            cancelled: parking_lot::Mutex::new(Vec::new()),
            live: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Transports dropped so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn max_active_calls(&self) -> usize {
        self.max_active_calls.load(Ordering::SeqCst)
    }

    /// Simulate the server process dying under every open transport
    pub fn drop_connections(&self) {
        for flag in self.live.lock().drain(..) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    async fn answer(&self, request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        let method = request["method"].as_str().unwrap_or_default();

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "fake", "version": "0.0.1" }
            }),
            "tools/list" => json!({ "tools": self.tools }),
            "ping" => json!({}),
            "tools/call" => self.call(&request["params"]).await,
            other => {
                return Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {}", other) }
                }))
            }
        };

        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    async fn call(&self, params: &Value) -> Value {
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_calls.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.call_delay).await;
        self.active_calls.fetch_sub(1, Ordering::SeqCst);

        match params["name"].as_str().unwrap_or_default() {
            "html" => json!({ "content": [{ "type": "text", "text": "<div>hi</div>" }] }),
            "fail" => json!({
                "content": [{ "type": "text", "text": "disk full" }],
                "isError": true
            }),
            _ => json!({
                "content": [{ "type": "text", "text": format!("echo: {}", params["arguments"]) }]
            }),
        }
    }
}

pub struct FakeTransport {
    server: Arc<FakeServer>,
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl FakeTransport {
    pub fn new(server: Arc<FakeServer>) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            server,
            connected: Arc::new(AtomicBool::new(false)),
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.server.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        let attempt = self.server.connects.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.server.connect_delay).await;
        if self.server.fail_connect.load(Ordering::SeqCst) {
            return Err(McpError::Connection(format!("refused #{}", attempt)));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.server.live.lock().push(self.connected.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }

        let request: Value = serde_json::from_str(&message)?;
        if request["method"] == "notifications/cancelled" {
            if let Some(id) = request["params"]["requestId"].as_u64() {
                self.server.cancelled.lock().push(id);
            }
            return Ok(());
        }

        let server = self.server.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = server.answer(&request).await {
                let _ = tx.send(reply.to_string()).await;
            }
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Ok(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Routes each server name to its fake
#[derive(Default)]
pub struct FakeFactory {
    servers: HashMap<String, Arc<FakeServer>>,
}

impl FakeFactory {
    pub fn with_server(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), Arc::new(server));
        self
    }

    pub fn server(&self, name: &str) -> Arc<FakeServer> {
        self.servers[name].clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(
        &self,
        server: &str,
        _config: &McpServerConfig,
        _kind: TransportKind,
    ) -> Result<Box<dyn McpTransport>> {
        let fake = self
            .servers
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::InvalidConfig(format!("no fake for '{}'", server)))?;
        Ok(Box::new(FakeTransport::new(fake)))
    }
}

pub fn stdio_server() -> McpServerConfig {
    McpServerConfig::stdio("fake-mcp", Vec::new())
}

pub fn http_server() -> McpServerConfig {
    McpServerConfig::http("http://fake.invalid/mcp")
}

/// Manager over the given servers with fast retries and the fake factory
pub fn manager(
    servers: Vec<(&str, McpServerConfig)>,
    factory: Arc<FakeFactory>,
) -> McpServerManager {
    let mut config = McpConfig::default();
    for (name, server) in servers {
        config.servers.insert(name.to_string(), server);
    }
    McpServerManager::new(config)
        .with_transport_factory(factory)
        .with_backoff_base(Duration::from_millis(5))
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
