use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgedResult, BridgedTool, ToolBridge};
use crate::client::McpClient;
use crate::config::{EndpointSettings, McpConfig, McpServerConfig};
use crate::error::{McpError, Result};
use crate::transports::{select_transport, DefaultTransportFactory, TransportFactory};
use crate::types::{ConnectionState, EndpointStatus, McpEvent, McpTool};

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type ConnectAttempt = Shared<BoxFuture<'static, Result<()>>>;

/// Mutable part of a managed endpoint, always updated under one lock
struct EndpointState {
    state: ConnectionState,
    client: Option<Arc<McpClient>>,
    last_error: Option<String>,
    tools: Vec<McpTool>,
    connected_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    attempt: Option<ConnectAttempt>,
}

struct ManagedEndpoint {
    name: String,
    config: McpServerConfig,
    settings: EndpointSettings,
    state: parking_lot::Mutex<EndpointState>,
}

impl ManagedEndpoint {
    fn new(name: String, config: McpServerConfig, settings: EndpointSettings) -> Self {
        Self {
            name,
            config,
            settings,
            state: parking_lot::Mutex::new(EndpointState {
                state: ConnectionState::Disconnected,
                client: None,
                last_error: None,
                tools: Vec::new(),
                connected_at: None,
                last_health_check: None,
                attempt: None,
            }),
        }
    }

    fn visible_tools(&self, tools: &[McpTool]) -> Vec<String> {
        tools
            .iter()
            .filter(|t| {
                self.config
                    .tool_filter
                    .as_ref()
                    .map_or(true, |f| f.allows(&t.name))
            })
            .map(|t| t.name.clone())
            .collect()
    }

    fn status(&self) -> EndpointStatus {
        let state = self.state.lock();
        let tools = self.visible_tools(&state.tools);
        EndpointStatus {
            name: self.name.clone(),
            state: state.state,
            transport: select_transport(&self.config),
            trust_level: self.settings.trust_level,
            last_error: state.last_error.clone(),
            tool_count: tools.len(),
            tools,
            connected_at: state.connected_at,
            last_health_check: state.last_health_check,
        }
    }
}

/// Everything a spawned connect attempt needs, detached from the manager
#[derive(Clone)]
struct ConnectContext {
    factory: Arc<dyn TransportFactory>,
    retries: u32,
    backoff_base: Duration,
    event_tx: Option<mpsc::Sender<McpEvent>>,
}

async fn emit(event_tx: &Option<mpsc::Sender<McpEvent>>, event: McpEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event).await;
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`, capped
/// at [`MAX_BACKOFF`]
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32 << (attempt - 1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Manages the configured MCP servers: connection lifecycle, status and
/// the bridged tool set.
pub struct McpServerManager {
    endpoints: DashMap<String, Arc<ManagedEndpoint>>,
    factory: Arc<dyn TransportFactory>,
    retries: u32,
    backoff_base: Duration,
    event_tx: Option<mpsc::Sender<McpEvent>>,
}

impl McpServerManager {
    /// Register every enabled server from `config`. Nothing connects yet.
    pub fn new(config: McpConfig) -> Self {
        let endpoints = DashMap::new();
        for (name, server) in config.servers {
            if !server.enabled {
                debug!("MCP server '{}' is disabled, skipping", name);
                continue;
            }
            let settings = server.settings(&config.defaults);
            endpoints.insert(
                name.clone(),
                Arc::new(ManagedEndpoint::new(name, server, settings)),
            );
        }

        Self {
            endpoints,
            factory: Arc::new(DefaultTransportFactory),
            retries: config.defaults.retries,
            backoff_base: DEFAULT_BACKOFF_BASE,
            event_tx: None,
        }
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Base delay between connect attempts. Retry `i` waits `base * 2^(i-1)`,
    /// capped at 30 s.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<McpEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn endpoint(&self, name: &str) -> Result<Arc<ManagedEndpoint>> {
        self.endpoints
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    /// Names of all managed servers, sorted
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn sorted_endpoints(&self) -> Vec<Arc<ManagedEndpoint>> {
        let mut endpoints: Vec<_> = self.endpoints.iter().map(|e| e.value().clone()).collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    /// Live client of a connected server
    pub fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.endpoints
            .get(name)
            .and_then(|e| e.state.lock().client.clone())
    }

    fn context(&self) -> ConnectContext {
        ConnectContext {
            factory: self.factory.clone(),
            retries: self.retries,
            backoff_base: self.backoff_base,
            event_tx: self.event_tx.clone(),
        }
    }

    /// Spawn a connect attempt and publish it on the endpoint.
    /// Must be called with the endpoint's state lock held.
    fn start_attempt(
        &self,
        endpoint: &Arc<ManagedEndpoint>,
        state: &mut EndpointState,
        reported: ConnectionState,
    ) -> ConnectAttempt {
        let handle = tokio::spawn(run_connect(self.context(), endpoint.clone()));
        let name = endpoint.name.clone();
        let attempt = async move {
            handle.await.unwrap_or_else(|e| {
                Err(McpError::Connection(format!(
                    "Connect task for '{}' failed: {}",
                    name, e
                )))
            })
        }
        .boxed()
        .shared();

        state.state = reported;
        state.attempt = Some(attempt.clone());
        attempt
    }

    /// Connect one server. Returns immediately when it is already connected
    /// and joins the running attempt when one is in flight.
    pub async fn connect_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self.endpoint(name)?;

        let (attempt, started) = {
            let mut state = endpoint.state.lock();
            if state.state == ConnectionState::Connected && state.client.is_some() {
                return Ok(());
            }
            match state.attempt.clone() {
                Some(attempt) => (attempt, false),
                None => (
                    self.start_attempt(&endpoint, &mut state, ConnectionState::Connecting),
                    true,
                ),
            }
        };

        if started {
            info!("Connecting MCP server '{}'", name);
            emit(
                &self.event_tx,
                McpEvent::ServerStatusChanged {
                    server: name.to_string(),
                    state: ConnectionState::Connecting,
                    error: None,
                },
            )
            .await;
        }

        attempt.await
    }

    /// Connect every server concurrently and collect the failures
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let names = self.endpoint_names();
        let results = join_all(names.into_iter().map(|name| async move {
            let result = self.connect_endpoint(&name).await;
            (name, result)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    error!("Failed to connect MCP server '{}': {}", name, e);
                    Some((name, e))
                }
            })
            .collect()
    }

    /// Wait out any running attempt, then drop the session and its tools
    async fn teardown(&self, endpoint: &ManagedEndpoint) {
        // Idle check and reset happen under the same lock
        let client = loop {
            let attempt = {
                let mut state = endpoint.state.lock();
                match state.attempt.clone() {
                    Some(attempt) => attempt,
                    None => {
                        state.tools.clear();
                        state.connected_at = None;
                        state.last_error = None;
                        state.state = ConnectionState::Disconnected;
                        break state.client.take();
                    }
                }
            };
            let _ = attempt.await;
        };

        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!("Error disconnecting MCP server '{}': {}", endpoint.name, e);
            }
        }
    }

    pub async fn disconnect_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self.endpoint(name)?;
        self.teardown(&endpoint).await;

        info!("MCP server '{}' disconnected", name);
        emit(
            &self.event_tx,
            McpEvent::ServerStatusChanged {
                server: name.to_string(),
                state: ConnectionState::Disconnected,
                error: None,
            },
        )
        .await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let names = self.endpoint_names();
        join_all(names.iter().map(|name| self.disconnect_endpoint(name))).await;
    }

    /// Disconnect, then connect again while reporting `reconnecting`
    pub async fn restart_endpoint(&self, name: &str) -> Result<()> {
        let endpoint = self.endpoint(name)?;
        self.teardown(&endpoint).await;

        let attempt = {
            let mut state = endpoint.state.lock();
            match state.attempt.clone() {
                Some(attempt) => attempt,
                None => self.start_attempt(&endpoint, &mut state, ConnectionState::Reconnecting),
            }
        };

        info!("Restarting MCP server '{}'", name);
        emit(
            &self.event_tx,
            McpEvent::ServerStatusChanged {
                server: name.to_string(),
                state: ConnectionState::Reconnecting,
                error: None,
            },
        )
        .await;

        attempt.await
    }

    /// Ping a server. Not-connected servers report `false` without a ping.
    pub async fn health_check(&self, name: &str) -> Result<bool> {
        let endpoint = self.endpoint(name)?;
        let client = {
            let state = endpoint.state.lock();
            match (&state.client, state.state) {
                (Some(client), ConnectionState::Connected) => client.clone(),
                _ => return Ok(false),
            }
        };

        let healthy = client.health_check().await;
        endpoint.state.lock().last_health_check = Some(Utc::now());
        Ok(healthy)
    }

    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let names = self.endpoint_names();
        join_all(names.into_iter().map(|name| async move {
            let healthy = self.health_check(&name).await.unwrap_or(false);
            (name, healthy)
        }))
        .await
    }

    pub fn get_status(&self) -> Vec<EndpointStatus> {
        self.sorted_endpoints().iter().map(|e| e.status()).collect()
    }

    pub fn get_endpoint_status(&self, name: &str) -> Result<EndpointStatus> {
        Ok(self.endpoint(name)?.status())
    }

    /// Connect everything that is not connected yet, then bridge all tools.
    /// Servers that fail to connect are left out.
    pub async fn get_tools(&self) -> Vec<BridgedTool> {
        let failures = self.connect_all().await;
        if !failures.is_empty() {
            warn!(
                "{} MCP server(s) unavailable, their tools are omitted",
                failures.len()
            );
        }
        self.get_cached_tools()
    }

    /// Bridge the tools of servers that are connected right now
    pub fn get_cached_tools(&self) -> Vec<BridgedTool> {
        let mut bridge = ToolBridge::new();
        for endpoint in self.sorted_endpoints() {
            let (client, tools) = {
                let state = endpoint.state.lock();
                match (&state.client, state.state) {
                    (Some(client), ConnectionState::Connected) => {
                        (client.clone(), state.tools.clone())
                    }
                    _ => continue,
                }
            };
            bridge.add_server(&client, &tools, endpoint.config.tool_filter.as_ref());
        }
        bridge.finish()
    }

    /// Invoke a bridged tool by its qualified name
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<BridgedResult> {
        let tool = self
            .get_cached_tools()
            .into_iter()
            .find(|t| t.qualified_name == qualified_name)
            .ok_or_else(|| McpError::ToolNotFound(qualified_name.to_string()))?;

        let result = tool.invoke(args, cancel).await;

        emit(
            &self.event_tx,
            McpEvent::ToolExecuted {
                server: tool.server.clone(),
                tool_name: tool.operation.clone(),
                success: matches!(&result, Ok(r) if !r.is_error),
            },
        )
        .await;

        result
    }
}

/// Connect and list tools, one attempt
async fn try_connect(client: &McpClient) -> Result<Vec<McpTool>> {
    client.connect().await?;
    client.list_tools().await
}

async fn run_connect(ctx: ConnectContext, endpoint: Arc<ManagedEndpoint>) -> Result<()> {
    let name = endpoint.name.clone();
    let attempts = ctx.retries + 1;
    let mut last_error = McpError::Connection(format!("No connect attempt made for '{}'", name));

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = backoff_delay(ctx.backoff_base, attempt);
            debug!(
                "Retrying MCP server '{}' in {:?} (attempt {}/{})",
                name,
                delay,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(delay).await;
        }

        let client = Arc::new(McpClient::new(
            name.clone(),
            endpoint.config.clone(),
            endpoint.settings,
            ctx.factory.clone(),
        ));

        match try_connect(&client).await {
            Ok(tools) => {
                info!("MCP server '{}' connected with {} tools", name, tools.len());
                let closed = client.closed_token();
                let visible = endpoint.visible_tools(&tools);
                {
                    let mut state = endpoint.state.lock();
                    state.client = Some(client.clone());
                    state.tools = tools;
                    state.connected_at = Some(Utc::now());
                    state.last_error = None;
                    state.state = ConnectionState::Connected;
                    state.attempt = None;
                }

                if let Some(closed) = closed {
                    watch_transport(
                        Arc::downgrade(&endpoint),
                        Arc::downgrade(&client),
                        closed,
                        ctx.event_tx.clone(),
                    );
                }

                emit(
                    &ctx.event_tx,
                    McpEvent::ServerStatusChanged {
                        server: name.clone(),
                        state: ConnectionState::Connected,
                        error: None,
                    },
                )
                .await;
                emit(
                    &ctx.event_tx,
                    McpEvent::ToolsChanged {
                        server: name,
                        tools: visible,
                    },
                )
                .await;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "MCP server '{}' connect attempt {}/{} failed: {}",
                    name,
                    attempt + 1,
                    attempts,
                    e
                );
                if let Err(close_err) = client.disconnect().await {
                    debug!("Error cleaning up MCP server '{}': {}", name, close_err);
                }
                last_error = e;
            }
        }
    }

    error!(
        "MCP server '{}' failed after {} attempts: {}",
        name, attempts, last_error
    );
    {
        let mut state = endpoint.state.lock();
        state.client = None;
        state.tools.clear();
        state.connected_at = None;
        state.last_error = Some(last_error.to_string());
        state.state = ConnectionState::Error;
        state.attempt = None;
    }

    emit(
        &ctx.event_tx,
        McpEvent::ServerStatusChanged {
            server: name,
            state: ConnectionState::Error,
            error: Some(last_error.to_string()),
        },
    )
    .await;

    Err(last_error)
}

/// Move a connected endpoint to `error` when its transport goes away on its own
fn watch_transport(
    endpoint: Weak<ManagedEndpoint>,
    client: Weak<McpClient>,
    closed: CancellationToken,
    event_tx: Option<mpsc::Sender<McpEvent>>,
) {
    tokio::spawn(async move {
        closed.cancelled().await;

        let Some(endpoint) = endpoint.upgrade() else {
            return;
        };

        let message = format!("Connection to MCP server '{}' closed unexpectedly", endpoint.name);
        let stale = {
            let mut state = endpoint.state.lock();
            let current = state
                .client
                .as_ref()
                .is_some_and(|c| Weak::ptr_eq(&Arc::downgrade(c), &client));
            if !current || state.state != ConnectionState::Connected {
                return;
            }
            state.state = ConnectionState::Error;
            state.last_error = Some(message.clone());
            state.tools.clear();
            state.connected_at = None;
            state.client.take()
        };

        warn!("{}", message);
        if let Some(stale) = stale {
            if let Err(e) = stale.disconnect().await {
                debug!("Error closing MCP server '{}': {}", endpoint.name, e);
            }
        }

        emit(
            &event_tx,
            McpEvent::ServerStatusChanged {
                server: endpoint.name.clone(),
                state: ConnectionState::Error,
                error: Some(message),
            },
        )
        .await;
    });
}
