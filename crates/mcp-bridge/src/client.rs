use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EndpointSettings, McpServerConfig};
use crate::error::{McpError, Result};
use crate::protocol::McpProtocolClient;
use crate::transports::{select_transport, TransportFactory, TransportKind};
use crate::types::{McpCallResult, McpTool};

/// Live session with one server
struct Session {
    protocol: Arc<McpProtocolClient>,
    kind: TransportKind,
    limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

/// Client for a single MCP server.
///
/// Owns at most one transport session at a time and bounds concurrent
/// `call_tool` requests by transport kind. Queued callers are admitted in
/// FIFO order; a disconnect fails them with [`McpError::NotConnected`].
pub struct McpClient {
    name: String,
    config: McpServerConfig,
    settings: EndpointSettings,
    factory: Arc<dyn TransportFactory>,
    session: parking_lot::Mutex<Option<Session>>,
    connect_gate: tokio::sync::Mutex<()>,
}

/// Decrements the in-flight counter when a call finishes, however it finishes
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl McpClient {
    pub fn new(
        name: impl Into<String>,
        config: McpServerConfig,
        settings: EndpointSettings,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            settings,
            factory,
            session: parking_lot::Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> EndpointSettings {
        self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Transport of the live session, if any
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.session.lock().as_ref().map(|s| s.kind)
    }

    /// Calls currently holding a permit
    pub fn in_flight_calls(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |s| s.in_flight.load(Ordering::SeqCst))
    }

    /// Cancelled when the live session's transport goes away
    pub fn closed_token(&self) -> Option<CancellationToken> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.protocol.closed_token())
    }

    fn protocol(&self) -> Result<Arc<McpProtocolClient>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.protocol.clone())
            .ok_or_else(|| McpError::NotConnected(self.name.clone()))
    }

    /// Open a session unless one is live. Concurrent callers are serialized
    /// and all but the first find the session already installed.
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let kind = select_transport(&self.config);
        let transport = self.factory.create(&self.name, &self.config, kind)?;
        let protocol = McpProtocolClient::new(transport);

        protocol.connect().await?;

        let init_result = match protocol.initialize(self.settings.call_timeout_ms).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(close_err) = protocol.disconnect().await {
                    debug!(
                        "Error closing MCP server '{}' after failed handshake: {}",
                        self.name, close_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            "MCP server '{}' initialized over {}: {} v{}",
            self.name, kind, init_result.server_info.name, init_result.server_info.version
        );

        *self.session.lock() = Some(Session {
            protocol: Arc::new(protocol),
            kind,
            limiter: Arc::new(Semaphore::new(kind.max_concurrent_calls())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });

        Ok(())
    }

    /// Tear down the session. Always leaves the client disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().take();

        let Some(session) = session else {
            return Ok(());
        };

        session.limiter.close();

        info!("Disconnecting MCP server '{}'", self.name);
        session.protocol.disconnect().await
    }

    /// Ping the server; any failure counts as unhealthy
    pub async fn health_check(&self) -> bool {
        let Ok(protocol) = self.protocol() else {
            return false;
        };

        match protocol.ping(self.settings.call_timeout_ms).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check failed for MCP server '{}': {}", self.name, e);
                false
            }
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let protocol = self.protocol()?;
        protocol
            .list_tools(&self.name, self.settings.call_timeout_ms)
            .await
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<McpCallResult> {
        let (protocol, limiter, in_flight) = {
            let session = self.session.lock();
            let session = session
                .as_ref()
                .ok_or_else(|| McpError::NotConnected(self.name.clone()))?;
            (
                session.protocol.clone(),
                session.limiter.clone(),
                session.in_flight.clone(),
            )
        };

        let _permit = limiter
            .acquire_owned()
            .await
            .map_err(|_| McpError::NotConnected(self.name.clone()))?;

        in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(in_flight);

        debug!("Calling tool '{}' on MCP server '{}'", tool_name, self.name);
        protocol
            .call_tool(tool_name, args, self.settings.call_timeout_ms, cancel)
            .await
    }
}
