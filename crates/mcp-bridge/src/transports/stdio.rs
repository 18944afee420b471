use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Inbox;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;

/// Newline-delimited JSON-RPC over a child process's stdin/stdout
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    inbox: Inbox,
}

impl StdioTransport {
    pub fn new(
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    ) -> Self {
        Self {
            command,
            args,
            env,
            cwd,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            inbox: Inbox::new(),
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        info!(
            "Starting MCP server process: {} {:?}",
            self.command, self.args
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        if !self.env.is_empty() {
            cmd.envs(&self.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn MCP server process: {}", e);
            McpError::Transport(format!("Failed to spawn process '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[MCP server stderr] {}", line);
                }
            });
        }

        self.inbox.drain().await;
        let tx = self.inbox.sender();
        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        debug!("Received: {}", line);
                        if tx.send(line.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("MCP server stdout closed (EOF)");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read MCP server stdout: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }
        self.connected.store(true, Ordering::SeqCst);

        info!("MCP server process started successfully");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting MCP server process");

        self.connected.store(false, Ordering::SeqCst);

        // Dropping stdin signals EOF to the server
        self.stdin.lock().await.take();

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(tokio::time::Duration::from_secs(5), child.wait()).await {
                Ok(Ok(_)) => {
                    info!("MCP server process exited gracefully");
                }
                _ => {
                    warn!("MCP server process did not exit gracefully, killing");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill MCP server process: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Disconnected)?;

        let message_with_newline = format!("{}\n", message);
        stdin
            .write_all(message_with_newline.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("Failed to write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to flush: {}", e)))?;

        debug!("Sent: {}", message);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<String>> {
        self.inbox.receive().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
