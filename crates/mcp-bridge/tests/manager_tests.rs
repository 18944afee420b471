//! Connection lifecycle of the MCP server manager against fake servers

mod common;

use common::{eventually, http_server, manager, stdio_server, FakeFactory, FakeServer};
use futures::future::join_all;
use mcp_bridge::{ConnectionState, McpError, McpEvent, TransportKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let factory = Arc::new(
        FakeFactory::default().with_server(
            "fs",
            FakeServer::new().with_connect_delay(Duration::from_millis(100)),
        ),
    );
    let manager = manager(vec![("fs", stdio_server())], factory.clone());

    let results = join_all((0..5).map(|_| manager.connect_endpoint("fs"))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(factory.server("fs").connects(), 1);
    assert_eq!(
        manager.get_endpoint_status("fs").unwrap().state,
        ConnectionState::Connected
    );

    // Already connected: no new attempt
    manager.connect_endpoint("fs").await.unwrap();
    assert_eq!(factory.server("fs").connects(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_records_error() {
    let factory = Arc::new(FakeFactory::default().with_server("down", FakeServer::new().failing()));
    let manager = manager(vec![("down", stdio_server())], factory.clone());

    let err = manager.connect_endpoint("down").await.unwrap_err();

    assert_eq!(err, McpError::Connection("refused #3".to_string()));
    assert_eq!(factory.server("down").connects(), 3);

    let status = manager.get_endpoint_status("down").unwrap();
    assert_eq!(status.state, ConnectionState::Error);
    assert_eq!(
        status.last_error.as_deref(),
        Some("Connection error: refused #3")
    );
    assert_eq!(status.tool_count, 0);
}

#[tokio::test]
async fn test_connect_all_collects_failures() {
    let factory = Arc::new(
        FakeFactory::default()
            .with_server("up", FakeServer::new())
            .with_server("down", FakeServer::new().failing()),
    );
    let manager = manager(
        vec![("up", stdio_server()), ("down", http_server())],
        factory,
    );

    let failures = manager.connect_all().await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "down");

    let status = manager.get_status();
    let names: Vec<&str> = status.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["down", "up"]);
    assert_eq!(status[0].state, ConnectionState::Error);
    assert_eq!(status[0].transport, TransportKind::StreamableHttp);
    assert_eq!(status[1].state, ConnectionState::Connected);
    assert_eq!(status[1].transport, TransportKind::Stdio);
    assert_eq!(status[1].tools, vec!["echo", "html", "fail"]);
    assert!(status[1].connected_at.is_some());
}

#[tokio::test]
async fn test_stdio_calls_run_one_at_a_time() {
    let factory = Arc::new(FakeFactory::default().with_server(
        "fs",
        FakeServer::new().with_call_delay(Duration::from_millis(50)),
    ));
    let manager = manager(vec![("fs", stdio_server())], factory.clone());
    manager.connect_endpoint("fs").await.unwrap();

    let calls = (0..4).map(|i| manager.call_tool("mcp_fs_echo", json!({ "i": i }), None));
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(factory.server("fs").max_active_calls(), 1);
}

#[tokio::test]
async fn test_http_calls_are_capped_at_four() {
    let factory = Arc::new(FakeFactory::default().with_server(
        "web",
        FakeServer::new().with_call_delay(Duration::from_millis(150)),
    ));
    let manager = manager(vec![("web", http_server())], factory.clone());
    manager.connect_endpoint("web").await.unwrap();

    let calls = (0..8).map(|i| manager.call_tool("mcp_web_echo", json!({ "i": i }), None));
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(factory.server("web").max_active_calls(), 4);
}

#[tokio::test]
async fn test_disconnect_fails_queued_callers() {
    let factory = Arc::new(FakeFactory::default().with_server(
        "fs",
        FakeServer::new().with_call_delay(Duration::from_millis(500)),
    ));
    let manager = Arc::new(manager(vec![("fs", stdio_server())], factory));
    manager.connect_endpoint("fs").await.unwrap();

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.call_tool("mcp_fs_echo", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.call_tool("mcp_fs_echo", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    manager.disconnect_endpoint("fs").await.unwrap();

    assert!(running.await.unwrap().is_err());
    assert!(matches!(
        queued.await.unwrap(),
        Err(McpError::NotConnected(name)) if name == "fs"
    ));

    let status = manager.get_endpoint_status("fs").unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.tool_count, 0);
    assert!(manager.get_cached_tools().is_empty());
}

#[tokio::test]
async fn test_cancelled_call_notifies_server() {
    let factory = Arc::new(FakeFactory::default().with_server(
        "fs",
        FakeServer::new().with_call_delay(Duration::from_millis(500)),
    ));
    let manager = manager(vec![("fs", stdio_server())], factory.clone());
    manager.connect_endpoint("fs").await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = manager.call_tool("mcp_fs_echo", json!({}), Some(&token)).await;

    assert!(matches!(result, Err(McpError::Cancelled(_))));
    assert!(eventually(|| !factory.server("fs").cancelled.lock().is_empty()).await);

    // The permit is released, so the next call goes through
    let token = CancellationToken::new();
    assert!(manager
        .call_tool("mcp_fs_html", json!({}), Some(&token))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_transport_closing_moves_endpoint_to_error() {
    let factory = Arc::new(FakeFactory::default().with_server("fs", FakeServer::new()));
    let manager = manager(vec![("fs", stdio_server())], factory.clone());
    manager.connect_endpoint("fs").await.unwrap();
    assert_eq!(manager.get_cached_tools().len(), 3);

    factory.server("fs").drop_connections();

    assert!(
        eventually(|| manager.get_endpoint_status("fs").unwrap().state == ConnectionState::Error)
            .await
    );
    let status = manager.get_endpoint_status("fs").unwrap();
    assert!(status
        .last_error
        .unwrap_or_default()
        .contains("closed unexpectedly"));
    assert!(manager.get_cached_tools().is_empty());

    // An explicit connect recovers from the error state
    manager.connect_endpoint("fs").await.unwrap();
    assert_eq!(factory.server("fs").connects(), 2);
    assert_eq!(manager.get_cached_tools().len(), 3);
}

#[tokio::test]
async fn test_restart_reconnects() {
    let factory = Arc::new(FakeFactory::default().with_server("fs", FakeServer::new()));
    let (tx, mut rx) = mpsc::channel(32);
    let manager = manager(vec![("fs", stdio_server())], factory.clone()).with_event_channel(tx);

    manager.connect_endpoint("fs").await.unwrap();
    manager.restart_endpoint("fs").await.unwrap();

    assert_eq!(factory.server("fs").connects(), 2);
    assert_eq!(
        manager.get_endpoint_status("fs").unwrap().state,
        ConnectionState::Connected
    );

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let McpEvent::ServerStatusChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_health_check_records_timestamp() {
    let factory = Arc::new(FakeFactory::default().with_server("fs", FakeServer::new()));
    let manager = manager(vec![("fs", stdio_server())], factory);

    assert_eq!(manager.health_check_all().await, vec![("fs".to_string(), false)]);
    assert!(manager
        .get_endpoint_status("fs")
        .unwrap()
        .last_health_check
        .is_none());

    manager.connect_endpoint("fs").await.unwrap();
    assert!(manager.health_check("fs").await.unwrap());
    assert!(manager
        .get_endpoint_status("fs")
        .unwrap()
        .last_health_check
        .is_some());
}

#[tokio::test]
async fn test_disconnect_all() {
    let factory = Arc::new(
        FakeFactory::default()
            .with_server("a", FakeServer::new())
            .with_server("b", FakeServer::new()),
    );
    let manager = manager(vec![("a", stdio_server()), ("b", http_server())], factory);
    assert!(manager.connect_all().await.is_empty());

    manager.disconnect_all().await;

    assert!(manager
        .get_status()
        .iter()
        .all(|s| s.state == ConnectionState::Disconnected && s.tools.is_empty()));
}

#[tokio::test]
async fn test_dropping_manager_releases_transport() {
    let factory = Arc::new(FakeFactory::default().with_server("fs", FakeServer::new()));
    let manager = manager(vec![("fs", stdio_server())], factory.clone());
    manager.connect_endpoint("fs").await.unwrap();
    assert_eq!(factory.server("fs").released(), 0);

    drop(manager);

    assert!(eventually(|| factory.server("fs").released() == 1).await);
}

#[tokio::test]
async fn test_disconnect_waits_for_running_attempt() {
    let factory = Arc::new(FakeFactory::default().with_server(
        "fs",
        FakeServer::new().with_connect_delay(Duration::from_millis(150)),
    ));
    let manager = Arc::new(manager(vec![("fs", stdio_server())], factory.clone()));

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect_endpoint("fs").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        manager.get_endpoint_status("fs").unwrap().state,
        ConnectionState::Connecting
    );

    manager.disconnect_endpoint("fs").await.unwrap();

    assert!(connecting.await.unwrap().is_ok());
    let status = manager.get_endpoint_status("fs").unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.tool_count, 0);
    assert!(manager.client("fs").is_none());
    assert_eq!(factory.server("fs").connects(), 1);
    assert!(eventually(|| factory.server("fs").released() == 1).await);
}
