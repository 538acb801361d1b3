// Black-box exercise of the full fleet-monitor wiring: load a TOML config,
// stand up the three components the way `main.rs` does, drive a mock
// upstream ledger node through a server-status change, and observe the
// rendered alert arrive at a captured webhook POST.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;

use fleet_core::{DispatcherConfig, NotificationQueue, ServerTable, TransportRegistry, ValidatorTable};
use fleet_monitor::{config, transports};
use fleet_test_support::{server_status_frame, MockLedgerNode};

/// Reads one HTTP/1.1 request off `listener`, returning its JSON body.
async fn capture_one_post_body(listener: TcpListener) -> serde_json::Value {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let (header_end, body_end) = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]);
        let content_length: usize = headers
            .lines()
            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_owned()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let body_start = header_end + 4;
        if buf.len() - body_start >= content_length {
            break (header_end, body_start + content_length);
        }
    };
    let body_bytes = &buf[header_end + 4..body_end];
    let parsed = serde_json::from_slice(body_bytes).unwrap();
    let _ = socket.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
    parsed
}

#[tokio::test]
async fn server_status_change_reaches_discord_webhook() {
    let mut node = MockLedgerNode::start().await.unwrap();
    let node_url = node.url();

    let webhook_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let webhook_addr = webhook_listener.local_addr().unwrap();
    let capture = tokio::spawn(capture_one_post_body(webhook_listener));

    let toml = format!(
        r#"
        [[servers]]
        url = "{node_url}"
        server_name = "node1"
        [servers.notifications.discord]
        notify_discord = true
        webhook_url = "http://{webhook_addr}/webhook"

        [send]
        discord = true

        ws_retry = 3600
        fork_check_freq = 3600
        console_refresh_time = 3600
        "#
    );
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    config_file.write_all(toml.as_bytes()).unwrap();
    let cfg = config::load_config_from_path(config_file.path()).unwrap();

    let server_table = Arc::new(RwLock::new(ServerTable::bootstrap(&cfg.servers)));
    let validator_table = Arc::new(RwLock::new(ValidatorTable::bootstrap(&cfg.validators)));
    let notification_queue = Arc::new(NotificationQueue::new(cfg.notification_queue_capacity));
    let (message_tx, message_rx) = mpsc::channel(cfg.message_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut registry = TransportRegistry::new();
    registry.register("discord", transports::discord_transport(reqwest::Client::new()));

    let supervisor_handle = tokio::spawn(fleet_core::supervisor::run(
        cfg.servers.clone(),
        false,
        server_table.clone(),
        message_tx,
        fleet_core::SupervisorConfig {
            ws_retry: cfg.ws_retry,
            max_connect_attempts: cfg.max_connect_attempts,
            max_val_streams: cfg.max_val_streams,
        },
        shutdown_rx.clone(),
    ));
    let processor_handle = tokio::spawn(fleet_core::processor::run(
        fleet_core::ProcessorConfig {
            fork_check_freq: cfg.fork_check_freq,
            ll_fork_cutoff: cfg.ll_fork_cutoff,
            processed_val_max: cfg.processed_val_max,
            remove_dup_validators: cfg.remove_dup_validators,
            console_out: false,
            console_refresh_time: cfg.console_refresh_time,
            admin_heartbeat: false,
            heartbeat_interval: cfg.heartbeat_interval,
            admin_notifications: Vec::new(),
            log_these_validations: Default::default(),
        },
        server_table.clone(),
        validator_table,
        message_rx,
        notification_queue.clone(),
        None,
        shutdown_rx.clone(),
    ));
    let dispatcher_handle = tokio::spawn(fleet_core::dispatcher::run(
        DispatcherConfig {
            known_notifications: cfg.known_notifications.clone(),
            send_enabled: cfg.send_enabled.clone(),
        },
        registry,
        notification_queue,
        shutdown_rx.clone(),
    ));

    let conn = timeout(Duration::from_secs(5), node.accept()).await.unwrap();
    // First update only establishes a baseline status -- no prior value to diff against.
    conn.push_json(server_status_frame("full", 100));
    // Second update changes state, which is what should trigger the alert.
    conn.push_json(serde_json::json!({"type": "serverStatus", "server_status": "connected"}));

    let body = timeout(Duration::from_secs(5), capture).await.unwrap().unwrap();
    let message = body["content"].as_str().unwrap();
    assert!(message.contains("State changed for server: 'node1'"));
    assert!(message.contains("From: 'full'. To: 'connected'"));

    let _ = shutdown_tx.send(true);
    supervisor_handle.await.unwrap();
    processor_handle.await.unwrap().unwrap();
    dispatcher_handle.await.unwrap();
}
