// End-to-end exercises of the connection supervisor and response processor
// against a mock upstream ledger node, wired the same way `fleet-monitor`'s
// `main.rs` wires them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;

use fleet_core::{
    NotificationQueue, ProcessorConfig, ServerSpec, ServerTable, SupervisorConfig, ValidatorTable,
};
use fleet_test_support::{server_status_frame, MockLedgerNode};

fn server_spec(url: String) -> ServerSpec {
    ServerSpec {
        url,
        server_name: "test-node".to_owned(),
        ssl_verify: true,
        notifications: fleet_core::NotificationConfig::new(),
    }
}

fn processor_config() -> ProcessorConfig {
    ProcessorConfig {
        fork_check_freq: Duration::from_secs(3600),
        ll_fork_cutoff: 5,
        processed_val_max: 1000,
        remove_dup_validators: false,
        console_out: false,
        console_refresh_time: Duration::from_secs(3600),
        admin_heartbeat: false,
        heartbeat_interval: Duration::from_secs(3600),
        admin_notifications: Vec::new(),
        log_these_validations: Default::default(),
    }
}

#[tokio::test]
async fn server_status_frame_updates_server_table() {
    let mut node = MockLedgerNode::start().await.unwrap();
    let url = node.url();

    let server_table = Arc::new(RwLock::new(ServerTable::bootstrap(&[server_spec(url.clone())])));
    let validator_table = Arc::new(RwLock::new(ValidatorTable::bootstrap(&[])));
    let notification_queue = Arc::new(NotificationQueue::new(16));
    let (message_tx, message_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = tokio::spawn(fleet_core::supervisor::run(
        vec![server_spec(url)],
        false,
        server_table.clone(),
        message_tx,
        SupervisorConfig {
            ws_retry: Duration::from_secs(3600),
            max_connect_attempts: 10,
            max_val_streams: 5,
        },
        shutdown_rx.clone(),
    ));

    let processor_handle = tokio::spawn(fleet_core::processor::run(
        processor_config(),
        server_table.clone(),
        validator_table,
        message_rx,
        notification_queue,
        None,
        shutdown_rx.clone(),
    ));

    let conn = timeout(Duration::from_secs(5), node.accept()).await.unwrap();
    conn.push_json(server_status_frame("full", 1000));

    timeout(Duration::from_secs(5), async {
        loop {
            {
                let table = server_table.read().await;
                let record = table.iter().next().unwrap();
                if record.server_status.as_deref() == Some("full") && record.ledger_index == Some(1000) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let _ = shutdown_tx.send(true);
    supervisor_handle.await.unwrap();
    processor_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn dropped_connection_is_surfaced_as_disconnected_and_reconnects() {
    let mut node = MockLedgerNode::start().await.unwrap();
    let url = node.url();

    let server_table = Arc::new(RwLock::new(ServerTable::bootstrap(&[server_spec(url.clone())])));
    let validator_table = Arc::new(RwLock::new(ValidatorTable::bootstrap(&[])));
    let notification_queue = Arc::new(NotificationQueue::new(16));
    let (message_tx, message_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = tokio::spawn(fleet_core::supervisor::run(
        vec![server_spec(url)],
        false,
        server_table.clone(),
        message_tx,
        SupervisorConfig {
            ws_retry: Duration::from_millis(50),
            max_connect_attempts: 10,
            max_val_streams: 5,
        },
        shutdown_rx.clone(),
    ));

    let processor_handle = tokio::spawn(fleet_core::processor::run(
        processor_config(),
        server_table.clone(),
        validator_table,
        message_rx,
        notification_queue,
        None,
        shutdown_rx.clone(),
    ));

    let conn = timeout(Duration::from_secs(5), node.accept()).await.unwrap();
    conn.push_json(server_status_frame("full", 1));
    conn.drop_connection();

    timeout(Duration::from_secs(5), async {
        loop {
            {
                let table = server_table.read().await;
                let record = table.iter().next().unwrap();
                if record.server_status.as_deref() == Some(fleet_core::DISCONNECTED_STATUS) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Supervisor should attempt a fresh connection after the retry tick.
    let second_conn = timeout(Duration::from_secs(5), node.accept()).await.unwrap();
    second_conn.push_json(server_status_frame("full", 2));

    timeout(Duration::from_secs(5), async {
        loop {
            {
                let table = server_table.read().await;
                let record = table.iter().next().unwrap();
                if record.ledger_index == Some(2) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let _ = shutdown_tx.send(true);
    supervisor_handle.await.unwrap();
    processor_handle.await.unwrap().unwrap();
}

/// P9: a server whose retry_count has exceeded max_connect_attempts is never
/// reconnected again.
#[tokio::test]
async fn retry_count_beyond_cap_stops_reconnecting() {
    let mut node = MockLedgerNode::start().await.unwrap();
    let url = node.url();

    let server_table = Arc::new(RwLock::new(ServerTable::bootstrap(&[server_spec(url.clone())])));
    let (message_tx, message_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = tokio::spawn(fleet_core::supervisor::run(
        vec![server_spec(url)],
        false,
        server_table.clone(),
        message_tx,
        SupervisorConfig {
            ws_retry: Duration::from_millis(20),
            max_connect_attempts: 1,
            max_val_streams: 5,
        },
        shutdown_rx.clone(),
    ));

    // Drop the connection immediately each time the worker connects, so the
    // minder keeps hitting the retry path.
    for _ in 0..2 {
        let conn = timeout(Duration::from_secs(5), node.accept()).await.unwrap();
        conn.drop_connection();
    }

    // Give the minder several more ticks' worth of time; no further
    // connection should arrive once retry_count exceeds the cap.
    let extra_connect = timeout(Duration::from_millis(300), node.accept()).await;
    assert!(extra_connect.is_err(), "supervisor reconnected past max_connect_attempts");

    {
        let table = server_table.read().await;
        let record = table.iter().next().unwrap();
        assert!(record.retry_count > 1);
    }

    let _ = shutdown_tx.send(true);
    supervisor_handle.await.unwrap();
    drop(message_rx);
}
