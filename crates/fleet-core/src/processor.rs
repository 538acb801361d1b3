//! Response Processor: the single mutator of the server and validator
//! tables. Classifies every ingest event, updates state, runs periodic fork
//! detection, and drives heartbeat and console-refresh cadence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use ledger_protocol::{
    classify, is_flag_ledger, server_status_body, LedgerClosedFields, MessageClass,
    ServerStatusFields, ValidationFields,
};

use crate::fork::fork_check;
use crate::model::{
    IngestEvent, Notification, NotificationQueue, ProcessedValidations, ServerTable,
    ValKeys, ValidatorSpec, ValidatorTable, DISCONNECTED_STATUS,
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("message queue closed")]
    QueueClosed,
}

/// Read-only rendering of current table state. The processor owns the
/// cadence; what happens with the snapshot (terminal rendering, etc.) is an
/// external collaborator.
pub trait ConsoleRenderer: Send + Sync {
    fn render(&self, servers: &ServerTable, validators: &ValidatorTable);
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub fork_check_freq: Duration,
    pub ll_fork_cutoff: i64,
    pub processed_val_max: usize,
    pub remove_dup_validators: bool,
    pub console_out: bool,
    pub console_refresh_time: Duration,
    pub admin_heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// Recipients notified on every heartbeat tick.
    pub admin_notifications: Vec<crate::model::NotificationConfig>,
    /// Validator `master_key`s whose full validation payload is logged at
    /// error level when received (§4.2.3 step 6).
    pub log_these_validations: HashSet<String>,
}

/// Runs until `shutdown` fires. `server_table` and `validator_table` are
/// shared for read-only access by other components (console renderer,
/// tests); this function is their sole writer, save for the supervisor's
/// narrow `retry_count` updates.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: ProcessorConfig,
    server_table: Arc<RwLock<ServerTable>>,
    validator_table: Arc<RwLock<ValidatorTable>>,
    mut message_queue: mpsc::Receiver<IngestEvent>,
    notification_queue: Arc<NotificationQueue>,
    console_renderer: Option<Arc<dyn ConsoleRenderer>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProcessorError> {
    let mut val_keys = ValKeys::bootstrap(&*validator_table.read().await);
    let mut processed = ProcessedValidations::new(config.processed_val_max);
    let mut last_modes: Vec<i64> = Vec::new();

    let mut fork_ticker = tokio::time::interval(config.fork_check_freq);
    fork_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut heartbeat_ticker = tokio::time::interval(config.heartbeat_interval);
    heartbeat_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut console_ticker = tokio::time::interval(config.console_refresh_time);
    console_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = message_queue.recv() => {
                match event {
                    None => break,
                    Some(event) => {
                        handle_event(
                            &config,
                            &server_table,
                            &validator_table,
                            &notification_queue,
                            &mut val_keys,
                            &mut processed,
                            event,
                        ).await;
                    }
                }
            }
            _ = fork_ticker.tick() => {
                let mut servers = server_table.write().await;
                let mut validators = validator_table.write().await;
                let result = fork_check(&mut servers, &mut validators, config.ll_fork_cutoff);
                if result.skipped_multimodal {
                    debug!(modes = ?result.modes, "fork check skipped: multimodal");
                } else {
                    last_modes = result.modes.clone();
                }
                drop(servers);
                drop(validators);
                for alert in result.alerts {
                    notification_queue.push(Notification {
                        message: alert.message,
                        recipient: alert.recipient,
                    });
                }
            }
            _ = heartbeat_ticker.tick(), if config.admin_heartbeat => {
                let mode_summary = match last_modes.as_slice() {
                    [] => "no data yet".to_owned(),
                    [single] => single.to_string(),
                    multiple => format!("ambiguous: {multiple:?}"),
                };
                let message = format!(
                    "Heartbeat: consensus mode '{}'. Time UTC: {}.",
                    mode_summary,
                    Utc::now().format("%m-%d %H:%M:%S"),
                );
                for recipient in &config.admin_notifications {
                    notification_queue.push(Notification {
                        message: message.clone(),
                        recipient: recipient.clone(),
                    });
                }
            }
            _ = console_ticker.tick(), if config.console_out => {
                if let Some(renderer) = &console_renderer {
                    let servers = server_table.read().await;
                    let validators = validator_table.read().await;
                    renderer.render(&servers, &validators);
                }
            }
        }
    }

    Ok(())
}

async fn handle_event(
    config: &ProcessorConfig,
    server_table: &Arc<RwLock<ServerTable>>,
    validator_table: &Arc<RwLock<ValidatorTable>>,
    notification_queue: &Arc<NotificationQueue>,
    val_keys: &mut ValKeys,
    processed: &mut ProcessedValidations,
    event: IngestEvent,
) {
    match classify(&event.payload) {
        MessageClass::ServerStatus => {
            handle_server_status(server_table, notification_queue, &event).await;
        }
        MessageClass::LedgerClosed => {
            handle_ledger_closed(server_table, &event).await;
        }
        MessageClass::Validation => {
            handle_validation(config, validator_table, val_keys, processed, &event).await;
        }
        MessageClass::Unknown => {
            warn!(source_url = %event.source_url, "unrecognized message shape, dropping");
        }
    }
}

/// §4.2.1.
async fn handle_server_status(
    server_table: &Arc<RwLock<ServerTable>>,
    notification_queue: &Arc<NotificationQueue>,
    event: &IngestEvent,
) {
    let body = server_status_body(&event.payload);
    let new: ServerStatusFields = match serde_json::from_value(body.clone()) {
        Ok(f) => f,
        Err(e) => {
            warn!(source_url = %event.source_url, error = %e, "malformed server status payload");
            return;
        }
    };

    let mut table = server_table.write().await;
    let Some(record) = table.get_mut(&event.source_url) else {
        warn!(source_url = %event.source_url, "server status for unconfigured server");
        return;
    };

    if let (Some(old), Some(new_status)) = (&record.server_status, &new.server_status) {
        if old != new_status {
            let message = format!(
                "State changed for server: '{}' with key '{}'. From: '{}'. To: '{}'. Time UTC: {}.",
                record.server_name,
                record.pubkey_node.as_deref().unwrap_or("").chars().take(5).collect::<String>(),
                old,
                new_status,
                Utc::now().format("%m-%d %H:%M:%S"),
            );
            notification_queue.push(Notification {
                message,
                recipient: record.notifications.clone(),
            });
        }
    }

    record.apply_server_status(&new);
}

/// §4.2.2.
async fn handle_ledger_closed(server_table: &Arc<RwLock<ServerTable>>, event: &IngestEvent) {
    let new: LedgerClosedFields = match serde_json::from_value(event.payload.clone()) {
        Ok(f) => f,
        Err(e) => {
            warn!(source_url = %event.source_url, error = %e, "malformed ledgerClosed payload");
            return;
        }
    };

    let mut table = server_table.write().await;
    let Some(record) = table.get_mut(&event.source_url) else {
        warn!(source_url = %event.source_url, "ledgerClosed for unconfigured server");
        return;
    };
    record.apply_ledger_closed(&new);
}

/// §4.2.3.
async fn handle_validation(
    config: &ProcessorConfig,
    validator_table: &Arc<RwLock<ValidatorTable>>,
    val_keys: &mut ValKeys,
    processed: &mut ProcessedValidations,
    event: &IngestEvent,
) {
    let new: ValidationFields = match serde_json::from_value(event.payload.clone()) {
        Ok(f) => f,
        Err(e) => {
            warn!(source_url = %event.source_url, error = %e, "malformed validationReceived payload");
            return;
        }
    };

    if !val_keys.contains_either(new.master_key.as_deref(), new.validation_public_key.as_deref()) {
        debug!(source_url = %event.source_url, "validation from unmonitored key, dropping");
        return;
    }

    if let Some(signature) = &new.signature {
        if processed.contains(signature) {
            debug!(source_url = %event.source_url, "duplicate validation, dropping");
            return;
        }
    }

    let mut table = validator_table.write().await;
    let Some(record) = table.find_mut(new.master_key.as_deref(), new.validation_public_key.as_deref()) else {
        warn!(source_url = %event.source_url, "validation matched a monitored key but no table row");
        return;
    };

    if let Some(idx) = new.ledger_index {
        if is_flag_ledger(idx) {
            record.reset_flag_ledger_fields();
        }
    }
    record.apply_validation(&new);

    let should_log = new
        .master_key
        .as_deref()
        .is_some_and(|k| config.log_these_validations.contains(k));
    if should_log {
        error!(payload = %event.payload, "received validation from watched key");
    }

    if let Some(signature) = new.signature {
        let pruned = processed.insert(signature);
        if pruned && config.remove_dup_validators {
            table.remove_duplicate_master_keys();
            val_keys.rebuild(&table);
        }
    }
}

/// §4.2.7.
pub fn bootstrap_validator_table(specs: &[ValidatorSpec]) -> ValidatorTable {
    ValidatorTable::bootstrap(specs)
}

pub fn is_disconnected(status: Option<&str>) -> bool {
    status == Some(DISCONNECTED_STATUS)
}
