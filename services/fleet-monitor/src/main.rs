// fleet-monitor: supervises connections to a fleet of ledger nodes, ingests
// their status/ledger/validation streams, detects forks, and dispatches
// alerts to whatever transports a recipient has opted into.

use std::env;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_core::{
    ConsoleRenderer, DispatcherConfig, NotificationQueue, ProcessorConfig, ServerTable,
    SupervisorConfig, TransportRegistry, ValidatorTable,
};
use fleet_monitor::config::{self, FleetConfig};
use fleet_monitor::transports;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fleet-monitor starting");

    let config_path = env::var("FLEET_MONITOR_CONFIG").unwrap_or_else(|_| "/etc/fleet-monitor/config.toml".to_owned());
    let cfg = match config::load_config_from_path(std::path::Path::new(&config_path)) {
        Ok(cfg) => {
            info!(
                servers = cfg.servers.len(),
                validators = cfg.validators.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let server_table = Arc::new(RwLock::new(ServerTable::bootstrap(&cfg.servers)));
    let validator_table = Arc::new(RwLock::new(ValidatorTable::bootstrap(&cfg.validators)));
    let notification_queue = Arc::new(NotificationQueue::new(cfg.notification_queue_capacity));
    let (message_tx, message_rx) = mpsc::channel(cfg.message_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = build_transport_registry(&cfg);
    let console_renderer: Option<Arc<dyn ConsoleRenderer>> = if cfg.console_out {
        Some(Arc::new(StdoutConsoleRenderer {
            print_amendments: cfg.print_amendments,
        }))
    } else {
        None
    };

    let supervisor_config = SupervisorConfig {
        ws_retry: cfg.ws_retry,
        max_connect_attempts: cfg.max_connect_attempts,
        max_val_streams: cfg.max_val_streams,
    };
    let processor_config = ProcessorConfig {
        fork_check_freq: cfg.fork_check_freq,
        ll_fork_cutoff: cfg.ll_fork_cutoff,
        processed_val_max: cfg.processed_val_max,
        remove_dup_validators: cfg.remove_dup_validators,
        console_out: cfg.console_out,
        console_refresh_time: cfg.console_refresh_time,
        admin_heartbeat: cfg.admin_heartbeat,
        heartbeat_interval: cfg.heartbeat_interval,
        admin_notifications: cfg.admin_notifications.clone(),
        log_these_validations: cfg.log_these_validations.iter().cloned().collect(),
    };
    let dispatcher_config = DispatcherConfig {
        known_notifications: cfg.known_notifications.clone(),
        send_enabled: cfg.send_enabled.clone(),
    };

    let validators_configured = !cfg.validators.is_empty();

    let supervisor_handle = tokio::spawn(fleet_core::supervisor::run(
        cfg.servers.clone(),
        validators_configured,
        server_table.clone(),
        message_tx,
        supervisor_config,
        shutdown_rx.clone(),
    ));

    let processor_handle = tokio::spawn(fleet_core::processor::run(
        processor_config,
        server_table.clone(),
        validator_table.clone(),
        message_rx,
        notification_queue.clone(),
        console_renderer,
        shutdown_rx.clone(),
    ));

    let dispatcher_handle = tokio::spawn(fleet_core::dispatcher::run(
        dispatcher_config,
        registry,
        notification_queue.clone(),
        shutdown_rx.clone(),
    ));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let (supervisor_result, processor_result, dispatcher_result) =
        tokio::join!(supervisor_handle, processor_handle, dispatcher_handle);

    if let Err(e) = supervisor_result {
        error!(error = %e, "connection supervisor task panicked");
    }
    match processor_result {
        Ok(Err(e)) => error!(error = %e, "response processor exited with error"),
        Err(e) => error!(error = %e, "response processor task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = dispatcher_result {
        error!(error = %e, "notification dispatcher task panicked");
    }

    info!("fleet-monitor shut down gracefully");
}

fn build_transport_registry(cfg: &FleetConfig) -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    let http_client = reqwest::Client::new();

    registry.register("discord", transports::discord_transport(http_client.clone()));
    registry.register("mattermost", transports::mattermost_transport(http_client.clone()));
    registry.register("slack", transports::slack_transport(http_client.clone()));

    let twilio_from = env::var("TWILIO_FROM_NUMBER").unwrap_or_default();
    registry.register(
        "twilio",
        transports::twilio_transport(http_client.clone(), cfg.transports.twilio.clone(), twilio_from),
    );

    let smtp_from = env::var("SMTP_FROM_ADDRESS").unwrap_or_default();
    registry.register("smtp", transports::smtp_transport(cfg.transports.smtp.clone(), smtp_from));

    registry
}

struct StdoutConsoleRenderer {
    print_amendments: bool,
}

impl ConsoleRenderer for StdoutConsoleRenderer {
    fn render(&self, servers: &ServerTable, validators: &ValidatorTable) {
        println!("--- fleet status ---");
        for server in servers.iter() {
            println!(
                "{:<30} status={:<24} ledger={}",
                server.server_name,
                server.server_status.as_deref().unwrap_or("unknown"),
                server.ledger_index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_owned()),
            );
        }
        for validator in validators.iter() {
            println!(
                "{:<30} ledger={}",
                validator.server_name,
                validator.ledger_index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_owned()),
            );
            if self.print_amendments {
                if let Some(amendments) = &validator.amendments {
                    println!("  amendments: {}", amendments.join(", "));
                }
            }
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
