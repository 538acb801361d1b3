//! Connection Supervisor: keeps one subscription alive per configured
//! server, surfaces drops to the processor as synthetic events, and
//! reconnects with a bounded retry counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use ledger_protocol::SubscribeCommand;

use crate::model::{IngestEvent, ServerSpec, ServerTable, DISCONNECTED_STATUS};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid server URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialize subscription command: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("connection closed by peer")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub ws_retry: Duration,
    pub max_connect_attempts: u32,
    pub max_val_streams: usize,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run the supervisor until `shutdown` signals termination. Spawns one
/// worker task per server plus a minder task that sweeps every `ws_retry`
/// interval.
pub async fn run(
    servers: Vec<ServerSpec>,
    validators_configured: bool,
    server_table: Arc<RwLock<ServerTable>>,
    queue: mpsc::Sender<IngestEvent>,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let val_stream_count = Arc::new(AtomicUsize::new(0));

    struct Slot {
        spec: ServerSpec,
        retry_count: u32,
        handle: tokio::task::JoinHandle<()>,
    }

    let mut slots: Vec<Slot> = Vec::with_capacity(servers.len());
    for spec in servers {
        let handle = spawn_worker(
            spec.clone(),
            validators_configured,
            val_stream_count.clone(),
            config.max_val_streams,
            queue.clone(),
            shutdown.clone(),
        );
        slots.push(Slot {
            spec,
            retry_count: 0,
            handle,
        });
    }

    let mut ticker = tokio::time::interval(config.ws_retry);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                for slot in &mut slots {
                    if !slot.handle.is_finished() {
                        continue;
                    }
                    if slot.retry_count > config.max_connect_attempts {
                        continue;
                    }

                    warn!(
                        server_name = %slot.spec.server_name,
                        retry_count = slot.retry_count,
                        "ws connection dropped, attempting reconnect"
                    );

                    let disconnect = IngestEvent {
                        source_url: slot.spec.url.clone(),
                        payload: serde_json::json!({"result": {"server_status": DISCONNECTED_STATUS}}),
                    };
                    if queue.send(disconnect).await.is_err() {
                        continue;
                    }

                    slot.retry_count += 1;
                    if let Some(record) = server_table.write().await.get_mut(&slot.spec.url) {
                        record.retry_count = slot.retry_count;
                    }

                    if slot.retry_count > config.max_connect_attempts {
                        error!(
                            server_name = %slot.spec.server_name,
                            retry_count = slot.retry_count,
                            "exceeded max connect attempts, leaving server disconnected"
                        );
                        continue;
                    }

                    slot.handle = spawn_worker(
                        slot.spec.clone(),
                        validators_configured,
                        val_stream_count.clone(),
                        config.max_val_streams,
                        queue.clone(),
                        shutdown.clone(),
                    );
                }
            }
        }
    }

    for slot in slots {
        slot.handle.abort();
    }
}

fn spawn_worker(
    spec: ServerSpec,
    validators_configured: bool,
    val_stream_count: Arc<AtomicUsize>,
    max_val_streams: usize,
    queue: mpsc::Sender<IngestEvent>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let command = subscribe_command(validators_configured, &val_stream_count, max_val_streams);
        if let Err(e) = connect_and_stream(&spec, command, &queue, shutdown).await {
            info!(server_name = %spec.server_name, error = %e, "connection worker terminated");
        }
    })
}

/// §4.1 step 2: baseline streams plus `validations` when validators are
/// configured and the global subscription count has room.
fn subscribe_command(
    validators_configured: bool,
    val_stream_count: &AtomicUsize,
    max_val_streams: usize,
) -> SubscribeCommand {
    if validators_configured {
        loop {
            let current = val_stream_count.load(Ordering::Acquire);
            if current >= max_val_streams {
                break;
            }
            if val_stream_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return SubscribeCommand::with_validations();
            }
        }
    }
    SubscribeCommand::baseline()
}

/// One connection attempt's lifetime: connect, subscribe, stream frames
/// onto `queue` until the transport errs, the peer closes, or `shutdown`
/// fires. Reconnection is the minder's responsibility, not this function's.
async fn connect_and_stream(
    spec: &ServerSpec,
    command: SubscribeCommand,
    queue: &mpsc::Sender<IngestEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    let request = spec
        .url
        .clone()
        .into_client_request()
        .map_err(|e| SupervisorError::InvalidUrl(spec.url.clone(), e.to_string()))?;
    let connector = build_connector(&spec.url, spec.ssl_verify);

    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector).await?;
    let (mut write, mut read) = ws.split();

    let command_json = serde_json::to_string(&command)?;
    write.send(Message::Text(command_json.into())).await?;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            frame = read.next() => {
                match frame {
                    None => return Err(SupervisorError::Disconnected),
                    Some(Err(e)) => return Err(SupervisorError::Connect(e)),
                    Some(Ok(Message::Close(_))) => return Err(SupervisorError::Disconnected),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(payload) => {
                                let event = IngestEvent {
                                    source_url: spec.url.clone(),
                                    payload,
                                };
                                if queue.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(source_url = %spec.url, error = %e, "failed to decode frame as JSON");
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Lexical scheme inference (§4.1 step 1): `wss:` is secure, `ws:` is
/// cleartext. When `ssl_verify` is false on a secure URL, certificate
/// validation is disabled; otherwise system defaults apply.
fn build_connector(url: &str, ssl_verify: bool) -> Option<Connector> {
    if ssl_verify || !url.starts_with("wss:") {
        return None;
    }

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
    Some(Connector::Rustls(Arc::new(config)))
}

/// Accepts any certificate. Used only when a server's `ssl_verify = false`.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_command_adds_validations_when_room() {
        let count = AtomicUsize::new(0);
        let cmd = subscribe_command(true, &count, 5);
        assert_eq!(cmd.streams, vec!["server", "ledger", "validations"]);
        assert_eq!(count.load(Ordering::Acquire), 1);
    }

    #[test]
    fn subscribe_command_omits_validations_when_cap_reached() {
        let count = AtomicUsize::new(5);
        let cmd = subscribe_command(true, &count, 5);
        assert_eq!(cmd.streams, vec!["server", "ledger"]);
    }

    #[test]
    fn subscribe_command_omits_validations_when_none_configured() {
        let count = AtomicUsize::new(0);
        let cmd = subscribe_command(false, &count, 5);
        assert_eq!(cmd.streams, vec!["server", "ledger"]);
        assert_eq!(count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn build_connector_is_default_for_ws_scheme() {
        assert!(build_connector("ws://example.com", false).is_none());
    }

    #[test]
    fn build_connector_is_default_when_verify_enabled() {
        assert!(build_connector("wss://example.com", true).is_none());
    }

    #[test]
    fn build_connector_disables_verification_for_insecure_wss() {
        assert!(build_connector("wss://example.com", false).is_some());
    }
}
