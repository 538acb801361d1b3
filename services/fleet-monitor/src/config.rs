//! Fleet-monitor configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides except
//! for transport credentials, which may be sourced from the environment
//! when the configured value is empty (spec §6).
//!
//! A `Raw*` deserialization layer keeps every field `Option<T>`; this module
//! validates and defaults it into a plain config struct with no `Option`
//! fields the rest of the program has to keep re-checking.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use fleet_core::{NotificationConfig, ServerSpec, ValidatorSpec};

// ---------------------------------------------------------------------------
// Validated config (no Options)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub servers: Vec<ServerSpec>,
    pub validators: Vec<ValidatorSpec>,

    pub ws_retry: Duration,
    pub max_connect_attempts: u32,
    pub max_val_streams: usize,

    pub processed_val_max: usize,
    pub remove_dup_validators: bool,
    pub fork_check_freq: Duration,
    pub ll_fork_cutoff: i64,

    pub console_out: bool,
    pub console_refresh_time: Duration,
    pub print_amendments: bool,

    pub admin_heartbeat: bool,
    pub heartbeat_interval: Duration,
    pub admin_notifications: Vec<NotificationConfig>,

    pub known_notifications: Vec<String>,
    pub send_enabled: HashMap<String, bool>,
    pub log_these_validations: Vec<String>,

    pub transports: TransportsConfig,

    pub message_queue_capacity: usize,
    pub notification_queue_capacity: usize,

    pub log_level: String,
}

/// Global, process-wide transport credentials (distinct from a recipient's
/// per-tag settings such as a webhook URL). Sourced from the environment
/// when the TOML value is empty.
#[derive(Debug, Clone, Default)]
pub struct TransportsConfig {
    pub smtp: SmtpTransportConfig,
    pub twilio: TwilioTransportConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SmtpTransportConfig {
    pub server: String,
    pub submission_port: u16,
    pub start_tls: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct TwilioTransportConfig {
    pub account_sid: String,
    pub auth_token: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    ws_retry: Option<u64>,
    max_connect_attempts: Option<u32>,
    max_val_streams: Option<usize>,
    processed_val_max: Option<usize>,
    remove_dup_validators: Option<bool>,
    fork_check_freq: Option<u64>,
    ll_fork_cutoff: Option<i64>,
    console_out: Option<bool>,
    console_refresh_time: Option<u64>,
    print_amendments: Option<bool>,
    admin_heartbeat: Option<bool>,
    heartbeat_interval: Option<u64>,
    known_notifications: Option<Vec<String>>,
    send: Option<HashMap<String, bool>>,
    log_these_validations: Option<Vec<String>>,
    log_level: Option<String>,
    message_queue_capacity: Option<usize>,
    notification_queue_capacity: Option<usize>,
    admin_notifications: Option<HashMap<String, toml::Value>>,
    transports: Option<RawTransportsConfig>,
    servers: Option<Vec<RawServerConfig>>,
    validators: Option<Vec<RawValidatorConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTransportsConfig {
    smtp: Option<RawSmtpConfig>,
    twilio: Option<RawTwilioConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSmtpConfig {
    server: Option<String>,
    submission_port: Option<u16>,
    start_tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTwilioConfig {
    account_sid: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    url: String,
    server_name: Option<String>,
    ssl_verify: Option<bool>,
    notifications: Option<HashMap<String, toml::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawValidatorConfig {
    server_name: Option<String>,
    master_key: Option<String>,
    validation_public_key: Option<String>,
    notifications: Option<HashMap<String, toml::Value>>,
}

// ---------------------------------------------------------------------------
// Defaults (the knobs spec.md §6 names but does not pin a value for)
// ---------------------------------------------------------------------------

const DEFAULT_WS_RETRY_SECS: u64 = 30;
const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_VAL_STREAMS: usize = 5;
const DEFAULT_PROCESSED_VAL_MAX: usize = 10_000;
const DEFAULT_FORK_CHECK_FREQ_SECS: u64 = 60;
const DEFAULT_LL_FORK_CUTOFF: i64 = 5;
const DEFAULT_CONSOLE_REFRESH_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MESSAGE_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<FleetConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<FleetConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/fleet-monitor/config.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<FleetConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_servers = raw.servers.unwrap_or_default();
    if raw_servers.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[servers]] entry is required".to_owned(),
        ));
    }
    let mut servers = Vec::with_capacity(raw_servers.len());
    let mut seen_urls = std::collections::HashSet::new();
    for (i, s) in raw_servers.into_iter().enumerate() {
        if s.url.is_empty() {
            return Err(ConfigError::MissingField(format!("servers[{i}].url")));
        }
        if !seen_urls.insert(s.url.clone()) {
            return Err(ConfigError::InvalidValue(format!("duplicate server url '{}' (I1)", s.url)));
        }
        servers.push(ServerSpec {
            server_name: s.server_name.unwrap_or_else(|| s.url.clone()),
            url: s.url,
            ssl_verify: s.ssl_verify.unwrap_or(true),
            notifications: convert_notifications(s.notifications)?,
        });
    }

    let mut validators = Vec::new();
    for v in raw.validators.unwrap_or_default() {
        if v.master_key.is_none() && v.validation_public_key.is_none() {
            return Err(ConfigError::InvalidValue(
                "each [[validators]] entry needs a master_key or validation_public_key".to_owned(),
            ));
        }
        validators.push(ValidatorSpec {
            server_name: v.server_name.unwrap_or_else(|| "unnamed validator".to_owned()),
            master_key: v.master_key,
            validation_public_key: v.validation_public_key,
            notifications: convert_notifications(v.notifications)?,
        });
    }

    let mut admin_notifications = Vec::new();
    for (_, settings) in raw.admin_notifications.unwrap_or_default() {
        admin_notifications.push(notification_config_from_toml(settings)?);
    }

    let transports = raw.transports.unwrap_or_default();
    let smtp = transports.smtp.unwrap_or_default();
    let twilio = transports.twilio.unwrap_or_default();

    Ok(FleetConfig {
        servers,
        validators,
        ws_retry: Duration::from_secs(raw.ws_retry.unwrap_or(DEFAULT_WS_RETRY_SECS)),
        max_connect_attempts: raw.max_connect_attempts.unwrap_or(DEFAULT_MAX_CONNECT_ATTEMPTS),
        max_val_streams: raw.max_val_streams.unwrap_or(DEFAULT_MAX_VAL_STREAMS),
        processed_val_max: raw.processed_val_max.unwrap_or(DEFAULT_PROCESSED_VAL_MAX),
        remove_dup_validators: raw.remove_dup_validators.unwrap_or(false),
        fork_check_freq: Duration::from_secs(raw.fork_check_freq.unwrap_or(DEFAULT_FORK_CHECK_FREQ_SECS)),
        ll_fork_cutoff: raw.ll_fork_cutoff.unwrap_or(DEFAULT_LL_FORK_CUTOFF),
        console_out: raw.console_out.unwrap_or(false),
        console_refresh_time: Duration::from_secs(raw.console_refresh_time.unwrap_or(DEFAULT_CONSOLE_REFRESH_SECS)),
        print_amendments: raw.print_amendments.unwrap_or(false),
        admin_heartbeat: raw.admin_heartbeat.unwrap_or(false),
        heartbeat_interval: Duration::from_secs(raw.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS)),
        admin_notifications,
        known_notifications: raw
            .known_notifications
            .unwrap_or_else(fleet_core::default_known_notifications),
        send_enabled: raw.send.unwrap_or_default(),
        log_these_validations: raw.log_these_validations.unwrap_or_default(),
        transports: TransportsConfig {
            smtp: SmtpTransportConfig {
                server: smtp.server.unwrap_or_default(),
                submission_port: smtp.submission_port.unwrap_or(587),
                start_tls: smtp.start_tls.unwrap_or(true),
                username: env_fallback(smtp.username.unwrap_or_default(), "SMTP_USERNAME"),
                password: env_fallback(smtp.password.unwrap_or_default(), "SMTP_PASSWORD"),
            },
            twilio: TwilioTransportConfig {
                account_sid: env_fallback(twilio.account_sid.unwrap_or_default(), "TWILIO_ACCOUNT_SID"),
                auth_token: env_fallback(twilio.auth_token.unwrap_or_default(), "TWILIO_AUTH_TOKEN"),
            },
        },
        message_queue_capacity: raw.message_queue_capacity.unwrap_or(DEFAULT_MESSAGE_QUEUE_CAPACITY),
        notification_queue_capacity: raw
            .notification_queue_capacity
            .unwrap_or(DEFAULT_NOTIFICATION_QUEUE_CAPACITY),
        log_level: raw.log_level.unwrap_or_else(|| "info".to_owned()),
    })
}

/// "transport-specific creds may be sourced from the environment when the
/// configured value is empty" (spec §6).
fn env_fallback(configured: String, env_var: &str) -> String {
    if !configured.is_empty() {
        return configured;
    }
    std::env::var(env_var).unwrap_or_default()
}

fn convert_notifications(
    raw: Option<HashMap<String, toml::Value>>,
) -> Result<NotificationConfig, ConfigError> {
    let mut config = NotificationConfig::new();
    for (tag, value) in raw.unwrap_or_default() {
        let json = serde_json::to_value(&value)
            .map_err(|e| ConfigError::Parse(format!("notifications.{tag}: {e}")))?;
        config.settings.insert(tag, json);
    }
    Ok(config)
}

fn notification_config_from_toml(settings: toml::Value) -> Result<NotificationConfig, ConfigError> {
    let table = settings
        .as_table()
        .ok_or_else(|| ConfigError::InvalidValue("admin_notifications entries must be tables".to_owned()))?;
    convert_notifications(Some(
        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[servers]]
        url = "wss://node1.example.com"
        server_name = "node1"
    "#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.max_connect_attempts, DEFAULT_MAX_CONNECT_ATTEMPTS);
        assert!(config.servers[0].ssl_verify);
        assert_eq!(config.known_notifications, fleet_core::default_known_notifications());
    }

    #[test]
    fn duplicate_server_url_rejected() {
        let toml = r#"
            [[servers]]
            url = "wss://a"
            [[servers]]
            url = "wss://a"
        "#;
        assert!(matches!(load_config_from_str(toml), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validator_without_either_key_rejected() {
        let toml = r#"
            [[servers]]
            url = "wss://a"
            [[validators]]
            server_name = "v1"
        "#;
        assert!(matches!(load_config_from_str(toml), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn recipient_notification_settings_round_trip() {
        let toml = r#"
            [[servers]]
            url = "wss://a"
            server_name = "a"
            [servers.notifications.discord]
            notify_discord = true
            webhook_url = "https://discord.example/webhooks/abc"
        "#;
        let config = load_config_from_str(toml).unwrap();
        let notifications = &config.servers[0].notifications;
        assert!(notifications.allows("discord"));
        assert_eq!(
            notifications.setting("discord", "webhook_url").and_then(|v| v.as_str()),
            Some("https://discord.example/webhooks/abc")
        );
    }

    #[test]
    fn empty_smtp_credential_falls_back_to_environment() {
        std::env::set_var("SMTP_USERNAME", "from-env");
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.transports.smtp.username, "from-env");
        std::env::remove_var("SMTP_USERNAME");
    }
}
