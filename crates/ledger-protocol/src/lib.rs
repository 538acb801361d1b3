// ledger-protocol: wire types for the streaming ledger subscription protocol.
//
// Incoming frames are JSON objects; recognized shapes are identified by a
// `type` field or by the presence of a `result` object. We do not model the
// full message grammar -- only the fields the monitoring pipeline consumes.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Outbound: subscription command
// ---------------------------------------------------------------------------

/// The JSON object sent immediately after connecting to a monitored server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeCommand {
    pub command: &'static str,
    pub streams: Vec<String>,
    pub ledger_index: &'static str,
}

impl SubscribeCommand {
    /// `{"command":"subscribe","streams":["server","ledger"],"ledger_index":"current"}`
    pub fn baseline() -> Self {
        SubscribeCommand {
            command: "subscribe",
            streams: vec!["server".to_owned(), "ledger".to_owned()],
            ledger_index: "current",
        }
    }

    /// Baseline plus the `validations` stream, when the caller has room under
    /// `MAX_VAL_STREAMS`.
    pub fn with_validations() -> Self {
        let mut cmd = Self::baseline();
        cmd.streams.push("validations".to_owned());
        cmd
    }
}

// ---------------------------------------------------------------------------
// Inbound: classification
// ---------------------------------------------------------------------------

/// The class a decoded frame falls into, per §4.2 of the monitoring spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    ServerStatus,
    LedgerClosed,
    Validation,
    Unknown,
}

/// Classify a decoded JSON payload by its `type` field, falling back to
/// "server status" when a bare `result` object is present instead.
pub fn classify(payload: &serde_json::Value) -> MessageClass {
    match payload.get("type").and_then(serde_json::Value::as_str) {
        Some("serverStatus") => return MessageClass::ServerStatus,
        Some("ledgerClosed") => return MessageClass::LedgerClosed,
        Some("validationReceived") => return MessageClass::Validation,
        _ => {}
    }
    if payload.get("result").is_some() {
        return MessageClass::ServerStatus;
    }
    MessageClass::Unknown
}

/// Return the sub-object server-status fields should be read from: `result`
/// when present, otherwise the payload itself.
pub fn server_status_body(payload: &serde_json::Value) -> &serde_json::Value {
    payload.get("result").unwrap_or(payload)
}

// ---------------------------------------------------------------------------
// Inbound: recognized field sets
// ---------------------------------------------------------------------------

/// Fields recognized from a server-status update (§3 ServerRecord: last
/// observed server state + economics + ledger). Every field is optional --
/// only fields present in the incoming message are copied into the record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerStatusFields {
    pub server_status: Option<String>,
    pub pubkey_node: Option<String>,
    pub hostid: Option<String>,
    pub server_version: Option<String>,
    pub fee_base: Option<i64>,
    pub fee_ref: Option<i64>,
    pub load_base: Option<i64>,
    pub reserve_base: Option<i64>,
    pub reserve_inc: Option<i64>,
    pub load_factor: Option<f64>,
    pub load_factor_server: Option<f64>,
    pub load_factor_fee_reference: Option<f64>,
    pub ledger_index: Option<i64>,
    pub ledger_hash: Option<String>,
    pub ledger_time: Option<i64>,
    pub validated_ledgers: Option<String>,
    pub txn_count: Option<i64>,
}

/// Fields recognized from a `ledgerClosed` message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LedgerClosedFields {
    pub ledger_index: Option<i64>,
    pub ledger_hash: Option<String>,
    pub ledger_time: Option<i64>,
    pub txn_count: Option<i64>,
    pub validated_ledgers: Option<String>,
}

/// Fields recognized from a `validationReceived` message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ValidationFields {
    pub master_key: Option<String>,
    pub validation_public_key: Option<String>,
    pub cookie: Option<i64>,
    pub server_version: Option<String>,
    pub base_fee: Option<i64>,
    pub reserve_base: Option<i64>,
    pub reserve_inc: Option<i64>,
    pub full: Option<bool>,
    pub ledger_hash: Option<String>,
    pub validated_hash: Option<String>,
    pub ledger_index: Option<i64>,
    pub signature: Option<String>,
    pub signing_time: Option<i64>,
    pub load_fee: Option<i64>,
    #[serde(default)]
    pub amendments: Option<Vec<String>>,
}

/// A flag ledger is one whose index satisfies `(index + 1) mod 256 == 0`, at
/// which amendment voting is signalled.
pub fn is_flag_ledger(ledger_index: i64) -> bool {
    (ledger_index + 1).rem_euclid(256) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn baseline_command_omits_validations() {
        let cmd = SubscribeCommand::baseline();
        assert_eq!(cmd.streams, vec!["server", "ledger"]);
    }

    #[test]
    fn with_validations_appends_stream() {
        let cmd = SubscribeCommand::with_validations();
        assert_eq!(cmd.streams, vec!["server", "ledger", "validations"]);
    }

    #[test]
    fn classify_by_type_field() {
        assert_eq!(
            classify(&json!({"type": "ledgerClosed"})),
            MessageClass::LedgerClosed
        );
        assert_eq!(
            classify(&json!({"type": "validationReceived"})),
            MessageClass::Validation
        );
        assert_eq!(classify(&json!({"foo": "bar"})), MessageClass::Unknown);
    }

    #[test]
    fn classify_by_bare_result() {
        assert_eq!(
            classify(&json!({"result": {"server_status": "full"}})),
            MessageClass::ServerStatus
        );
    }

    #[test]
    fn server_status_body_prefers_result() {
        let payload = json!({"result": {"server_status": "full"}});
        let body = server_status_body(&payload);
        assert_eq!(body["server_status"], "full");
    }

    #[test]
    fn server_status_body_falls_back_to_payload() {
        let payload = json!({"server_status": "full"});
        let body = server_status_body(&payload);
        assert_eq!(body["server_status"], "full");
    }

    #[test]
    fn flag_ledger_boundary() {
        assert!(is_flag_ledger(255));
        assert!(is_flag_ledger(511));
        assert!(!is_flag_ledger(256));
        assert!(!is_flag_ledger(0));
    }

    #[test]
    fn validation_fields_parse_partial_payload() {
        let payload = json!({
            "master_key": "nHU...",
            "signature": "abc123",
            "ledger_index": 1000,
            "full": true,
        });
        let fields: ValidationFields = serde_json::from_value(payload).unwrap();
        assert_eq!(fields.master_key.as_deref(), Some("nHU..."));
        assert_eq!(fields.signature.as_deref(), Some("abc123"));
        assert_eq!(fields.ledger_index, Some(1000));
        assert_eq!(fields.full, Some(true));
        assert!(fields.amendments.is_none());
    }
}
