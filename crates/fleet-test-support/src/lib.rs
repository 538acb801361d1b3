// fleet-test-support: a mock upstream ledger node used by `fleet-core`'s and
// `services/fleet-monitor`'s integration tests.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockLedgerClient;
pub use mock_ws_server::{ConnectionHandle, MockLedgerNode, ReceivedSubscribeCommand};

use serde_json::{json, Value};

/// A canned `serverStatus` frame, as a stock server would push on the
/// `server` stream.
pub fn server_status_frame(status: &str, ledger_index: i64) -> Value {
    json!({
        "type": "serverStatus",
        "server_status": status,
        "pubkey_node": "n9Labc12345def",
        "ledger_index": ledger_index,
    })
}

/// A canned `serverStatus` frame wrapped in the `result` shape some upstream
/// nodes use instead of a bare `type` discriminant.
pub fn server_status_result_frame(status: &str) -> Value {
    json!({"result": {"server_status": status}})
}

/// A canned `ledgerClosed` frame.
pub fn ledger_closed_frame(ledger_index: i64, ledger_hash: &str) -> Value {
    json!({
        "type": "ledgerClosed",
        "ledger_index": ledger_index,
        "ledger_hash": ledger_hash,
        "txn_count": 12,
    })
}

/// A canned `validationReceived` frame.
pub fn validation_frame(master_key: &str, signature: &str, ledger_index: i64) -> Value {
    json!({
        "type": "validationReceived",
        "master_key": master_key,
        "signature": signature,
        "ledger_index": ledger_index,
        "full": true,
    })
}
