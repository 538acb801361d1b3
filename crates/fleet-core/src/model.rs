//! Shared data model: the server and validator tables, the two bounded
//! queues, and the small bits of per-process bookkeeping (dedupe window,
//! validator key set) that sit alongside them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use ledger_protocol::{LedgerClosedFields, ServerStatusFields, ValidationFields};

/// Sentinel `server_status` value the supervisor injects on every connection
/// drop. This is the only path permitted to write this value.
pub const DISCONNECTED_STATUS: &str = "disconnected from monitoring";

// ---------------------------------------------------------------------------
// Per-recipient notification configuration
// ---------------------------------------------------------------------------

/// A recipient's per-transport settings: one JSON object per tag, holding
/// the `notify_<tag>` opt-in boolean plus whatever transport-specific
/// fields that transport needs (webhook URL, phone numbers, smtp
/// recipients, …). The core only ever reads the boolean; everything else
/// passes through untouched to the transport adapter that owns the tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    pub settings: HashMap<String, serde_json::Value>,
}

impl NotificationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for tests and simple configs: sets just the `notify_<tag>`
    /// flag, leaving any other settings for that tag untouched.
    pub fn allow(mut self, tag: impl Into<String>, enabled: bool) -> Self {
        let tag = tag.into();
        let key = format!("notify_{tag}");
        let entry = self
            .settings
            .entry(tag)
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let serde_json::Value::Object(map) = entry {
            map.insert(key, serde_json::Value::Bool(enabled));
        }
        self
    }

    /// `notify_<tag>` for this recipient, defaulting to `false` when unset.
    pub fn allows(&self, tag: &str) -> bool {
        self.settings
            .get(tag)
            .and_then(|v| v.get(format!("notify_{tag}")))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// A transport-specific setting for `tag`, e.g. `setting("discord",
    /// "webhook_url")`.
    pub fn setting(&self, tag: &str, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(tag).and_then(|v| v.get(key))
    }

    /// The full settings object for `tag`, if the recipient configured one.
    pub fn tag_settings(&self, tag: &str) -> Option<&serde_json::Value> {
        self.settings.get(tag)
    }
}

// ---------------------------------------------------------------------------
// Static configuration (fed in at startup, never mutated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub url: String,
    pub server_name: String,
    pub ssl_verify: bool,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct ValidatorSpec {
    pub server_name: String,
    pub master_key: Option<String>,
    pub validation_public_key: Option<String>,
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// ServerRecord
// ---------------------------------------------------------------------------

/// One row per configured upstream node. `retry_count` is the one field the
/// connection supervisor is permitted to write directly -- it is connection
/// state, not observed ledger state. Every other field is mutated only by
/// the response processor.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: u32,
    pub url: String,
    pub server_name: String,
    pub ssl_verify: bool,
    pub notifications: NotificationConfig,

    pub retry_count: u32,

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

    /// `None` = never evaluated by a fork-check pass. `Some(false/true)` once it has been.
    pub forked: Option<bool>,
    pub time_forked: Option<DateTime<Utc>>,
    pub time_updated: Option<DateTime<Utc>>,
}

impl ServerRecord {
    fn bootstrap(id: u32, spec: &ServerSpec) -> Self {
        ServerRecord {
            id,
            url: spec.url.clone(),
            server_name: spec.server_name.clone(),
            ssl_verify: spec.ssl_verify,
            notifications: spec.notifications.clone(),
            retry_count: 0,
            server_status: None,
            pubkey_node: None,
            hostid: None,
            server_version: None,
            fee_base: None,
            fee_ref: None,
            load_base: None,
            reserve_base: None,
            reserve_inc: None,
            load_factor: None,
            load_factor_server: None,
            load_factor_fee_reference: None,
            ledger_index: None,
            ledger_hash: None,
            ledger_time: None,
            validated_ledgers: None,
            txn_count: None,
            forked: None,
            time_forked: None,
            time_updated: None,
        }
    }

    /// Copy every field present in `new` over this record's corresponding
    /// field, leaving absent fields untouched (§4.2.1 / §4.2.2 "copy every
    /// recognized field present").
    pub fn apply_server_status(&mut self, new: &ServerStatusFields) {
        if let Some(v) = &new.server_status {
            self.server_status = Some(v.clone());
        }
        if let Some(v) = &new.pubkey_node {
            self.pubkey_node = Some(v.clone());
        }
        if let Some(v) = &new.hostid {
            self.hostid = Some(v.clone());
        }
        if let Some(v) = &new.server_version {
            self.server_version = Some(v.clone());
        }
        if new.fee_base.is_some() {
            self.fee_base = new.fee_base;
        }
        if new.fee_ref.is_some() {
            self.fee_ref = new.fee_ref;
        }
        if new.load_base.is_some() {
            self.load_base = new.load_base;
        }
        if new.reserve_base.is_some() {
            self.reserve_base = new.reserve_base;
        }
        if new.reserve_inc.is_some() {
            self.reserve_inc = new.reserve_inc;
        }
        if new.load_factor.is_some() {
            self.load_factor = new.load_factor;
        }
        if new.load_factor_server.is_some() {
            self.load_factor_server = new.load_factor_server;
        }
        if new.load_factor_fee_reference.is_some() {
            self.load_factor_fee_reference = new.load_factor_fee_reference;
        }
        if new.ledger_index.is_some() {
            self.ledger_index = new.ledger_index;
        }
        if let Some(v) = &new.ledger_hash {
            self.ledger_hash = Some(v.clone());
        }
        if new.ledger_time.is_some() {
            self.ledger_time = new.ledger_time;
        }
        if let Some(v) = &new.validated_ledgers {
            self.validated_ledgers = Some(v.clone());
        }
        if new.txn_count.is_some() {
            self.txn_count = new.txn_count;
        }
        self.time_updated = Some(Utc::now());
    }

    pub fn apply_ledger_closed(&mut self, new: &LedgerClosedFields) {
        if new.ledger_index.is_some() {
            self.ledger_index = new.ledger_index;
        }
        if let Some(v) = &new.ledger_hash {
            self.ledger_hash = Some(v.clone());
        }
        if new.ledger_time.is_some() {
            self.ledger_time = new.ledger_time;
        }
        if new.txn_count.is_some() {
            self.txn_count = new.txn_count;
        }
        if let Some(v) = &new.validated_ledgers {
            self.validated_ledgers = Some(v.clone());
        }
        self.time_updated = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// ValidatorRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidatorRecord {
    pub id: u32,
    pub server_name: String,
    pub master_key: Option<String>,
    pub validation_public_key: Option<String>,
    pub notifications: NotificationConfig,

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
    pub amendments: Option<Vec<String>>,

    pub forked: Option<bool>,
    pub time_forked: Option<DateTime<Utc>>,
    pub time_updated: Option<DateTime<Utc>>,
}

impl ValidatorRecord {
    fn bootstrap(id: u32, spec: &ValidatorSpec) -> Self {
        ValidatorRecord {
            id,
            server_name: spec.server_name.clone(),
            master_key: spec.master_key.clone(),
            validation_public_key: spec.validation_public_key.clone(),
            notifications: spec.notifications.clone(),
            cookie: None,
            server_version: None,
            base_fee: None,
            reserve_base: None,
            reserve_inc: None,
            full: None,
            ledger_hash: None,
            validated_hash: None,
            ledger_index: None,
            signature: None,
            signing_time: None,
            load_fee: None,
            amendments: None,
            forked: None,
            time_forked: None,
            time_updated: None,
        }
    }

    /// I3: match by *either* key equal to the incoming message's key.
    pub fn matches(&self, master_key: Option<&str>, validation_public_key: Option<&str>) -> bool {
        let master_match = match (self.master_key.as_deref(), master_key) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        let eph_match = match (self.validation_public_key.as_deref(), validation_public_key) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        master_match || eph_match
    }

    /// Flag-ledger reset (§4.2.3 step 2): null out fields that upstream may
    /// silently omit, so a dropped key doesn't leave stale data behind.
    pub fn reset_flag_ledger_fields(&mut self) {
        self.amendments = None;
        self.base_fee = None;
        self.load_fee = None;
        self.reserve_base = None;
        self.reserve_inc = None;
        self.server_version = None;
    }

    pub fn apply_validation(&mut self, new: &ValidationFields) {
        if let Some(v) = &new.master_key {
            self.master_key = Some(v.clone());
        }
        if let Some(v) = &new.validation_public_key {
            self.validation_public_key = Some(v.clone());
        }
        if new.cookie.is_some() {
            self.cookie = new.cookie;
        }
        if let Some(v) = &new.server_version {
            self.server_version = Some(v.clone());
        }
        if new.base_fee.is_some() {
            self.base_fee = new.base_fee;
        }
        if new.reserve_base.is_some() {
            self.reserve_base = new.reserve_base;
        }
        if new.reserve_inc.is_some() {
            self.reserve_inc = new.reserve_inc;
        }
        if new.full.is_some() {
            self.full = new.full;
        }
        if let Some(v) = &new.ledger_hash {
            self.ledger_hash = Some(v.clone());
        }
        if let Some(v) = &new.validated_hash {
            self.validated_hash = Some(v.clone());
        }
        if new.ledger_index.is_some() {
            self.ledger_index = new.ledger_index;
        }
        if let Some(v) = &new.signature {
            self.signature = Some(v.clone());
        }
        if new.signing_time.is_some() {
            self.signing_time = new.signing_time;
        }
        if new.load_fee.is_some() {
            self.load_fee = new.load_fee;
        }
        if let Some(v) = &new.amendments {
            self.amendments = Some(v.clone());
        }
        self.time_updated = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Keyed by `url` (I1: unique primary key).
#[derive(Debug, Default)]
pub struct ServerTable {
    records: HashMap<String, ServerRecord>,
    order: Vec<String>,
}

impl ServerTable {
    pub fn bootstrap(specs: &[ServerSpec]) -> Self {
        let mut records = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            records.insert(spec.url.clone(), ServerRecord::bootstrap(i as u32, spec));
            order.push(spec.url.clone());
        }
        ServerTable { records, order }
    }

    pub fn get(&self, url: &str) -> Option<&ServerRecord> {
        self.records.get(url)
    }

    pub fn get_mut(&mut self, url: &str) -> Option<&mut ServerRecord> {
        self.records.get_mut(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerRecord> {
        self.order.iter().filter_map(|u| self.records.get(u))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServerRecord> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// No single key field is guaranteed present (I3), so lookups are linear
/// scans over a small table rather than a hash index.
#[derive(Debug, Default)]
pub struct ValidatorTable {
    records: Vec<ValidatorRecord>,
}

impl ValidatorTable {
    pub fn bootstrap(specs: &[ValidatorSpec]) -> Self {
        let records = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| ValidatorRecord::bootstrap(i as u32, spec))
            .collect();
        ValidatorTable { records }
    }

    pub fn find_mut(
        &mut self,
        master_key: Option<&str>,
        validation_public_key: Option<&str>,
    ) -> Option<&mut ValidatorRecord> {
        self.records
            .iter_mut()
            .find(|r| r.matches(master_key, validation_public_key))
    }

    pub fn find(
        &self,
        master_key: Option<&str>,
        validation_public_key: Option<&str>,
    ) -> Option<&ValidatorRecord> {
        self.records
            .iter()
            .find(|r| r.matches(master_key, validation_public_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ValidatorRecord> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `REMOVE_DUP_VALIDATORS`: cull same-`master_key` duplicates, keeping
    /// the first occurrence. Entries with no `master_key` are never culled
    /// (nothing to compare them against).
    pub fn remove_duplicate_master_keys(&mut self) {
        let mut seen = HashSet::new();
        self.records.retain(|r| match &r.master_key {
            Some(k) => seen.insert(k.clone()),
            None => true,
        });
    }
}

// ---------------------------------------------------------------------------
// ValKeys
// ---------------------------------------------------------------------------

/// The currently monitored set of validator master and ephemeral keys.
#[derive(Debug, Default)]
pub struct ValKeys {
    keys: HashSet<String>,
}

impl ValKeys {
    pub fn bootstrap(validators: &ValidatorTable) -> Self {
        let mut keys = HashSet::new();
        for v in validators.iter() {
            if let Some(k) = &v.master_key {
                keys.insert(k.clone());
            }
            if let Some(k) = &v.validation_public_key {
                keys.insert(k.clone());
            }
        }
        ValKeys { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn contains_either(&self, master_key: Option<&str>, eph_key: Option<&str>) -> bool {
        master_key.is_some_and(|k| self.contains(k)) || eph_key.is_some_and(|k| self.contains(k))
    }

    /// Re-derive from the table after duplicate suppression.
    pub fn rebuild(&mut self, validators: &ValidatorTable) {
        *self = Self::bootstrap(validators);
    }
}

// ---------------------------------------------------------------------------
// ProcessedValidations
// ---------------------------------------------------------------------------

/// Bounded dedupe window over validation `signature`s (I6: size never
/// exceeds `PROCESSED_VAL_MAX`). When full, the oldest half is dropped
/// rather than a single entry, so the prune doesn't run on every insert.
#[derive(Debug)]
pub struct ProcessedValidations {
    max: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl ProcessedValidations {
    pub fn new(max: usize) -> Self {
        ProcessedValidations {
            max: max.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.set.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns `true` if pruning ran (caller may want to cull duplicate
    /// validators when `REMOVE_DUP_VALIDATORS` is set).
    pub fn insert(&mut self, signature: String) -> bool {
        if self.set.insert(signature.clone()) {
            self.order.push_back(signature);
        }
        if self.order.len() >= self.max {
            self.prune_oldest_half();
            true
        } else {
            false
        }
    }

    fn prune_oldest_half(&mut self) {
        let drop_n = self.order.len() / 2;
        for _ in 0..drop_n {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest queue item
// ---------------------------------------------------------------------------

/// One event as produced by the connection supervisor.
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub source_url: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Notification queue item + bounded drop-oldest queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub recipient: NotificationConfig,
}

/// The notification queue drops the *oldest* pending alert on overflow
/// rather than blocking the processor -- liveness of monitoring beats
/// completeness of past alerts. `tokio::sync::mpsc` has no such discipline,
/// so this is a small ring buffer guarded by a std mutex (push/pop never
/// holds the lock across an await point) plus a `Notify` to wake the
/// dispatcher.
pub struct NotificationQueue {
    inner: StdMutex<VecDeque<Notification>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        NotificationQueue {
            inner: StdMutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, notification: Notification) {
        {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if guard.len() >= self.capacity {
                guard.pop_front();
                tracing::warn!(
                    capacity = self.capacity,
                    "notification queue full, dropped oldest pending alert"
                );
            }
            guard.push_back(notification);
        }
        self.notify.notify_one();
    }

    /// Waits for the next notification, or `None` once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            {
                let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(n) = guard.pop_front() {
                    return Some(n);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
