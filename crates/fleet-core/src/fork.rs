//! Fork detection: mode computation over observed ledger indices and the
//! per-record classification/transition logic run on every fork-check sweep.

use std::collections::HashMap;

use chrono::Utc;

use crate::model::{NotificationConfig, ServerTable, ValidatorTable, DISCONNECTED_STATUS};

/// Value(s) of maximum frequency in a multiset. Returns every tied maximum,
/// sorted, so callers can detect (and refuse to act on) a tie rather than
/// silently picking the first-seen one.
pub fn calc_modes(values: &[i64]) -> Vec<i64> {
    let mut freq: HashMap<i64, usize> = HashMap::new();
    for v in values {
        *freq.entry(*v).or_insert(0) += 1;
    }
    let Some(&max_count) = freq.values().max() else {
        return Vec::new();
    };
    let mut modes: Vec<i64> = freq
        .into_iter()
        .filter(|(_, count)| *count == max_count)
        .map(|(value, _)| value)
        .collect();
    modes.sort_unstable();
    modes
}

/// One alert emitted by a fork-check pass.
pub struct ForkAlert {
    pub message: String,
    pub recipient: NotificationConfig,
}

/// Outcome of a single fork-check pass.
pub struct ForkCheckResult {
    pub alerts: Vec<ForkAlert>,
    /// The mode(s) observed this pass. Empty when there was nothing to
    /// evaluate; more than one entry when the pass was skipped as
    /// multimodal.
    pub modes: Vec<i64>,
    pub skipped_multimodal: bool,
}

fn short_key(key: Option<&str>) -> String {
    key.unwrap_or("").chars().take(5).collect()
}

fn now_stamp() -> String {
    Utc::now().format("%m-%d %H:%M:%S").to_string()
}

/// Run one fork-check pass over both tables in place. See spec §4.2.4.
pub fn fork_check(
    servers: &mut ServerTable,
    validators: &mut ValidatorTable,
    ll_fork_cutoff: i64,
) -> ForkCheckResult {
    let mut values = Vec::new();
    for s in servers.iter() {
        if let Some(idx) = s.ledger_index {
            values.push(idx);
        }
    }
    for v in validators.iter() {
        if let Some(idx) = v.ledger_index {
            values.push(idx);
        }
    }

    let modes = calc_modes(&values);
    if modes.len() > 1 {
        return ForkCheckResult {
            alerts: Vec::new(),
            modes,
            skipped_multimodal: true,
        };
    }
    let Some(&mode) = modes.first() else {
        return ForkCheckResult {
            alerts: Vec::new(),
            modes,
            skipped_multimodal: false,
        };
    };

    let mut alerts = Vec::new();
    let now = Utc::now();

    for s in servers.iter_mut() {
        let Some(idx) = s.ledger_index else { continue };
        if s.server_status.as_deref() == Some(DISCONNECTED_STATUS) {
            continue;
        }
        let was_forked = s.forked;
        let is_forked = (idx - mode).abs() > ll_fork_cutoff;
        s.forked = Some(is_forked);

        if is_forked && was_forked != Some(true) {
            s.time_forked = Some(now);
            alerts.push(ForkAlert {
                message: format!(
                    "Forked server: '{}' '{}' returned index: '{}'. The consensus mode was: '{}'. Time UTC: {}.",
                    s.server_name,
                    short_key(s.pubkey_node.as_deref()),
                    idx,
                    mode,
                    now_stamp(),
                ),
                recipient: s.notifications.clone(),
            });
        } else if !is_forked && was_forked == Some(true) {
            s.time_forked = None;
            alerts.push(ForkAlert {
                message: format!(
                    "Previously forked server: '{}' '{}' is back in consensus at ledger: '{}'. Time UTC: {}.",
                    s.server_name,
                    short_key(s.pubkey_node.as_deref()),
                    idx,
                    now_stamp(),
                ),
                recipient: s.notifications.clone(),
            });
        } else if !is_forked {
            s.time_forked = None;
        }
    }

    for v in validators.iter_mut() {
        let Some(idx) = v.ledger_index else { continue };
        let was_forked = v.forked;
        let is_forked = (idx - mode).abs() > ll_fork_cutoff;
        v.forked = Some(is_forked);

        let key = v.master_key.as_deref().or(v.validation_public_key.as_deref());

        if is_forked && was_forked != Some(true) {
            v.time_forked = Some(now);
            alerts.push(ForkAlert {
                message: format!(
                    "Forked server: '{}' '{}' returned index: '{}'. The consensus mode was: '{}'. Time UTC: {}.",
                    v.server_name,
                    short_key(key),
                    idx,
                    mode,
                    now_stamp(),
                ),
                recipient: v.notifications.clone(),
            });
        } else if !is_forked && was_forked == Some(true) {
            v.time_forked = None;
            alerts.push(ForkAlert {
                message: format!(
                    "Previously forked server: '{}' '{}' is back in consensus at ledger: '{}'. Time UTC: {}.",
                    v.server_name,
                    short_key(key),
                    idx,
                    now_stamp(),
                ),
                recipient: v.notifications.clone(),
            });
        } else if !is_forked {
            v.time_forked = None;
        }
    }

    ForkCheckResult {
        alerts,
        modes,
        skipped_multimodal: false,
    }
}
