//! Notification Dispatcher: fans each rendered alert out to every transport
//! enabled both globally and for that recipient, concurrently, with one
//! transport's failure never affecting another's.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{error, info};

use crate::model::{Notification, NotificationQueue};

/// A transport adapter: render-and-send, swallowing its own retriable
/// errors. The core only ever calls this; what it does with the message is
/// out of scope (§1, §4.3.1).
pub type TransportFn = Arc<dyn Fn(Notification) -> BoxFuture<'static, ()> + Send + Sync>;

/// Default tag ordering, matching `settings_ex.py`'s enumeration. Used when
/// a configuration does not override `KNOWN_NOTIFICATIONS`.
pub fn default_known_notifications() -> Vec<String> {
    ["discord", "slack", "mattermost", "smtp", "twilio"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Replaces the source's `"send_" + tag` name-lookup trick (Design Notes)
/// with an explicit tag → transport registry, built once at startup.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, TransportFn>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<String>, transport: TransportFn) {
        self.transports.insert(tag.into(), transport);
    }

    fn get(&self, tag: &str) -> Option<&TransportFn> {
        self.transports.get(tag)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ordered transport tags to consider on every notification.
    pub known_notifications: Vec<String>,
    /// `SEND_<TAG>` global enable flags, defaulting to `false` when absent.
    pub send_enabled: HashMap<String, bool>,
}

impl DispatcherConfig {
    fn global_allowed(&self, tag: &str) -> bool {
        self.send_enabled.get(tag).copied().unwrap_or(false)
    }
}

/// Runs until `notification_queue` closes and drains, or `shutdown` fires.
pub async fn run(
    config: DispatcherConfig,
    registry: TransportRegistry,
    notification_queue: Arc<NotificationQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let notification = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            n = notification_queue.recv() => n,
        };

        let Some(notification) = notification else {
            break;
        };

        dispatch_one(&config, &registry, notification).await;
    }
}

/// §4.3: for each known tag, schedule the transport iff both the global
/// switch and this recipient's opt-in are true, then await all of them
/// concurrently. A transport panicking or erroring never blocks the others
/// -- `send_<tag>` is expected to swallow its own errors, but a `JoinSet` is
/// used so a panic in one adapter can't take the dispatcher loop down.
async fn dispatch_one(config: &DispatcherConfig, registry: &TransportRegistry, notification: Notification) {
    let mut scheduled = tokio::task::JoinSet::new();

    for tag in &config.known_notifications {
        let allowed_local = notification.recipient.allows(tag);
        let allowed_global = config.global_allowed(tag);
        if !(allowed_local && allowed_global) {
            continue;
        }
        let Some(transport) = registry.get(tag) else {
            error!(tag = %tag, "notification tag enabled but no transport registered");
            continue;
        };
        let fut = (transport)(notification.clone());
        let tag = tag.clone();
        scheduled.spawn(async move {
            fut.await;
            tag
        });
    }

    while let Some(result) = scheduled.join_next().await {
        match result {
            Ok(tag) => info!(tag = %tag, "notification dispatched"),
            Err(e) => error!(error = %e, "transport task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_transport(counter: Arc<AtomicUsize>) -> TransportFn {
        Arc::new(move |_notification| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn dispatch_gating_requires_both_global_and_local() {
        let discord_calls = Arc::new(AtomicUsize::new(0));
        let smtp_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = TransportRegistry::new();
        registry.register("discord", counting_transport(discord_calls.clone()));
        registry.register("smtp", counting_transport(smtp_calls.clone()));

        let mut send_enabled = HashMap::new();
        send_enabled.insert("discord".to_owned(), true);
        send_enabled.insert("smtp".to_owned(), false);

        let config = DispatcherConfig {
            known_notifications: default_known_notifications(),
            send_enabled,
        };

        let notification = Notification {
            message: "hello".to_owned(),
            recipient: NotificationConfig::new().allow("discord", true).allow("smtp", true),
        };

        dispatch_one(&config, &registry, notification).await;

        assert_eq!(discord_calls.load(Ordering::SeqCst), 1);
        assert_eq!(smtp_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_skips_tag_disabled_locally() {
        let discord_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TransportRegistry::new();
        registry.register("discord", counting_transport(discord_calls.clone()));

        let mut send_enabled = HashMap::new();
        send_enabled.insert("discord".to_owned(), true);

        let config = DispatcherConfig {
            known_notifications: default_known_notifications(),
            send_enabled,
        };

        let notification = Notification {
            message: "hello".to_owned(),
            recipient: NotificationConfig::new().allow("discord", false),
        };

        dispatch_one(&config, &registry, notification).await;
        assert_eq!(discord_calls.load(Ordering::SeqCst), 0);
    }
}
