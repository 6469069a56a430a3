//! Change and deletion notifications
//!
//! A dedicated listener task subscribes to both notification channels and
//! invokes locally registered observers for every message. Delivery is
//! at-most-once: nothing is replayed after a reconnect.

use crate::backend::StorageBackend;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CHANGE_CHANNEL: &str = "change-notification-channel";
pub const DELETION_CHANNEL: &str = "deletion-notification-channel";

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Changed,
    Deleted,
}

impl NotificationKind {
    pub fn channel(self) -> &'static str {
        match self {
            NotificationKind::Changed => CHANGE_CHANNEL,
            NotificationKind::Deleted => DELETION_CHANNEL,
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            CHANGE_CHANNEL => Some(NotificationKind::Changed),
            DELETION_CHANNEL => Some(NotificationKind::Deleted),
            _ => None,
        }
    }
}

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

struct Registration {
    id: u64,
    kind: NotificationKind,
    handler: Handler,
}

/// Observers registered on one engine
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl Observers {
    pub(crate) fn register(
        self: &Arc<Self>,
        kind: NotificationKind,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.write().push(Registration {
            id,
            kind,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            observers: Arc::downgrade(self),
        }
    }

    /// Run every handler registered for `kind`, outside the registry lock
    pub(crate) fn dispatch(&self, kind: NotificationKind, id: &str) {
        let handlers: Vec<Handler> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.handler.clone())
            .collect();
        debug!(?kind, id, observers = handlers.len(), "Dispatching notification");
        for handler in handlers {
            handler(id);
        }
    }

    fn unregister(&self, id: u64) {
        self.registrations.write().retain(|r| r.id != id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registrations.read().len()
    }
}

/// Keeps an observer registered. Dropping it deregisters the handler.
#[must_use = "dropping a Subscription deregisters its handler"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.unregister(self.id);
        }
    }
}

/// The background listener; aborted when the owning engine is dropped
pub(crate) struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn spawn(backend: Arc<dyn StorageBackend>, observers: Weak<Observers>) -> Self {
        Self {
            task: tokio::spawn(listen(backend, observers)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe, dispatch until the connection ends, then reconnect with backoff
async fn listen(backend: Arc<dyn StorageBackend>, observers: Weak<Observers>) {
    let mut reconnect_attempts: u32 = 0;

    loop {
        match backend.subscribe(&[CHANGE_CHANNEL, DELETION_CHANNEL]).await {
            Ok(mut messages) => {
                info!("Notification listener subscribed");
                reconnect_attempts = 0;

                while let Some(msg) = messages.next().await {
                    let Some(observers) = observers.upgrade() else {
                        return;
                    };
                    match NotificationKind::from_channel(&msg.channel) {
                        Some(kind) => observers.dispatch(kind, &msg.payload),
                        None => debug!(channel = %msg.channel, "Ignoring message on unknown channel"),
                    }
                }
                warn!("Notification subscription ended");
            }
            Err(e) => {
                error!(error = %e, "Failed to subscribe to notifications");
            }
        }

        if observers.strong_count() == 0 {
            return;
        }

        reconnect_attempts = reconnect_attempts.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempts);
        warn!(
            "Resubscribing in {:?} (attempt {})",
            delay, reconnect_attempts
        );
        tokio::time::sleep(delay).await;
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    INITIAL_RECONNECT_DELAY
        .saturating_mul(factor)
        .min(MAX_RECONNECT_DELAY)
}
