//! Out-of-band routing: backend pushes that correlate to no pending call.
//!
//! Two kinds arrive on the duplex channel (`warning`, `dl_progress`); the
//! router also surfaces the bridge's own lifecycle and failure notices so
//! every failure class is user-visible even when the caller drops the
//! returned error.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

/// External collaborator that displays notices to the user.
///
/// The bridge only ever calls this trait and the progress subscribers; it
/// never renders anything itself.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

/// Default sink: structured log events under the `wahu_bridge::notice` target.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Error => tracing::error!(target: "wahu_bridge::notice", "{message}"),
            Severity::Warning => tracing::warn!(target: "wahu_bridge::notice", "{message}"),
            Severity::Info | Severity::Success => {
                tracing::info!(target: "wahu_bridge::notice", "{message}")
            }
        }
    }
}

type ProgressFn = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct ProgressRegistry {
    subscribers: Mutex<Vec<(u64, ProgressFn)>>,
    next_id: AtomicU64,
}

/// Deregistration capability for a progress subscription.
///
/// Dropping the guard leaves the subscription in place; only calling
/// `deregister` removes it.
pub struct ProgressGuard {
    registry: Weak<ProgressRegistry>,
    id: u64,
}

impl ProgressGuard {
    pub fn deregister(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .subscribers
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct OobRouter {
    sink: Arc<dyn NotificationSink>,
    progress: Arc<ProgressRegistry>,
}

impl OobRouter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            progress: Arc::new(ProgressRegistry::default()),
        }
    }

    /// Register a progress subscriber. Subscribers fire in registration
    /// order; each receives every progress payload.
    pub fn subscribe_progress(
        &self,
        subscriber: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ProgressGuard {
        let id = self.progress.next_id.fetch_add(1, Ordering::Relaxed);
        self.progress
            .subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(subscriber)));
        ProgressGuard {
            registry: Arc::downgrade(&self.progress),
            id,
        }
    }

    pub(crate) fn progress(&self, report: &Value) {
        let subscribers: Vec<ProgressFn> = self
            .progress
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in subscribers {
            // One failing subscriber must not starve the rest.
            if catch_unwind(AssertUnwindSafe(|| subscriber(report))).is_err() {
                tracing::warn!("progress subscriber panicked");
            }
        }
    }

    pub(crate) fn notify(&self, severity: Severity, message: &str) {
        self.sink.notify(severity, message);
    }

    pub(crate) fn success(&self, message: &str) {
        self.notify(Severity::Success, message);
    }

    pub(crate) fn warning(&self, message: &str) {
        self.notify(Severity::Warning, message);
    }

    pub(crate) fn error(&self, message: &str) {
        self.notify(Severity::Error, message);
    }
}
