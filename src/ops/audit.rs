use crate::spi::message::{ConsumerId, MessageId};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::event;

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: String,
    pub consumer: ConsumerId,
    pub queue: String,
    pub detail: String,
}

/// In-memory audit sink; mirrors everything also emitted on the `audit`
/// tracing target.
#[derive(Clone, Default)]
pub struct AuditSink {
    inner: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();

pub fn install_sink(sink: AuditSink) {
    let _ = AUDIT_SINK.set(sink);
}

/// Return a copy of recorded audit events for mirroring to external sinks.
pub fn snapshot() -> Vec<AuditEvent> {
    AUDIT_SINK
        .get()
        .and_then(|s| s.inner.lock().ok().map(|g| g.clone()))
        .unwrap_or_default()
}

/// Emit an immutable audit event.
pub fn emit(event_type: &str, consumer: ConsumerId, queue: &str, detail: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        consumer,
        %queue,
        %detail
    );
    let sink = AUDIT_SINK.get_or_init(AuditSink::default);
    sink.record(AuditEvent {
        event_type: event_type.to_string(),
        consumer,
        queue: queue.to_string(),
        detail: detail.to_string(),
    });
}

/// Audit a message handed to a remote consumer.
pub fn message_consumed(consumer: ConsumerId, queue: &str, message_id: MessageId, remote: &str) {
    emit(
        "consume",
        consumer,
        queue,
        &format!("message {message_id} to {remote}"),
    );
}
