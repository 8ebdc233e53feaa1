use serde::Serialize;

/// Management notification published when a consumer closes.
///
/// Cluster peers key off these to track remote consumer counts, so the close
/// path publishes before the queue's ref-count recheck can act.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerClosedNotification {
    pub address: String,
    pub cluster_name: String,
    pub routing_name: String,
    pub filter: Option<String>,
    pub distance: u32,
    pub consumer_count: usize,
    pub user: String,
    pub remote_address: String,
    pub session_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum Notification {
    ConsumerClosed(ConsumerClosedNotification),
}

/// Destination for management notifications.
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: Notification);
}

/// Sink that forwards notifications to the log stream; the default when no
/// management plane is wired in.
#[derive(Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn send(&self, notification: Notification) {
        match &notification {
            Notification::ConsumerClosed(closed) => {
                tracing::info!(
                    target: "management",
                    address = %closed.address,
                    queue_consumers = closed.consumer_count,
                    session = %closed.session_name,
                    "consumer closed"
                );
            }
        }
    }
}
