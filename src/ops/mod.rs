//! Operational surfaces: audit events, management notifications, and
//! consumer gauges.

pub mod audit;
pub mod notifications;
pub mod observability;

pub use notifications::{ConsumerClosedNotification, Notification, NotificationSink};
pub use observability::{ConsumerStats, RateMeter};
