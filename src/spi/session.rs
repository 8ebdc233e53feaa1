use crate::spi::message::{ConsumerId, MessageReference};
use std::sync::Arc;

/// Session metadata key set by JMS clients; its presence marks a connection
/// that may need legacy address prefixes.
pub const JMS_SESSION_METADATA_KEY: &str = "jms-session";

/// First wire-protocol channel version that understands prefixless addresses.
pub const ADDRESSING_CHANGE_VERSION: i32 = 129;

/// The owning session, as seen by one of its consumers.
pub trait SessionHandle: Send + Sync {
    fn name(&self) -> String;

    fn connection_id(&self) -> String;

    fn username(&self) -> String;

    fn remote_address(&self) -> String;

    fn metadata(&self, key: &str) -> Option<String>;

    /// Negotiated wire-protocol channel version of the remoting connection.
    fn channel_version(&self) -> i32;

    /// References this consumer delivered that sit in a client transaction.
    fn in_tx_references_for(&self, consumer: ConsumerId) -> Vec<Arc<dyn MessageReference>>;

    /// Retain a closed consumer so its in-transaction references can still
    /// be acknowledged.
    fn add_linger_consumer(&self, consumer: ConsumerId);

    fn remove_consumer(&self, consumer: ConsumerId);
}
