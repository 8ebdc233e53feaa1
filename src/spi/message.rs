use crate::delivery::DeliveryError;
use crate::messaging::transaction::Transaction;
use crate::spi::queue::DeliveryQueue;
use std::sync::Arc;

/// Identifier of a message within the broker's storage layer.
pub type MessageId = u64;

/// Identifier of a consumer, unique within its session.
pub type ConsumerId = u64;

/// Broker-wide monotonic id issued by the storage layer at consumer creation.
pub type SequentialId = u64;

/// Property carried by forced-delivery probe messages; its value is the
/// client-chosen sequence number.
pub const FORCED_DELIVERY_PROPERTY: &str = "_PHOTON_FORCED_DELIVERY";

/// A message handle as seen by the delivery engine.
///
/// Implementations live in the storage/protocol layers; the engine only reads
/// routing metadata, sizes, and flags, and rewrites the address for legacy
/// clients.
pub trait Message: Send + Sync {
    fn id(&self) -> MessageId;

    fn address(&self) -> String;

    fn set_address(&self, address: String);

    fn encoded_size(&self) -> u64;

    fn is_durable(&self) -> bool;

    /// True when the body must stream as header plus continuation chunks.
    fn is_large(&self) -> bool;

    /// Consumer-group gate: whether this consumer may take the message.
    fn accepts_consumer(&self, sequential_id: SequentialId) -> bool {
        let _ = sequential_id;
        true
    }

    fn long_property(&self, name: &str) -> Option<u64> {
        let _ = name;
        None
    }

    /// Pin the message while a large-message stream holds a reader on it.
    fn usage_up(&self) {}

    fn usage_down(&self) {}

    /// Open a reader over the large body. Errors for non-large messages.
    fn large_body(&self) -> Result<Box<dyn LargeBodyReader>, DeliveryError> {
        Err(DeliveryError::streamer(format!(
            "message {} has no large body",
            self.id()
        )))
    }
}

/// Sequential reader over a large message body, opened once per stream and
/// closed exactly once when the stream finishes.
pub trait LargeBodyReader: Send {
    fn size(&self) -> u64;

    /// Fill `buf` from the current position, returning the bytes read.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, DeliveryError>;

    fn close(&mut self);
}

/// A lightweight handle to a message sitting in a queue.
///
/// Carries the delivery count and paging flag; acknowledging hands the
/// underlying message to the given transaction (or acks immediately when no
/// transaction is supplied).
pub trait MessageReference: Send + Sync {
    fn message(&self) -> Arc<dyn Message>;

    fn message_id(&self) -> MessageId {
        self.message().id()
    }

    fn delivery_count(&self) -> u32;

    fn increment_delivery_count(&self);

    fn decrement_delivery_count(&self);

    /// Mark the reference as taken by a consumer, before any wire send.
    fn handled(&self) {}

    fn set_consumer_id(&self, consumer: ConsumerId) {
        let _ = consumer;
    }

    fn is_paged(&self) -> bool {
        false
    }

    fn queue(&self) -> Arc<dyn DeliveryQueue>;

    fn acknowledge(
        &self,
        tx: Option<&mut Transaction>,
        consumer: ConsumerId,
    ) -> Result<(), DeliveryError>;
}

/// Server-side message selector attached to a consumer at creation.
pub trait MessageFilter: Send + Sync {
    fn matches(&self, message: &dyn Message) -> bool;

    fn filter_string(&self) -> String;
}
