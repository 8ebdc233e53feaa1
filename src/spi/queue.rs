use crate::core::executor::QueueExecutor;
use crate::delivery::DeliveryError;
use crate::messaging::transaction::Transaction;
use crate::spi::message::{ConsumerId, MessageReference};
use std::sync::Arc;

/// How the binding routes messages to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKind {
    Anycast,
    Multicast,
}

/// Immutable description of the binding a consumer attaches through.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub address: String,
    pub cluster_name: String,
    pub routing_name: String,
    pub distance: u32,
    pub routing: RoutingKind,
}

/// The queue surface the delivery engine calls back into.
///
/// The queue's delivery loop drives the consumer; the consumer uses this
/// trait to register, prompt redelivery, return cancelled references, and
/// route rejected ones to the dead-letter sink.
pub trait DeliveryQueue: Send + Sync {
    fn name(&self) -> String;

    fn is_durable(&self) -> bool;

    fn is_internal(&self) -> bool {
        false
    }

    fn consumer_count(&self) -> usize;

    fn add_consumer(&self, consumer: ConsumerId);

    fn remove_consumer(&self, consumer: ConsumerId);

    /// Cursor over the queue's current contents for browse-only traversal.
    fn browser_iterator(&self) -> Box<dyn Iterator<Item = Arc<dyn MessageReference>> + Send>;

    /// Ask the queue's delivery loop to resume pushing references.
    fn deliver_async(&self);

    /// The single-writer executor serialising wire work for this queue.
    fn executor(&self) -> Arc<dyn QueueExecutor>;

    fn acknowledge(
        &self,
        reference: &dyn MessageReference,
        consumer: ConsumerId,
    ) -> Result<(), DeliveryError>;

    /// Register a cancellation whose side effect runs when `tx` rolls back.
    fn cancel_in_tx(&self, tx: &mut Transaction, reference: Arc<dyn MessageReference>, expire: bool);

    /// Return a reference to the queue immediately, stamped with wall time.
    fn cancel(
        &self,
        reference: Arc<dyn MessageReference>,
        timestamp_millis: u64,
    ) -> Result<(), DeliveryError>;

    fn send_to_dead_letter_address(
        &self,
        reference: Arc<dyn MessageReference>,
    ) -> Result<(), DeliveryError>;

    fn allows_reference_callback(&self) -> bool {
        true
    }

    fn error_processing(
        &self,
        consumer: ConsumerId,
        error: &DeliveryError,
        reference: &dyn MessageReference,
    ) {
        let _ = (consumer, error, reference);
    }

    /// Re-evaluate the queue's reference count; may trigger auto-delete.
    fn recheck_ref_count(&self);
}
