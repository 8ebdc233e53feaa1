use crate::delivery::DeliveryError;
use crate::spi::message::MessageReference;

/// The slice of the storage layer the delivery engine touches.
pub trait StorageManager: Send + Sync {
    /// Issue a broker-wide monotonic id.
    fn generate_id(&self) -> u64;

    /// Persist an updated delivery count for a durable reference.
    fn update_delivery_count(&self, reference: &dyn MessageReference) -> Result<(), DeliveryError>;
}
