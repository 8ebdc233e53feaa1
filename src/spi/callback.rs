use crate::delivery::DeliveryError;
use crate::spi::message::{ConsumerId, Message, MessageReference};
use std::any::Any;
use std::sync::Arc;

/// Opaque protocol attachment a wire adapter hangs off a consumer, handed
/// back on writability checks.
pub type ProtocolContext = Arc<dyn Any + Send + Sync>;

/// The wire adapter a session exposes to its consumers.
///
/// Send methods return the packet size actually written, which the engine
/// debits from the consumer's credit balance.
pub trait SessionCallback: Send + Sync {
    /// Protocol-specific credit check beyond the byte meter.
    fn has_credits(&self, consumer: ConsumerId, reference: &dyn MessageReference) -> bool {
        let _ = (consumer, reference);
        true
    }

    fn is_writable(&self, consumer: ConsumerId, context: Option<&ProtocolContext>) -> bool {
        let _ = (consumer, context);
        true
    }

    fn send_message(
        &self,
        reference: &dyn MessageReference,
        message: &dyn Message,
        consumer: ConsumerId,
        delivery_count: u32,
    ) -> Result<u64, DeliveryError>;

    /// Emit the header packet of a chunked large-message delivery.
    fn send_large_message(
        &self,
        reference: &dyn MessageReference,
        message: &dyn Message,
        consumer: ConsumerId,
        total_size: u64,
        delivery_count: u32,
    ) -> Result<u64, DeliveryError>;

    /// Emit one continuation chunk. With `requires_response` false the wire
    /// layer must not retain `body` past the call, which lets the engine
    /// reuse a single chunk buffer for the whole stream.
    fn send_large_message_continuation(
        &self,
        consumer: ConsumerId,
        body: &[u8],
        has_more: bool,
        requires_response: bool,
    ) -> Result<u64, DeliveryError>;

    /// Returns true when the callback took responsibility for adjusting the
    /// delivery count of a cancelled reference; otherwise the engine applies
    /// the default decrement on non-failed cancels.
    fn update_delivery_count_after_cancel(
        &self,
        consumer: ConsumerId,
        reference: &dyn MessageReference,
        failed: bool,
    ) -> bool {
        let _ = (consumer, reference, failed);
        false
    }

    /// Invoked unconditionally after every `proceed_deliver`.
    fn after_delivery(&self) {}

    fn disconnect(&self, consumer: ConsumerId, queue_name: &str) {
        let _ = (consumer, queue_name);
    }

    /// Invoked once when a browse-only consumer exhausts its cursor.
    fn browser_finished(&self, consumer: ConsumerId) {
        let _ = consumer;
    }

    fn supports_direct_delivery(&self) -> bool {
        true
    }
}
