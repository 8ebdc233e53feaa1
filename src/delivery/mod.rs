//! The delivery engine: dispatch, lifecycle, large-message streaming, and
//! browse traversal.

pub mod browser;
pub mod consumer;
pub mod large;

pub use consumer::{Collaborators, ConsumerSpec, ServerConsumer};

use crate::spi::message::{ConsumerId, MessageId};
use thiserror::Error;

/// Verdict returned to the queue's delivery loop for a single reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// Accepted; the queue must follow up with `proceed_deliver`.
    Handled,
    /// Temporarily unable to take the reference; redeliver on the next prompt.
    Busy,
    /// The reference is not for this consumer; offer it elsewhere.
    NoMatch,
}

/// Failures surfaced by the delivery engine.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// An acknowledgement targeted a reference that is not in flight.
    #[error("consumer {consumer} has no reference for message {message_id} on queue {queue}")]
    NoReference {
        consumer: ConsumerId,
        message_id: MessageId,
        queue: String,
    },

    #[error("illegal consumer state: {0}")]
    IllegalState(String),

    #[error("transport send failed: {0}")]
    Transport(String),

    #[error("large message stream failed: {0}")]
    Streamer(String),
}

impl DeliveryError {
    pub fn illegal_state(detail: impl Into<String>) -> Self {
        Self::IllegalState(detail.into())
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    pub fn streamer(detail: impl Into<String>) -> Self {
        Self::Streamer(detail.into())
    }
}
