use crate::core::time::Clock;
use crate::delivery::consumer::ServerConsumer;
use crate::delivery::HandleStatus;
use crate::spi::message::MessageReference;
use std::sync::Arc;

type BrowseCursor = std::iter::Peekable<Box<dyn Iterator<Item = Arc<dyn MessageReference>> + Send>>;

/// Cursor-based read-only traversal over a queue.
///
/// Runs on the queue executor and reuses the consumer's dispatch machine:
/// HANDLED references are delivered, BUSY parks the reference for the next
/// prompt, NO_MATCH advances. Browsed references never enter the in-flight
/// ledger and are never acknowledged.
pub(crate) struct BrowserDeliverer {
    cursor: BrowseCursor,
    current: Option<Arc<dyn MessageReference>>,
    notified_finished: bool,
    closed: bool,
}

impl BrowserDeliverer {
    pub fn new(cursor: Box<dyn Iterator<Item = Arc<dyn MessageReference>> + Send>) -> Self {
        Self {
            cursor: cursor.peekable(),
            current: None,
            notified_finished: false,
            closed: false,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_exhausted(&mut self) -> bool {
        self.current.is_none() && self.cursor.peek().is_none()
    }

    pub fn run<C: Clock>(&mut self, consumer: &ServerConsumer<C>) {
        if self.closed {
            return;
        }

        // A reference parked as busy on the previous run goes first.
        if let Some(current) = self.current.clone() {
            match consumer.handle(current.clone()) {
                Ok(HandleStatus::Busy) => return,
                Ok(HandleStatus::Handled) => {
                    if let Err(error) = consumer.proceed_deliver(current.clone()) {
                        tracing::warn!(
                            consumer = consumer.id(),
                            message_id = current.message_id(),
                            %error,
                            "browser failed delivering parked reference"
                        );
                        return;
                    }
                }
                Ok(HandleStatus::NoMatch) => {}
                Err(error) => {
                    tracing::warn!(
                        consumer = consumer.id(),
                        message_id = current.message_id(),
                        %error,
                        "browser failed handling parked reference"
                    );
                    return;
                }
            }
            self.current = None;
        }

        loop {
            let Some(reference) = self.cursor.next() else {
                if !self.notified_finished {
                    tracing::trace!(consumer = consumer.id(), "browser finished");
                    consumer.callback().browser_finished(consumer.id());
                    self.notified_finished = true;
                }
                break;
            };

            match consumer.handle(reference.clone()) {
                Ok(HandleStatus::Handled) => {
                    if let Err(error) = consumer.proceed_deliver(reference.clone()) {
                        tracing::warn!(
                            consumer = consumer.id(),
                            message_id = reference.message_id(),
                            %error,
                            "browser failed delivering reference"
                        );
                        break;
                    }
                }
                Ok(HandleStatus::Busy) => {
                    self.current = Some(reference);
                    break;
                }
                Ok(HandleStatus::NoMatch) => {}
                Err(error) => {
                    tracing::warn!(
                        consumer = consumer.id(),
                        message_id = reference.message_id(),
                        %error,
                        "browser failed handling reference"
                    );
                    break;
                }
            }
        }
    }
}
