use crate::spi::message::{MessageId, MessageReference};
use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered set of references delivered but not yet acknowledged, rejected,
/// or cancelled.
///
/// Order is delivery order: the queue appends at the tail as it hands
/// references out, and batch acknowledgement polls from the head. The ledger
/// itself is not synchronised; the owning consumer's lock guards every
/// access.
#[derive(Default)]
pub struct DeliveryLedger {
    refs: VecDeque<Arc<dyn MessageReference>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn push_back(&mut self, reference: Arc<dyn MessageReference>) {
        self.refs.push_back(reference);
    }

    /// Re-establish ordering after a protocol rollback: the reference goes
    /// back to the head so it is acknowledged first.
    pub fn push_front(&mut self, reference: Arc<dyn MessageReference>) {
        self.refs.push_front(reference);
    }

    pub fn poll(&mut self) -> Option<Arc<dyn MessageReference>> {
        self.refs.pop_front()
    }

    /// Remove one reference by message id. Expiries and individual acks can
    /// arrive out of delivery order, so the head check is only a fast path
    /// before the linear scan.
    pub fn remove_by_id(&mut self, message_id: MessageId) -> Option<Arc<dyn MessageReference>> {
        if self.refs.is_empty() {
            return None;
        }
        if self
            .refs
            .front()
            .is_some_and(|head| head.message_id() == message_id)
        {
            return self.refs.pop_front();
        }
        let position = self
            .refs
            .iter()
            .position(|reference| reference.message_id() == message_id)?;
        self.refs.remove(position)
    }

    /// Collect references in order from the first satisfying `start` through
    /// the one satisfying `end` (inclusive), optionally excising them.
    pub fn scan<F, G>(
        &mut self,
        remove: bool,
        mut start: F,
        mut end: G,
    ) -> Vec<Arc<dyn MessageReference>>
    where
        F: FnMut(&dyn MessageReference) -> bool,
        G: FnMut(&dyn MessageReference) -> bool,
    {
        let mut collected = Vec::new();
        let mut hit = false;
        let mut index = 0;
        while index < self.refs.len() {
            let reference = &self.refs[index];
            if !hit && start(reference.as_ref()) {
                hit = true;
            }
            if hit {
                let reference = if remove {
                    match self.refs.remove(index) {
                        Some(removed) => removed,
                        None => break,
                    }
                } else {
                    let kept = reference.clone();
                    index += 1;
                    kept
                };
                let done = end(reference.as_ref());
                collected.push(reference);
                if done {
                    break;
                }
            } else {
                index += 1;
            }
        }
        collected
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn MessageReference>> {
        self.refs.iter().cloned().collect()
    }
}
