use crate::spi::message::{ConsumerId, MessageReference};
use std::sync::Arc;

/// Broker plugin hooks invoked around consumer dispatch and close.
///
/// All hooks default to no-ops so plugins implement only what they watch.
pub trait DeliveryPlugin: Send + Sync {
    /// Veto gate evaluated before a reference is offered to the consumer.
    fn can_accept(&self, consumer: ConsumerId, reference: &dyn MessageReference) -> bool {
        let _ = (consumer, reference);
        true
    }

    fn before_deliver(&self, consumer: ConsumerId, reference: &dyn MessageReference) {
        let _ = (consumer, reference);
    }

    fn after_deliver(&self, consumer: ConsumerId, reference: &dyn MessageReference) {
        let _ = (consumer, reference);
    }

    fn before_close_consumer(&self, consumer: ConsumerId, failed: bool) {
        let _ = (consumer, failed);
    }

    fn after_close_consumer(&self, consumer: ConsumerId, failed: bool) {
        let _ = (consumer, failed);
    }
}

/// Fan-out over the registered plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn DeliveryPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn DeliveryPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// True only when every plugin accepts the reference.
    pub fn can_accept(&self, consumer: ConsumerId, reference: &dyn MessageReference) -> bool {
        self.plugins
            .iter()
            .all(|plugin| plugin.can_accept(consumer, reference))
    }

    pub fn before_deliver(&self, consumer: ConsumerId, reference: &dyn MessageReference) {
        for plugin in &self.plugins {
            plugin.before_deliver(consumer, reference);
        }
    }

    pub fn after_deliver(&self, consumer: ConsumerId, reference: &dyn MessageReference) {
        for plugin in &self.plugins {
            plugin.after_deliver(consumer, reference);
        }
    }

    pub fn before_close_consumer(&self, consumer: ConsumerId, failed: bool) {
        for plugin in &self.plugins {
            plugin.before_close_consumer(consumer, failed);
        }
    }

    pub fn after_close_consumer(&self, consumer: ConsumerId, failed: bool) {
        for plugin in &self.plugins {
            plugin.after_close_consumer(consumer, failed);
        }
    }
}
