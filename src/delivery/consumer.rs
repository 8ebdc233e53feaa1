use crate::core::config::DeliveryConfig;
use crate::core::latch::CountLatch;
use crate::core::time::{Clock, SystemClock};
use crate::delivery::browser::BrowserDeliverer;
use crate::delivery::large::{LargeMessageDeliverer, StreamEnv, StreamStep};
use crate::delivery::{DeliveryError, HandleStatus};
use crate::messaging::credit::{CreditEvent, CreditMeter};
use crate::messaging::ledger::DeliveryLedger;
use crate::messaging::transaction::Transaction;
use crate::ops::audit;
use crate::ops::notifications::{ConsumerClosedNotification, Notification, NotificationSink};
use crate::ops::observability::{ConsumerStats, RateMeter};
use crate::spi::callback::{ProtocolContext, SessionCallback};
use crate::spi::message::{
    ConsumerId, Message, MessageFilter, MessageId, MessageReference, SequentialId,
    FORCED_DELIVERY_PROPERTY,
};
use crate::spi::plugins::PluginRegistry;
use crate::spi::queue::{DeliveryQueue, QueueBinding, RoutingKind};
use crate::spi::session::{SessionHandle, ADDRESSING_CHANGE_VERSION, JMS_SESSION_METADATA_KEY};
use crate::spi::storage::StorageManager;
use crate::spi::SlowConsumerListener;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const OLD_QUEUE_PREFIX: &str = "jms.queue.";
const OLD_TOPIC_PREFIX: &str = "jms.topic.";

/// Creation-time attributes of a consumer.
#[derive(Clone)]
pub struct ConsumerSpec {
    pub id: ConsumerId,
    pub priority: u8,
    pub started: bool,
    pub browse_only: bool,
    pub pre_ack: bool,
    pub strict_update_delivery_count: bool,
    pub support_large_message: bool,
    /// `None` starts the meter bounded at zero, `Some(-1)` disables flow
    /// control, any other value seeds the balance.
    pub credits: Option<i64>,
    pub filter: Option<Arc<dyn MessageFilter>>,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            id: 0,
            priority: 0,
            started: true,
            browse_only: false,
            pre_ack: false,
            strict_update_delivery_count: false,
            support_large_message: true,
            credits: None,
            filter: None,
        }
    }
}

/// Shared handles a consumer borrows from its surroundings. The consumer
/// owns none of them; close detaches explicitly.
pub struct Collaborators<C: Clock = SystemClock> {
    pub queue: Arc<dyn DeliveryQueue>,
    pub binding: QueueBinding,
    pub session: Arc<dyn SessionHandle>,
    pub callback: Arc<dyn SessionCallback>,
    pub storage: Arc<dyn StorageManager>,
    pub plugins: PluginRegistry,
    pub notifications: Arc<dyn NotificationSink>,
    pub config: DeliveryConfig,
    pub clock: C,
}

/// State guarded by the consumer lock. The lock makes the
/// started/transferring read atomic with the ledger append and with the
/// one-streamer-at-a-time invariant.
struct DispatchState {
    started: bool,
    transferring: bool,
    ledger: DeliveryLedger,
    deliverer: Option<LargeMessageDeliverer>,
}

enum StreamOutcome {
    Resume,
    Kick,
    Stay,
}

/// The server-side consumer: pulls references from its queue, meters client
/// credit, tracks in-flight state, and drives the acknowledge / cancel /
/// reject lifecycle.
pub struct ServerConsumer<C: Clock = SystemClock> {
    id: ConsumerId,
    sequential_id: SequentialId,
    priority: u8,
    filter: Option<Arc<dyn MessageFilter>>,
    browse_only: bool,
    pre_ack: AtomicBool,
    strict_update_delivery_count: bool,
    support_large_message: bool,
    created_at_millis: u64,
    config: DeliveryConfig,

    queue: Arc<dyn DeliveryQueue>,
    binding: QueueBinding,
    session: Arc<dyn SessionHandle>,
    callback: Arc<dyn SessionCallback>,
    storage: Arc<dyn StorageManager>,
    plugins: PluginRegistry,
    notifications: Arc<dyn NotificationSink>,
    clock: C,

    credits: CreditMeter,
    pending: CountLatch,
    state: Mutex<DispatchState>,
    browser: Option<Mutex<BrowserDeliverer>>,
    closed: Mutex<bool>,

    acks: AtomicU64,
    rate: RateMeter,
    legacy_prefix: Option<RoutingKind>,
    slow_consumer_listener: Mutex<Option<Arc<dyn SlowConsumerListener>>>,
    protocol_context: Mutex<Option<ProtocolContext>>,
    protocol_data: Mutex<Option<ProtocolContext>>,

    weak_self: Weak<ServerConsumer<C>>,
}

impl<C: Clock> ServerConsumer<C> {
    pub fn new(spec: ConsumerSpec, collab: Collaborators<C>) -> Arc<Self> {
        let sequential_id = collab.storage.generate_id();
        let created_at_millis = collab.clock.wall_millis();

        // Old JMS clients on pre-addressing-change channels expect prefixed
        // addresses on everything we send them.
        let legacy_prefix = (collab.session.metadata(JMS_SESSION_METADATA_KEY).is_some()
            && collab.session.channel_version() < ADDRESSING_CHANGE_VERSION)
            .then_some(collab.binding.routing);

        let browser = spec
            .browse_only
            .then(|| Mutex::new(BrowserDeliverer::new(collab.queue.browser_iterator())));

        let consumer = Arc::new_cyclic(|weak| Self {
            id: spec.id,
            sequential_id,
            priority: spec.priority,
            filter: spec.filter,
            browse_only: spec.browse_only,
            pre_ack: AtomicBool::new(spec.pre_ack),
            strict_update_delivery_count: spec.strict_update_delivery_count,
            support_large_message: spec.support_large_message,
            created_at_millis,
            config: collab.config,
            queue: collab.queue,
            binding: collab.binding,
            session: collab.session,
            callback: collab.callback,
            storage: collab.storage,
            plugins: collab.plugins,
            notifications: collab.notifications,
            clock: collab.clock.clone(),
            credits: CreditMeter::from_initial(spec.credits),
            pending: CountLatch::new(),
            state: Mutex::new(DispatchState {
                started: spec.browse_only || spec.started,
                transferring: false,
                ledger: DeliveryLedger::new(),
                deliverer: None,
            }),
            browser,
            closed: Mutex::new(false),
            acks: AtomicU64::new(0),
            rate: RateMeter::new(created_at_millis),
            legacy_prefix,
            slow_consumer_listener: Mutex::new(None),
            protocol_context: Mutex::new(None),
            protocol_data: Mutex::new(None),
            weak_self: weak.clone(),
        });

        if !consumer.browse_only {
            consumer.queue.add_consumer(consumer.id);
        }
        consumer
    }

    // Identity and metadata
    // ----------------------------------------------------------------------

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn sequential_id(&self) -> SequentialId {
        self.sequential_id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn is_browse_only(&self) -> bool {
        self.browse_only
    }

    pub fn created_at_millis(&self) -> u64 {
        self.created_at_millis
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    pub fn filter_string(&self) -> Option<String> {
        self.filter.as_ref().map(|filter| filter.filter_string())
    }

    pub fn connection_id(&self) -> String {
        self.session.connection_id()
    }

    pub fn session_name(&self) -> String {
        self.session.name()
    }

    pub(crate) fn callback(&self) -> &dyn SessionCallback {
        self.callback.as_ref()
    }

    pub fn set_pre_ack(&self, pre_ack: bool) {
        self.pre_ack.store(pre_ack, Ordering::Release);
    }

    pub fn set_protocol_context(&self, context: Option<ProtocolContext>) {
        *self.protocol_context.lock() = context;
    }

    pub fn protocol_context(&self) -> Option<ProtocolContext> {
        self.protocol_context.lock().clone()
    }

    pub fn set_protocol_data(&self, data: Option<ProtocolContext>) {
        *self.protocol_data.lock() = data;
    }

    pub fn protocol_data(&self) -> Option<ProtocolContext> {
        self.protocol_data.lock().clone()
    }

    pub fn set_slow_consumer_listener(&self, listener: Option<Arc<dyn SlowConsumerListener>>) {
        *self.slow_consumer_listener.lock() = listener;
    }

    pub fn fire_slow_consumer(&self) {
        let listener = self.slow_consumer_listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_slow_consumer(self.id);
        }
    }

    pub fn supports_direct_delivery(&self) -> bool {
        self.callback.supports_direct_delivery()
    }

    pub fn allow_reference_callback(&self) -> bool {
        if self.browse_only {
            false
        } else {
            self.queue.allows_reference_callback()
        }
    }

    // Dispatch
    // ----------------------------------------------------------------------

    /// Offer a reference to this consumer. Called by the queue's delivery
    /// loop from arbitrary worker contexts.
    ///
    /// Credit and writability are checked before the lock so exhausted
    /// consumers never contend the dispatch path.
    pub fn handle(&self, reference: Arc<dyn MessageReference>) -> Result<HandleStatus, DeliveryError> {
        if !self.callback.has_credits(self.id, reference.as_ref()) || !self.credits.try_reserve() {
            tracing::debug!(
                consumer = self.id,
                balance = ?self.credits.balance(),
                message_id = reference.message_id(),
                "busy for lack of credits"
            );
            return Ok(HandleStatus::Busy);
        }

        if !self.plugins.is_empty() && !self.plugins.can_accept(self.id, reference.as_ref()) {
            tracing::trace!(
                consumer = self.id,
                message_id = reference.message_id(),
                "reference vetoed by plugin"
            );
            return Ok(HandleStatus::NoMatch);
        }

        let context = self.protocol_context.lock().clone();
        let mut state = self.state.lock();

        if !self.callback.is_writable(self.id, context.as_ref())
            || !state.started
            || state.transferring
        {
            return Ok(HandleStatus::Busy);
        }

        if state.deliverer.is_some() {
            tracing::debug!(
                consumer = self.id,
                message_id = reference.message_id(),
                "busy delivering a large message"
            );
            return Ok(HandleStatus::Busy);
        }

        let message = reference.message();

        if !message.accepts_consumer(self.sequential_id) {
            return Ok(HandleStatus::NoMatch);
        }

        if let Some(filter) = &self.filter {
            if !filter.matches(message.as_ref()) {
                tracing::trace!(
                    consumer = self.id,
                    message_id = reference.message_id(),
                    "reference does not match filter"
                );
                return Ok(HandleStatus::NoMatch);
            }
        }

        if !self.browse_only {
            let pre_ack = self.pre_ack.load(Ordering::Acquire);
            if !pre_ack {
                state.ledger.push_back(reference.clone());
            }

            reference.handled();
            reference.set_consumer_id(self.id);
            reference.increment_delivery_count();

            if self.strict_update_delivery_count
                && !reference.is_paged()
                && message.is_durable()
                && self.queue.is_durable()
                && !self.queue.is_internal()
            {
                self.storage.update_delivery_count(reference.as_ref())?;
            }

            // The deliverer pins the message, so in pre-ack mode the ack has
            // to come after it exists or the message could be gone early.
            if message.is_large() && self.support_large_message {
                state.deliverer = Some(LargeMessageDeliverer::new(
                    message.clone(),
                    reference.clone(),
                ));
            }

            if pre_ack {
                self.queue.acknowledge(reference.as_ref(), self.id)?;
                self.acks.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.pending.count_up();
        Ok(HandleStatus::Handled)
    }

    /// Emit a handled reference on the wire: a single packet for standard
    /// messages, or the first step of a chunked stream for large ones.
    pub fn proceed_deliver(&self, reference: Arc<dyn MessageReference>) -> Result<(), DeliveryError> {
        let result = self.deliver_reference(&reference);
        self.pending.count_down();
        self.callback.after_delivery();
        self.plugins.after_deliver(self.id, reference.as_ref());
        result
    }

    fn deliver_reference(&self, reference: &Arc<dyn MessageReference>) -> Result<(), DeliveryError> {
        let message = reference.message();

        audit::message_consumed(
            self.id,
            &self.queue.name(),
            reference.message_id(),
            &self.session.remote_address(),
        );
        self.plugins.before_deliver(self.id, reference.as_ref());

        if message.is_large() && self.support_large_message {
            let outcome = {
                let mut state = self.state.lock();
                let DispatchState {
                    started, deliverer, ..
                } = &mut *state;
                let Some(active) = deliverer.as_mut() else {
                    // handle() prepares the deliverer before anything can be
                    // proceeded; a missing one means the invariant broke.
                    return Err(DeliveryError::illegal_state(format!(
                        "no large message stream prepared for message {}",
                        reference.message_id()
                    )));
                };
                let env = StreamEnv {
                    started: *started,
                    consumer: self.id,
                    chunk_size: self.config.min_large_message_size,
                    credits: &self.credits,
                    callback: self.callback.as_ref(),
                    pending: &self.pending,
                };
                match active.deliver(&env) {
                    Ok(StreamStep::Yield) => StreamOutcome::Resume,
                    Ok(StreamStep::Blocked) => StreamOutcome::Stay,
                    Ok(StreamStep::Done) => {
                        *deliverer = None;
                        StreamOutcome::Stay
                    }
                    Err(error) => {
                        active.finish();
                        *deliverer = None;
                        return Err(error);
                    }
                }
            };
            match outcome {
                StreamOutcome::Resume => self.resume_large_message(),
                StreamOutcome::Kick => self.kick_queue(),
                StreamOutcome::Stay => {}
            }
            Ok(())
        } else {
            self.deliver_standard(reference.as_ref(), message.as_ref())
        }
    }

    fn deliver_standard(
        &self,
        reference: &dyn MessageReference,
        message: &dyn Message,
    ) -> Result<(), DeliveryError> {
        self.apply_legacy_prefix(message);
        let packet_size =
            self.callback
                .send_message(reference, message, self.id, reference.delivery_count())?;
        if let Some(balance) = self.credits.consume(packet_size) {
            tracing::trace!(
                consumer = self.id,
                packet_size,
                balance,
                "standard delivery debited credits"
            );
        }
        Ok(())
    }

    /// Ask for delivery to resume: restart a paused large-message stream, or
    /// kick the queue (or browser) to push more references.
    pub fn prompt_delivery(&self) {
        let streaming = self.state.lock().deliverer.is_some();
        if streaming {
            self.resume_large_message();
        } else {
            self.kick_queue();
        }
    }

    fn kick_queue(&self) {
        if self.browse_only {
            let weak = self.weak_self.clone();
            self.queue.executor().execute(Box::new(move || {
                if let Some(consumer) = weak.upgrade() {
                    consumer.run_browser();
                }
            }));
        } else {
            self.queue.deliver_async();
        }
    }

    fn resume_large_message(&self) {
        let weak = self.weak_self.clone();
        self.queue.executor().execute(Box::new(move || {
            if let Some(consumer) = weak.upgrade() {
                consumer.run_large_message_step();
            }
        }));
    }

    fn run_large_message_step(&self) {
        let outcome = {
            let mut state = self.state.lock();
            let DispatchState {
                started, deliverer, ..
            } = &mut *state;
            match deliverer.as_mut() {
                None => StreamOutcome::Kick,
                Some(active) => {
                    let env = StreamEnv {
                        started: *started,
                        consumer: self.id,
                        chunk_size: self.config.min_large_message_size,
                        credits: &self.credits,
                        callback: self.callback.as_ref(),
                        pending: &self.pending,
                    };
                    match active.deliver(&env) {
                        Ok(StreamStep::Yield) => StreamOutcome::Resume,
                        Ok(StreamStep::Blocked) => StreamOutcome::Stay,
                        Ok(StreamStep::Done) => {
                            *deliverer = None;
                            StreamOutcome::Kick
                        }
                        Err(error) => {
                            tracing::warn!(
                                consumer = self.id,
                                %error,
                                "large message delivery failed, resetting stream"
                            );
                            active.finish();
                            *deliverer = None;
                            StreamOutcome::Stay
                        }
                    }
                }
            }
        };
        match outcome {
            StreamOutcome::Resume => self.resume_large_message(),
            StreamOutcome::Kick => self.kick_queue(),
            StreamOutcome::Stay => {}
        }
    }

    pub(crate) fn run_browser(&self) {
        if let Some(browser) = &self.browser {
            browser.lock().run(self);
        }
    }

    /// Kick the queue and report whether the browse cursor is exhausted.
    pub fn is_browsed(&self) -> bool {
        self.queue.deliver_async();
        match &self.browser {
            Some(browser) => browser.lock().is_exhausted(),
            None => false,
        }
    }

    fn apply_legacy_prefix(&self, message: &dyn Message) {
        let Some(routing) = self.legacy_prefix else {
            return;
        };
        let prefix = match routing {
            RoutingKind::Anycast => OLD_QUEUE_PREFIX,
            RoutingKind::Multicast => OLD_TOPIC_PREFIX,
        };
        let address = message.address();
        if !address.starts_with(prefix) {
            message.set_address(format!("{prefix}{address}"));
        }
    }

    // Flow control
    // ----------------------------------------------------------------------

    /// Apply a client flow-control frame: `-1` disables the meter, `0`
    /// zeroes it (slow-consumer throttle), anything else grants bytes.
    pub fn receive_credits(&self, credits: i64) {
        if credits == -1 {
            tracing::debug!(consumer = self.id, "flow control disabled");
            self.credits.disable();
            // There may be messages already waiting in the queue.
            self.prompt_delivery();
        } else if credits == 0 {
            tracing::debug!(consumer = self.id, "flow control reset");
            self.credits.reset();
        } else {
            let event = self.credits.grant(credits as u64);
            tracing::debug!(
                consumer = self.id,
                credits,
                balance = ?self.credits.balance(),
                "credits received"
            );
            if event == CreditEvent::Resumed {
                self.prompt_delivery();
            }
        }
    }

    // Lifecycle
    // ----------------------------------------------------------------------

    pub fn start(&self) {
        self.set_started(true);
    }

    /// Stop taking references. Returns false when in-flight deliveries did
    /// not drain within the configured deadline.
    pub fn stop(&self) -> bool {
        self.set_started(false)
    }

    fn set_started(&self, started: bool) -> bool {
        {
            let mut state = self.state.lock();
            // Browse-only consumers are not started and stopped by the
            // session; they run until closed.
            state.started = self.browse_only || started;
        }
        if started {
            self.prompt_delivery();
            true
        } else {
            self.flush_delivery()
        }
    }

    fn flush_delivery(&self) -> bool {
        if !self.pending.wait_zero(self.config.flush_timeout()) {
            tracing::warn!(
                consumer = self.id,
                pending = self.pending.count(),
                remote = %self.session.remote_address(),
                "timed out flushing pending deliveries"
            );
            return false;
        }
        true
    }

    /// Flip the transferring flag. The on-edge waits for the queue executor
    /// to drain (forced deliveries already scheduled there) and then flushes
    /// pending sends; the off-edge prompts delivery.
    pub fn set_transferring(&self, transferring: bool) {
        {
            let mut state = self.state.lock();
            state.transferring = transferring;
        }

        if transferring {
            let barrier = CountLatch::new();
            barrier.count_up();
            let release = barrier.clone();
            self.queue.executor().execute(Box::new(move || {
                release.count_down();
            }));
            if !barrier.wait_zero(self.config.transfer_timeout()) {
                tracing::warn!(
                    consumer = self.id,
                    "timed out waiting on queue executor while transferring"
                );
            }
            self.flush_delivery();
        } else {
            self.prompt_delivery();
        }
    }

    // Acknowledgement lifecycle
    // ----------------------------------------------------------------------

    /// Acknowledge every in-flight reference up to and including
    /// `up_to_message_id`, in delivery order.
    ///
    /// With no transaction supplied, one is opened and committed (or rolled
    /// back on failure); a supplied transaction is marked rollback-only on
    /// failure so retried batches cannot ack references they should not.
    pub fn acknowledge(
        &self,
        tx: Option<&mut Transaction>,
        up_to_message_id: MessageId,
    ) -> Result<Vec<MessageId>, DeliveryError> {
        if self.browse_only {
            return Ok(Vec::new());
        }

        match tx {
            Some(tx) => {
                let result = self.acknowledge_in_tx(tx, up_to_message_id);
                if let Err(error) = &result {
                    tx.mark_rollback_only(error.to_string());
                }
                result
            }
            None => {
                let mut tx = Transaction::new();
                match self.acknowledge_in_tx(&mut tx, up_to_message_id) {
                    Ok(acked) => {
                        tx.commit()
                            .map_err(|error| DeliveryError::illegal_state(error.to_string()))?;
                        Ok(acked)
                    }
                    Err(error) => {
                        tx.rollback();
                        Err(error)
                    }
                }
            }
        }
    }

    fn acknowledge_in_tx(
        &self,
        tx: &mut Transaction,
        up_to_message_id: MessageId,
    ) -> Result<Vec<MessageId>, DeliveryError> {
        let mut acked = Vec::new();
        loop {
            let reference = self.state.lock().ledger.poll();
            let Some(reference) = reference else {
                return Err(DeliveryError::NoReference {
                    consumer: self.id,
                    message_id: up_to_message_id,
                    queue: self.queue.name(),
                });
            };

            tracing::trace!(
                consumer = self.id,
                message_id = reference.message_id(),
                "acknowledging reference"
            );
            reference.acknowledge(Some(tx), self.id)?;
            self.acks.fetch_add(1, Ordering::Relaxed);

            let message_id = reference.message_id();
            acked.push(message_id);
            if message_id == up_to_message_id {
                return Ok(acked);
            }
        }
    }

    /// Acknowledge exactly one in-flight reference, out of delivery order.
    pub fn individual_acknowledge(
        &self,
        tx: Option<&mut Transaction>,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        if self.browse_only {
            return Ok(());
        }

        match tx {
            Some(tx) => {
                let result = self.individual_acknowledge_in_tx(tx, message_id);
                if let Err(error) = &result {
                    tx.mark_rollback_only(error.to_string());
                }
                result
            }
            None => {
                let mut tx = Transaction::new();
                match self.individual_acknowledge_in_tx(&mut tx, message_id) {
                    Ok(()) => tx
                        .commit()
                        .map_err(|error| DeliveryError::illegal_state(error.to_string())),
                    Err(error) => {
                        tx.rollback();
                        Err(error)
                    }
                }
            }
        }
    }

    fn individual_acknowledge_in_tx(
        &self,
        tx: &mut Transaction,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        let Some(reference) = self.remove_reference_by_id(message_id) else {
            return Err(DeliveryError::NoReference {
                consumer: self.id,
                message_id,
                queue: self.queue.name(),
            });
        };
        reference.acknowledge(Some(tx), self.id)?;
        self.acks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return one reference to the queue as cancelled.
    ///
    /// Unlike `reject`, cancelling an unknown reference is an error: the
    /// caller claimed an in-flight reference that does not exist.
    pub fn individual_cancel(&self, message_id: MessageId, failed: bool) -> Result<(), DeliveryError> {
        if self.browse_only {
            return Ok(());
        }
        let Some(reference) = self.remove_reference_by_id(message_id) else {
            return Err(DeliveryError::illegal_state(format!(
                "cannot find in-flight reference {message_id} to cancel"
            )));
        };
        if !failed {
            reference.decrement_delivery_count();
        }
        let queue = reference.queue();
        queue.cancel(reference, self.clock.wall_millis())
    }

    /// Route one in-flight reference to the dead-letter sink.
    ///
    /// Silently succeeds when the reference is absent: retransmitting
    /// protocols may reject the same message twice.
    pub fn reject(&self, message_id: MessageId) -> Result<(), DeliveryError> {
        if self.browse_only {
            return Ok(());
        }
        let Some(reference) = self.remove_reference_by_id(message_id) else {
            return Ok(());
        };
        let queue = reference.queue();
        queue.send_to_dead_letter_address(reference)
    }

    /// Push a reference back at the head of the in-flight ledger after a
    /// protocol-level rollback, restoring acknowledge order.
    pub fn back_to_delivering(&self, reference: Arc<dyn MessageReference>) {
        self.state.lock().ledger.push_front(reference);
    }

    /// Remove one in-flight reference by id, if present.
    pub fn remove_reference_by_id(
        &self,
        message_id: MessageId,
    ) -> Option<Arc<dyn MessageReference>> {
        if self.browse_only {
            return None;
        }
        self.state.lock().ledger.remove_by_id(message_id)
    }

    /// Collect in-flight references in order from the first matching `start`
    /// through the one matching `end` (inclusive), optionally removing them.
    pub fn scan_delivering_references<F, G>(
        &self,
        remove: bool,
        start: F,
        end: G,
    ) -> Vec<Arc<dyn MessageReference>>
    where
        F: FnMut(&dyn MessageReference) -> bool,
        G: FnMut(&dyn MessageReference) -> bool,
    {
        self.state.lock().ledger.scan(remove, start, end)
    }

    /// In-flight references plus those parked in the session's client
    /// transactions for this consumer.
    pub fn delivering_messages(&self) -> Vec<Arc<dyn MessageReference>> {
        let state = self.state.lock();
        let mut refs = self.session.in_tx_references_for(self.id);
        refs.extend(state.ledger.snapshot());
        refs
    }

    /// Drain the in-flight ledger for redelivery, finishing any active
    /// large-message stream first.
    ///
    /// When `last_consumed_as_delivered` is set, the head reference is
    /// acknowledged to `tx` instead of drained. Non-failed cancels get the
    /// default delivery-count decrement unless the wire callback takes
    /// responsibility.
    pub fn cancel_refs(
        &self,
        failed: bool,
        last_consumed_as_delivered: bool,
        mut tx: Option<&mut Transaction>,
    ) -> Result<Vec<Arc<dyn MessageReference>>, DeliveryError> {
        self.finish_large_message();

        let mut perform_ack = last_consumed_as_delivered;
        let mut state = self.state.lock();
        if state.ledger.is_empty() {
            return Ok(Vec::new());
        }

        let mut refs = Vec::with_capacity(state.ledger.len());
        while let Some(reference) = state.ledger.poll() {
            tracing::trace!(
                consumer = self.id,
                message_id = reference.message_id(),
                "preparing reference for cancellation"
            );
            if perform_ack {
                reference.acknowledge(tx.as_deref_mut(), self.id)?;
                self.acks.fetch_add(1, Ordering::Relaxed);
                perform_ack = false;
            } else {
                self.update_delivery_count_for_cancelled(&reference, failed);
                refs.push(reference);
            }
        }
        Ok(refs)
    }

    fn update_delivery_count_for_cancelled(
        &self,
        reference: &Arc<dyn MessageReference>,
        failed: bool,
    ) {
        if self
            .callback
            .update_delivery_count_after_cancel(self.id, reference.as_ref(), failed)
        {
            return;
        }
        // On a failed client the refs may have been delivered without the
        // acks reaching us; the count stays put in that case.
        if !failed {
            reference.decrement_delivery_count();
        }
    }

    fn finish_large_message(&self) {
        let deliverer = self.state.lock().deliverer.take();
        if let Some(mut deliverer) = deliverer {
            tracing::debug!(
                consumer = self.id,
                message_id = deliverer.reference().message_id(),
                "resetting large message stream"
            );
            deliverer.finish();
        }
    }

    // Forced delivery
    // ----------------------------------------------------------------------

    /// Emit a synthetic probe message carrying `sequence` once every
    /// delivery already scheduled on the queue executor has been written.
    /// The client uses it to detect that the queue is drained.
    pub fn force_delivery(&self, sequence: u64) {
        self.prompt_delivery();
        self.schedule_forced_delivery(sequence);
    }

    fn schedule_forced_delivery(&self, sequence: u64) {
        let weak = self.weak_self.clone();
        // The executor is the single writer for this queue, so the probe
        // lands after any in-flight deliveries already scheduled there.
        self.queue.executor().execute(Box::new(move || {
            let Some(consumer) = weak.upgrade() else {
                return;
            };
            if consumer.state.lock().transferring {
                // Reattach in progress; retry once it clears.
                consumer.schedule_forced_delivery(sequence);
                return;
            }
            if let Err(error) = consumer.emit_forced_delivery(sequence) {
                tracing::warn!(
                    consumer = consumer.id,
                    sequence,
                    %error,
                    "failed sending forced delivery"
                );
            }
        }));
    }

    fn emit_forced_delivery(&self, sequence: u64) -> Result<(), DeliveryError> {
        let message: Arc<dyn Message> = Arc::new(ForcedDeliveryMessage::new(
            self.storage.generate_id(),
            self.queue.name(),
            sequence,
        ));
        self.apply_legacy_prefix(message.as_ref());
        let reference = ForcedDeliveryReference {
            message: message.clone(),
            queue: self.queue.clone(),
        };
        self.callback
            .send_message(&reference, message.as_ref(), self.id, 0)?;
        Ok(())
    }

    // Close
    // ----------------------------------------------------------------------

    /// Tear the consumer down. Idempotent; every step is best-effort so a
    /// failing collaborator cannot leave the consumer half-closed.
    pub fn close(&self, failed: bool) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;

        tracing::debug!(consumer = self.id, failed, "closing consumer");
        self.plugins.before_close_consumer(self.id, failed);

        self.set_started(false);
        self.finish_large_message();
        self.remove_itself();

        let refs = match self.cancel_refs(failed, false, None) {
            Ok(refs) => refs,
            Err(error) => {
                tracing::warn!(consumer = self.id, %error, "failed draining in-flight references");
                Vec::new()
            }
        };

        // cancel() does its work during rollback; the transaction is a
        // cancellation context, not a unit of commit.
        let mut tx = Transaction::new();
        for reference in refs {
            tracing::trace!(
                consumer = self.id,
                message_id = reference.message_id(),
                "cancelling reference"
            );
            let queue = reference.queue();
            queue.cancel_in_tx(&mut tx, reference, true);
        }
        tx.rollback();

        self.add_linger_refs();

        // The notification goes first so cluster peers observe the closure
        // before a ref-count recheck can remove the queue.
        if !self.browse_only {
            self.notifications
                .send(Notification::ConsumerClosed(ConsumerClosedNotification {
                    address: self.binding.address.clone(),
                    cluster_name: self.binding.cluster_name.clone(),
                    routing_name: self.binding.routing_name.clone(),
                    filter: self.filter_string(),
                    distance: self.binding.distance,
                    consumer_count: self.queue.consumer_count(),
                    user: self.session.username(),
                    remote_address: self.session.remote_address(),
                    session_name: self.session.name(),
                }));
        }
        self.queue.recheck_ref_count();

        self.plugins.after_close_consumer(self.id, failed);
    }

    fn remove_itself(&self) {
        if let Some(browser) = &self.browser {
            browser.lock().close();
        } else {
            self.queue.remove_consumer(self.id);
        }
        self.session.remove_consumer(self.id);
    }

    fn add_linger_refs(&self) {
        if self.browse_only {
            return;
        }
        if !self.session.in_tx_references_for(self.id).is_empty() {
            self.session.add_linger_consumer(self.id);
        }
    }

    /// Drop the client connection for this consumer's queue.
    pub fn disconnect(&self) {
        self.callback.disconnect(self.id, &self.queue.name());
    }

    /// Report a delivery failure back to the queue.
    pub fn error_processing(&self, error: &DeliveryError, reference: &dyn MessageReference) {
        self.queue.error_processing(self.id, error, reference);
    }

    // Gauges
    // ----------------------------------------------------------------------

    pub fn acks(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    /// Remaining credit balance; `None` when flow control is disabled.
    pub fn available_credits(&self) -> Option<i64> {
        self.credits.balance()
    }

    /// Messages per second since the previous poll, rounded up to two
    /// decimals.
    pub fn rate(&self) -> f32 {
        self.rate
            .sample(self.acks.load(Ordering::Relaxed), self.clock.wall_millis())
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            id: self.id,
            queue: self.queue.name(),
            acks: self.acks(),
            rate: self.rate(),
            created_at_millis: self.created_at_millis,
            delivering: self
                .delivering_messages()
                .iter()
                .map(|reference| reference.message_id())
                .collect(),
        }
    }
}

impl<C: Clock> fmt::Display for ServerConsumer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerConsumer [id={}, queue={}, filter={}]",
            self.id,
            self.queue.name(),
            self.filter_string().unwrap_or_default()
        )
    }
}

/// Probe message synthesised for forced delivery.
struct ForcedDeliveryMessage {
    id: MessageId,
    address: Mutex<String>,
    sequence: u64,
}

impl ForcedDeliveryMessage {
    fn new(id: MessageId, address: String, sequence: u64) -> Self {
        Self {
            id,
            address: Mutex::new(address),
            sequence,
        }
    }
}

impl Message for ForcedDeliveryMessage {
    fn id(&self) -> MessageId {
        self.id
    }

    fn address(&self) -> String {
        self.address.lock().clone()
    }

    fn set_address(&self, address: String) {
        *self.address.lock() = address;
    }

    fn encoded_size(&self) -> u64 {
        0
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn is_large(&self) -> bool {
        false
    }

    fn long_property(&self, name: &str) -> Option<u64> {
        (name == FORCED_DELIVERY_PROPERTY).then_some(self.sequence)
    }
}

struct ForcedDeliveryReference {
    message: Arc<dyn Message>,
    queue: Arc<dyn DeliveryQueue>,
}

impl MessageReference for ForcedDeliveryReference {
    fn message(&self) -> Arc<dyn Message> {
        self.message.clone()
    }

    fn delivery_count(&self) -> u32 {
        0
    }

    fn increment_delivery_count(&self) {}

    fn decrement_delivery_count(&self) {}

    fn queue(&self) -> Arc<dyn DeliveryQueue> {
        self.queue.clone()
    }

    fn acknowledge(
        &self,
        _tx: Option<&mut Transaction>,
        _consumer: ConsumerId,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}
