#![allow(dead_code)]

//! Shared in-memory collaborator doubles for the delivery engine suites.

use parking_lot::Mutex;
use photon::config::DeliveryConfig;
use photon::delivery::DeliveryError;
use photon::executor::{ManualExecutor, QueueExecutor};
use photon::messaging::transaction::{Transaction, TxOperation};
use photon::notifications::{Notification, NotificationSink};
use photon::spi::{
    ConsumerId, DeliveryPlugin, DeliveryQueue, LargeBodyReader, Message, MessageFilter, MessageId,
    MessageReference, PluginRegistry, QueueBinding, RoutingKind, SessionCallback, SessionHandle,
    StorageManager,
};
use photon::spi::message::FORCED_DELIVERY_PROPERTY;
use photon::time::ManualClock;
use photon::{Collaborators, ConsumerSpec, ServerConsumer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Messages and references
// ---------------------------------------------------------------------------

pub struct TestMessage {
    id: MessageId,
    address: Mutex<String>,
    size: u64,
    durable: bool,
    body: Option<Vec<u8>>,
    reader_fails: bool,
    usage: AtomicI64,
}

impl TestMessage {
    pub fn standard(id: MessageId, size: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            address: Mutex::new("orders".to_string()),
            size,
            durable: false,
            body: None,
            reader_fails: false,
            usage: AtomicI64::new(0),
        })
    }

    pub fn large(id: MessageId, body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            address: Mutex::new("orders".to_string()),
            size: body.len() as u64,
            durable: false,
            body: Some(body),
            reader_fails: false,
            usage: AtomicI64::new(0),
        })
    }

    pub fn large_with_failing_reader(id: MessageId, body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            address: Mutex::new("orders".to_string()),
            size: body.len() as u64,
            durable: false,
            body: Some(body),
            reader_fails: true,
            usage: AtomicI64::new(0),
        })
    }

    pub fn durable(id: MessageId, size: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            address: Mutex::new("orders".to_string()),
            size,
            durable: true,
            body: None,
            reader_fails: false,
            usage: AtomicI64::new(0),
        })
    }

    pub fn with_address(self: &Arc<Self>, address: &str) -> Arc<Self> {
        *self.address.lock() = address.to_string();
        self.clone()
    }

    pub fn usage(&self) -> i64 {
        self.usage.load(Ordering::SeqCst)
    }
}

impl Message for TestMessage {
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
        self.size
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    fn is_large(&self) -> bool {
        self.body.is_some()
    }

    fn usage_up(&self) {
        self.usage.fetch_add(1, Ordering::SeqCst);
    }

    fn usage_down(&self) {
        self.usage.fetch_sub(1, Ordering::SeqCst);
    }

    fn large_body(&self) -> Result<Box<dyn LargeBodyReader>, DeliveryError> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| DeliveryError::streamer("message has no large body"))?;
        Ok(Box::new(VecBodyReader {
            data: body,
            position: 0,
            fails: self.reader_fails,
        }))
    }
}

struct VecBodyReader {
    data: Vec<u8>,
    position: usize,
    fails: bool,
}

impl LargeBodyReader for VecBodyReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, DeliveryError> {
        if self.fails {
            return Err(DeliveryError::streamer("disk read failed"));
        }
        let remaining = &self.data[self.position..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        self.position += len;
        Ok(len)
    }

    fn close(&mut self) {}
}

pub struct TestRef {
    message: Arc<TestMessage>,
    queue: Arc<TestQueue>,
    delivery_count: AtomicU32,
    consumer_id: AtomicU64,
    handled: AtomicBool,
    paged: bool,
}

impl TestRef {
    pub fn new(message: Arc<TestMessage>, queue: Arc<TestQueue>) -> Arc<Self> {
        Arc::new(Self {
            message,
            queue,
            delivery_count: AtomicU32::new(0),
            consumer_id: AtomicU64::new(0),
            handled: AtomicBool::new(false),
            paged: false,
        })
    }

    pub fn delivery_count_value(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    pub fn was_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer_id.load(Ordering::SeqCst)
    }
}

struct AckOnCommit {
    acked: Arc<Mutex<Vec<MessageId>>>,
    message_id: MessageId,
}

impl TxOperation for AckOnCommit {
    fn after_commit(&mut self) {
        self.acked.lock().push(self.message_id);
    }
}

impl MessageReference for TestRef {
    fn message(&self) -> Arc<dyn Message> {
        self.message.clone()
    }

    fn message_id(&self) -> MessageId {
        self.message.id
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    fn increment_delivery_count(&self) {
        self.delivery_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_delivery_count(&self) {
        self.delivery_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn handled(&self) {
        self.handled.store(true, Ordering::SeqCst);
    }

    fn set_consumer_id(&self, consumer: ConsumerId) {
        self.consumer_id.store(consumer, Ordering::SeqCst);
    }

    fn is_paged(&self) -> bool {
        self.paged
    }

    fn queue(&self) -> Arc<dyn DeliveryQueue> {
        self.queue.clone()
    }

    fn acknowledge(
        &self,
        tx: Option<&mut Transaction>,
        _consumer: ConsumerId,
    ) -> Result<(), DeliveryError> {
        match tx {
            Some(tx) => tx.add_operation(Box::new(AckOnCommit {
                acked: self.queue.acked.clone(),
                message_id: self.message.id,
            })),
            None => self.queue.acked.lock().push(self.message.id),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct TestQueue {
    pub queue_name: String,
    pub durable: bool,
    pub internal: bool,
    pub executor: Arc<ManualExecutor>,
    pub consumers: Mutex<Vec<ConsumerId>>,
    pub removed: Mutex<Vec<ConsumerId>>,
    pub deliver_async_calls: AtomicU64,
    pub acked: Arc<Mutex<Vec<MessageId>>>,
    pub cancelled: Mutex<Vec<(MessageId, u64)>>,
    pub tx_cancelled: Arc<Mutex<Vec<(MessageId, bool)>>>,
    pub dead_lettered: Mutex<Vec<MessageId>>,
    pub recheck_calls: AtomicU64,
    pub browse: Mutex<Vec<Arc<dyn MessageReference>>>,
}

impl TestQueue {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            queue_name: name.to_string(),
            durable: true,
            internal: false,
            executor: Arc::new(ManualExecutor::new()),
            consumers: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            deliver_async_calls: AtomicU64::new(0),
            acked: Arc::new(Mutex::new(Vec::new())),
            cancelled: Mutex::new(Vec::new()),
            tx_cancelled: Arc::new(Mutex::new(Vec::new())),
            dead_lettered: Mutex::new(Vec::new()),
            recheck_calls: AtomicU64::new(0),
            browse: Mutex::new(Vec::new()),
        })
    }

    pub fn seed_browse(&self, refs: Vec<Arc<dyn MessageReference>>) {
        *self.browse.lock() = refs;
    }

    pub fn deliver_async_count(&self) -> u64 {
        self.deliver_async_calls.load(Ordering::SeqCst)
    }
}

struct CancelOnRollback {
    cancelled: Arc<Mutex<Vec<(MessageId, bool)>>>,
    message_id: MessageId,
    expire: bool,
}

impl TxOperation for CancelOnRollback {
    fn after_rollback(&mut self) {
        self.cancelled.lock().push((self.message_id, self.expire));
    }
}

impl DeliveryQueue for TestQueue {
    fn name(&self) -> String {
        self.queue_name.clone()
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    fn add_consumer(&self, consumer: ConsumerId) {
        self.consumers.lock().push(consumer);
    }

    fn remove_consumer(&self, consumer: ConsumerId) {
        self.consumers.lock().retain(|&id| id != consumer);
        self.removed.lock().push(consumer);
    }

    fn browser_iterator(&self) -> Box<dyn Iterator<Item = Arc<dyn MessageReference>> + Send> {
        Box::new(self.browse.lock().clone().into_iter())
    }

    fn deliver_async(&self) {
        self.deliver_async_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn executor(&self) -> Arc<dyn QueueExecutor> {
        self.executor.clone()
    }

    fn acknowledge(
        &self,
        reference: &dyn MessageReference,
        _consumer: ConsumerId,
    ) -> Result<(), DeliveryError> {
        self.acked.lock().push(reference.message_id());
        Ok(())
    }

    fn cancel_in_tx(
        &self,
        tx: &mut Transaction,
        reference: Arc<dyn MessageReference>,
        expire: bool,
    ) {
        tx.add_operation(Box::new(CancelOnRollback {
            cancelled: self.tx_cancelled.clone(),
            message_id: reference.message_id(),
            expire,
        }));
    }

    fn cancel(
        &self,
        reference: Arc<dyn MessageReference>,
        timestamp_millis: u64,
    ) -> Result<(), DeliveryError> {
        self.cancelled
            .lock()
            .push((reference.message_id(), timestamp_millis));
        Ok(())
    }

    fn send_to_dead_letter_address(
        &self,
        reference: Arc<dyn MessageReference>,
    ) -> Result<(), DeliveryError> {
        self.dead_lettered.lock().push(reference.message_id());
        Ok(())
    }

    fn recheck_ref_count(&self) {
        self.recheck_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct TestSession {
    pub session_name: String,
    pub user: String,
    pub remote: String,
    pub connection: String,
    pub meta: Mutex<HashMap<String, String>>,
    pub version: i32,
    pub in_tx: Mutex<HashMap<ConsumerId, Vec<Arc<dyn MessageReference>>>>,
    pub lingerers: Mutex<Vec<ConsumerId>>,
    pub removed: Mutex<Vec<ConsumerId>>,
}

impl TestSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session_name: "session-1".to_string(),
            user: "app".to_string(),
            remote: "10.0.0.7:5432".to_string(),
            connection: "conn-1".to_string(),
            meta: Mutex::new(HashMap::new()),
            version: 200,
            in_tx: Mutex::new(HashMap::new()),
            lingerers: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn legacy_jms(version: i32) -> Arc<Self> {
        let mut meta = HashMap::new();
        meta.insert("jms-session".to_string(), "1".to_string());
        Arc::new(Self {
            session_name: "session-1".to_string(),
            user: "app".to_string(),
            remote: "10.0.0.7:5432".to_string(),
            connection: "conn-1".to_string(),
            meta: Mutex::new(meta),
            version,
            in_tx: Mutex::new(HashMap::new()),
            lingerers: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }
}

impl SessionHandle for TestSession {
    fn name(&self) -> String {
        self.session_name.clone()
    }

    fn connection_id(&self) -> String {
        self.connection.clone()
    }

    fn username(&self) -> String {
        self.user.clone()
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn metadata(&self, key: &str) -> Option<String> {
        self.meta.lock().get(key).cloned()
    }

    fn channel_version(&self) -> i32 {
        self.version
    }

    fn in_tx_references_for(&self, consumer: ConsumerId) -> Vec<Arc<dyn MessageReference>> {
        self.in_tx.lock().get(&consumer).cloned().unwrap_or_default()
    }

    fn add_linger_consumer(&self, consumer: ConsumerId) {
        self.lingerers.lock().push(consumer);
    }

    fn remove_consumer(&self, consumer: ConsumerId) {
        self.removed.lock().push(consumer);
    }
}

// ---------------------------------------------------------------------------
// Wire callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Standard {
        message_id: MessageId,
        address: String,
        delivery_count: u32,
        packet_size: u64,
        forced_sequence: Option<u64>,
    },
    LargeHeader {
        message_id: MessageId,
        total_size: u64,
        packet_size: u64,
    },
    Continuation {
        len: usize,
        has_more: bool,
        packet_size: u64,
    },
}

pub struct TestCallback {
    pub writable: AtomicBool,
    pub protocol_credits: AtomicBool,
    pub fail_sends: AtomicBool,
    pub handles_cancel_count: AtomicBool,
    pub overhead: u64,
    pub sent: Mutex<Vec<Sent>>,
    pub after_delivery_calls: AtomicU64,
    pub browser_finished_calls: AtomicU64,
    pub disconnects: Mutex<Vec<(ConsumerId, String)>>,
}

impl TestCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writable: AtomicBool::new(true),
            protocol_credits: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            handles_cancel_count: AtomicBool::new(false),
            overhead: 5,
            sent: Mutex::new(Vec::new()),
            after_delivery_calls: AtomicU64::new(0),
            browser_finished_calls: AtomicU64::new(0),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn sent_packets(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn standard_ids(&self) -> Vec<MessageId> {
        self.sent
            .lock()
            .iter()
            .filter_map(|packet| match packet {
                Sent::Standard { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    pub fn continuations(&self) -> Vec<(usize, bool)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|packet| match packet {
                Sent::Continuation { len, has_more, .. } => Some((*len, *has_more)),
                _ => None,
            })
            .collect()
    }
}

impl SessionCallback for TestCallback {
    fn has_credits(&self, _consumer: ConsumerId, _reference: &dyn MessageReference) -> bool {
        self.protocol_credits.load(Ordering::SeqCst)
    }

    fn is_writable(
        &self,
        _consumer: ConsumerId,
        _context: Option<&photon::spi::ProtocolContext>,
    ) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn send_message(
        &self,
        reference: &dyn MessageReference,
        message: &dyn Message,
        _consumer: ConsumerId,
        delivery_count: u32,
    ) -> Result<u64, DeliveryError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeliveryError::transport("connection reset"));
        }
        let packet_size = message.encoded_size() + self.overhead;
        self.sent.lock().push(Sent::Standard {
            message_id: reference.message_id(),
            address: message.address(),
            delivery_count,
            packet_size,
            forced_sequence: message.long_property(FORCED_DELIVERY_PROPERTY),
        });
        Ok(packet_size)
    }

    fn send_large_message(
        &self,
        reference: &dyn MessageReference,
        _message: &dyn Message,
        _consumer: ConsumerId,
        total_size: u64,
        _delivery_count: u32,
    ) -> Result<u64, DeliveryError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeliveryError::transport("connection reset"));
        }
        let packet_size = self.overhead;
        self.sent.lock().push(Sent::LargeHeader {
            message_id: reference.message_id(),
            total_size,
            packet_size,
        });
        Ok(packet_size)
    }

    fn send_large_message_continuation(
        &self,
        _consumer: ConsumerId,
        body: &[u8],
        has_more: bool,
        _requires_response: bool,
    ) -> Result<u64, DeliveryError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DeliveryError::transport("connection reset"));
        }
        let packet_size = body.len() as u64 + self.overhead;
        self.sent.lock().push(Sent::Continuation {
            len: body.len(),
            has_more,
            packet_size,
        });
        Ok(packet_size)
    }

    fn update_delivery_count_after_cancel(
        &self,
        _consumer: ConsumerId,
        _reference: &dyn MessageReference,
        _failed: bool,
    ) -> bool {
        self.handles_cancel_count.load(Ordering::SeqCst)
    }

    fn after_delivery(&self) {
        self.after_delivery_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self, consumer: ConsumerId, queue_name: &str) {
        self.disconnects
            .lock()
            .push((consumer, queue_name.to_string()));
    }

    fn browser_finished(&self, _consumer: ConsumerId) {
        self.browser_finished_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Storage, plugins, notifications
// ---------------------------------------------------------------------------

pub struct TestStorage {
    next_id: AtomicU64,
    pub delivery_count_updates: Mutex<Vec<MessageId>>,
}

impl TestStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1_000),
            delivery_count_updates: Mutex::new(Vec::new()),
        })
    }
}

impl StorageManager for TestStorage {
    fn generate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn update_delivery_count(&self, reference: &dyn MessageReference) -> Result<(), DeliveryError> {
        self.delivery_count_updates
            .lock()
            .push(reference.message_id());
        Ok(())
    }
}

pub struct TestPlugin {
    pub accept: AtomicBool,
    pub before_deliver_calls: AtomicU64,
    pub after_deliver_calls: AtomicU64,
    pub before_close_calls: AtomicU64,
    pub after_close_calls: AtomicU64,
}

impl TestPlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accept: AtomicBool::new(true),
            before_deliver_calls: AtomicU64::new(0),
            after_deliver_calls: AtomicU64::new(0),
            before_close_calls: AtomicU64::new(0),
            after_close_calls: AtomicU64::new(0),
        })
    }
}

impl DeliveryPlugin for TestPlugin {
    fn can_accept(&self, _consumer: ConsumerId, _reference: &dyn MessageReference) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn before_deliver(&self, _consumer: ConsumerId, _reference: &dyn MessageReference) {
        self.before_deliver_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn after_deliver(&self, _consumer: ConsumerId, _reference: &dyn MessageReference) {
        self.after_deliver_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn before_close_consumer(&self, _consumer: ConsumerId, _failed: bool) {
        self.before_close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn after_close_consumer(&self, _consumer: ConsumerId, _failed: bool) {
        self.after_close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    pub notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifications {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().len()
    }
}

impl NotificationSink for RecordingNotifications {
    fn send(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

/// Address-equality filter.
pub struct AddressFilter {
    pub address: String,
}

impl MessageFilter for AddressFilter {
    fn matches(&self, message: &dyn Message) -> bool {
        message.address() == self.address
    }

    fn filter_string(&self) -> String {
        format!("address = '{}'", self.address)
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

/// One consumer's worth of wired-together doubles.
pub struct Rig {
    pub queue: Arc<TestQueue>,
    pub session: Arc<TestSession>,
    pub callback: Arc<TestCallback>,
    pub storage: Arc<TestStorage>,
    pub notifications: Arc<RecordingNotifications>,
    pub clock: ManualClock,
    pub config: DeliveryConfig,
    pub plugins: PluginRegistry,
    pub binding: QueueBinding,
}

/// Route engine logs through the test writer when RUST_LOG asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Rig {
    pub fn new() -> Self {
        init_tracing();
        Self {
            queue: TestQueue::new("orders"),
            session: TestSession::new(),
            callback: TestCallback::new(),
            storage: TestStorage::new(),
            notifications: RecordingNotifications::new(),
            clock: ManualClock::new(1_700_000_000_000),
            config: DeliveryConfig {
                min_large_message_size: 4_096,
                flush_timeout_millis: 500,
                transfer_timeout_millis: 50,
                default_consumer_priority: 0,
            },
            plugins: PluginRegistry::new(),
            binding: QueueBinding {
                address: "orders".to_string(),
                cluster_name: "orders-cluster".to_string(),
                routing_name: "orders".to_string(),
                distance: 0,
                routing: RoutingKind::Anycast,
            },
        }
    }

    pub fn build(&self, spec: ConsumerSpec) -> Arc<ServerConsumer<ManualClock>> {
        ServerConsumer::new(
            spec,
            Collaborators {
                queue: self.queue.clone(),
                binding: self.binding.clone(),
                session: self.session.clone(),
                callback: self.callback.clone(),
                storage: self.storage.clone(),
                plugins: self.plugins.clone(),
                notifications: self.notifications.clone(),
                config: self.config.clone(),
                clock: self.clock.clone(),
            },
        )
    }

    /// A standard message reference sitting on this rig's queue.
    pub fn reference(&self, id: MessageId, size: u64) -> Arc<TestRef> {
        TestRef::new(TestMessage::standard(id, size), self.queue.clone())
    }

    pub fn large_reference(&self, id: MessageId, body_len: usize) -> Arc<TestRef> {
        TestRef::new(TestMessage::large(id, vec![7u8; body_len]), self.queue.clone())
    }
}

pub fn spec(id: ConsumerId) -> ConsumerSpec {
    ConsumerSpec {
        id,
        ..ConsumerSpec::default()
    }
}

pub fn spec_with_credits(id: ConsumerId, credits: i64) -> ConsumerSpec {
    ConsumerSpec {
        id,
        credits: Some(credits),
        ..ConsumerSpec::default()
    }
}

/// Sequential id helper for tests asserting delivery order.
pub fn sent_order(callback: &TestCallback) -> Vec<MessageId> {
    callback.standard_ids()
}
