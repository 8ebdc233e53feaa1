use crate::core::latch::CountLatch;
use crate::delivery::DeliveryError;
use crate::messaging::credit::CreditMeter;
use crate::spi::callback::SessionCallback;
use crate::spi::message::{ConsumerId, LargeBodyReader, Message, MessageReference};
use bytes::BytesMut;
use std::sync::Arc;

/// What the consumer should do after one delivery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamStep {
    /// More body remains and credit allows it; reschedule on the queue
    /// executor.
    Yield,
    /// Stopped or out of credit; the next prompt resumes the stream.
    Blocked,
    /// The whole body went out and the stream released its resources.
    Done,
}

/// Everything a delivery step reads from the owning consumer. `started` is
/// sampled under the consumer lock by the caller.
pub(crate) struct StreamEnv<'a> {
    pub started: bool,
    pub consumer: ConsumerId,
    pub chunk_size: u64,
    pub credits: &'a CreditMeter,
    pub callback: &'a dyn SessionCallback,
    pub pending: &'a CountLatch,
}

/// Chunked delivery state machine for one oversized payload.
///
/// A large message goes out as a header packet followed by continuation
/// chunks of at most `chunk_size` bytes. The state machine is resumed by
/// task re-submission on the queue executor rather than awaited, so the
/// executor stays the single writer for the queue.
///
/// Construction pins the message (`usage_up`); `finish` releases the reader
/// and unpins it, and is idempotent because the delivery path and close race
/// to call it.
pub(crate) struct LargeMessageDeliverer {
    message: Option<Arc<dyn Message>>,
    reference: Arc<dyn MessageReference>,
    reader: Option<Box<dyn LargeBodyReader>>,
    total_size: u64,
    position: u64,
    sent_initial: bool,
    chunk: Option<BytesMut>,
}

impl LargeMessageDeliverer {
    pub fn new(message: Arc<dyn Message>, reference: Arc<dyn MessageReference>) -> Self {
        message.usage_up();
        Self {
            message: Some(message),
            reference,
            reader: None,
            total_size: 0,
            position: 0,
            sent_initial: false,
            chunk: None,
        }
    }

    pub fn reference(&self) -> &Arc<dyn MessageReference> {
        &self.reference
    }

    /// Run one step of the stream. Counts against the pending-delivery latch
    /// for its duration so `stop` flushes cover in-flight chunks.
    pub fn deliver(&mut self, env: &StreamEnv<'_>) -> Result<StreamStep, DeliveryError> {
        env.pending.count_up();
        let step = self.step(env);
        env.pending.count_down();
        step
    }

    fn step(&mut self, env: &StreamEnv<'_>) -> Result<StreamStep, DeliveryError> {
        if !env.started {
            return Ok(StreamStep::Blocked);
        }
        let Some(message) = self.message.clone() else {
            return Ok(StreamStep::Done);
        };
        if !env.credits.try_reserve() {
            tracing::trace!(
                consumer = env.consumer,
                balance = ?env.credits.balance(),
                "large message stream paused for credits"
            );
            self.chunk = None;
            return Ok(StreamStep::Blocked);
        }

        if !self.sent_initial {
            let reader = message.large_body()?;
            self.total_size = reader.size();
            self.reader = Some(reader);
            self.sent_initial = true;

            let packet_size = env.callback.send_large_message(
                self.reference.as_ref(),
                message.as_ref(),
                env.consumer,
                self.total_size,
                self.reference.delivery_count(),
            )?;
            self.debit(env, packet_size);
            tracing::trace!(
                consumer = env.consumer,
                packet_size,
                total_size = self.total_size,
                "large message header delivered"
            );
            return Ok(StreamStep::Yield);
        }

        let chunk_len = (self.total_size - self.position).min(env.chunk_size) as usize;
        let has_more = self.position + (chunk_len as u64) < self.total_size;
        let buffer = self.chunk.get_or_insert_with(BytesMut::new);
        buffer.clear();
        buffer.resize(chunk_len, 0);
        read_exact(self.reader.as_deref_mut(), &mut buffer[..])?;

        let packet_size =
            env.callback
                .send_large_message_continuation(env.consumer, &buffer[..], has_more, false)?;
        self.debit(env, packet_size);
        self.position += chunk_len as u64;
        tracing::trace!(
            consumer = env.consumer,
            packet_size,
            position = self.position,
            has_more,
            "large message continuation delivered"
        );

        if self.position < self.total_size {
            Ok(StreamStep::Yield)
        } else {
            self.finish();
            Ok(StreamStep::Done)
        }
    }

    fn debit(&mut self, env: &StreamEnv<'_>, packet_size: u64) {
        if let Some(balance) = env.credits.consume(packet_size) {
            if balance <= 0 {
                self.chunk = None;
            }
        }
    }

    /// Release the reader, the chunk buffer, and the message pin. Safe to
    /// call from both the delivery path and close; later calls are no-ops.
    pub fn finish(&mut self) {
        self.chunk = None;
        let Some(message) = self.message.take() else {
            return;
        };
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        message.usage_down();
    }
}

impl Drop for LargeMessageDeliverer {
    fn drop(&mut self) {
        self.finish();
    }
}

fn read_exact(
    reader: Option<&mut (dyn LargeBodyReader + '_)>,
    buf: &mut [u8],
) -> Result<(), DeliveryError> {
    let reader =
        reader.ok_or_else(|| DeliveryError::streamer("stream has no open body reader"))?;
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read_into(&mut buf[filled..])?;
        if read == 0 {
            return Err(DeliveryError::streamer(format!(
                "body reader ended early: {filled} of {} bytes",
                buf.len()
            )));
        }
        filled += read;
    }
    Ok(())
}
