use crate::{
    consumer::{ConsumerPipeline, ConsumerSpec},
    headers::Headers,
    pending::PendingRequests,
    producer::ProducerSpec,
    serializer::{Payload, Serializer},
    BusResult,
    DynMessage,
};
use async_trait::async_trait;
use dyn_clonable::clonable;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The unit exchanged with a transport: headers plus payload
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Message headers
    pub headers: Headers,
    /// Payload bytes, or the loopback sentinel
    pub payload: Payload,
}

/// Outgoing message state flowing through the producer interceptor chain into
/// a transport
pub struct ProduceRequest {
    /// The erased message value
    pub message: DynMessage,
    /// Wire name of the message type
    pub message_type: &'static str,
    /// Destination path
    pub path: String,
    /// Composed headers
    pub headers: Headers,
    /// Serialized payload, or the loopback sentinel
    pub payload: Payload,
    /// Caller cancellation, best-effort once the transport took over
    pub cancel: CancellationToken,
}

impl ProduceRequest {
    /// The headers and payload as they would cross a wire
    pub fn envelope(&self) -> Envelope {
        Envelope {
            headers: self.headers.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Bus-side collaborators handed to a transport when the bus starts
#[derive(Clone)]
pub struct TransportContext {
    pipeline: Arc<ConsumerPipeline>,
    pending: Arc<PendingRequests>,
    reply_path: String,
}

impl TransportContext {
    pub(crate) fn new(
        pipeline: Arc<ConsumerPipeline>,
        pending: Arc<PendingRequests>,
        reply_path: String,
    ) -> Self {
        Self {
            pipeline,
            pending,
            reply_path,
        }
    }

    /// Consumer pipeline configured for this transport
    pub fn pipeline(&self) -> &Arc<ConsumerPipeline> {
        &self.pipeline
    }

    /// Bus-scoped address replies should be produced to
    pub fn reply_path(&self) -> &str {
        &self.reply_path
    }

    /// Settle the pending request matching `request_id` with a reply
    /// envelope. Unmatched replies are dropped.
    pub fn settle_reply(&self, request_id: &str, payload: Payload, headers: &Headers) {
        self.pending.settle(request_id, payload, headers);
    }
}

/// Contract implemented by every message transport.
///
/// A transport is built with its producer and consumer registrations, is
/// wired to the bus via [`Transport::start`], delivers produced envelopes and
/// routes replies back to the pending registry of the originating bus.
#[async_trait]
#[clonable]
pub trait Transport: Clone + Send + Sync {
    /// Routing name of this transport, unique within a bus
    fn name(&self) -> &str;

    /// Producer registrations aggregated into the bus routing table
    fn producer_specs(&self) -> Vec<ProducerSpec>;

    /// Consumer registrations dispatched by this transport
    fn consumer_specs(&self) -> Vec<Arc<ConsumerSpec>>;

    /// Payload codec used between the producer pipeline and this transport
    fn serializer(&self) -> Arc<dyn Serializer>;

    /// Whether consumers get a per-message dependency scope unless their spec
    /// says otherwise
    fn default_scope_enabled(&self) -> bool {
        true
    }

    /// Deliver a produced envelope to the consumers subscribed on its path
    async fn produce(&self, request: ProduceRequest) -> BusResult<()>;

    /// Deliver a reply for a pending request back to the originating bus
    async fn deliver_reply(
        &self,
        reply_to: &str,
        request_id: &str,
        payload: Payload,
        headers: Headers,
    ) -> BusResult<()>;

    /// Start accepting produces and consuming
    async fn start(&self, context: TransportContext) -> BusResult<()>;

    /// Stop accepting produces
    async fn stop(&self) -> BusResult<()>;

    /// Release transport resources when the owning bus is dropped.
    /// Best-effort; the bus logs and swallows failures.
    fn dispose(&self) -> BusResult<()> {
        Ok(())
    }
}

/// Save on typing
pub type DynTransport = Box<dyn Transport>;
