use crate::{
    consumer::{ConsumerSpec, ReplySink},
    headers::{self, Headers},
    producer::ProducerSpec,
    serializer::{JsonSerializer, NullSerializer, Payload, Serializer},
    transport::{Envelope, ProduceRequest, Transport, TransportContext},
    BusResult,
    Error,
};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// In-process transport: producing a message dispatches it to the consumers
/// subscribed on its path, on the caller's task.
///
/// With `serialization` enabled every message round-trips through the
/// envelope codec, so consumers observe a decoded clone (value semantics).
/// With it disabled the payload is the loopback sentinel and consumers
/// receive the original instance.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    serialize_loopback: bool,
    serializer: Arc<dyn Serializer>,
    producers: Vec<ProducerSpec>,
    consumers: HashMap<String, Vec<Arc<ConsumerSpec>>>,
    context: OnceCell<TransportContext>,
    stopped: AtomicBool,
}

impl MemoryTransport {
    /// Start building a memory transport
    pub fn builder() -> MemoryTransportBuilder {
        MemoryTransportBuilder {
            name: "memory".to_string(),
            serialize_loopback: false,
            producers: Vec::new(),
            consumers: HashMap::new(),
        }
    }

    fn context(&self) -> BusResult<&TransportContext> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::BusStopped);
        }
        self.inner.context.get().ok_or(Error::BusStopped)
    }

    /// Round-trip the envelope through the wire codec when serialization is
    /// enabled, so every consumer sees its own decoded copy
    fn loopback_envelope(&self, request: ProduceRequest) -> BusResult<Envelope> {
        if self.inner.serialize_loopback {
            if let Payload::Bytes(data) = &request.payload {
                let encoded = headers::encode_envelope(&request.headers, data)?;
                let (decoded_headers, decoded_payload) = headers::decode_envelope(&encoded)?;
                return Ok(Envelope {
                    headers: decoded_headers,
                    payload: Payload::Bytes(decoded_payload),
                });
            }
        }
        Ok(Envelope {
            headers: request.headers,
            payload: request.payload,
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn producer_specs(&self) -> Vec<ProducerSpec> {
        self.inner.producers.clone()
    }

    fn consumer_specs(&self) -> Vec<Arc<ConsumerSpec>> {
        self.inner
            .consumers
            .values()
            .flat_map(|specs| specs.iter().cloned())
            .collect()
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.inner.serializer.clone()
    }

    fn default_scope_enabled(&self) -> bool {
        false
    }

    async fn produce(&self, request: ProduceRequest) -> BusResult<()> {
        let context = self.context()?.clone();
        let specs = match self.inner.consumers.get(&request.path) {
            Some(specs) => specs,
            None => {
                log::debug!(
                    "no consumers subscribed on '{}'; '{}' dropped",
                    request.path,
                    request.message_type
                );
                return Ok(());
            }
        };
        let envelope = self.loopback_envelope(request)?;
        // consumers on one path observe messages in subscription order
        let mut first_failure = None;
        for spec in specs {
            if let Err(error) = context.pipeline().dispatch(spec, envelope.clone(), self).await {
                log::warn!(
                    "consumer on '{}' failed: {}",
                    spec.path(),
                    error
                );
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn deliver_reply(
        &self,
        reply_to: &str,
        request_id: &str,
        payload: Payload,
        headers: Headers,
    ) -> BusResult<()> {
        ReplySink::deliver_reply(self, reply_to, request_id, payload, headers).await
    }

    async fn start(&self, context: TransportContext) -> BusResult<()> {
        self.inner.context.set(context).map_err(|_| Error::Configuration {
            reason: format!("transport '{}' was started twice", self.inner.name),
        })?;
        log::debug!(
            "memory transport '{}' started with {} subscription path(s)",
            self.inner.name,
            self.inner.consumers.len()
        );
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) -> BusResult<()> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        log::debug!("memory transport '{}' disposed", self.inner.name);
        Ok(())
    }
}

/// Replies settle the pending registry of the originating bus synchronously
#[async_trait]
impl ReplySink for MemoryTransport {
    async fn deliver_reply(
        &self,
        _reply_to: &str,
        request_id: &str,
        payload: Payload,
        headers: Headers,
    ) -> BusResult<()> {
        let context = self
            .inner
            .context
            .get()
            .ok_or(Error::BusStopped)?;
        context.settle_reply(request_id, payload, &headers);
        Ok(())
    }
}

/// Builder collecting the registrations of a memory transport
pub struct MemoryTransportBuilder {
    name: String,
    serialize_loopback: bool,
    producers: Vec<ProducerSpec>,
    consumers: HashMap<String, Vec<Arc<ConsumerSpec>>>,
}

impl MemoryTransportBuilder {
    /// Routing name, `memory` by default
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Round-trip loopback messages through the serializer to enforce value
    /// semantics between producer and consumer
    pub fn with_serialization(mut self, enabled: bool) -> Self {
        self.serialize_loopback = enabled;
        self
    }

    /// Register a producer
    pub fn with_producer(mut self, spec: ProducerSpec) -> Self {
        self.producers.push(spec);
        self
    }

    /// Register a consumer
    pub fn with_consumer(mut self, spec: ConsumerSpec) -> Self {
        self.consumers
            .entry(spec.path().to_string())
            .or_insert_with(Vec::new)
            .push(Arc::new(spec));
        self
    }

    /// Build the transport
    pub fn build(self) -> MemoryTransport {
        let serializer: Arc<dyn Serializer> = if self.serialize_loopback {
            Arc::new(JsonSerializer)
        } else {
            Arc::new(NullSerializer)
        };
        MemoryTransport {
            inner: Arc::new(Inner {
                name: self.name,
                serialize_loopback: self.serialize_loopback,
                serializer,
                producers: self.producers,
                consumers: self.consumers,
                context: OnceCell::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}
