#![warn(missing_docs)]
//! Dispatch core of a pluggable message bus.
//!
//! Applications publish events and issue request/response interactions over
//! one or more transports through a single bus API. This crate implements the
//! parts every transport shares: routing by message type, the producer and
//! consumer pipelines with their interceptor chains, request/reply
//! correlation with timeouts and cancellation, and an in-process memory
//! transport. Broker-specific drivers implement the [`Transport`] contract
//! and plug into the same machinery.

/// Hybrid bus and its builder
pub mod bus;
/// Consumer specs and the consumer pipeline
pub mod consumer;
/// Header map and the envelope wire codec
pub mod headers;
/// Message lifecycle hooks
pub mod hooks;
/// Interceptor contracts and the runtime type cache
pub mod intercept;
/// In-process transport
pub mod memory;
mod pending;
/// Producer specs and the producer pipeline
pub mod producer;
mod routing;
/// Dependency resolution contracts
pub mod resolver;
/// Payload codec contracts
pub mod serializer;
/// Transport contract
pub mod transport;

pub use crate::{
    bus::{MessageBus, MessageBusBuilder},
    consumer::{
        ConsumeContext,
        ConsumerMode,
        ConsumerPipeline,
        ConsumerSpec,
        MessageConsumer,
        ReplySink,
        RequestHandler,
    },
    headers::{decode_envelope, encode_envelope, keys, HeaderValue, Headers},
    hooks::{FaultHook, HookContext, MessageHook, MessageHooks},
    intercept::{
        ConsumeInterceptor,
        ConsumeNext,
        ProduceInterceptor,
        ProduceNext,
        TypeRecord,
    },
    memory::{MemoryTransport, MemoryTransportBuilder},
    producer::{HeaderModifier, PathKind, ProducerSpec, PublishOptions, SendOptions},
    resolver::{DynHandler, Resolver, ResolverScope, TypeMapResolver},
    serializer::{JsonSerializer, MessageVtable, NullSerializer, Payload, Serializer},
    transport::{DynTransport, Envelope, ProduceRequest, Transport, TransportContext},
};

use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;
use std::{
    any::{Any, TypeId},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Result wrapper for all bus operations
pub type BusResult<T> = Result<T, Error>;

/// A message travelling through the core with its concrete type erased
pub type DynMessage = Arc<dyn Any + Send + Sync>;

/// Failure raised by user handler code. In `RequestResponse` mode it is
/// relayed to the caller through the reply `Error` header; in `Consumer` mode
/// it is re-raised to the transport.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Common error type for every bus operation
#[derive(Debug, Snafu, strum_macros::AsRefStr)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "No transport routes messages of type '{}' (attempted path '{}')",
        message_type,
        path.as_deref().unwrap_or("<default>")
    ))]
    NoRoute {
        message_type: String,
        path: Option<String>,
    },
    #[snafu(display(
        "Messages of type '{}' are routed by both '{}' and '{}'",
        message_type,
        first,
        second
    ))]
    DuplicateRoute {
        message_type: String,
        first: String,
        second: String,
    },
    #[snafu(display(
        "The route for type '{}' is ambiguous between base kinds handled by '{}' and '{}'",
        message_type,
        first,
        second
    ))]
    AmbiguousRoute {
        message_type: String,
        first: String,
        second: String,
    },
    #[snafu(display(
        "Transport '{}' has no producer registered for type '{}'",
        transport,
        message_type
    ))]
    NoProducer {
        message_type: String,
        transport: String,
    },
    #[snafu(display("Invalid bus configuration: {}", reason))]
    Configuration { reason: String },
    #[snafu(display("Failed to serialize a message of type '{}'", message_type))]
    SerializeMessage {
        message_type: String,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to deserialize a payload into type '{}'", message_type))]
    DeserializeMessage {
        message_type: String,
        source: serde_json::Error,
    },
    #[snafu(display("Malformed envelope: {}", reason))]
    MalformedEnvelope { reason: String },
    #[snafu(display("Transport '{}' failed to deliver the message: {}", transport, reason))]
    TransportFailed { transport: String, reason: String },
    #[snafu(display("Timed out waiting for a reply to request '{}'", request_id))]
    RequestTimeout { request_id: String },
    #[snafu(display("The request was cancelled by the caller"))]
    Cancelled,
    #[snafu(display("A request with id '{}' is already in flight", request_id))]
    DuplicateRequest { request_id: String },
    #[snafu(display("The handler failed to process the message: {}", message))]
    Handler { message: String },
    #[snafu(display(
        "No handler of type '{}' is registered with the resolver",
        consumer_type
    ))]
    HandlerMissing { consumer_type: String },
    #[snafu(display("The reply payload was not of the expected type '{}'", expected))]
    WrongResponseType { expected: String },
    #[snafu(display("The bus is not running"))]
    BusStopped,
}

/// Trait implemented by every message routed through the bus.
///
/// `Reply` is the type sent back for request/response exchanges; one-way
/// messages use `()`. `parent_types` declares the base kinds of this message,
/// most specific first; routing and interceptor lookup fall back to them when
/// the concrete type has no registration of its own.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type which is sent back in response to a request
    type Reply: Message;

    /// Wire name recorded in the `MessageType` header
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Declared base kinds, most specific first
    fn parent_types() -> Vec<TypeId> {
        Vec::new()
    }
}

impl Message for () {
    type Reply = ();
}

/// Milliseconds since the unix epoch, the clock used by the `Expires` header
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
