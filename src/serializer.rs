use crate::{BusResult, DeserializeMessage, DynMessage, Message, SerializeMessage};
use serde::ser::Error as _;
use snafu::ResultExt;
use std::{any::TypeId, fmt, sync::Arc};

/// Payload side of an envelope.
///
/// `Bytes` is the serialized form exchanged with real transports. `Value` is
/// the loopback sentinel used when serialization is disabled: the consumer
/// side receives the original message instance instead of a decoded clone.
#[derive(Clone)]
pub enum Payload {
    /// Serialized payload bytes
    Bytes(Vec<u8>),
    /// The original message, passed through without copying
    Value(DynMessage),
}

impl Payload {
    /// Serialized bytes, when this payload carries any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes.as_slice()),
            Payload::Value(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => write!(f, "Payload::Bytes({} bytes)", bytes.len()),
            Payload::Value(_) => write!(f, "Payload::Value"),
        }
    }
}

/// Type-erased codec entry points for one message type, captured where the
/// concrete type is still known. Lookups by `TypeId` replace any per-message
/// reflection.
#[derive(Clone)]
pub struct MessageVtable {
    type_id: TypeId,
    type_name: &'static str,
    encode_fn: Arc<dyn Fn(&DynMessage) -> Result<Vec<u8>, serde_json::Error> + Send + Sync>,
    decode_fn: Arc<dyn Fn(&[u8]) -> Result<DynMessage, serde_json::Error> + Send + Sync>,
}

fn encode_erased<M: Message>(message: &DynMessage) -> Result<Vec<u8>, serde_json::Error> {
    match message.downcast_ref::<M>() {
        Some(message) => serde_json::to_vec(message),
        None => Err(serde_json::Error::custom(
            "payload does not match the registered message type",
        )),
    }
}

fn decode_erased<M: Message>(data: &[u8]) -> Result<DynMessage, serde_json::Error> {
    let message: M = serde_json::from_slice(data)?;
    Ok(Arc::new(message) as DynMessage)
}

impl MessageVtable {
    /// Capture the codec entry points of `M`
    pub fn of<M: Message>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: M::type_name(),
            encode_fn: Arc::new(encode_erased::<M>),
            decode_fn: Arc::new(decode_erased::<M>),
        }
    }

    /// Type identity of the message
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Wire name of the message
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn encode(&self, message: &DynMessage) -> BusResult<Vec<u8>> {
        (self.encode_fn)(message).context(SerializeMessage {
            message_type: self.type_name,
        })
    }

    pub(crate) fn decode(&self, data: &[u8]) -> BusResult<DynMessage> {
        (self.decode_fn)(data).context(DeserializeMessage {
            message_type: self.type_name,
        })
    }
}

impl fmt::Debug for MessageVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageVtable({})", self.type_name)
    }
}

/// Pluggable payload codec used between a producer pipeline and its
/// transport.
pub trait Serializer: Send + Sync {
    /// Encode an erased message into a payload
    fn serialize(&self, vtable: &MessageVtable, message: &DynMessage) -> BusResult<Payload>;
    /// Decode a payload back into an erased message
    fn deserialize(&self, vtable: &MessageVtable, payload: Payload) -> BusResult<DynMessage>;
}

/// Codec which roundtrips payloads through serde_json
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, vtable: &MessageVtable, message: &DynMessage) -> BusResult<Payload> {
        Ok(Payload::Bytes(vtable.encode(message)?))
    }

    fn deserialize(&self, vtable: &MessageVtable, payload: Payload) -> BusResult<DynMessage> {
        match payload {
            Payload::Bytes(data) => vtable.decode(&data),
            Payload::Value(message) => Ok(message),
        }
    }
}

/// Codec which returns the original message unchanged, used for loopback
/// without copying
pub struct NullSerializer;

impl Serializer for NullSerializer {
    fn serialize(&self, _vtable: &MessageVtable, message: &DynMessage) -> BusResult<Payload> {
        Ok(Payload::Value(message.clone()))
    }

    fn deserialize(&self, vtable: &MessageVtable, payload: Payload) -> BusResult<DynMessage> {
        match payload {
            Payload::Value(message) => Ok(message),
            Payload::Bytes(data) => vtable.decode(&data),
        }
    }
}
