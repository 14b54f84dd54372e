use crate::{
    headers::{keys, Headers, HeaderValue},
    hooks::{self, HookContext, MessageHooks},
    intercept::{self, InterceptorRegistry, ProduceInterceptor, ProduceNext, TypeGraph, TypeRecord},
    now_millis,
    pending::PendingRequests,
    serializer::{MessageVtable, Serializer},
    transport::{DynTransport, ProduceRequest},
    BusResult,
    DynMessage,
    Error,
    Message,
    NoProducer,
};
use futures::future::BoxFuture;
use std::{any::TypeId, collections::HashMap, sync::Arc, time::Duration};
use strum_macros::{EnumString, ToString};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Kind of path a producer publishes to
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, ToString)]
pub enum PathKind {
    /// Fan-out to every consumer subscribed on the path
    Topic,
    /// Competing consumers on the path
    Queue,
}

/// Callback mutating outgoing headers before a message is produced
pub type HeaderModifier = Arc<dyn Fn(&mut Headers, &DynMessage) + Send + Sync>;

/// Producer-side registration of one message type: its default path and the
/// per-type settings applied when an instance is published or sent.
/// Immutable once handed to a transport builder.
#[derive(Clone)]
pub struct ProducerSpec {
    record: TypeRecord,
    message: MessageVtable,
    default_path: String,
    path_kind: PathKind,
    timeout: Option<Duration>,
    header_modifier: Option<HeaderModifier>,
    hooks: MessageHooks,
}

impl ProducerSpec {
    /// Producer for `M` publishing to topic `path` by default
    pub fn topic<M: Message>(path: impl Into<String>) -> Self {
        Self::new::<M>(path, PathKind::Topic)
    }

    /// Producer for `M` publishing to queue `path` by default
    pub fn queue<M: Message>(path: impl Into<String>) -> Self {
        Self::new::<M>(path, PathKind::Queue)
    }

    fn new<M: Message>(path: impl Into<String>, path_kind: PathKind) -> Self {
        Self {
            record: TypeRecord::of::<M>(),
            message: MessageVtable::of::<M>(),
            default_path: path.into(),
            path_kind,
            timeout: None,
            header_modifier: None,
            hooks: MessageHooks::new(),
        }
    }

    /// Request timeout for `send` calls of this type, overriding the bus
    /// default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mutate outgoing headers after the caller-supplied ones are applied
    pub fn with_header_modifier(
        mut self,
        modifier: impl Fn(&mut Headers, &DynMessage) + Send + Sync + 'static,
    ) -> Self {
        self.header_modifier = Some(Arc::new(modifier));
        self
    }

    /// Lifecycle hooks fired for messages of this type
    pub fn with_hooks(mut self, hooks: MessageHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Kind of the default path
    pub fn path_kind(&self) -> PathKind {
        self.path_kind
    }

    pub(crate) fn record(&self) -> &TypeRecord {
        &self.record
    }

    pub(crate) fn message(&self) -> &MessageVtable {
        &self.message
    }
}

/// Per-call options for `publish`
#[derive(Clone, Default)]
pub struct PublishOptions {
    pub(crate) path: Option<String>,
    pub(crate) headers: Headers,
}

impl PublishOptions {
    /// Defaults: the producer spec's path, no extra headers
    pub fn new() -> Self {
        Default::default()
    }

    /// Publish to `path` instead of the spec's default
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add an outgoing header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Replace the outgoing headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Per-call options for `send`
#[derive(Clone, Default)]
pub struct SendOptions {
    pub(crate) path: Option<String>,
    pub(crate) headers: Headers,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl SendOptions {
    /// Defaults: the spec's path and timeout, no extra headers, no
    /// cancellation
    pub fn new() -> Self {
        Default::default()
    }

    /// Send to `path` instead of the spec's default
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add an outgoing header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Replace the outgoing headers
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Reply timeout for this call, overriding spec and bus defaults
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancellation handle observed while awaiting the reply
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Producer pipeline bound to one transport: header composition, the
/// interceptor chain, serialization and request correlation.
pub(crate) struct Lane {
    transport: DynTransport,
    specs: HashMap<TypeId, ProducerSpec>,
    serializer: Arc<dyn Serializer>,
    interceptors: Arc<InterceptorRegistry<dyn ProduceInterceptor>>,
    graph: Arc<TypeGraph>,
    pending: Arc<PendingRequests>,
    bus_hooks: MessageHooks,
    bus_header_modifier: Option<HeaderModifier>,
    reply_path: String,
    default_timeout: Option<Duration>,
}

impl Lane {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: DynTransport,
        specs: HashMap<TypeId, ProducerSpec>,
        serializer: Arc<dyn Serializer>,
        interceptors: Arc<InterceptorRegistry<dyn ProduceInterceptor>>,
        graph: Arc<TypeGraph>,
        pending: Arc<PendingRequests>,
        bus_hooks: MessageHooks,
        bus_header_modifier: Option<HeaderModifier>,
        reply_path: String,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            specs,
            serializer,
            interceptors,
            graph,
            pending,
            bus_hooks,
            bus_header_modifier,
            reply_path,
            default_timeout,
        }
    }

    pub(crate) fn transport(&self) -> &DynTransport {
        &self.transport
    }

    /// Producer spec for `vtable`, falling back to the nearest base kind
    fn spec_for(&self, vtable: &MessageVtable) -> BusResult<&ProducerSpec> {
        for id in self.graph.ancestry(vtable.type_id()) {
            if let Some(spec) = self.specs.get(&id) {
                return Ok(spec);
            }
        }
        NoProducer {
            message_type: vtable.type_name(),
            transport: self.transport.name(),
        }
        .fail()
    }

    fn compose_headers(
        &self,
        spec: &ProducerSpec,
        headers: &mut Headers,
        message: &DynMessage,
        vtable: &MessageVtable,
    ) {
        if let Some(modifier) = &spec.header_modifier {
            modifier(headers, message);
        }
        if let Some(modifier) = &self.bus_header_modifier {
            modifier(headers, message);
        }
        headers.set(keys::MESSAGE_TYPE, vtable.type_name());
    }

    /// Build the interceptor chain and launch it with the transport produce
    /// as the innermost continuation
    fn launch(
        &self,
        vtable: &MessageVtable,
        request: ProduceRequest,
    ) -> BoxFuture<'static, BusResult<()>> {
        let interceptors = self.interceptors.lookup(vtable.type_id(), &self.graph);
        let transport = self.transport.clone();
        let terminal: ProduceNext =
            Box::new(move |request| Box::pin(async move { transport.produce(request).await }));
        let chain = intercept::produce_chain(&interceptors, terminal);
        chain(request)
    }

    fn fire_produced(&self, spec: &ProducerSpec, context: &HookContext<'_>) {
        hooks::fire(&spec.hooks.on_produced, context);
        hooks::fire(&self.bus_hooks.on_produced, context);
    }

    pub(crate) async fn publish(
        &self,
        vtable: &MessageVtable,
        message: DynMessage,
        options: PublishOptions,
    ) -> BusResult<()> {
        let spec = self.spec_for(vtable)?;
        let path = options.path.unwrap_or_else(|| spec.default_path.clone());
        let mut headers = options.headers;
        self.compose_headers(spec, &mut headers, &message, vtable);
        let payload = self.serializer.serialize(vtable, &message)?;
        log::debug!(
            "producing '{}' to {} '{}' on transport '{}'",
            vtable.type_name(),
            spec.path_kind.to_string().to_lowercase(),
            path,
            self.transport.name()
        );
        let hook_path = path.clone();
        let hook_headers = headers.clone();
        let request = ProduceRequest {
            message,
            message_type: vtable.type_name(),
            path,
            headers,
            payload,
            cancel: CancellationToken::new(),
        };
        self.launch(vtable, request).await?;
        self.fire_produced(
            spec,
            &HookContext {
                path: &hook_path,
                message_type: vtable.type_name(),
                headers: &hook_headers,
            },
        );
        Ok(())
    }

    pub(crate) async fn send(
        &self,
        vtable: &MessageVtable,
        response: MessageVtable,
        message: DynMessage,
        options: SendOptions,
    ) -> BusResult<DynMessage> {
        let spec = self.spec_for(vtable)?;
        let path = options.path.unwrap_or_else(|| spec.default_path.clone());
        let mut headers = options.headers;
        self.compose_headers(spec, &mut headers, &message, vtable);

        let request_id = Uuid::new_v4().to_string();
        headers.set(keys::REQUEST_ID, request_id.as_str());
        headers.set(keys::REPLY_TO, self.reply_path.as_str());
        let timeout = options.timeout.or(spec.timeout).or(self.default_timeout);
        if let Some(timeout) = timeout {
            headers.set(
                keys::EXPIRES,
                HeaderValue::Timestamp(now_millis() + timeout.as_millis() as i64),
            );
        }
        let payload = self.serializer.serialize(vtable, &message)?;
        let handle =
            self.pending
                .register(&request_id, response, self.serializer.clone(), timeout)?;

        log::debug!(
            "sending '{}' to {} '{}' on transport '{}' as request '{}'",
            vtable.type_name(),
            spec.path_kind.to_string().to_lowercase(),
            path,
            self.transport.name(),
            request_id
        );

        let chain_token = options
            .cancel
            .clone()
            .unwrap_or_else(CancellationToken::new);
        let hook_path = path.clone();
        let hook_headers = headers.clone();
        let request = ProduceRequest {
            message,
            message_type: vtable.type_name(),
            path,
            headers,
            payload,
            cancel: chain_token,
        };

        let mut produce = self.launch(vtable, request);
        let wait = handle.wait();
        tokio::pin!(wait);
        let caller_cancel = options.cancel;
        let cancelled = async move {
            match caller_cancel {
                Some(token) => token.cancelled().await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancelled);

        // The in-process transport runs consumers on this task, so the reply
        // (or the timeout) can arrive while the produce is still in flight.
        let produced: BusResult<()> = tokio::select! {
            biased;
            result = &mut produce => result,
            reply = &mut wait => return reply,
            _ = &mut cancelled => {
                self.pending.abort(&request_id);
                return Err(Error::Cancelled);
            }
        };
        if let Err(error) = produced {
            self.pending.abort(&request_id);
            return Err(error);
        }
        self.fire_produced(
            spec,
            &HookContext {
                path: &hook_path,
                message_type: vtable.type_name(),
                headers: &hook_headers,
            },
        );

        tokio::select! {
            reply = &mut wait => reply,
            _ = &mut cancelled => {
                self.pending.abort(&request_id);
                Err(Error::Cancelled)
            }
        }
    }
}
