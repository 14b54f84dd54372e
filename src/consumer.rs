use crate::{
    headers::{keys, Headers},
    hooks::{self, HookContext, MessageHooks},
    intercept::{self, ConsumeInterceptor, ConsumeNext, InterceptorRegistry, TypeGraph, TypeRecord},
    now_millis,
    resolver::{DynHandler, Resolver},
    serializer::{MessageVtable, Payload, Serializer},
    transport::Envelope,
    BusResult,
    Configuration,
    DynMessage,
    Handler,
    HandlerError,
    HandlerMissing,
    Message,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use snafu::{ensure, OptionExt};
use std::{any::TypeId, collections::HashMap, sync::Arc};
use strum_macros::{EnumString, ToString};

/// How a consumer participates in an exchange
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, ToString)]
pub enum ConsumerMode {
    /// One-way: the handler consumes the message, nothing is sent back
    Consumer,
    /// Two-way: the handler's response is delivered to the requester
    RequestResponse,
}

/// Handler for one-way messages of type `M`
#[async_trait]
pub trait MessageConsumer<M: Message>: Send + Sync {
    /// Process one message
    async fn on_message(
        &self,
        message: Arc<M>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError>;
}

/// Handler for request messages of type `M`, replying with `M::Reply`
#[async_trait]
pub trait RequestHandler<M: Message>: Send + Sync {
    /// Process one request and produce the reply
    async fn on_request(
        &self,
        request: Arc<M>,
        context: &ConsumeContext,
    ) -> Result<M::Reply, HandlerError>;
}

/// Read-only view of the message being consumed, injected into handlers and
/// consumer interceptors
pub struct ConsumeContext {
    path: String,
    transport: String,
    headers: Headers,
}

impl ConsumeContext {
    pub(crate) fn new(path: String, transport: String, headers: Headers) -> Self {
        Self {
            path,
            transport,
            headers,
        }
    }

    /// Path the message arrived on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Name of the transport which delivered the message
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Headers as received
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Correlation id, present on request/response exchanges
    pub fn request_id(&self) -> Option<&str> {
        self.headers.string(keys::REQUEST_ID)
    }
}

type InvokeFn = Arc<
    dyn Fn(
            DynHandler,
            DynMessage,
            Arc<ConsumeContext>,
        ) -> BoxFuture<'static, Result<Option<DynMessage>, HandlerError>>
        + Send
        + Sync,
>;

fn consumer_invoke<M, H>() -> InvokeFn
where
    M: Message,
    H: MessageConsumer<M> + 'static,
{
    let invoke: InvokeFn = Arc::new(|handler, message, context| {
        Box::pin(async move {
            let handler = handler.downcast::<H>().map_err(|_| {
                HandlerError::from("the resolved handler does not match the consumer registration")
            })?;
            let message = message.downcast::<M>().map_err(|_| {
                HandlerError::from("the decoded message does not match the consumer registration")
            })?;
            handler.on_message(message, &context).await?;
            Ok(None)
        })
    });
    invoke
}

fn request_invoke<M, H>() -> InvokeFn
where
    M: Message,
    H: RequestHandler<M> + 'static,
{
    let invoke: InvokeFn = Arc::new(|handler, message, context| {
        Box::pin(async move {
            let handler = handler.downcast::<H>().map_err(|_| {
                HandlerError::from("the resolved handler does not match the consumer registration")
            })?;
            let request = message.downcast::<M>().map_err(|_| {
                HandlerError::from("the decoded message does not match the consumer registration")
            })?;
            let response = handler.on_request(request, &context).await?;
            Ok(Some(Arc::new(response) as DynMessage))
        })
    });
    invoke
}

/// One registered message type of a consumer spec: its codec entry points and
/// the erased invocation of the handler
struct ConsumerInvoker {
    message: MessageVtable,
    response: Option<MessageVtable>,
    record: TypeRecord,
    invoke: InvokeFn,
}

/// Consumer-side registration: which handler type consumes which message type
/// on which path, and how. Immutable once handed to a transport builder.
pub struct ConsumerSpec {
    path: String,
    mode: ConsumerMode,
    consumer_type: TypeId,
    consumer_name: &'static str,
    primary: &'static str,
    invokers: HashMap<String, ConsumerInvoker>,
    scope_enabled: Option<bool>,
    dispose_after_use: bool,
    hooks: MessageHooks,
    config_error: Option<String>,
}

impl ConsumerSpec {
    /// One-way consumer: `H` handles `M` arriving on `path`
    pub fn consumer<M, H>(path: impl Into<String>) -> Self
    where
        M: Message,
        H: MessageConsumer<M> + 'static,
    {
        Self::build::<M>(
            path,
            ConsumerMode::Consumer,
            TypeId::of::<H>(),
            std::any::type_name::<H>(),
            None,
            consumer_invoke::<M, H>(),
        )
    }

    /// Request/response consumer: `H` handles `M` arriving on `path` and
    /// replies with `M::Reply`
    pub fn request_response<M, H>(path: impl Into<String>) -> Self
    where
        M: Message,
        H: RequestHandler<M> + 'static,
    {
        Self::build::<M>(
            path,
            ConsumerMode::RequestResponse,
            TypeId::of::<H>(),
            std::any::type_name::<H>(),
            Some(MessageVtable::of::<M::Reply>()),
            request_invoke::<M, H>(),
        )
    }

    fn build<M: Message>(
        path: impl Into<String>,
        mode: ConsumerMode,
        consumer_type: TypeId,
        consumer_name: &'static str,
        response: Option<MessageVtable>,
        invoke: InvokeFn,
    ) -> Self {
        let invoker = ConsumerInvoker {
            message: MessageVtable::of::<M>(),
            response,
            record: TypeRecord::of::<M>(),
            invoke,
        };
        let mut invokers = HashMap::new();
        invokers.insert(M::type_name().to_string(), invoker);
        Self {
            path: path.into(),
            mode,
            consumer_type,
            consumer_name,
            primary: M::type_name(),
            invokers,
            scope_enabled: None,
            dispose_after_use: true,
            hooks: MessageHooks::new(),
            config_error: None,
        }
    }

    /// Additional message type dispatched to the same handler, selected by
    /// the `MessageType` header
    pub fn with_variant<M2, H>(mut self) -> Self
    where
        M2: Message,
        H: MessageConsumer<M2> + 'static,
    {
        if TypeId::of::<H>() != self.consumer_type {
            self.config_error = Some(format!(
                "variant '{}' is handled by '{}' but the spec resolves '{}'",
                M2::type_name(),
                std::any::type_name::<H>(),
                self.consumer_name
            ));
            return self;
        }
        if self.mode != ConsumerMode::Consumer {
            self.config_error = Some(format!(
                "variant '{}' can only be added to a one-way consumer",
                M2::type_name()
            ));
            return self;
        }
        self.invokers.insert(
            M2::type_name().to_string(),
            ConsumerInvoker {
                message: MessageVtable::of::<M2>(),
                response: None,
                record: TypeRecord::of::<M2>(),
                invoke: consumer_invoke::<M2, H>(),
            },
        );
        self
    }

    /// Override the transport's per-message scope default
    pub fn with_scope(mut self, enabled: bool) -> Self {
        self.scope_enabled = Some(enabled);
        self
    }

    /// Whether the pipeline releases its handler reference right after
    /// invocation (the default) or keeps it until the message is finished
    pub fn with_dispose_after_use(mut self, dispose: bool) -> Self {
        self.dispose_after_use = dispose;
        self
    }

    /// Lifecycle hooks fired for messages consumed through this spec
    pub fn with_hooks(mut self, hooks: MessageHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Path this consumer subscribes on
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Exchange mode of this consumer
    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    pub(crate) fn invoker_records(&self) -> Vec<&TypeRecord> {
        self.invokers.values().map(|invoker| &invoker.record).collect()
    }

    pub(crate) fn validate(&self) -> BusResult<()> {
        if let Some(reason) = &self.config_error {
            return Configuration {
                reason: reason.clone(),
            }
            .fail();
        }
        if self.mode == ConsumerMode::RequestResponse {
            let declared = self
                .invokers
                .get(self.primary)
                .map(|invoker| invoker.response.is_some())
                .unwrap_or(false);
            ensure!(
                declared,
                Configuration {
                    reason: format!(
                        "request/response consumer '{}' declares no response type",
                        self.consumer_name
                    ),
                }
            );
        }
        Ok(())
    }
}

/// Reply delivery side of a transport, used by the consumer pipeline to hand
/// a request/response result back to the originating bus
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Deliver a reply envelope for `request_id` to `reply_to`
    async fn deliver_reply(
        &self,
        reply_to: &str,
        request_id: &str,
        payload: Payload,
        headers: Headers,
    ) -> BusResult<()>;
}

/// Consumer pipeline configured for one transport: deserialization,
/// expiration, scope acquisition, the interceptor chain, handler invocation
/// and reply delivery.
pub struct ConsumerPipeline {
    transport: String,
    serializer: Arc<dyn Serializer>,
    resolver: Arc<dyn Resolver>,
    interceptors: Arc<InterceptorRegistry<dyn ConsumeInterceptor>>,
    graph: Arc<TypeGraph>,
    bus_hooks: MessageHooks,
    scope_default: bool,
}

impl ConsumerPipeline {
    pub(crate) fn new(
        transport: String,
        serializer: Arc<dyn Serializer>,
        resolver: Arc<dyn Resolver>,
        interceptors: Arc<InterceptorRegistry<dyn ConsumeInterceptor>>,
        graph: Arc<TypeGraph>,
        bus_hooks: MessageHooks,
        scope_default: bool,
    ) -> Self {
        Self {
            transport,
            serializer,
            resolver,
            interceptors,
            graph,
            bus_hooks,
            scope_default,
        }
    }

    /// Run one envelope through the pipeline for `spec`.
    ///
    /// Request/response handler failures are reported back through the reply
    /// `Error` header and this returns `Ok`; one-way handler failures are
    /// returned to the transport for its own retry or dead-letter policy.
    pub async fn dispatch(
        &self,
        spec: &ConsumerSpec,
        envelope: Envelope,
        replies: &dyn ReplySink,
    ) -> BusResult<()> {
        let Envelope { headers, payload } = envelope;

        let invoker = match headers
            .string(keys::MESSAGE_TYPE)
            .and_then(|name| spec.invokers.get(name))
        {
            Some(invoker) => invoker,
            None => spec.invokers.get(spec.primary).context(Configuration {
                reason: format!(
                    "consumer '{}' has no invoker for its primary message type",
                    spec.consumer_name
                ),
            })?,
        };
        let type_name = invoker.message.type_name();

        let message = match self.serializer.deserialize(&invoker.message, payload) {
            Ok(message) => message,
            Err(error) => {
                log::error!(
                    "failed to decode a '{}' message on '{}': {}",
                    type_name,
                    spec.path,
                    error
                );
                // a request with a correlation id still gets an answer, so
                // the requester fails fast instead of waiting out its timeout
                if spec.mode == ConsumerMode::RequestResponse {
                    if let Some(request_id) = headers.string(keys::REQUEST_ID) {
                        let reply_to = headers.string(keys::REPLY_TO).unwrap_or("");
                        let mut reply_headers = Headers::new();
                        reply_headers.set(keys::REQUEST_ID, request_id);
                        reply_headers.set(keys::ERROR, error.to_string());
                        replies
                            .deliver_reply(
                                reply_to,
                                request_id,
                                Payload::Bytes(Vec::new()),
                                reply_headers,
                            )
                            .await?;
                        return Ok(());
                    }
                }
                return Err(error);
            }
        };

        let context = Arc::new(ConsumeContext::new(
            spec.path.clone(),
            self.transport.clone(),
            headers,
        ));
        let hook_context = HookContext {
            path: context.path(),
            message_type: type_name,
            headers: context.headers(),
        };

        if let Some(expires) = context.headers().timestamp(keys::EXPIRES) {
            let now = now_millis();
            if now > expires {
                hooks::fire(&spec.hooks.on_expired, &hook_context);
                hooks::fire(&self.bus_hooks.on_expired, &hook_context);
                log::debug!(
                    "message '{}' on '{}' expired {}ms ago; dropped",
                    type_name,
                    spec.path,
                    now - expires
                );
                return Ok(());
            }
        }

        // released on every exit path below
        let scope = if spec.scope_enabled.unwrap_or(self.scope_default) {
            Some(self.resolver.create_scope())
        } else {
            None
        };

        hooks::fire(&spec.hooks.on_arrived, &hook_context);
        hooks::fire(&self.bus_hooks.on_arrived, &hook_context);

        let resolved = match scope.as_ref() {
            Some(scope) => scope.resolve(spec.consumer_type),
            None => self.resolver.resolve(spec.consumer_type),
        };
        let handler_instance = match resolved {
            Some(handler) => handler,
            None => {
                return HandlerMissing {
                    consumer_type: spec.consumer_name,
                }
                .fail()
            }
        };

        log::debug!(
            "dispatching '{}' on '{}' to consumer '{}' ({})",
            type_name,
            spec.path,
            spec.consumer_name,
            spec.mode.to_string()
        );

        let interceptors = self.interceptors.lookup(invoker.message.type_id(), &self.graph);
        let invoke = invoker.invoke.clone();
        let invoke_handler = handler_instance.clone();
        let invoke_context = context.clone();
        let terminal: ConsumeNext =
            Box::new(move |message| invoke(invoke_handler, message, invoke_context));
        let chain = intercept::consume_chain(&interceptors, context.clone(), terminal);
        let outcome = chain(message).await;

        let (response, failure) = match outcome {
            Ok(response) => (response, None),
            Err(error) => (None, Some(error)),
        };
        if let Some(error) = &failure {
            hooks::fire_fault(&spec.hooks.on_fault, &hook_context, error.as_ref());
            hooks::fire_fault(&self.bus_hooks.on_fault, &hook_context, error.as_ref());
            log::warn!(
                "consumer '{}' failed to process '{}' on '{}': {}",
                spec.consumer_name,
                type_name,
                spec.path,
                error
            );
        }

        if spec.dispose_after_use {
            drop(handler_instance);
        }

        hooks::fire(&spec.hooks.on_finished, &hook_context);
        hooks::fire(&self.bus_hooks.on_finished, &hook_context);

        match spec.mode {
            ConsumerMode::Consumer => match failure {
                Some(error) => Handler {
                    message: error.to_string(),
                }
                .fail(),
                None => Ok(()),
            },
            ConsumerMode::RequestResponse => {
                let request_id = match context.request_id() {
                    Some(id) => id.to_string(),
                    None => {
                        return Configuration {
                            reason: format!(
                                "request '{}' on '{}' arrived without a '{}' header",
                                type_name,
                                spec.path,
                                keys::REQUEST_ID
                            ),
                        }
                        .fail()
                    }
                };
                let reply_to = context
                    .headers()
                    .string(keys::REPLY_TO)
                    .unwrap_or("")
                    .to_string();
                let mut reply_headers = Headers::new();
                reply_headers.set(keys::REQUEST_ID, request_id.as_str());
                let mut reply_payload = Payload::Bytes(Vec::new());
                match (failure, response) {
                    (Some(error), _) => {
                        reply_headers.set(keys::ERROR, error.to_string());
                    }
                    (None, Some(response)) => match invoker.response.as_ref() {
                        Some(vtable) => match self.serializer.serialize(vtable, &response) {
                            Ok(payload) => reply_payload = payload,
                            Err(error) => {
                                log::warn!(
                                    "failed to encode the reply for request '{}': {}",
                                    request_id,
                                    error
                                );
                                reply_headers.set(keys::ERROR, error.to_string());
                            }
                        },
                        None => {
                            reply_headers.set(keys::ERROR, "the consumer declares no response type");
                        }
                    },
                    (None, None) => {
                        reply_headers.set(keys::ERROR, "the request handler returned no response");
                    }
                }
                replies
                    .deliver_reply(&reply_to, &request_id, reply_payload, reply_headers)
                    .await
            }
        }
    }
}
