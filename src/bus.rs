use crate::{
    consumer::ConsumerPipeline,
    hooks::MessageHooks,
    intercept::{
        ConsumeInterceptor,
        InterceptorRegistry,
        ProduceInterceptor,
        TypeGraph,
        TypeRecord,
    },
    pending::{self, PendingRequests},
    producer::{HeaderModifier, Lane, ProducerSpec, PublishOptions, SendOptions},
    resolver::{Resolver, TypeMapResolver},
    routing::RoutingTable,
    serializer::MessageVtable,
    transport::{Transport, TransportContext},
    BusResult,
    BusStopped,
    Configuration,
    DynMessage,
    Error,
    Message,
};
use parking_lot::{Mutex, RwLock};
use snafu::{ensure, OptionExt};
use std::{any::TypeId, collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BusState {
    Built,
    Starting,
    Started,
    Stopping,
    Stopped,
}

struct BusInner {
    lanes: Vec<Lane>,
    by_name: HashMap<String, usize>,
    routes: RoutingTable,
    graph: Arc<TypeGraph>,
    pending: Arc<PendingRequests>,
    resolver: Arc<dyn Resolver>,
    consume_interceptors: Arc<InterceptorRegistry<dyn ConsumeInterceptor>>,
    bus_hooks: MessageHooks,
    reply_path: String,
    state: RwLock<BusState>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        for lane in self.lanes.iter().rev() {
            let transport = lane.transport();
            if let Err(error) = transport.dispose() {
                log::error!(
                    "transport '{}' failed to dispose: {}",
                    transport.name(),
                    error
                );
            }
        }
    }
}

/// A bus composing one or more transports behind a single publish/send API.
///
/// The routing table picks the transport for each outgoing message by its
/// runtime type; the transport's producer pipeline serializes the message,
/// runs the interceptor chain and hands the envelope over. The bus must be
/// started explicitly before use and stops accepting messages once stopped.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus").finish()
    }
}

impl MessageBus {
    /// Start building a bus
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::new()
    }

    fn lane_for(&self, vtable: &MessageVtable, path: Option<&str>) -> BusResult<&Lane> {
        ensure!(*self.inner.state.read() == BusState::Started, BusStopped {});
        let transport = self.inner.routes.resolve(
            vtable.type_id(),
            vtable.type_name(),
            path,
            &self.inner.graph,
        )?;
        let index = self.inner.by_name.get(transport).context(Configuration {
            reason: format!("route points at unknown transport '{}'", transport),
        })?;
        Ok(&self.inner.lanes[*index])
    }

    /// Publish `message` to its producer's default path
    pub async fn publish<M: Message>(&self, message: M) -> BusResult<()> {
        self.publish_ext(message, PublishOptions::new()).await
    }

    /// Publish `message` to `path`
    pub async fn publish_on<M: Message>(&self, path: &str, message: M) -> BusResult<()> {
        self.publish_ext(message, PublishOptions::new().with_path(path))
            .await
    }

    /// Publish `message` with explicit options
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn publish_ext<M: Message>(
        &self,
        message: M,
        options: PublishOptions,
    ) -> BusResult<()> {
        let vtable = MessageVtable::of::<M>();
        let lane = self.lane_for(&vtable, options.path.as_deref())?;
        let message: DynMessage = Arc::new(message);
        lane.publish(&vtable, message, options).await
    }

    /// Send `request` and await its `M::Reply`
    pub async fn send<M: Message>(&self, request: M) -> BusResult<Arc<M::Reply>> {
        self.send_ext(request, SendOptions::new()).await
    }

    /// Send `request` to `path` and await its `M::Reply`
    pub async fn send_on<M: Message>(&self, path: &str, request: M) -> BusResult<Arc<M::Reply>> {
        self.send_ext(request, SendOptions::new().with_path(path)).await
    }

    /// Send `request` with explicit options and await its `M::Reply`
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn send_ext<M: Message>(
        &self,
        request: M,
        options: SendOptions,
    ) -> BusResult<Arc<M::Reply>> {
        let vtable = MessageVtable::of::<M>();
        let response = MessageVtable::of::<M::Reply>();
        let lane = self.lane_for(&vtable, options.path.as_deref())?;
        let request: DynMessage = Arc::new(request);
        let reply = lane
            .send(&vtable, response, request, options)
            .await?;
        reply
            .downcast::<M::Reply>()
            .map_err(|_| Error::WrongResponseType {
                expected: M::Reply::type_name().to_string(),
            })
    }

    /// Number of requests currently awaiting a reply
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Start the transports in registration order and begin sweeping request
    /// timeouts. A transport failing to start stops the already-started ones
    /// in reverse order and surfaces its error.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn start(&self) -> BusResult<()> {
        {
            let mut state = self.inner.state.write();
            ensure!(
                *state == BusState::Built,
                Configuration {
                    reason: "the bus can only be started once",
                }
            );
            *state = BusState::Starting;
        }

        let mut started = Vec::new();
        for (index, lane) in self.inner.lanes.iter().enumerate() {
            let transport = lane.transport();
            let pipeline = Arc::new(ConsumerPipeline::new(
                transport.name().to_string(),
                transport.serializer(),
                self.inner.resolver.clone(),
                self.inner.consume_interceptors.clone(),
                self.inner.graph.clone(),
                self.inner.bus_hooks.clone(),
                transport.default_scope_enabled(),
            ));
            let context = TransportContext::new(
                pipeline,
                self.inner.pending.clone(),
                self.inner.reply_path.clone(),
            );
            match transport.start(context).await {
                Ok(()) => started.push(index),
                Err(error) => {
                    log::error!(
                        "transport '{}' failed to start: {}; stopping the bus",
                        transport.name(),
                        error
                    );
                    for index in started.into_iter().rev() {
                        let transport = self.inner.lanes[index].transport();
                        if let Err(stop_error) = transport.stop().await {
                            log::error!(
                                "transport '{}' failed to stop while unwinding: {}",
                                transport.name(),
                                stop_error
                            );
                        }
                    }
                    *self.inner.state.write() = BusState::Stopped;
                    return Err(error);
                }
            }
        }

        let sweeper =
            pending::spawn_sweeper(self.inner.pending.clone(), self.inner.shutdown.clone());
        *self.inner.sweeper.lock() = Some(sweeper);
        *self.inner.state.write() = BusState::Started;
        log::info!("bus started with {} transport(s)", self.inner.lanes.len());
        Ok(())
    }

    /// Stop accepting messages, stop the transports in reverse registration
    /// order and fail every outstanding request.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn stop(&self) -> BusResult<()> {
        {
            let mut state = self.inner.state.write();
            if *state != BusState::Started {
                return Err(Error::BusStopped);
            }
            *state = BusState::Stopping;
        }
        for lane in self.inner.lanes.iter().rev() {
            let transport = lane.transport();
            if let Err(error) = transport.stop().await {
                log::error!("transport '{}' failed to stop: {}", transport.name(), error);
            }
        }
        self.inner.pending.fail_all();
        self.inner.shutdown.cancel();
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        *self.inner.state.write() = BusState::Stopped;
        log::info!("bus stopped");
        Ok(())
    }
}

/// Builder collecting transports and bus-wide settings.
///
/// `build` aggregates every transport's producer registrations into the
/// routing table and validates the consumer registrations; configuration
/// faults surface here rather than at first use.
pub struct MessageBusBuilder {
    transports: Vec<Box<dyn Transport>>,
    resolver: Arc<dyn Resolver>,
    default_timeout: Option<Duration>,
    sweep_interval: Duration,
    header_modifier: Option<HeaderModifier>,
    hooks: MessageHooks,
    produce_interceptors: InterceptorRegistry<dyn ProduceInterceptor>,
    consume_interceptors: InterceptorRegistry<dyn ConsumeInterceptor>,
    graph: TypeGraph,
}

impl Default for MessageBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBusBuilder {
    /// A builder with no transports and an empty resolver
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            resolver: Arc::new(TypeMapResolver::new()),
            default_timeout: None,
            sweep_interval: Duration::from_millis(100),
            header_modifier: None,
            hooks: MessageHooks::new(),
            produce_interceptors: InterceptorRegistry::new(),
            consume_interceptors: InterceptorRegistry::new(),
            graph: TypeGraph::default(),
        }
    }

    /// Add a transport; messages route to it by the producer types it
    /// registers
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Box::new(transport));
        self
    }

    /// Resolver handlers are constructed from
    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Reply timeout applied when neither the call nor the producer spec
    /// declares one; without it requests without a timeout wait forever
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Upper bound on the timeout sweeper interval; the sweeper tightens
    /// itself to half of the smallest registered timeout
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Mutate the headers of every outgoing message, after the producer
    /// spec's own modifier
    pub fn with_header_modifier(
        mut self,
        modifier: impl Fn(&mut crate::headers::Headers, &DynMessage) + Send + Sync + 'static,
    ) -> Self {
        self.header_modifier = Some(Arc::new(modifier));
        self
    }

    /// Bus-level lifecycle hooks, fired after the spec-level ones
    pub fn with_hooks(mut self, hooks: MessageHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Producer interceptor for messages of type `M` and its derived kinds
    pub fn with_produce_interceptor<M: Message>(
        mut self,
        interceptor: impl ProduceInterceptor + 'static,
    ) -> Self {
        self.graph.add(&TypeRecord::of::<M>());
        self.produce_interceptors
            .register(TypeId::of::<M>(), Arc::new(interceptor));
        self
    }

    /// Consumer interceptor for messages of type `M` and its derived kinds
    pub fn with_consume_interceptor<M: Message>(
        mut self,
        interceptor: impl ConsumeInterceptor + 'static,
    ) -> Self {
        self.graph.add(&TypeRecord::of::<M>());
        self.consume_interceptors
            .register(TypeId::of::<M>(), Arc::new(interceptor));
        self
    }

    /// Validate the configuration and build the bus. The bus still needs an
    /// explicit [`MessageBus::start`].
    pub fn build(mut self) -> BusResult<MessageBus> {
        ensure!(
            !self.transports.is_empty(),
            Configuration {
                reason: "a bus needs at least one transport",
            }
        );

        let mut routes = RoutingTable::default();
        let mut by_name = HashMap::new();
        for (index, transport) in self.transports.iter().enumerate() {
            let name = transport.name().to_string();
            if by_name.insert(name.clone(), index).is_some() {
                return Configuration {
                    reason: format!("transport name '{}' is not unique", name),
                }
                .fail();
            }
            for spec in transport.producer_specs() {
                self.graph.add(spec.record());
                routes.insert(
                    spec.record().id,
                    spec.message().type_name(),
                    transport.name(),
                )?;
            }
            for spec in transport.consumer_specs() {
                spec.validate()?;
                for record in spec.invoker_records() {
                    self.graph.add(record);
                }
            }
        }

        let graph = Arc::new(self.graph);
        let pending = Arc::new(PendingRequests::new(self.sweep_interval));
        let produce_interceptors = Arc::new(self.produce_interceptors);
        let consume_interceptors = Arc::new(self.consume_interceptors);
        let reply_path = format!("reply.{}", Uuid::new_v4());

        let mut lanes = Vec::with_capacity(self.transports.len());
        for transport in self.transports {
            let specs: HashMap<TypeId, ProducerSpec> = transport
                .producer_specs()
                .into_iter()
                .map(|spec| (spec.record().id, spec))
                .collect();
            let serializer = transport.serializer();
            lanes.push(Lane::new(
                transport,
                specs,
                serializer,
                produce_interceptors.clone(),
                graph.clone(),
                pending.clone(),
                self.hooks.clone(),
                self.header_modifier.clone(),
                reply_path.clone(),
                self.default_timeout,
            ));
        }

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                lanes,
                by_name,
                routes,
                graph,
                pending,
                resolver: self.resolver,
                consume_interceptors,
                bus_hooks: self.hooks,
                reply_path,
                state: RwLock::new(BusState::Built),
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }
}
