use async_trait::async_trait;
use mbus_core::{
    keys,
    ConsumeContext,
    ConsumeInterceptor,
    ConsumeNext,
    ConsumerSpec,
    DynMessage,
    Error,
    HandlerError,
    HeaderValue,
    Headers,
    Message,
    MessageBus,
    MessageConsumer,
    MessageHooks,
    MemoryTransport,
    ProduceInterceptor,
    ProduceNext,
    ProduceRequest,
    ProducerSpec,
    PublishOptions,
    RequestHandler,
    SendOptions,
    TypeMapResolver,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    any::TypeId,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Order {
    id: u32,
}
impl Message for Order {
    type Reply = ();

    fn type_name() -> &'static str {
        "Order"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct RushOrder {
    id: u32,
}
impl Message for RushOrder {
    type Reply = ();

    fn type_name() -> &'static str {
        "RushOrder"
    }

    fn parent_types() -> Vec<TypeId> {
        vec![TypeId::of::<Order>()]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Echo {
    text: String,
}
impl Message for Echo {
    type Reply = EchoReply;

    fn type_name() -> &'static str {
        "Echo"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct EchoReply {
    text: String,
}
impl Message for EchoReply {
    type Reply = ();

    fn type_name() -> &'static str {
        "EchoReply"
    }
}

#[derive(Default)]
struct FirstSink {
    seen: Mutex<Vec<Arc<Order>>>,
}

#[async_trait]
impl MessageConsumer<Order> for FirstSink {
    async fn on_message(
        &self,
        message: Arc<Order>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.seen.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
struct SecondSink {
    seen: Mutex<Vec<Arc<Order>>>,
}

#[async_trait]
impl MessageConsumer<Order> for SecondSink {
    async fn on_message(
        &self,
        message: Arc<Order>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.seen.lock().push(message);
        Ok(())
    }
}

struct EchoHandler;

#[async_trait]
impl RequestHandler<Echo> for EchoHandler {
    async fn on_request(
        &self,
        request: Arc<Echo>,
        _context: &ConsumeContext,
    ) -> Result<EchoReply, HandlerError> {
        match request.text.as_str() {
            "fail" => Err(std::io::Error::new(std::io::ErrorKind::Other, "nope").into()),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(EchoReply {
                    text: request.text.clone(),
                })
            }
            _ => Ok(EchoReply {
                text: request.text.clone(),
            }),
        }
    }
}

fn order_fanout_bus(serialization: bool) -> (MessageBus, Arc<FirstSink>, Arc<SecondSink>) {
    let first = Arc::new(FirstSink::default());
    let second = Arc::new(SecondSink::default());
    let transport = MemoryTransport::builder()
        .with_serialization(serialization)
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, ArcSink>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, ArcSink2>("orders"))
        .build();
    let first_instance = first.clone();
    let second_instance = second.clone();
    let resolver = TypeMapResolver::new()
        .with_handler(move || ArcSink(first_instance.clone()))
        .with_handler(move || ArcSink2(second_instance.clone()));
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(resolver)
        .build()
        .unwrap();
    (bus, first, second)
}

// newtype wrappers so the resolver can hand out shared sinks by type
struct ArcSink(Arc<FirstSink>);

#[async_trait]
impl MessageConsumer<Order> for ArcSink {
    async fn on_message(
        &self,
        message: Arc<Order>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.on_message(message, context).await
    }
}

struct ArcSink2(Arc<SecondSink>);

#[async_trait]
impl MessageConsumer<Order> for ArcSink2 {
    async fn on_message(
        &self,
        message: Arc<Order>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.on_message(message, context).await
    }
}

#[tokio::test]
async fn publishing_without_consumers_succeeds() -> TestResult {
    init_tracing();
    let transport = MemoryTransport::builder()
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .build();
    let bus = MessageBus::builder().with_transport(transport).build()?;
    bus.start().await?;
    bus.publish(Order { id: 1 }).await?;
    bus.stop().await?;
    Ok(())
}

#[tokio::test]
async fn fanout_with_serialization_hands_each_consumer_its_own_copy() -> TestResult {
    init_tracing();
    let (bus, first, second) = order_fanout_bus(true);
    bus.start().await?;
    bus.publish(Order { id: 7 }).await?;

    let first_seen = first.seen.lock();
    let second_seen = second.seen.lock();
    assert_eq!(first_seen.len(), 1);
    assert_eq!(second_seen.len(), 1);
    assert_eq!(*first_seen[0], Order { id: 7 });
    assert_eq!(*second_seen[0], Order { id: 7 });
    // each consumer decoded its own clone
    assert!(!Arc::ptr_eq(&first_seen[0], &second_seen[0]));
    Ok(())
}

#[tokio::test]
async fn fanout_without_serialization_hands_consumers_the_original() -> TestResult {
    init_tracing();
    let (bus, first, second) = order_fanout_bus(false);
    bus.start().await?;
    bus.publish(Order { id: 7 }).await?;

    let first_seen = first.seen.lock();
    let second_seen = second.seen.lock();
    assert_eq!(*first_seen[0], Order { id: 7 });
    // both consumers observe the very instance that was produced
    assert!(Arc::ptr_eq(&first_seen[0], &second_seen[0]));
    Ok(())
}

fn echo_bus() -> MessageBus {
    let transport = MemoryTransport::builder()
        .with_producer(ProducerSpec::topic::<Echo>("echo"))
        .with_consumer(ConsumerSpec::request_response::<Echo, EchoHandler>("echo"))
        .build();
    MessageBus::builder()
        .with_transport(transport)
        .with_resolver(TypeMapResolver::new().with_handler(|| EchoHandler))
        .build()
        .unwrap()
}

#[tokio::test]
async fn send_completes_with_the_handler_reply() -> TestResult {
    init_tracing();
    let bus = echo_bus();
    bus.start().await?;
    let reply = bus
        .send(Echo {
            text: "hi".to_string(),
        })
        .await?;
    assert_eq!(reply.text, "hi");
    assert_eq!(bus.in_flight(), 0);
    bus.stop().await?;
    Ok(())
}

#[tokio::test]
async fn send_times_out_when_the_handler_is_too_slow() -> TestResult {
    init_tracing();
    let bus = echo_bus();
    bus.start().await?;
    let started = Instant::now();
    let error = bus
        .send_ext(
            Echo {
                text: "slow".to_string(),
            },
            SendOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(error, Error::RequestTimeout { .. }), "{}", error);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
    assert_eq!(bus.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn handler_failures_reach_the_requester() -> TestResult {
    init_tracing();
    let bus = echo_bus();
    bus.start().await?;
    let error = bus
        .send(Echo {
            text: "fail".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Handler { .. }), "{}", error);
    assert!(error.to_string().contains("nope"));
    assert_eq!(bus.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_settles_the_request() -> TestResult {
    init_tracing();
    let bus = echo_bus();
    bus.start().await?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let error = bus
        .send_ext(
            Echo {
                text: "slow".to_string(),
            },
            SendOptions::new().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Cancelled), "{}", error);
    assert_eq!(bus.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_messages_are_dropped_before_the_handler() -> TestResult {
    init_tracing();
    let expired = Arc::new(AtomicUsize::new(0));
    let expires_seen = Arc::new(Mutex::new(None));
    let sink = Arc::new(FirstSink::default());
    let sink_instance = sink.clone();

    let transport = MemoryTransport::builder()
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, ArcSink>("orders"))
        .build();
    let counter = expired.clone();
    let stamp = expires_seen.clone();
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(
            TypeMapResolver::new().with_handler(move || ArcSink(sink_instance.clone())),
        )
        .with_hooks(MessageHooks::new().on_expired(move |context| {
            counter.fetch_add(1, Ordering::SeqCst);
            *stamp.lock() = context.headers.timestamp(keys::EXPIRES);
        }))
        .build()?;
    bus.start().await?;

    let expiry = unix_millis() - 1_000;
    bus.publish_ext(
        Order { id: 9 },
        PublishOptions::new().with_header(keys::EXPIRES, HeaderValue::Timestamp(expiry)),
    )
    .await?;

    assert!(sink.seen.lock().is_empty(), "the handler must not run");
    assert_eq!(expired.load(Ordering::SeqCst), 1);
    assert_eq!(*expires_seen.lock(), Some(expiry));
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TypeX {}
impl Message for TypeX {
    type Reply = ();

    fn type_name() -> &'static str {
        "TypeX"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TypeY {}
impl Message for TypeY {
    type Reply = ();

    fn type_name() -> &'static str {
        "TypeY"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TypeZ {}
impl Message for TypeZ {
    type Reply = ();

    fn type_name() -> &'static str {
        "TypeZ"
    }
}

struct CountingSink<M> {
    count: AtomicUsize,
    _marker: std::marker::PhantomData<M>,
}

impl<M> Default for CountingSink<M> {
    fn default() -> Self {
        Self {
            count: AtomicUsize::new(0),
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<M: Message> MessageConsumer<M> for CountingSink<M> {
    async fn on_message(
        &self,
        _message: Arc<M>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct XSink(Arc<CountingSink<TypeX>>);

#[async_trait]
impl MessageConsumer<TypeX> for XSink {
    async fn on_message(
        &self,
        message: Arc<TypeX>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.on_message(message, context).await
    }
}

struct YSink(Arc<CountingSink<TypeY>>);

#[async_trait]
impl MessageConsumer<TypeY> for YSink {
    async fn on_message(
        &self,
        message: Arc<TypeY>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.on_message(message, context).await
    }
}

#[tokio::test]
async fn hybrid_buses_route_by_message_type() -> TestResult {
    init_tracing();
    let x_count = Arc::new(CountingSink::<TypeX>::default());
    let y_count = Arc::new(CountingSink::<TypeY>::default());

    let transport_a = MemoryTransport::builder()
        .with_name("a")
        .with_producer(ProducerSpec::topic::<TypeX>("x"))
        .with_consumer(ConsumerSpec::consumer::<TypeX, XSink>("x"))
        .build();
    let transport_b = MemoryTransport::builder()
        .with_name("b")
        .with_producer(ProducerSpec::queue::<TypeY>("y"))
        .with_consumer(ConsumerSpec::consumer::<TypeY, YSink>("y"))
        .build();

    let x_instance = x_count.clone();
    let y_instance = y_count.clone();
    let bus = MessageBus::builder()
        .with_transport(transport_a)
        .with_transport(transport_b)
        .with_resolver(
            TypeMapResolver::new()
                .with_handler(move || XSink(x_instance.clone()))
                .with_handler(move || YSink(y_instance.clone())),
        )
        .build()?;
    bus.start().await?;

    bus.publish(TypeX {}).await?;
    bus.publish(TypeY {}).await?;
    assert_eq!(x_count.count.load(Ordering::SeqCst), 1);
    assert_eq!(y_count.count.load(Ordering::SeqCst), 1);

    let error = bus.publish(TypeZ {}).await.unwrap_err();
    assert!(matches!(error, Error::NoRoute { .. }), "{}", error);
    Ok(())
}

#[tokio::test]
async fn duplicate_routes_fail_at_build() {
    init_tracing();
    let transport_a = MemoryTransport::builder()
        .with_name("a")
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .build();
    let transport_b = MemoryTransport::builder()
        .with_name("b")
        .with_producer(ProducerSpec::topic::<Order>("orders-too"))
        .build();
    let error = MessageBus::builder()
        .with_transport(transport_a)
        .with_transport(transport_b)
        .build()
        .unwrap_err();
    assert!(matches!(error, Error::DuplicateRoute { .. }), "{}", error);
}

#[derive(Default)]
struct HeaderCapture {
    headers: Mutex<Option<Headers>>,
}

struct CaptureSink(Arc<HeaderCapture>);

#[async_trait]
impl MessageConsumer<Order> for CaptureSink {
    async fn on_message(
        &self,
        _message: Arc<Order>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        *self.0.headers.lock() = Some(context.headers().clone());
        Ok(())
    }
}

#[tokio::test]
async fn unknown_headers_survive_the_serialized_loopback() -> TestResult {
    init_tracing();
    let capture = Arc::new(HeaderCapture::default());
    let transport = MemoryTransport::builder()
        .with_serialization(true)
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, CaptureSink>("orders"))
        .build();
    let capture_instance = capture.clone();
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(
            TypeMapResolver::new().with_handler(move || CaptureSink(capture_instance.clone())),
        )
        .build()?;
    bus.start().await?;

    bus.publish_ext(
        Order { id: 2 },
        PublishOptions::new()
            .with_header("X-Tenant", "blue")
            .with_header("X-Attempt", 2i64),
    )
    .await?;

    let seen = capture.headers.lock();
    let headers = seen.as_ref().expect("the consumer saw the message");
    assert_eq!(headers.string("X-Tenant"), Some("blue"));
    assert_eq!(headers.int("X-Attempt"), Some(2));
    assert_eq!(headers.string(keys::MESSAGE_TYPE), Some("Order"));
    Ok(())
}

struct TracingProduce {
    trace: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl ProduceInterceptor for TracingProduce {
    async fn intercept(
        &self,
        mut request: ProduceRequest,
        next: ProduceNext,
    ) -> mbus_core::BusResult<()> {
        self.trace.lock().push("produce");
        request.headers.set("X-Produced", true);
        next(request).await
    }
}

struct TracingConsume {
    label: &'static str,
    trace: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl ConsumeInterceptor for TracingConsume {
    async fn intercept(
        &self,
        message: DynMessage,
        _context: Arc<ConsumeContext>,
        next: ConsumeNext,
    ) -> Result<Option<DynMessage>, HandlerError> {
        self.trace.lock().push(self.label);
        let result = next(message).await;
        self.trace.lock().push(if self.label == "outer" {
            "outer-done"
        } else {
            "inner-done"
        });
        result
    }
}

struct TraceSink {
    trace: Arc<Mutex<Vec<&'static str>>>,
    produced_header: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl MessageConsumer<Order> for TraceSink {
    async fn on_message(
        &self,
        _message: Arc<Order>,
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.trace.lock().push("handler");
        *self.produced_header.lock() = context.headers().flag("X-Produced");
        Ok(())
    }
}

#[tokio::test]
async fn interceptors_wrap_both_pipelines_in_declared_order() -> TestResult {
    init_tracing();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let produced_header = Arc::new(Mutex::new(None));

    let transport = MemoryTransport::builder()
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, TraceSink>("orders"))
        .build();
    let sink_trace = trace.clone();
    let sink_header = produced_header.clone();
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(TypeMapResolver::new().with_handler(move || TraceSink {
            trace: sink_trace.clone(),
            produced_header: sink_header.clone(),
        }))
        .with_produce_interceptor::<Order>(TracingProduce {
            trace: trace.clone(),
        })
        .with_consume_interceptor::<Order>(TracingConsume {
            label: "outer",
            trace: trace.clone(),
        })
        .with_consume_interceptor::<Order>(TracingConsume {
            label: "inner",
            trace: trace.clone(),
        })
        .build()?;
    bus.start().await?;
    bus.publish(Order { id: 5 }).await?;

    assert_eq!(
        trace.lock().clone(),
        vec!["produce", "outer", "inner", "handler", "inner-done", "outer-done"]
    );
    // the produce interceptor's header mutation reached the consumer
    assert_eq!(*produced_header.lock(), Some(true));
    Ok(())
}

struct ScopedSink {
    live: Arc<AtomicUsize>,
    fail: bool,
}

impl Drop for ScopedSink {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageConsumer<Order> for ScopedSink {
    async fn on_message(
        &self,
        _message: Arc<Order>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        if self.fail {
            return Err("scoped handler failure".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn per_message_scopes_release_handlers_on_every_path() -> TestResult {
    init_tracing();
    let live = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicUsize::new(0));

    let transport = MemoryTransport::builder()
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(ConsumerSpec::consumer::<Order, ScopedSink>("orders").with_scope(true))
        .build();
    let factory_live = live.clone();
    let factory_fail = fail.clone();
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(TypeMapResolver::new().with_handler(move || {
            factory_live.fetch_add(1, Ordering::SeqCst);
            ScopedSink {
                live: factory_live.clone(),
                fail: factory_fail.load(Ordering::SeqCst) > 0,
            }
        }))
        .build()?;
    bus.start().await?;

    bus.publish(Order { id: 1 }).await?;
    assert_eq!(live.load(Ordering::SeqCst), 0, "scope released on success");

    fail.store(1, Ordering::SeqCst);
    let error = bus.publish(Order { id: 2 }).await.unwrap_err();
    assert!(matches!(error, Error::Handler { .. }), "{}", error);
    assert_eq!(live.load(Ordering::SeqCst), 0, "scope released on failure");
    Ok(())
}

#[derive(Default)]
struct AnyOrderSink {
    orders: AtomicUsize,
    rush: AtomicUsize,
}

struct AnySink(Arc<AnyOrderSink>);

#[async_trait]
impl MessageConsumer<Order> for AnySink {
    async fn on_message(
        &self,
        _message: Arc<Order>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.orders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageConsumer<RushOrder> for AnySink {
    async fn on_message(
        &self,
        _message: Arc<RushOrder>,
        _context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        self.0.rush.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn derived_kinds_route_through_their_base_registration() -> TestResult {
    init_tracing();
    let sink = Arc::new(AnyOrderSink::default());
    let transport = MemoryTransport::builder()
        .with_serialization(true)
        .with_producer(ProducerSpec::topic::<Order>("orders"))
        .with_consumer(
            ConsumerSpec::consumer::<Order, AnySink>("orders")
                .with_variant::<RushOrder, AnySink>(),
        )
        .build();
    let sink_instance = sink.clone();
    let bus = MessageBus::builder()
        .with_transport(transport)
        .with_resolver(TypeMapResolver::new().with_handler(move || AnySink(sink_instance.clone())))
        .build()?;
    bus.start().await?;

    // no producer of its own: the declared base kind routes it
    bus.publish(RushOrder { id: 11 }).await?;
    bus.publish(Order { id: 12 }).await?;

    assert_eq!(sink.rush.load(Ordering::SeqCst), 1);
    assert_eq!(sink.orders.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn a_stopped_bus_rejects_messages_and_fails_pending_requests() -> TestResult {
    init_tracing();
    let bus = echo_bus();

    // not started yet
    let error = bus.publish_on("echo", Echo { text: "x".into() }).await.unwrap_err();
    assert!(matches!(error, Error::BusStopped), "{}", error);

    bus.start().await?;
    let stopper = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = stopper.stop().await;
    });
    let error = bus
        .send(Echo {
            text: "slow".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(error, Error::BusStopped), "{}", error);

    let error = bus.publish_on("echo", Echo { text: "x".into() }).await.unwrap_err();
    assert!(matches!(error, Error::BusStopped), "{}", error);
    assert_eq!(bus.in_flight(), 0);
    Ok(())
}
