use crate::{
    consumer::ConsumeContext,
    transport::ProduceRequest,
    BusResult,
    DynMessage,
    HandlerError,
    Message,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Type identity of a message together with its declared base kinds
#[derive(Clone, Debug)]
pub struct TypeRecord {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
    pub(crate) parents: Vec<TypeId>,
}

impl TypeRecord {
    /// Capture the identity of `M`
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: M::type_name(),
            parents: M::parent_types(),
        }
    }
}

/// Declared parent chains of every registered message type. Built once at
/// bus build and read-only afterwards.
#[derive(Default)]
pub(crate) struct TypeGraph {
    parents: HashMap<TypeId, Vec<TypeId>>,
    names: HashMap<TypeId, &'static str>,
}

impl TypeGraph {
    pub(crate) fn add(&mut self, record: &TypeRecord) {
        self.names.insert(record.id, record.name);
        self.parents
            .entry(record.id)
            .or_insert_with(|| record.parents.clone());
    }

    /// Base kinds of `ty` grouped by distance, starting with `ty` itself
    pub(crate) fn levels(&self, ty: TypeId) -> Vec<Vec<TypeId>> {
        let mut levels = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(ty);
        let mut frontier = vec![ty];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in &frontier {
                if let Some(parents) = self.parents.get(id) {
                    for parent in parents {
                        if seen.insert(*parent) {
                            next.push(*parent);
                        }
                    }
                }
            }
            levels.push(frontier);
            frontier = next;
        }
        levels
    }

    /// `ty` followed by its base kinds, most derived first
    pub(crate) fn ancestry(&self, ty: TypeId) -> Vec<TypeId> {
        self.levels(ty).into_iter().flatten().collect()
    }
}

/// Continuation invoked by a producer interceptor to run the remainder of the
/// produce chain
pub type ProduceNext = Box<dyn FnOnce(ProduceRequest) -> BoxFuture<'static, BusResult<()>> + Send>;

/// Middleware wrapping the produce side of the pipeline.
///
/// Interceptors run in registration order, most-derived message type first;
/// each may mutate the request, short-circuit by not calling `next`, or fail
/// the produce.
#[async_trait]
pub trait ProduceInterceptor: Send + Sync {
    /// Wrap the rest of the produce chain
    async fn intercept(&self, request: ProduceRequest, next: ProduceNext) -> BusResult<()>;
}

/// Continuation invoked by a consumer interceptor to run the remainder of the
/// consume chain, yielding the handler response if any
pub type ConsumeNext = Box<
    dyn FnOnce(DynMessage) -> BoxFuture<'static, Result<Option<DynMessage>, HandlerError>> + Send,
>;

/// Middleware wrapping handler invocation on the consume side
#[async_trait]
pub trait ConsumeInterceptor: Send + Sync {
    /// Wrap the rest of the consume chain
    async fn intercept(
        &self,
        message: DynMessage,
        context: Arc<ConsumeContext>,
        next: ConsumeNext,
    ) -> Result<Option<DynMessage>, HandlerError>;
}

/// Interceptors registered per message type, with a memoized
/// most-derived-first lookup over the type graph
pub(crate) struct InterceptorRegistry<I: ?Sized> {
    by_type: HashMap<TypeId, Vec<Arc<I>>>,
    cache: RwLock<HashMap<TypeId, Arc<Vec<Arc<I>>>>>,
}

impl<I: ?Sized> InterceptorRegistry<I> {
    pub(crate) fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&mut self, ty: TypeId, interceptor: Arc<I>) {
        self.by_type.entry(ty).or_insert_with(Vec::new).push(interceptor);
    }

    pub(crate) fn lookup(&self, ty: TypeId, graph: &TypeGraph) -> Arc<Vec<Arc<I>>> {
        if let Some(cached) = self.cache.read().get(&ty) {
            return cached.clone();
        }
        let mut list = Vec::new();
        for id in graph.ancestry(ty) {
            if let Some(registered) = self.by_type.get(&id) {
                list.extend(registered.iter().cloned());
            }
        }
        let list = Arc::new(list);
        self.cache.write().insert(ty, list.clone());
        list
    }
}

/// Fold producer interceptors around a terminal continuation. The first
/// interceptor in `interceptors` becomes the outermost wrapper.
pub(crate) fn produce_chain(
    interceptors: &[Arc<dyn ProduceInterceptor>],
    terminal: ProduceNext,
) -> ProduceNext {
    let mut next = terminal;
    for interceptor in interceptors.iter().rev() {
        let interceptor = interceptor.clone();
        let inner = next;
        next = Box::new(move |request| {
            Box::pin(async move { interceptor.intercept(request, inner).await })
        });
    }
    next
}

/// Fold consumer interceptors around the handler invocation
pub(crate) fn consume_chain(
    interceptors: &[Arc<dyn ConsumeInterceptor>],
    context: Arc<ConsumeContext>,
    terminal: ConsumeNext,
) -> ConsumeNext {
    let mut next = terminal;
    for interceptor in interceptors.iter().rev() {
        let interceptor = interceptor.clone();
        let context = context.clone();
        let inner = next;
        next = Box::new(move |message| {
            Box::pin(async move { interceptor.intercept(message, context, inner).await })
        });
    }
    next
}
