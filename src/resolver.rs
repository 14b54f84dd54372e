use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// An erased handler instance produced by a resolver
pub type DynHandler = Arc<dyn Any + Send + Sync>;

/// Dependency resolution contract consumed by the consumer pipeline.
///
/// The core never constructs handlers itself; it asks the resolver (or a
/// per-message scope created from it) for the consumer type registered on the
/// spec.
pub trait Resolver: Send + Sync {
    /// Resolve an instance of `ty`, if registered
    fn resolve(&self, ty: TypeId) -> Option<DynHandler>;
    /// Open a child resolution context tied to one message
    fn create_scope(&self) -> Box<dyn ResolverScope>;
}

/// Child resolution context whose lifetime equals one message's processing.
/// Instances it handed out are released when the scope is dropped.
pub trait ResolverScope: Send {
    /// Resolve an instance of `ty` within this scope
    fn resolve(&self, ty: TypeId) -> Option<DynHandler>;
}

type HandlerFactory = Arc<dyn Fn() -> DynHandler + Send + Sync>;

/// Simple resolver backed by a map of factories, one per handler type.
///
/// Factory registrations construct a fresh instance per resolution; instance
/// registrations hand out clones of one shared value. Scopes memoize, so a
/// message sees at most one instance of each handler type.
#[derive(Clone, Default)]
pub struct TypeMapResolver {
    factories: HashMap<TypeId, HandlerFactory>,
}

impl TypeMapResolver {
    /// An empty resolver
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a factory for handler type `H`
    pub fn with_handler<H: Send + Sync + 'static>(
        mut self,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::new(factory()) as DynHandler),
        );
        self
    }

    /// Register a shared instance of handler type `H`
    pub fn with_instance<H: Send + Sync + 'static>(mut self, instance: H) -> Self {
        let instance = Arc::new(instance);
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || instance.clone() as DynHandler),
        );
        self
    }
}

impl Resolver for TypeMapResolver {
    fn resolve(&self, ty: TypeId) -> Option<DynHandler> {
        Some(self.factories.get(&ty)?())
    }

    fn create_scope(&self) -> Box<dyn ResolverScope> {
        Box::new(TypeMapScope {
            factories: self.factories.clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

struct TypeMapScope {
    factories: HashMap<TypeId, HandlerFactory>,
    cache: Mutex<HashMap<TypeId, DynHandler>>,
}

impl ResolverScope for TypeMapScope {
    fn resolve(&self, ty: TypeId) -> Option<DynHandler> {
        if let Some(cached) = self.cache.lock().get(&ty) {
            return Some(cached.clone());
        }
        let instance = self.factories.get(&ty)?();
        self.cache.lock().insert(ty, instance.clone());
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        live: Arc<AtomicUsize>,
    }
    impl Drop for Counting {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn factories_build_per_resolution_and_scopes_memoize() {
        let live = Arc::new(AtomicUsize::new(0));
        let births = live.clone();
        let resolver = TypeMapResolver::new().with_handler(move || {
            births.fetch_add(1, Ordering::SeqCst);
            Counting {
                live: births.clone(),
            }
        });

        let ty = TypeId::of::<Counting>();
        let scope = resolver.create_scope();
        let first = scope.resolve(ty).unwrap();
        let second = scope.resolve(ty).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(live.load(Ordering::SeqCst), 1);

        drop(first);
        drop(second);
        assert_eq!(live.load(Ordering::SeqCst), 1, "scope still holds the instance");
        drop(scope);
        assert_eq!(live.load(Ordering::SeqCst), 0, "scope released its instances");
    }

    #[test]
    fn unregistered_types_resolve_to_none() {
        let resolver = TypeMapResolver::new();
        assert!(resolver.resolve(TypeId::of::<u32>()).is_none());
        assert!(resolver.create_scope().resolve(TypeId::of::<u32>()).is_none());
    }
}
