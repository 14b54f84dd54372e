use crate::headers::Headers;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Snapshot of a message handed to lifecycle hooks
pub struct HookContext<'a> {
    /// Path the message was produced to or consumed from
    pub path: &'a str,
    /// Wire name of the message type
    pub message_type: &'a str,
    /// Headers at the time the hook fires
    pub headers: &'a Headers,
}

/// Lifecycle hook invoked inline on the task handling the message
pub type MessageHook = Arc<dyn Fn(&HookContext<'_>) + Send + Sync>;

/// Fault hook, additionally given the failure
pub type FaultHook = Arc<dyn Fn(&HookContext<'_>, &dyn std::error::Error) + Send + Sync>;

/// Optional lifecycle callbacks carried by producer/consumer specs and by the
/// bus itself. Spec-level hooks fire before bus-level ones; all of them are
/// best-effort and must not block for unbounded time.
#[derive(Clone, Default)]
pub struct MessageHooks {
    pub(crate) on_produced: Option<MessageHook>,
    pub(crate) on_arrived: Option<MessageHook>,
    pub(crate) on_expired: Option<MessageHook>,
    pub(crate) on_fault: Option<FaultHook>,
    pub(crate) on_finished: Option<MessageHook>,
}

impl MessageHooks {
    /// No hooks
    pub fn new() -> Self {
        Default::default()
    }

    /// Fired after a message was handed to the transport
    pub fn on_produced(mut self, hook: impl Fn(&HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.on_produced = Some(Arc::new(hook));
        self
    }

    /// Fired when a message reaches the consumer pipeline
    pub fn on_arrived(mut self, hook: impl Fn(&HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.on_arrived = Some(Arc::new(hook));
        self
    }

    /// Fired when an expired message is dropped
    pub fn on_expired(mut self, hook: impl Fn(&HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.on_expired = Some(Arc::new(hook));
        self
    }

    /// Fired when the handler or an interceptor fails
    pub fn on_fault(
        mut self,
        hook: impl Fn(&HookContext<'_>, &dyn std::error::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_fault = Some(Arc::new(hook));
        self
    }

    /// Fired after handler invocation, before any reply is sent
    pub fn on_finished(mut self, hook: impl Fn(&HookContext<'_>) + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Arc::new(hook));
        self
    }
}

/// Invoke a hook, swallowing and logging a panic
pub(crate) fn fire(hook: &Option<MessageHook>, context: &HookContext<'_>) {
    if let Some(hook) = hook {
        if catch_unwind(AssertUnwindSafe(|| hook(context))).is_err() {
            log::error!(
                "a message hook panicked while handling '{}' on '{}'",
                context.message_type,
                context.path
            );
        }
    }
}

/// Invoke a fault hook, swallowing and logging a panic
pub(crate) fn fire_fault(
    hook: &Option<FaultHook>,
    context: &HookContext<'_>,
    error: &dyn std::error::Error,
) {
    if let Some(hook) = hook {
        if catch_unwind(AssertUnwindSafe(|| hook(context, error))).is_err() {
            log::error!(
                "a fault hook panicked while handling '{}' on '{}'",
                context.message_type,
                context.path
            );
        }
    }
}
