use crate::{
    headers::{keys, Headers},
    serializer::{MessageVtable, Payload, Serializer},
    BusResult,
    DuplicateRequest,
    DynMessage,
    Error,
    Handler,
    RequestTimeout,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// In-flight request/response exchanges keyed by `RequestId`.
///
/// Every entry is settled exactly once, by a matching reply, by the timeout
/// sweeper, or by cancellation; whichever comes first removes the entry and
/// later attempts are dropped.
pub(crate) struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
    sweep_interval: Duration,
    min_timeout_millis: AtomicU64,
}

struct PendingEntry {
    deadline: Option<Instant>,
    response: MessageVtable,
    serializer: Arc<dyn Serializer>,
    reply: oneshot::Sender<BusResult<DynMessage>>,
}

/// Await side of a registered request
#[derive(Debug)]
pub(crate) struct PendingHandle {
    rx: oneshot::Receiver<BusResult<DynMessage>>,
}

impl PendingHandle {
    pub(crate) async fn wait(self) -> BusResult<DynMessage> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::BusStopped),
        }
    }
}

impl PendingRequests {
    pub(crate) fn new(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_interval,
            min_timeout_millis: AtomicU64::new(u64::MAX),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn register(
        &self,
        id: &str,
        response: MessageVtable,
        serializer: Arc<dyn Serializer>,
        timeout: Option<Duration>,
    ) -> BusResult<PendingHandle> {
        let (tx, rx) = oneshot::channel();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        if let Some(timeout) = timeout {
            self.min_timeout_millis
                .fetch_min((timeout.as_millis() as u64).max(1), Ordering::Relaxed);
        }
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => DuplicateRequest { request_id: id }.fail(),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    deadline,
                    response,
                    serializer,
                    reply: tx,
                });
                Ok(PendingHandle { rx })
            }
        }
    }

    /// Complete the matching request with a reply envelope. A non-empty
    /// `Error` header marks a remote handler failure.
    pub(crate) fn settle(&self, id: &str, payload: Payload, headers: &Headers) {
        let entry = match self.entries.remove(id) {
            Some((_, entry)) => entry,
            None => {
                log::debug!("no pending request '{}' for the received reply", id);
                return;
            }
        };
        let outcome = match headers.string(keys::ERROR) {
            Some(message) if !message.is_empty() => Handler { message }.fail(),
            _ => entry.serializer.deserialize(&entry.response, payload),
        };
        let _ = entry.reply.send(outcome);
    }

    /// Complete the matching request with `error`
    pub(crate) fn cancel(&self, id: &str, error: Error) {
        if let Some((_, entry)) = self.entries.remove(id) {
            let _ = entry.reply.send(Err(error));
        }
    }

    /// Drop a registration whose caller already has its outcome
    pub(crate) fn abort(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Interval until the next sweep, at most half of the smallest timeout
    /// registered so far
    pub(crate) fn sweep_granularity(&self) -> Duration {
        let min = self.min_timeout_millis.load(Ordering::Relaxed);
        let mut millis = self.sweep_interval.as_millis() as u64;
        if min != u64::MAX {
            millis = millis.min((min / 2).max(1));
        }
        Duration::from_millis(millis)
    }

    /// Time out every entry whose deadline has passed
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().deadline.map(|d| d <= now).unwrap_or(false))
            .map(|entry| entry.key().clone())
            .collect();
        for id in expired {
            let removed = self
                .entries
                .remove_if(&id, |_, entry| {
                    entry.deadline.map(|d| d <= now).unwrap_or(false)
                });
            if let Some((id, entry)) = removed {
                log::debug!("request '{}' timed out waiting for a reply", id);
                let _ = entry.reply.send(RequestTimeout { request_id: id }.fail());
            }
        }
    }

    /// Fail every in-flight request, used at shutdown
    pub(crate) fn fail_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.cancel(&id, Error::BusStopped);
        }
    }
}

/// Drive periodic sweeps until `shutdown` fires
pub(crate) fn spawn_sweeper(
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let granularity = pending.sweep_granularity();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(granularity) => pending.sweep(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{serializer::JsonSerializer, Message};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Pong {
        value: u32,
    }
    impl Message for Pong {
        type Reply = ();
    }

    fn registry() -> PendingRequests {
        PendingRequests::new(Duration::from_millis(100))
    }

    fn json() -> Arc<dyn Serializer> {
        Arc::new(JsonSerializer)
    }

    #[tokio::test]
    async fn a_matching_reply_settles_the_request() {
        let pending = registry();
        let handle = pending
            .register("r-1", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        let payload = Payload::Bytes(serde_json::to_vec(&Pong { value: 3 }).unwrap());
        pending.settle("r-1", payload, &Headers::new());
        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.downcast_ref::<Pong>(), Some(&Pong { value: 3 }));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn an_error_header_becomes_a_handler_failure() {
        let pending = registry();
        let handle = pending
            .register("r-2", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        let mut headers = Headers::new();
        headers.set(keys::ERROR, "nope");
        pending.settle("r-2", Payload::Bytes(Vec::new()), &headers);
        let error = handle.wait().await.unwrap_err();
        assert!(matches!(error, Error::Handler { .. }));
        assert!(error.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn colliding_ids_are_rejected() {
        let pending = registry();
        let _handle = pending
            .register("r-3", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        let error = pending
            .register("r-3", MessageVtable::of::<Pong>(), json(), None)
            .unwrap_err();
        assert!(matches!(error, Error::DuplicateRequest { .. }));
    }

    #[tokio::test]
    async fn only_the_first_settle_wins() {
        let pending = registry();
        let handle = pending
            .register("r-4", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        pending.cancel("r-4", Error::Cancelled);
        // late reply after cancellation is silently dropped
        let payload = Payload::Bytes(serde_json::to_vec(&Pong { value: 9 }).unwrap());
        pending.settle("r-4", payload, &Headers::new());
        assert!(matches!(handle.wait().await.unwrap_err(), Error::Cancelled));
    }

    #[tokio::test]
    async fn the_sweeper_times_out_expired_entries() {
        let pending = Arc::new(PendingRequests::new(Duration::from_millis(100)));
        let handle = pending
            .register(
                "r-5",
                MessageVtable::of::<Pong>(),
                json(),
                Some(Duration::from_millis(40)),
            )
            .unwrap();
        assert!(pending.sweep_granularity() <= Duration::from_millis(20));
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(pending.clone(), shutdown.clone());
        let started = Instant::now();
        let error = handle.wait().await.unwrap_err();
        assert!(matches!(error, Error::RequestTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(pending.len(), 0);
        shutdown.cancel();
        let _ = sweeper.await;
    }

    #[tokio::test]
    async fn fail_all_drains_the_registry() {
        let pending = registry();
        let first = pending
            .register("r-6", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        let second = pending
            .register("r-7", MessageVtable::of::<Pong>(), json(), None)
            .unwrap();
        pending.fail_all();
        assert!(matches!(first.wait().await.unwrap_err(), Error::BusStopped));
        assert!(matches!(second.wait().await.unwrap_err(), Error::BusStopped));
        assert_eq!(pending.len(), 0);
    }
}
