//! Readable end of an observable, returned by `Client::observable`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::observable::registry::StreamRegistry;
use crate::proto::{EventKind, StreamId, OBSERVABLE_CANCEL_METHOD};
use crate::rpc::{RpcClient, RpcError};

/// Rejection of [`StreamSubscriber::closed`]; carries the abort reason.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("observable aborted: {0}")]
pub struct Aborted(pub Value);

/// Handle returned by [`StreamSubscriber::listen`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;
type Settlement = Option<Result<Value, Aborted>>;

struct ListenerSet {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
    // Chunks received before the first listener; `None` once one attached.
    backlog: Option<Vec<Value>>,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
            backlog: Some(Vec::new()),
        }
    }
}

/// State shared between a subscriber handle and the registry routing to it.
pub(crate) struct SubscriberShared {
    id: StreamId,
    listeners: Mutex<ListenerSet>,
    // Serializes chunk delivery with the first listener's backlog replay.
    delivery: Mutex<()>,
    closed: watch::Sender<Settlement>,
}

impl SubscriberShared {
    pub(crate) fn new(id: StreamId) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            id,
            listeners: Mutex::new(ListenerSet::default()),
            delivery: Mutex::new(()),
            closed,
        }
    }

    pub(crate) fn id(&self) -> &StreamId {
        &self.id
    }

    /// Applies one inbound stream event.
    pub(crate) fn deliver(&self, kind: EventKind, data: Value) {
        match kind {
            EventKind::Write => self.emit(data),
            EventKind::Close => self.settle(Ok(data)),
            EventKind::Abort => self.settle(Err(Aborted(data))),
        }
    }

    fn emit(&self, data: Value) {
        let _delivery = self.delivery();
        // Membership changes made by a listener apply from the next chunk.
        let snapshot: Vec<Listener> = {
            let mut listeners = self.listeners();
            if let Some(backlog) = listeners.backlog.as_mut() {
                backlog.push(data);
                return;
            }
            listeners
                .entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in snapshot {
            listener(&data);
        }
    }

    fn is_listening(&self, id: ListenerId) -> bool {
        self.listeners()
            .entries
            .iter()
            .any(|(existing, _)| *existing == id)
    }

    fn settle(&self, outcome: Result<Value, Aborted>) {
        let settled = self.closed.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if !settled {
            debug!(event = "observable_duplicate_terminal", stream_id = %self.id);
        }
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerSet> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client-side end of one stream.
///
/// Cheap to clone; clones share listeners and the `closed` settlement.
#[derive(Clone)]
pub struct StreamSubscriber {
    shared: Arc<SubscriberShared>,
    registry: Arc<StreamRegistry>,
    rpc: Arc<RpcClient>,
}

impl StreamSubscriber {
    pub(crate) fn new(
        shared: Arc<SubscriberShared>,
        registry: Arc<StreamRegistry>,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            shared,
            registry,
            rpc,
        }
    }

    pub fn id(&self) -> &StreamId {
        self.shared.id()
    }

    /// Calls `callback` with the payload of every subsequent chunk.
    ///
    /// Chunks that arrived before the first listener was attached are held
    /// back and replayed, in order, to that first listener before it sees
    /// any newer chunk.
    pub fn listen<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: Listener = Arc::new(callback);
        let first = self.shared.listeners().backlog.is_some();
        let _delivery = first.then(|| self.shared.delivery());

        let (id, backlog) = {
            let mut listeners = self.shared.listeners();
            listeners.next_id += 1;
            let id = ListenerId(listeners.next_id);
            listeners.entries.push((id, Arc::clone(&callback)));
            (id, listeners.backlog.take())
        };

        for data in backlog.into_iter().flatten() {
            if !self.shared.is_listening(id) {
                break;
            }
            callback(&data);
        }
        id
    }

    /// Removes a listener. Returns false when it was not registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners();
        let before = listeners.entries.len();
        listeners.entries.retain(|(existing, _)| *existing != id);
        before != listeners.entries.len()
    }

    /// Resolves with the close payload or rejects with the abort reason.
    ///
    /// Never completes for a stream that was canceled before terminating.
    pub async fn closed(&self) -> Result<Value, Aborted> {
        let mut rx = self.shared.closed.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    /// Returns the settlement if the stream already terminated.
    pub fn try_closed(&self) -> Option<Result<Value, Aborted>> {
        self.shared.closed.borrow().clone()
    }

    /// Asks the producer to cancel the stream.
    ///
    /// Resolves with the producer's cancel handler result. Once the reply
    /// arrives, successful or not, the stream is dropped from the registry
    /// and late events for it are discarded. `closed` is left untouched.
    pub fn cancel(
        &self,
        reason: impl Into<Value>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send + 'static {
        let id = self.id().clone();
        let reason = reason.into();
        debug!(event = "observable_cancel_requested", stream_id = %id);

        let sent = self.rpc.request(
            OBSERVABLE_CANCEL_METHOD,
            json!({ "id": id.as_str(), "reason": reason }),
        );
        let registry = Arc::clone(&self.registry);
        async move {
            let result = match sent {
                Ok(reply) => reply.await,
                Err(err) => Err(err),
            };
            registry.unregister(&id);
            result
        }
    }
}

impl std::fmt::Debug for StreamSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscriber")
            .field("id", self.id())
            .field("closed", &self.try_closed())
            .finish()
    }
}
