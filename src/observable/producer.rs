//! Writable end of an observable, handed to service handlers.
//!
//! Every action goes through the state machine under one lock, and the
//! envelope is enqueued before the lock is released. Whichever of
//! close/abort/cancel is evaluated first wins; later actions fail with
//! [`ObservableError::InvalidState`] and transmit nothing.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, BoxFuture, Either, FutureExt};
use serde_json::Value;
use tracing::debug;

use crate::observable::state::{Action, StateMachine, StreamState};
use crate::observable::ObservableError;
use crate::proto::{Address, Envelope, EventKind, ObservableEventMsg, StreamId};
use crate::transport::Transport;

/// Handles a subscriber's cancellation request.
///
/// The returned future's value or failure reason becomes the reply to the
/// subscriber. An error returned without suspending counts the same as a
/// deferred one.
pub trait CancelHandler: Send + Sync + 'static {
    fn cancel(&self, reason: Value) -> BoxFuture<'static, Result<Value, Value>>;
}

impl<F, Fut> CancelHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Value>> + Send + 'static,
{
    fn cancel(&self, reason: Value) -> BoxFuture<'static, Result<Value, Value>> {
        self(reason).boxed()
    }
}

type ReleaseHook = Box<dyn Fn(&StreamId) + Send + Sync>;

/// Service-side end of one stream.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StreamProducer {
    shared: Arc<ProducerShared>,
}

struct ProducerShared {
    id: StreamId,
    recipient: Address,
    transport: Arc<dyn Transport>,
    inner: Mutex<ProducerInner>,
    release: Option<ReleaseHook>,
}

#[derive(Default)]
struct ProducerInner {
    machine: StateMachine,
    cancel_handler: Option<Arc<dyn CancelHandler>>,
}

impl StreamProducer {
    /// Creates a producer sending events for `id` to `recipient`.
    pub fn new(id: StreamId, recipient: Address, transport: Arc<dyn Transport>) -> Self {
        Self::build(id, recipient, transport, None)
    }

    /// Like [`StreamProducer::new`], calling `release` once the producer
    /// reaches a terminal state.
    pub(crate) fn with_release<R>(
        id: StreamId,
        recipient: Address,
        transport: Arc<dyn Transport>,
        release: R,
    ) -> Self
    where
        R: Fn(&StreamId) + Send + Sync + 'static,
    {
        Self::build(id, recipient, transport, Some(Box::new(release)))
    }

    fn build(
        id: StreamId,
        recipient: Address,
        transport: Arc<dyn Transport>,
        release: Option<ReleaseHook>,
    ) -> Self {
        Self {
            shared: Arc::new(ProducerShared {
                id,
                recipient,
                transport,
                inner: Mutex::new(ProducerInner::default()),
                release,
            }),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.shared.id
    }

    pub fn recipient(&self) -> &Address {
        &self.shared.recipient
    }

    pub fn state(&self) -> StreamState {
        self.lock().machine.state()
    }

    /// Opts into cancellation. Replaces any previous handler.
    pub fn set_cancel_handler<H>(&self, handler: H)
    where
        H: CancelHandler,
    {
        self.lock().cancel_handler = Some(Arc::new(handler));
    }

    /// Sends a chunk of data to the subscriber.
    pub fn write(&self, data: impl Into<Value>) -> Result<(), ObservableError> {
        self.post(Action::Write, EventKind::Write, data.into())
    }

    /// Ends the stream successfully with an optional payload (`()` for none).
    pub fn close(&self, data: impl Into<Value>) -> Result<(), ObservableError> {
        self.post(Action::Close, EventKind::Close, data.into())
    }

    /// Ends the stream as failed; `reason` reaches the subscriber's `closed`.
    pub fn abort(&self, reason: impl Into<Value>) -> Result<(), ObservableError> {
        self.post(Action::Abort, EventKind::Abort, reason.into())
    }

    /// Applies a cancellation request.
    ///
    /// Normally driven by the service when a subscriber cancels. The state
    /// check, the transition and the handler call happen before this
    /// returns; the future only waits for the handler's outcome. Without a
    /// handler this fails with [`ObservableError::NotImplemented`] and the
    /// producer stays writable. A failing handler still leaves it canceled.
    pub fn cancel(
        &self,
        reason: Value,
    ) -> impl Future<Output = Result<Value, ObservableError>> + Send + 'static {
        let handler = match self.begin_cancel() {
            Ok(handler) => handler,
            Err(err) => return Either::Left(future::ready(Err(err))),
        };
        self.release();
        debug!(event = "observable_canceled", stream_id = %self.shared.id);

        let outcome = handler.cancel(reason);
        Either::Right(outcome.map(|result| result.map_err(ObservableError::CancelHandler)))
    }

    fn begin_cancel(&self) -> Result<Arc<dyn CancelHandler>, ObservableError> {
        let mut inner = self.lock();
        inner.machine.check(Action::Cancel)?;
        let handler = inner
            .cancel_handler
            .clone()
            .ok_or(ObservableError::NotImplemented)?;
        inner.machine.transition(Action::Cancel)?;
        Ok(handler)
    }

    fn post(&self, action: Action, kind: EventKind, data: Value) -> Result<(), ObservableError> {
        let (state, sent) = {
            let mut inner = self.lock();
            let state = inner.machine.transition(action)?;
            let sent = self.shared.transport.send(Envelope::ObservableEvent {
                recipient: self.shared.recipient.clone(),
                data: ObservableEventMsg {
                    id: self.shared.id.clone(),
                    kind,
                    data,
                },
            });
            (state, sent)
        };

        debug!(event = "observable_post", stream_id = %self.shared.id, kind = %kind);
        if state.is_terminal() {
            self.release();
        }
        sent.map_err(ObservableError::from)
    }

    fn release(&self) {
        if let Some(release) = self.shared.release.as_ref() {
            release(&self.shared.id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProducerInner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StreamProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProducer")
            .field("id", &self.shared.id)
            .field("recipient", &self.shared.recipient)
            .field("state", &self.state())
            .finish()
    }
}
