//! Service context hosting named observables.
//!
//! A [`Service`] answers `"observable"` requests by creating a
//! [`StreamProducer`] addressed to the requesting client and running the
//! registered handler with it. `"observablecancel"` requests are routed to the
//! live producer with that stream id.
//!
//! Producers are released once terminal. A cancel request for a stream that
//! already closed, aborted or was canceled therefore finds no producer and
//! is answered with `UnknownStream`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::observable::{ObservableError, StreamProducer};
use crate::proto::{
    Address, CancelObservableMsg, Envelope, RemoteError, RequestMsg, StartObservableMsg, StreamId,
    OBSERVABLE_CANCEL_METHOD, OBSERVABLE_METHOD,
};
use crate::rpc::send_reply;
use crate::transport::{Link, Transport};

/// Errors produced while serving requests.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request method is not served.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// No observable is registered under the requested name.
    #[error("unknown observable: {0}")]
    UnknownObservable(String),

    /// No live producer has the requested stream id.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// A live producer already uses the requested stream id.
    #[error("stream already exists: {0}")]
    DuplicateStream(StreamId),

    /// Request payload did not decode.
    #[error("invalid request payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Link is attached under a different address than the service.
    #[error("link address {actual} does not match service address {expected}")]
    AddressMismatch { expected: Address, actual: Address },
}

impl ServiceError {
    /// Encodes this error as the failure payload of a reply.
    pub fn to_reply(&self) -> Value {
        let name = match self {
            ServiceError::UnknownMethod(_) => "UnknownMethod",
            ServiceError::UnknownObservable(_) => "UnknownObservable",
            ServiceError::UnknownStream(_) => "UnknownStream",
            ServiceError::DuplicateStream(_) => "DuplicateStream",
            ServiceError::InvalidPayload(_) => "InvalidPayload",
            ServiceError::AddressMismatch { .. } => "AddressMismatch",
        };
        RemoteError::new(name, self.to_string()).to_value()
    }
}

type ObservableHandler =
    Arc<dyn Fn(StreamProducer, Value) -> BoxFuture<'static, Result<(), ObservableError>> + Send + Sync>;

/// Collects the observables a service offers.
pub struct ServiceBuilder {
    address: Address,
    handlers: HashMap<String, ObservableHandler>,
}

impl ServiceBuilder {
    /// Registers `handler` under `name`, replacing any earlier one.
    ///
    /// The handler receives the producer and the start arguments. If it
    /// returns an error, the stream is aborted with that error unless it
    /// already ended.
    pub fn observable<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StreamProducer, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ObservableError>> + Send + 'static,
    {
        let boxed: ObservableHandler =
            Arc::new(move |producer: StreamProducer, args: Value| handler(producer, args).boxed());
        self.handlers.insert(name.into(), boxed);
        self
    }

    pub fn build(self) -> Service {
        Service {
            inner: Arc::new(ServiceInner {
                address: self.address,
                handlers: self.handlers,
                producers: Arc::new(ProducerRegistry::default()),
            }),
        }
    }
}

/// Serves observables over a [`Link`].
///
/// Cheap to clone; clones share the producer registry.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    address: Address,
    handlers: HashMap<String, ObservableHandler>,
    producers: Arc<ProducerRegistry>,
}

impl Service {
    pub fn builder(address: Address) -> ServiceBuilder {
        ServiceBuilder {
            address,
            handlers: HashMap::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Number of producers that have not reached a terminal state.
    pub fn active_streams(&self) -> usize {
        self.inner.producers.len()
    }

    /// Processes requests arriving on `link` until its inbox closes.
    pub async fn serve(&self, link: Link) -> Result<(), ServiceError> {
        if link.address() != self.address() {
            return Err(ServiceError::AddressMismatch {
                expected: self.address().clone(),
                actual: link.address().clone(),
            });
        }
        let (_, transport, mut inbox) = link.into_parts();

        while let Some(envelope) = inbox.recv().await {
            match envelope {
                Envelope::Request { sender, data, .. } => {
                    self.handle_request(&transport, sender, data);
                }
                Envelope::Response { data, .. } => {
                    warn!(event = "service_unexpected_response", request_id = data.id);
                }
                Envelope::ObservableEvent { data, .. } => {
                    warn!(event = "service_unexpected_event", stream_id = %data.id);
                }
            }
        }

        debug!(event = "service_inbox_closed", address = %self.address());
        Ok(())
    }

    /// Runs [`Service::serve`] on a background task.
    pub fn spawn(&self, link: Link) -> JoinHandle<Result<(), ServiceError>> {
        let service = self.clone();
        tokio::spawn(async move { service.serve(link).await })
    }

    fn handle_request(&self, transport: &Arc<dyn Transport>, sender: Address, request: RequestMsg) {
        let RequestMsg { id, method, data } = request;
        debug!(event = "service_request", request_id = id, method = %method, sender = %sender);

        let handled = match method.as_str() {
            OBSERVABLE_METHOD => self.start(transport, &sender, id, data),
            OBSERVABLE_CANCEL_METHOD => self.cancel(transport, &sender, id, data),
            _ => Err(ServiceError::UnknownMethod(method.clone())),
        };
        if let Err(err) = handled {
            warn!(event = "service_request_rejected", request_id = id, error = %err);
            reply(transport.as_ref(), sender, id, Err(err.to_reply()));
        }
    }

    fn start(
        &self,
        transport: &Arc<dyn Transport>,
        sender: &Address,
        request_id: u64,
        data: Value,
    ) -> Result<(), ServiceError> {
        let StartObservableMsg { id, name, args } = serde_json::from_value(data)?;
        let handler = self
            .inner
            .handlers
            .get(&name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownObservable(name.clone()))?;

        let producer = self.inner.producers.create(id, sender.clone(), Arc::clone(transport))?;
        reply(transport.as_ref(), sender.clone(), request_id, Ok(Value::Null));
        debug!(event = "observable_producer_started", stream_id = %producer.id(), observable = %name);

        tokio::spawn(async move {
            if let Err(err) = handler(producer.clone(), args).await {
                warn!(event = "observable_handler_failed", stream_id = %producer.id(), error = %err);
                match producer.abort(err.to_reply()) {
                    Ok(()) => {}
                    Err(abort_err @ ObservableError::InvalidState { .. }) => {
                        debug!(
                            event = "observable_handler_abort_skipped",
                            stream_id = %producer.id(),
                            error = %abort_err
                        );
                    }
                    Err(abort_err) => {
                        warn!(
                            event = "observable_handler_abort_failed",
                            stream_id = %producer.id(),
                            error = %abort_err
                        );
                    }
                }
            }
        });
        Ok(())
    }

    fn cancel(
        &self,
        transport: &Arc<dyn Transport>,
        sender: &Address,
        request_id: u64,
        data: Value,
    ) -> Result<(), ServiceError> {
        let CancelObservableMsg { id, reason } = serde_json::from_value(data)?;
        let producer = self
            .inner
            .producers
            .get(&id)
            .ok_or(ServiceError::UnknownStream(id))?;

        // Arbitration happens here, in inbox order.
        let outcome = producer.cancel(reason);

        let transport = Arc::clone(transport);
        let sender = sender.clone();
        tokio::spawn(async move {
            let result = outcome.await.map_err(|err| err.to_reply());
            reply(transport.as_ref(), sender, request_id, result);
        });
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.inner.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Service")
            .field("address", &self.inner.address)
            .field("observables", &names)
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

fn reply(transport: &dyn Transport, recipient: Address, id: u64, result: Result<Value, Value>) {
    if let Err(err) = send_reply(transport, recipient, id, result) {
        warn!(event = "service_reply_failed", request_id = id, error = %err);
    }
}

/// Live producers by stream id.
#[derive(Default)]
struct ProducerRegistry {
    producers: Mutex<HashMap<StreamId, StreamProducer>>,
}

impl ProducerRegistry {
    fn create(
        self: &Arc<Self>,
        id: StreamId,
        recipient: Address,
        transport: Arc<dyn Transport>,
    ) -> Result<StreamProducer, ServiceError> {
        let mut producers = self.producers();
        if producers.contains_key(&id) {
            return Err(ServiceError::DuplicateStream(id));
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let producer = StreamProducer::with_release(id.clone(), recipient, transport, move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        });
        producers.insert(id, producer.clone());
        Ok(producer)
    }

    fn get(&self, id: &StreamId) -> Option<StreamProducer> {
        self.producers().get(id).cloned()
    }

    fn remove(&self, id: &StreamId) {
        if self.producers().remove(id).is_some() {
            debug!(event = "observable_producer_released", stream_id = %id);
        }
    }

    fn len(&self) -> usize {
        self.producers().len()
    }

    fn producers(&self) -> MutexGuard<'_, HashMap<StreamId, StreamProducer>> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
