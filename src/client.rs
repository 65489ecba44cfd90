//! Client context: starts observables on a service and routes their events.
//!
//! [`Client::connect`] spawns an inbox worker that completes pending
//! requests and hands stream events to the [`StreamRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::observable::subscriber::SubscriberShared;
use crate::observable::{StreamRegistry, StreamSubscriber};
use crate::proto::{Address, Envelope, EventKind, StreamId, OBSERVABLE_METHOD};
use crate::rpc::{RpcClient, RpcError};
use crate::transport::Link;

/// Errors produced by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request could not be issued.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Client end of a connection to one service.
pub struct Client {
    rpc: Arc<RpcClient>,
    registry: Arc<StreamRegistry>,
    next_stream: AtomicU64,
    worker: JoinHandle<()>,
}

impl Client {
    /// Attaches a client to `service` over `link` and starts its inbox
    /// worker. Must be called within a tokio runtime.
    pub fn connect(link: Link, service: Address) -> Self {
        let (address, transport, inbox) = link.into_parts();
        let rpc = Arc::new(RpcClient::new(address, service, transport));
        let registry = Arc::new(StreamRegistry::new());

        let worker = tokio::spawn(client_inbox_worker(
            inbox,
            Arc::clone(&rpc),
            Arc::clone(&registry),
        ));

        Self {
            rpc,
            registry,
            next_stream: AtomicU64::new(1),
            worker,
        }
    }

    pub fn address(&self) -> &Address {
        self.rpc.address()
    }

    pub fn service(&self) -> &Address {
        self.rpc.service()
    }

    /// Registry of this client's live streams.
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Starts the observable `name` on the service.
    ///
    /// The subscriber is registered before the start request is sent.
    /// Chunks arriving before the first `listen` are held and replayed to
    /// that listener, so no chunk is lost whichever thread routes it. If the
    /// service rejects the start request, `closed` rejects with the failure.
    pub fn observable(
        &self,
        name: &str,
        args: impl Into<Value>,
    ) -> Result<StreamSubscriber, ClientError> {
        let id = self.next_stream_id();
        let shared = Arc::new(SubscriberShared::new(id.clone()));
        self.registry.register(Arc::clone(&shared));

        let started = self.rpc.request(
            OBSERVABLE_METHOD,
            json!({ "id": id.as_str(), "name": name, "args": args.into() }),
        );
        let reply = match started {
            Ok(reply) => reply,
            Err(err) => {
                self.registry.unregister(&id);
                return Err(err.into());
            }
        };
        debug!(event = "observable_started", stream_id = %id, observable = name);

        let registry = Arc::clone(&self.registry);
        let stream_id = id.clone();
        tokio::spawn(async move {
            match reply.await {
                Ok(_) => {}
                Err(RpcError::Rejected(reason)) => {
                    warn!(event = "observable_start_rejected", stream_id = %stream_id);
                    registry.dispatch(&stream_id, EventKind::Abort, reason);
                }
                Err(err) => {
                    warn!(event = "observable_start_failed", stream_id = %stream_id, error = %err);
                }
            }
        });

        Ok(StreamSubscriber::new(
            shared,
            Arc::clone(&self.registry),
            Arc::clone(&self.rpc),
        ))
    }

    /// Sends a raw request to the service and waits for its reply.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        self.rpc.request(method, data)?.await
    }

    fn next_stream_id(&self) -> StreamId {
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        StreamId::new(format!("{}:{n}", self.rpc.address()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.worker.abort();
        self.rpc.disconnect();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", self.address())
            .field("service", self.service())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

async fn client_inbox_worker(
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    rpc: Arc<RpcClient>,
    registry: Arc<StreamRegistry>,
) {
    while let Some(envelope) = inbox.recv().await {
        match envelope {
            Envelope::ObservableEvent { data, .. } => {
                registry.dispatch(&data.id, data.kind, data.data);
            }
            Envelope::Response { data, .. } => {
                rpc.complete(data);
            }
            Envelope::Request { sender, data, .. } => {
                warn!(
                    event = "client_unexpected_request",
                    sender = %sender,
                    method = %data.method
                );
            }
        }
    }

    debug!(event = "client_inbox_closed", address = %rpc.address());
    rpc.disconnect();
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Client;
    use crate::proto::{Address, Envelope, EventKind, ObservableEventMsg, StreamId};
    use crate::transport::Link;

    #[tokio::test]
    async fn stream_ids_are_unique_and_sent_with_start_request() {
        let (link, mut outbound, _inbound) = Link::queued(Address::new("client-1"));
        let client = Client::connect(link, Address::new("svc"));

        let first = client.observable("feed", json!([1])).expect("first");
        let second = client.observable("feed", json!([2])).expect("second");
        assert_ne!(first.id(), second.id());
        assert_eq!(client.registry().len(), 2);

        match outbound.recv().await.expect("start request") {
            Envelope::Request {
                recipient, data, ..
            } => {
                assert_eq!(recipient, Address::new("svc"));
                assert_eq!(data.method, "observable");
                assert_eq!(data.data["id"], json!(first.id().as_str()));
                assert_eq!(data.data["name"], json!("feed"));
                assert_eq!(data.data["args"], json!([1]));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbox_routes_events_to_subscriber() {
        let (link, _outbound, inbound) = Link::queued(Address::new("client-1"));
        let client = Client::connect(link, Address::new("svc"));
        let subscriber = client.observable("feed", json!(null)).expect("observable");

        inbound
            .send(Envelope::ObservableEvent {
                recipient: Address::new("client-1"),
                data: ObservableEventMsg {
                    id: subscriber.id().clone(),
                    kind: EventKind::Close,
                    data: json!("done"),
                },
            })
            .expect("deliver");
        inbound
            .send(Envelope::ObservableEvent {
                recipient: Address::new("client-1"),
                data: ObservableEventMsg {
                    id: StreamId::new("unknown"),
                    kind: EventKind::Write,
                    data: json!("ignored"),
                },
            })
            .expect("deliver");

        assert_eq!(subscriber.closed().await, Ok(json!("done")));
    }

    #[test]
    fn observable_on_closed_link_fails_and_unregisters() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let (link, outbound, _inbound) = Link::queued(Address::new("client-1"));
            let client = Client::connect(link, Address::new("svc"));
            drop(outbound);

            assert!(client.observable("feed", json!(null)).is_err());
            assert!(client.registry().is_empty());
        });
    }
}
