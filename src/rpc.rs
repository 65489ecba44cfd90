//! Request/response correlation over an envelope transport.
//!
//! The client side allocates request ids and parks a oneshot per pending
//! request; the inbox worker completes it when the matching response
//! arrives. The service side answers with [`send_reply`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::proto::{Address, Envelope, RemoteError, ReplyResult, RequestMsg, ResponseMsg};
use crate::transport::{Transport, TransportError};

/// Errors observed by the requesting side.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The remote side answered with a failure.
    #[error("request rejected: {0}")]
    Rejected(Value),

    /// The connection went away before a reply arrived.
    #[error("connection closed before a reply arrived")]
    Disconnected,

    /// The request could not be enqueued.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Failure payload sent by the remote side, if any.
    pub fn reason(&self) -> Option<&Value> {
        match self {
            RpcError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Library failure sent by the remote side, if the payload is one.
    pub fn remote_error(&self) -> Option<RemoteError> {
        self.reason().and_then(RemoteError::from_value)
    }
}

/// Issues requests to one service address.
pub struct RpcClient {
    address: Address,
    service: Address,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
}

impl RpcClient {
    pub fn new(address: Address, service: Address, transport: Arc<dyn Transport>) -> Self {
        Self {
            address,
            service,
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn service(&self) -> &Address {
        &self.service
    }

    /// Sends a request and returns a future for its reply.
    ///
    /// The request is enqueued before this returns; awaiting the reply is
    /// optional.
    pub fn request(&self, method: &str, data: Value) -> Result<PendingReply, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let envelope = Envelope::Request {
            sender: self.address.clone(),
            recipient: self.service.clone(),
            data: RequestMsg {
                id,
                method: method.to_string(),
                data,
            },
        };
        if let Err(err) = self.transport.send(envelope) {
            self.pending().remove(&id);
            return Err(err.into());
        }

        debug!(event = "rpc_request_sent", request_id = id, method);
        Ok(PendingReply { rx })
    }

    /// Completes the pending request matching `response`.
    ///
    /// Returns false when no request with that id is pending.
    pub fn complete(&self, response: ResponseMsg) -> bool {
        let Some(tx) = self.pending().remove(&response.id) else {
            debug!(event = "rpc_unmatched_response", request_id = response.id);
            return false;
        };
        let _ = tx.send(response.result);
        true
    }

    /// Fails every pending request with [`RpcError::Disconnected`].
    pub fn disconnect(&self) {
        let dropped = self.pending().drain().count();
        if dropped > 0 {
            debug!(event = "rpc_disconnected", dropped);
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<ReplyResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reply to a request sent through [`RpcClient::request`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<ReplyResult>,
}

impl Future for PendingReply {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(ReplyResult::Ok(value)) => Ok(value),
            Ok(ReplyResult::Err(reason)) => Err(RpcError::Rejected(reason)),
            Err(_) => Err(RpcError::Disconnected),
        })
    }
}

/// Sends the response to request `id` back to `recipient`.
pub fn send_reply(
    transport: &dyn Transport,
    recipient: Address,
    id: u64,
    result: Result<Value, Value>,
) -> Result<(), TransportError> {
    transport.send(Envelope::Response {
        recipient,
        data: ResponseMsg {
            id,
            result: result.into(),
        },
    })
}
