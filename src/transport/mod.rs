//! Envelope transports between execution contexts.
//!
//! - `memory`: in-process hub routing envelopes by recipient address.
//! - `ws`: websocket link with an outbound queue and reconnect handling.
//!
//! A transport only has to preserve send order per recipient. Sends are
//! fire-and-forget: `Ok(())` means the envelope was enqueued, not delivered.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::proto::{Address, Envelope};

/// In-process envelope hub.
pub mod memory;
/// Websocket envelope link.
pub mod ws;

/// Outbound half of a context's connection.
pub trait Transport: Send + Sync + 'static {
    /// Enqueues an envelope for its recipient.
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Errors produced by envelope transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Auth token could not be converted to a valid HTTP header value.
    #[error("invalid auth header: {0}")]
    InvalidAuthHeader(#[from] InvalidHeaderValue),

    /// Outbound envelope queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// Link protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Transport backed by an unbounded queue drained by some worker.
#[derive(Clone, Debug)]
pub struct QueueTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl QueueTransport {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }
}

impl Transport for QueueTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(envelope)
            .map_err(|_| TransportError::SendQueueClosed)
    }
}

/// A context's attachment point: its own address, an outbound transport and
/// the inbox of envelopes addressed to it.
pub struct Link {
    address: Address,
    transport: Arc<dyn Transport>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl Link {
    /// Builds a link from its parts.
    pub fn new<T>(address: Address, transport: T, inbox: mpsc::UnboundedReceiver<Envelope>) -> Self
    where
        T: Transport,
    {
        Self {
            address,
            transport: Arc::new(transport),
            inbox,
        }
    }

    /// Builds a link whose outbound envelopes land in the returned receiver
    /// and whose inbox is fed through the returned sender.
    ///
    /// Useful for bridging a link onto a foreign connection.
    pub fn queued(
        address: Address,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedSender<Envelope>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let link = Self::new(address, QueueTransport::new(outbound_tx), inbound_rx);
        (link, outbound_rx, inbound_tx)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns a shared handle to the outbound transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Splits into address, transport and inbox.
    pub fn into_parts(
        self,
    ) -> (
        Address,
        Arc<dyn Transport>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        (self.address, self.transport, self.inbox)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
