//! In-process hub connecting any number of contexts.
//!
//! Each attached context owns one unbounded inbox, so envelopes between a
//! given sender and recipient arrive in send order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::proto::{Address, Envelope};
use crate::transport::{Link, Transport, TransportError};

type Routes = Arc<RwLock<HashMap<Address, mpsc::UnboundedSender<Envelope>>>>;

/// Routes envelopes to attached contexts by recipient address.
#[derive(Clone, Default)]
pub struct MemoryHub {
    routes: Routes,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a context under `address`.
    ///
    /// Re-attaching an address replaces the previous inbox.
    pub fn attach(&self, address: Address) -> Link {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), tx);
        Link::new(
            address,
            HubTransport {
                routes: Arc::clone(&self.routes),
            },
            rx,
        )
    }

    /// Detaches a context; envelopes sent to it afterwards are dropped.
    pub fn detach(&self, address: &Address) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .is_some()
    }

    pub fn is_attached(&self, address: &Address) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }
}

struct HubTransport {
    routes: Routes,
}

impl Transport for HubTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let recipient = envelope.recipient().clone();
        match routes.get(&recipient) {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    warn!(event = "hub_recipient_gone", recipient = %recipient);
                }
            }
            None => warn!(event = "hub_unknown_recipient", recipient = %recipient),
        }
        Ok(())
    }
}
