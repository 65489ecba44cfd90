//! Cancelable streaming observables.
//!
//! - `state`: terminal-state machine arbitrating producer actions.
//! - `producer`: service-side writable end.
//! - `subscriber`: client-side readable end.
//! - `registry`: routes inbound stream events to subscribers.

use serde_json::Value;
use thiserror::Error;

use crate::proto::RemoteError;
use crate::transport::TransportError;

/// Service-side writable observable.
pub mod producer;
/// Subscriber registry and event router.
pub mod registry;
/// Terminal-state machine.
pub mod state;
/// Client-side readable observable.
pub mod subscriber;

pub use producer::{CancelHandler, StreamProducer};
pub use registry::StreamRegistry;
pub use state::{Action, StreamState};
pub use subscriber::{Aborted, ListenerId, StreamSubscriber};

/// Errors returned by producer actions.
#[derive(Debug, Error)]
pub enum ObservableError {
    /// The producer already reached a terminal state.
    #[error("can't {action} on current state: {state}")]
    InvalidState { action: Action, state: StreamState },

    /// A cancellation request reached a producer without a cancel handler.
    #[error("producer does not support cancellation")]
    NotImplemented,

    /// The cancel handler failed; carries its failure reason.
    #[error("cancel handler failed: {0}")]
    CancelHandler(Value),

    /// The envelope could not be enqueued.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ObservableError {
    /// Encodes this error as the failure payload of a cancellation reply.
    ///
    /// Cancel handler failures are forwarded verbatim.
    pub fn to_reply(&self) -> Value {
        let name = match self {
            ObservableError::CancelHandler(reason) => return reason.clone(),
            ObservableError::InvalidState { .. } => "InvalidStateError",
            ObservableError::NotImplemented => "NotImplementedError",
            ObservableError::Transport(_) => "TransportError",
        };
        RemoteError::new(name, self.to_string()).to_value()
    }
}
