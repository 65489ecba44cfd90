//! Stream-id to subscriber map owned by a client.
//!
//! Entries are added when a stream is created and removed once a
//! cancellation reply arrives. Events for unknown ids are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;

use crate::observable::subscriber::SubscriberShared;
use crate::proto::{EventKind, StreamId};

/// Routes inbound stream events to the subscriber they belong to.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, Arc<SubscriberShared>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, subscriber: Arc<SubscriberShared>) {
        self.streams()
            .insert(subscriber.id().clone(), subscriber);
    }

    /// Drops the bookkeeping for `id`. Returns false if it was not present.
    pub fn unregister(&self, id: &StreamId) -> bool {
        let removed = self.streams().remove(id).is_some();
        if removed {
            debug!(event = "observable_unregistered", stream_id = %id);
        }
        removed
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.streams().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams().is_empty()
    }

    /// Delivers one stream event.
    ///
    /// Returns false when no subscriber is registered for `id`; the event is
    /// then dropped.
    pub fn dispatch(&self, id: &StreamId, kind: EventKind, data: Value) -> bool {
        let Some(subscriber) = self.streams().get(id).cloned() else {
            debug!(event = "observable_event_discarded", stream_id = %id, kind = %kind);
            return false;
        };
        subscriber.deliver(kind, data);
        true
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, Arc<SubscriberShared>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.len())
            .finish()
    }
}
