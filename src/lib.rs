//! Cancelable streaming observables between isolated execution contexts.
//!
//! The crate is organized by layer:
//! - `proto`: addresses, stream ids and the JSON envelope format.
//! - `transport`: envelope transports (in-memory hub, websocket link).
//! - `rpc`: request/response correlation over a transport.
//! - `observable`: producer state machine, subscriber and event router.
//! - `service`: service host serving named observables.
//! - `client`: client host starting and routing observables.
//! - `retry`: shared retry and timeout utilities.

/// Client host.
pub mod client;
/// Producer, subscriber and stream registry.
pub mod observable;
/// Wire protocol types.
pub mod proto;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Request/response correlation.
pub mod rpc;
/// Service host.
pub mod service;
/// Envelope transports.
pub mod transport;

pub use client::{Client, ClientError};
pub use observable::{ObservableError, StreamProducer, StreamSubscriber};
pub use proto::{Address, StreamId};
pub use service::{Service, ServiceBuilder, ServiceError};
