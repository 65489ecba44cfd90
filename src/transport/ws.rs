//! Websocket link carrying envelopes as JSON text frames.
//!
//! A background worker owns the socket. Outbound envelopes wait in an
//! in-memory queue while the link reconnects, so per-recipient send order
//! survives reconnects.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::proto::{Address, Envelope};
use crate::retry::{retry_async, RetryPolicy};
use crate::transport::{Link, QueueTransport, TransportError};

/// Header carrying the optional auth token.
pub const AUTH_HEADER: &str = "x-api-key";

/// Default reconnect backoff bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WsLinkDefaults;

impl WsLinkDefaults {
    pub const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
    pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
}

/// Websocket link configuration.
#[derive(Clone, Debug)]
pub struct WsLinkConfig {
    endpoint: String,
    address: Address,
    auth_token: Option<SecretString>,
    connect_retry: RetryPolicy,
    min_reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
}

impl WsLinkConfig {
    /// Creates a config for the context `address` reachable at `endpoint`.
    pub fn new(endpoint: impl Into<String>, address: Address) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            address,
            auth_token: None,
            connect_retry: RetryPolicy::default(),
            min_reconnect_backoff: WsLinkDefaults::MIN_RECONNECT_BACKOFF,
            max_reconnect_backoff: WsLinkDefaults::MAX_RECONNECT_BACKOFF,
        }
    }

    /// Sends `token` in the [`AUTH_HEADER`] header on every connect.
    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Retry policy applied to each connect, including the first one.
    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    /// Bounds for the exponential delay between reconnects.
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_backoff = min;
        self.max_reconnect_backoff = max.max(min);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// Connects websocket links.
pub struct WsLink;

impl WsLink {
    /// Opens a websocket link.
    ///
    /// This spawns a background worker that owns the socket and resolves once
    /// the first connection is established.
    pub async fn connect(config: WsLinkConfig) -> Result<Link, TransportError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let address = config.address.clone();

        tokio::spawn(async move {
            ws_link_worker(config, outbound_rx, inbound_tx, ready_tx).await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Link::new(
                address,
                QueueTransport::new(outbound_tx),
                inbound_rx,
            )),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Protocol(
                "websocket worker stopped before initial connect".to_string(),
            )),
        }
    }
}

enum LinkOutcome {
    GracefulShutdown,
    Reconnect,
}

async fn ws_link_worker(
    config: WsLinkConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    ready_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut pending = VecDeque::new();
    let mut backoff = config.min_reconnect_backoff;

    loop {
        match run_connected_link(
            &config,
            &mut outbound_rx,
            &inbound_tx,
            &mut pending,
            &mut ready_tx,
        )
        .await
        {
            Ok(LinkOutcome::GracefulShutdown) => {
                debug!(event = "ws_link_shutdown", address = %config.address);
                break;
            }
            Ok(LinkOutcome::Reconnect) => {
                debug!(
                    event = "ws_link_reconnecting",
                    address = %config.address,
                    queued = pending.len()
                );
                backoff = config.min_reconnect_backoff;
            }
            Err(err) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                warn!(event = "ws_link_connect_failed", address = %config.address, error = %err);
            }
        }

        if outbound_rx.is_closed() {
            break;
        }

        if !collect_envelopes_during_delay(backoff, &mut outbound_rx, &mut pending).await {
            break;
        }

        backoff = std::cmp::min(backoff.saturating_mul(2), config.max_reconnect_backoff);
    }
}

async fn run_connected_link(
    config: &WsLinkConfig,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    inbound_tx: &mpsc::UnboundedSender<Envelope>,
    pending: &mut VecDeque<Envelope>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), TransportError>>>,
) -> Result<LinkOutcome, TransportError> {
    let mut socket = retry_async(
        &config.connect_retry,
        |_| open_socket(config),
        |err| matches!(err, TransportError::WebSocket(_)),
    )
    .await?;

    debug!(event = "ws_link_connected", endpoint = %config.endpoint);
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }

    while let Some(next) = pending.pop_front() {
        if send_envelope(&mut socket, &next).await.is_err() {
            pending.push_front(next);
            return Ok(LinkOutcome::Reconnect);
        }
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(envelope) => {
                        if send_envelope(&mut socket, &envelope).await.is_err() {
                            pending.push_front(envelope);
                            return Ok(LinkOutcome::Reconnect);
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(LinkOutcome::GracefulShutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match Envelope::from_text(&text) {
                        Ok(envelope) => {
                            let _ = inbound_tx.send(envelope);
                        }
                        Err(err) => {
                            warn!(event = "ws_link_malformed_envelope", error = %err);
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(LinkOutcome::Reconnect);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(LinkOutcome::Reconnect),
                    Some(Ok(_)) => {
                        warn!(event = "ws_link_unexpected_frame");
                    }
                    Some(Err(_)) => return Ok(LinkOutcome::Reconnect),
                    None => return Ok(LinkOutcome::Reconnect),
                }
            }
        }
    }
}

async fn open_socket(
    config: &WsLinkConfig,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    TransportError,
> {
    let mut request = config.endpoint.as_str().into_client_request()?;
    if let Some(token) = config.auth_token.as_ref() {
        let header = token.expose_secret().parse()?;
        request.headers_mut().insert(AUTH_HEADER, header);
    }
    let (socket, _) = connect_async(request).await?;
    Ok(socket)
}

async fn send_envelope<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    envelope: &Envelope,
) -> Result<(), TransportError>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = envelope.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn collect_envelopes_during_delay(
    delay: Duration,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    pending: &mut VecDeque<Envelope>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe_envelope = outbound_rx.recv() => {
                match maybe_envelope {
                    Some(envelope) => pending.push_back(envelope),
                    None => return false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{collect_envelopes_during_delay, WsLinkConfig, WsLinkDefaults};
    use crate::proto::{Address, Envelope, ReplyResult, ResponseMsg};

    #[test]
    fn config_trims_endpoint_and_uses_default_backoff() {
        let config = WsLinkConfig::new("ws://127.0.0.1:9000/link  \n", Address::new("client"));
        assert_eq!(config.endpoint(), "ws://127.0.0.1:9000/link");
        assert_eq!(
            config.min_reconnect_backoff,
            WsLinkDefaults::MIN_RECONNECT_BACKOFF
        );
        assert_eq!(
            config.max_reconnect_backoff,
            WsLinkDefaults::MAX_RECONNECT_BACKOFF
        );
    }

    #[test]
    fn reconnect_backoff_max_never_below_min() {
        let config = WsLinkConfig::new("ws://x", Address::new("client"))
            .with_reconnect_backoff(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(config.max_reconnect_backoff, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn envelopes_sent_during_backoff_are_queued_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = VecDeque::new();
        for id in 0..3 {
            tx.send(Envelope::Response {
                recipient: Address::new("service"),
                data: ResponseMsg {
                    id,
                    result: ReplyResult::Ok(json!(id)),
                },
            })
            .expect("enqueue");
        }

        let keep_going =
            collect_envelopes_during_delay(Duration::from_millis(5), &mut rx, &mut pending).await;
        assert!(keep_going);
        let ids: Vec<u64> = pending
            .iter()
            .map(|envelope| match envelope {
                Envelope::Response { data, .. } => data.id,
                _ => u64::MAX,
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        drop(tx);
        let keep_going =
            collect_envelopes_during_delay(Duration::from_secs(5), &mut rx, &mut pending).await;
        assert!(!keep_going);
    }
}
