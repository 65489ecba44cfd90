use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{json, Value};
use threadlink::observable::{ObservableError, StreamProducer};
use threadlink::proto::Envelope;
use threadlink::retry::RetryPolicy;
use threadlink::transport::ws::{WsLink, WsLinkConfig};
use threadlink::transport::{Link, TransportError};
use threadlink::{Address, Client, Service};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";
const SERVICE: &str = "ws-service";
const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct WsState {
    expected_api_key: String,
    service: Service,
}

fn counting_service() -> Service {
    Service::builder(Address::new(SERVICE))
        .observable("count", |producer: StreamProducer, args: Value| async move {
            for n in 1..=args.as_u64().unwrap_or(0) {
                producer.write(n)?;
            }
            producer.close(json!({ "success": true }))?;
            Ok::<(), ObservableError>(())
        })
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_link_streams_observable_through_mock_server() {
    let state = WsState {
        expected_api_key: TEST_API_KEY.to_string(),
        service: counting_service(),
    };
    let app = Router::new()
        .route("/link", get(ws_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = WsLinkConfig::new(format!("ws://{addr}/link"), Address::new("ws-client"))
        .with_auth_token(SecretString::new(TEST_API_KEY.to_string()));
    let link = timeout(WAIT, WsLink::connect(config))
        .await
        .expect("timed out connecting ws link")
        .expect("connect ws link to mock server");
    let client = Client::connect(link, Address::new(SERVICE));

    let observable = client
        .observable("count", json!(3))
        .expect("start observable");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    observable.listen(move |data| sink.lock().expect("seen").push(data.clone()));

    let closed = timeout(WAIT, observable.closed())
        .await
        .expect("timed out waiting for close");
    assert_eq!(closed, Ok(json!({ "success": true })));

    let expected: Vec<Value> = (1..=3).map(|n| json!(n)).collect();
    assert_eq!(*seen.lock().expect("seen"), expected);

    drop(observable);
    drop(client);
    let _ = shutdown_tx.send(());
    let _ = timeout(WAIT, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_link_rejects_wrong_api_key() {
    let state = WsState {
        expected_api_key: TEST_API_KEY.to_string(),
        service: counting_service(),
    };
    let app = Router::new()
        .route("/link", get(ws_handler))
        .with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let config = WsLinkConfig::new(format!("ws://{addr}/link"), Address::new("ws-client"))
        .with_auth_token(SecretString::new("wrong-key".to_string()))
        .with_connect_retry(RetryPolicy::no_retry());
    let result = timeout(WAIT, WsLink::connect(config))
        .await
        .expect("timed out connecting ws link");
    assert!(matches!(result, Err(TransportError::WebSocket(_))));

    let _ = shutdown_tx.send(());
    let _ = timeout(WAIT, server_task).await;
}

async fn ws_handler(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let api_key_matches = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == state.expected_api_key);
    if !api_key_matches {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let service = state.service.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = bridge_socket(socket, service).await {
            eprintln!("mock ws bridge stopped: {err}");
        }
    })
    .into_response()
}

/// Relays envelopes between one websocket and a service running on a queued
/// link.
async fn bridge_socket(mut socket: WebSocket, service: Service) -> Result<(), String> {
    let (link, mut outbound, inbound) = Link::queued(Address::new(SERVICE));
    let served = service.spawn(link);

    loop {
        tokio::select! {
            maybe_outbound = outbound.recv() => {
                let Some(envelope) = maybe_outbound else {
                    break;
                };
                let payload = envelope
                    .to_text()
                    .map_err(|err| format!("failed to encode envelope: {err}"))?;
                socket
                    .send(Message::Text(payload.into()))
                    .await
                    .map_err(|err| format!("failed to send envelope: {err}"))?;
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = Envelope::from_text(text.as_str())
                            .map_err(|err| format!("failed to decode envelope: {err}"))?;
                        inbound
                            .send(envelope)
                            .map_err(|_| "service inbox closed".to_string())?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        socket
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|err| format!("failed to send pong: {err}"))?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => return Err("unexpected non-text frame".to_string()),
                    Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
                }
            }
        }
    }

    drop(inbound);
    let _ = served.await;
    Ok(())
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
