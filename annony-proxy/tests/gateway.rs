use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use annony_api::{create_router, AppState, MessageService};
use annony_cluster::sync::{ClusterConfig, ClusterManager, ConnectionRegistry, LocalBus, MessageBus};
use annony_core::{
    config::{ChatConfig, GatewayConfig},
    repository::MemoryHistoryStore,
    service::RateLimiter,
};
use annony_proxy::{create_gateway_router, GatewayState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Backend {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
}

async fn spawn_backend() -> Backend {
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let registry = Arc::new(ConnectionRegistry::default());
    let cluster = Arc::new(
        ClusterManager::start_with_bus(bus, ClusterConfig::default(), Arc::clone(&registry))
            .await
            .unwrap(),
    );
    let service = Arc::new(MessageService::new(
        Arc::new(MemoryHistoryStore::new()),
        Arc::clone(&cluster),
        &ChatConfig::default(),
    ));
    let state = AppState {
        message_service: service,
        registry: Arc::clone(&registry),
        cluster,
        stream_path: "/socket".to_string(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    Backend { addr, registry }
}

async fn spawn_gateway(backend_url: String, limiter: RateLimiter, handshake_timeout_seconds: u64) -> SocketAddr {
    let config = GatewayConfig {
        backend_urls: vec![backend_url],
        handshake_timeout_seconds,
        ..GatewayConfig::default()
    };
    let state = GatewayState::new(&config, limiter).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            create_gateway_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn generous_limiter() -> RateLimiter {
    RateLimiter::with_quota(10_000, Duration::from_secs(60))
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for_connections(registry: &ConnectionRegistry, count: usize) {
    for _ in 0..200 {
        if registry.connection_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} connections, found {}", registry.connection_count());
}

#[tokio::test]
async fn test_stream_relay_delivers_to_gateway_and_direct_clients() {
    let backend = spawn_backend().await;
    let gateway = spawn_gateway(format!("http://{}", backend.addr), generous_limiter(), 10).await;

    let (mut via_gateway, response) = connect_async(format!("ws://{gateway}/socket")).await.unwrap();
    assert_eq!(response.status(), 101);
    let (mut direct, _) = connect_async(format!("ws://{}/socket", backend.addr)).await.unwrap();

    assert_eq!(next_event(&mut via_gateway).await["event"], "load_history");
    assert_eq!(next_event(&mut direct).await["event"], "load_history");
    wait_for_connections(&backend.registry, 2).await;

    let frame = json!({ "event": "send_message", "data": { "text": "through the edge" } });
    via_gateway.send(Message::Text(frame.to_string().into())).await.unwrap();

    for client in [&mut via_gateway, &mut direct] {
        let event = next_event(client).await;
        assert_eq!(event["event"], "receive_message");
        assert_eq!(event["data"]["text"], "through the edge");
    }
}

#[tokio::test]
async fn test_client_close_tears_down_backend_side() {
    let backend = spawn_backend().await;
    let gateway = spawn_gateway(format!("http://{}", backend.addr), generous_limiter(), 10).await;

    let (mut client, _) = connect_async(format!("ws://{gateway}/socket")).await.unwrap();
    next_event(&mut client).await;
    wait_for_connections(&backend.registry, 1).await;

    client.close(None).await.unwrap();
    drop(client);
    wait_for_connections(&backend.registry, 0).await;
}

#[tokio::test]
async fn test_messages_forwarded() {
    let backend = spawn_backend().await;
    let gateway = spawn_gateway(format!("http://{}", backend.addr), generous_limiter(), 10).await;

    let response = reqwest::get(format!("http://{gateway}/messages")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    let records: Vec<Value> = response.json().await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_sixty_first_request_is_rejected() {
    let backend = spawn_backend().await;
    // Long window so no token refills while the burst is in flight
    let limiter = RateLimiter::with_quota(60, Duration::from_secs(3600));
    let gateway = spawn_gateway(format!("http://{}", backend.addr), limiter, 10).await;
    let client = reqwest::Client::new();

    for i in 0..60 {
        let response = client.get(format!("http://{gateway}/messages")).send().await.unwrap();
        assert_eq!(response.status(), 200, "request {i} should pass");
    }

    let response = client.get(format!("http://{gateway}/messages")).send().await.unwrap();
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(response.text().await.unwrap(), "Too many messages, slow down.");

    // Health is answered locally and never limited
    let health = client.get(format!("http://{gateway}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_unreachable_backend_returns_proxy_failed() {
    let gateway = spawn_gateway("http://127.0.0.1:1".to_string(), generous_limiter(), 2).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("http://{gateway}/messages")).await.unwrap();
        assert_eq!(response.status(), 502);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "error": "Proxy failed" }));
    }

    match connect_async(format!("ws://{gateway}/socket")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 502),
        other => panic!("expected HTTP 502, got {:?}", other.map(|(_, r)| r.status())),
    }

    let health = reqwest::get(format!("http://{gateway}/health")).await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_silent_backend_times_out_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let gateway = spawn_gateway(format!("http://{silent}"), generous_limiter(), 1).await;

    match timeout(Duration::from_secs(5), connect_async(format!("ws://{gateway}/socket"))).await {
        Ok(Err(tungstenite::Error::Http(response))) => assert_eq!(response.status(), 504),
        other => panic!(
            "expected HTTP 504, got {:?}",
            other.map(|r| r.map(|(_, response)| response.status()))
        ),
    }
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let backend = spawn_backend().await;
    let gateway = spawn_gateway(format!("http://{}", backend.addr), generous_limiter(), 10).await;

    let response = reqwest::get(format!("http://{gateway}/admin")).await.unwrap();
    assert_eq!(response.status(), 404);
}
