//! Client-against-gateway tests over a loopback socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::mpsc};

use {
    clawdis_client::{ClientError, GatewayClient, GatewayClientOptions, RequestOpts},
    clawdis_gateway::{
        methods::MethodRegistry,
        server::build_gateway_app,
        services::GatewayServices,
        state::{GatewayConfig, GatewayState},
    },
    clawdis_protocol::ClientInfo,
};

async fn start_server(token: Option<&str>) -> (SocketAddr, Arc<GatewayState>) {
    let config = GatewayConfig {
        token: token.map(String::from),
        version: Some("test".into()),
        commit: None,
    };
    let state = GatewayState::new(config, GatewayServices::noop());
    let app = build_gateway_app(Arc::clone(&state), Arc::new(MethodRegistry::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn client_info() -> ClientInfo {
    ClientInfo {
        name: "loopback-test".into(),
        version: "0.0.0".into(),
        platform: "test".into(),
        mode: "cli".into(),
        instance_id: Some("loopback-1".into()),
    }
}

#[tokio::test]
async fn connect_stashes_snapshot_and_serves_requests() {
    let (addr, _state) = start_server(None).await;

    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
    let options = GatewayClientOptions::new(format!("ws://{addr}/ws"), client_info())
        .on_connect(move |hello| {
            let _ = connect_tx.send(hello.clone());
        });
    let client = GatewayClient::new(options);
    client.connect().await.unwrap();

    let hello = tokio::time::timeout(Duration::from_secs(5), connect_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hello.protocol, 1);
    assert_eq!(hello.server.version, "test");
    assert!(client.hello().await.is_some());

    let health = client
        .request("health", None, RequestOpts::default())
        .await
        .unwrap();
    assert!(health.is_object());

    let presence = client
        .request("system-presence", None, RequestOpts::default())
        .await
        .unwrap();
    let entries = presence.as_array().unwrap();
    assert!(entries.iter().any(|e| e["reason"] == "connect"));

    client.stop().await;
}

#[tokio::test]
async fn events_advance_last_seq_without_gaps() {
    let (addr, _state) = start_server(None).await;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (gap_tx, mut gap_rx) = mpsc::unbounded_channel();
    let options = GatewayClientOptions::new(format!("ws://{addr}/ws"), client_info())
        .on_event(move |event| {
            let _ = event_tx.send(event.clone());
        })
        .on_gap(move |gap| {
            let _ = gap_tx.send(gap);
        });
    let client = GatewayClient::new(options);
    client.connect().await.unwrap();

    // system-event triggers a presence broadcast back to this client.
    client
        .request(
            "system-event",
            Some(serde_json::json!({ "text": "note" })),
            RequestOpts::default(),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event, "presence");
    assert!(client.last_seq() >= 1);
    // A single well-behaved connection observes no gaps.
    assert!(gap_rx.try_recv().is_err());

    client.stop().await;
}

#[tokio::test]
async fn wrong_token_fails_handshake() {
    let (addr, _state) = start_server(Some("secret")).await;

    let options =
        GatewayClientOptions::new(format!("ws://{addr}/ws"), client_info()).with_token("wrong");
    let client = GatewayClient::new(options);
    match client.connect().await {
        Err(ClientError::Handshake(reason)) => assert_eq!(reason, "unauthorized"),
        other => panic!("expected handshake failure, got {other:?}"),
    }
}

#[tokio::test]
async fn right_token_connects() {
    let (addr, _state) = start_server(Some("secret")).await;

    let options =
        GatewayClientOptions::new(format!("ws://{addr}/ws"), client_info()).with_token("secret");
    let client = GatewayClient::new(options);
    client.connect().await.unwrap();

    let result = client.request("status", None, RequestOpts::default()).await;
    assert!(result.is_ok());
    client.stop().await;
}

#[tokio::test]
async fn stop_prevents_further_requests() {
    let (addr, _state) = start_server(None).await;

    let client = GatewayClient::new(GatewayClientOptions::new(
        format!("ws://{addr}/ws"),
        client_info(),
    ));
    client.connect().await.unwrap();
    client.stop().await;

    let result = client.request("health", None, RequestOpts::default()).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
}
