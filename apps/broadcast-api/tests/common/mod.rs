#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use broadcast_api::config::Config;
use broadcast_api::AppState;

/// Build a test AppState with default limits.
pub fn test_state() -> AppState {
    AppState::new(Config::default())
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = broadcast_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_ws_server() -> (SocketAddr, AppState) {
    start_ws_server_with(Config::default()).await
}

/// Like [`start_ws_server`], with a custom configuration.
pub async fn start_ws_server_with(config: Config) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let app = broadcast_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// A gateway client speaking the `{op, t, s, d}` envelope.
pub struct GatewayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl GatewayClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{addr}/gateway");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("ws connect");
        Self { ws }
    }

    pub async fn send_event(&mut self, event: &str, data: Value) {
        let msg = serde_json::json!({ "op": 0, "t": event, "d": data });
        self.send_raw(&msg.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(tungstenite::Message::Text(text.to_string().into()))
            .await
            .expect("ws send");
    }

    /// Read the next text frame as JSON.
    pub async fn next_json(&mut self) -> Value {
        loop {
            let msg = time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timeout waiting for gateway message")
                .expect("stream ended")
                .expect("ws read error");
            match msg {
                tungstenite::Message::Text(text) => {
                    return serde_json::from_str(&text).expect("parse gateway message");
                }
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                other => panic!("expected text frame, got: {other:?}"),
            }
        }
    }

    /// Read dispatches until one named `event` arrives; returns its `d`.
    pub async fn expect_event(&mut self, event: &str) -> Value {
        loop {
            let msg = self.next_json().await;
            if msg["op"] == 0 && msg["t"] == event {
                return msg["d"].clone();
            }
        }
    }

    /// Read the next frame, which must be a close frame; returns its code.
    pub async fn expect_close(&mut self) -> Option<u16> {
        let msg = time::timeout(Duration::from_secs(5), self.ws.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Close(frame) => frame.map(|f| u16::from(f.code)),
            other => panic!("Expected Close frame, got: {other:?}"),
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Connect and join `broadcast_id` as its broadcaster.
pub async fn join_broadcaster(addr: SocketAddr, broadcast_id: &str) -> GatewayClient {
    let mut client = GatewayClient::connect(addr).await;
    client
        .send_event(
            "join-as-broadcaster",
            serde_json::json!({ "broadcastId": broadcast_id, "broadcasterInfo": { "name": "Studio" } }),
        )
        .await;
    client.expect_event("broadcaster-ready").await;
    client
}

/// Connect and join `broadcast_id` as a listener.
pub async fn join_listener(addr: SocketAddr, broadcast_id: &str) -> GatewayClient {
    let mut client = GatewayClient::connect(addr).await;
    client
        .send_event("join-broadcast", serde_json::json!({ "broadcastId": broadcast_id }))
        .await;
    client.expect_event("broadcast-info").await;
    client
}
