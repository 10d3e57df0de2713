mod common;

use std::time::Duration;

use serde_json::json;

use common::{join_broadcaster, join_listener, GatewayClient};

#[tokio::test]
async fn broadcaster_ready_advertises_limits_and_format() {
    let (addr, _state) = common::start_ws_server().await;

    let mut client = GatewayClient::connect(addr).await;
    client
        .send_event("join-as-broadcaster", json!({ "broadcastId": "morning-show" }))
        .await;

    let msg = client.next_json().await;
    assert_eq!(msg["op"], 0);
    assert_eq!(msg["t"], "broadcaster-ready");
    assert_eq!(msg["s"], 1);

    let d = &msg["d"];
    assert_eq!(d["broadcastId"], "morning-show");
    assert_eq!(d["config"]["maxCallers"], 2);
    assert_eq!(d["config"]["sampleRate"], 48000);
    assert!(d["config"]["heartbeatInterval"].as_u64().unwrap() > 0);
    assert_eq!(d["stats"]["listenerCount"], 0);
}

#[tokio::test]
async fn listener_join_notifies_broadcaster() {
    let (addr, _state) = common::start_ws_server().await;
    let mut broadcaster = join_broadcaster(addr, "bid-1").await;

    let _listener = join_listener(addr, "bid-1").await;

    let count = broadcaster.expect_event("listener-count").await;
    assert_eq!(count["count"], 1);
    assert_eq!(count["peak"], 1);
}

#[tokio::test]
async fn joining_missing_broadcast_returns_error_and_keeps_socket() {
    let (addr, _state) = common::start_ws_server().await;
    let mut client = GatewayClient::connect(addr).await;

    client
        .send_event("join-broadcast", json!({ "broadcastId": "ghost" }))
        .await;
    let err = client.expect_event("error").await;
    assert_eq!(err["event"], "join-broadcast");
    assert_eq!(err["code"], "BROADCAST_NOT_FOUND");
    assert!(!err["message"].as_str().unwrap().is_empty());

    // Still open: heartbeat is acknowledged.
    client.send_raw(&json!({ "op": 1, "d": { "seq": 9 } }).to_string()).await;
    let ack = client.next_json().await;
    assert_eq!(ack["op"], 6);
    assert_eq!(ack["d"]["ack"], 9);
}

#[tokio::test]
async fn second_broadcaster_is_rejected() {
    let (addr, _state) = common::start_ws_server().await;
    let _first = join_broadcaster(addr, "bid-1").await;

    let mut second = GatewayClient::connect(addr).await;
    second
        .send_event("join-as-broadcaster", json!({ "broadcastId": "bid-1" }))
        .await;
    let err = second.expect_event("error").await;
    assert_eq!(err["code"], "BROADCASTER_CONFLICT");
}

#[tokio::test]
async fn audio_is_relayed_to_listeners() {
    let (addr, state) = common::start_ws_server().await;
    let mut broadcaster = join_broadcaster(addr, "bid-1").await;
    let mut listener = join_listener(addr, "bid-1").await;

    broadcaster
        .send_event(
            "broadcast-audio",
            json!({ "audio": "AAEC", "timestamp": 1000, "metrics": { "peakLevel": 0.4 } }),
        )
        .await;

    let chunk = listener.expect_event("audio-stream").await;
    assert_eq!(chunk["audio"], "AAEC");
    assert_eq!(chunk["timestamp"], 1000);
    assert_eq!(chunk["metrics"]["peakLevel"], 0.4);
    assert!(state.registry.stats("bid-1").unwrap().is_live);
}

#[tokio::test]
async fn call_flow_from_request_to_hang_up() {
    let (addr, _state) = common::start_ws_server().await;
    let mut broadcaster = join_broadcaster(addr, "bid-1").await;
    let mut caller = join_listener(addr, "bid-1").await;

    caller
        .send_event(
            "request-call",
            json!({ "callerInfo": { "name": "Ama", "location": "Accra" } }),
        )
        .await;
    let pending = caller.expect_event("call-pending").await;
    assert_eq!(pending["position"], 1);
    let call_id = pending["callId"].as_str().unwrap().to_string();
    assert!(call_id.starts_with("call_"));

    let incoming = broadcaster.expect_event("incoming-call").await;
    assert_eq!(incoming["call"]["callId"], call_id);
    assert_eq!(incoming["call"]["callerName"], "Ama");

    broadcaster
        .send_event("accept-call", json!({ "callId": call_id }))
        .await;
    let accepted = caller.expect_event("call-accepted").await;
    let source_id = accepted["sourceId"].as_str().unwrap().to_string();
    assert!(source_id.starts_with("caller_conn_"));

    let added = broadcaster.expect_event("audio-source-added").await;
    assert_eq!(added["source"]["id"], source_id);
    assert_eq!(added["source"]["kind"], "caller");

    caller.send_event("end-call", json!({ "callId": call_id })).await;
    let removed = broadcaster.expect_event("audio-source-removed").await;
    assert_eq!(removed["sourceId"], source_id);
    let ended = broadcaster.expect_event("call-ended").await;
    assert_eq!(ended["callId"], call_id);
    assert_eq!(ended["reason"], "The caller hung up");
}

#[tokio::test]
async fn caller_disconnect_removes_its_source() {
    let (addr, state) = common::start_ws_server().await;
    let mut broadcaster = join_broadcaster(addr, "bid-1").await;
    let mut caller = join_listener(addr, "bid-1").await;

    caller.send_event("request-call", json!({})).await;
    let call_id = caller.expect_event("call-pending").await["callId"]
        .as_str()
        .unwrap()
        .to_string();
    broadcaster
        .send_event("accept-call", json!({ "callId": call_id }))
        .await;
    broadcaster.expect_event("audio-source-added").await;

    caller.close().await;

    broadcaster.expect_event("audio-source-removed").await;
    let count = broadcaster.expect_event("listener-count").await;
    assert_eq!(count["count"], 0);
    assert!(state.registry.audio_sources("bid-1").unwrap().is_empty());
}

#[tokio::test]
async fn broadcaster_disconnect_ends_broadcast_for_listeners() {
    let (addr, state) = common::start_ws_server().await;
    let broadcaster = join_broadcaster(addr, "bid-1").await;
    let mut l1 = join_listener(addr, "bid-1").await;
    let mut l2 = join_listener(addr, "bid-1").await;

    broadcaster.close().await;

    for listener in [&mut l1, &mut l2] {
        let ended = listener.expect_event("broadcast-ended").await;
        assert_eq!(ended["broadcastId"], "bid-1");
        assert_eq!(ended["stats"]["peakListeners"], 2);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!state.registry.contains("bid-1"));
}

#[tokio::test]
async fn invalid_json_closes_with_4000() {
    let (addr, _state) = common::start_ws_server().await;
    let mut client = GatewayClient::connect(addr).await;

    client.send_raw("{not json").await;
    assert_eq!(client.expect_close().await, Some(4000));
}

#[tokio::test]
async fn dispatch_sequence_numbers_increase() {
    let (addr, _state) = common::start_ws_server().await;
    let mut broadcaster = join_broadcaster(addr, "bid-1").await;

    broadcaster.send_event("get-broadcast-stats", json!({})).await;
    let first = broadcaster.next_json().await;
    broadcaster.send_event("get-call-queue", json!({})).await;
    let second = broadcaster.next_json().await;

    assert_eq!(first["t"], "broadcast-stats");
    assert_eq!(second["t"], "call-queue");
    assert!(second["s"].as_u64().unwrap() > first["s"].as_u64().unwrap());
}

#[tokio::test]
async fn zero_heartbeat_interval_uses_the_default() {
    let config = broadcast_api::config::Config {
        heartbeat_interval_ms: 0,
        ..Default::default()
    };
    let (addr, _state) = common::start_ws_server_with(config).await;

    let mut client = GatewayClient::connect(addr).await;
    client
        .send_event("join-as-broadcaster", json!({ "broadcastId": "bid-1" }))
        .await;
    let ready = client.expect_event("broadcaster-ready").await;
    assert_eq!(ready["config"]["heartbeatInterval"], 41_250);

    // The connection task is still alive and answering heartbeats.
    client.send_raw(&json!({ "op": 1, "d": { "seq": 1 } }).to_string()).await;
    let ack = client.next_json().await;
    assert_eq!(ack["op"], 6);
}
