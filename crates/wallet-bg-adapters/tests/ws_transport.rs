mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use common::{endpoint, genesis, spawn_single_use_ws_node, spawn_ws_node};
use wallet_bg_adapters::SubstrateWsTransport;
use wallet_bg_core::{
    probe, ChainConnection, ChainFamily, ChainIdentity, ConnectionConfig, ConnectionStatus,
    HandleSignal, PortError, RpcTransport,
};

fn transport() -> SubstrateWsTransport {
    SubstrateWsTransport::new(Duration::from_millis(20), Duration::from_secs(5))
}

#[tokio::test]
async fn handshake_reads_the_genesis_hash() {
    let node = spawn_ws_node(genesis(3)).await;
    let handle = transport()
        .open(&endpoint("westend", &node.url))
        .await
        .expect("open");

    let identity = handle.handshake().await.expect("handshake");
    assert_eq!(identity, ChainIdentity::Genesis(genesis(3)));
    let name = handle
        .request("system_chain", json!([]))
        .await
        .expect("system_chain");
    assert_eq!(name, json!("Testnet"));

    let err = handle
        .request("state_unknown", json!([]))
        .await
        .expect_err("unknown method");
    assert!(err.to_string().contains("method not found"));
}

#[tokio::test]
async fn dropped_socket_is_redialed_and_signalled() {
    let node = spawn_ws_node(genesis(3)).await;
    let handle = transport()
        .open(&endpoint("westend", &node.url))
        .await
        .expect("open");
    let mut signals = handle.take_signals().expect("signals");
    assert!(handle.take_signals().is_none());

    handle
        .request("test_dropConnection", json!([]))
        .await
        .expect_err("peer hung up");

    let first = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("disconnect signal");
    assert_eq!(first, Some(HandleSignal::Disconnected));
    let second = timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("reconnect signal");
    assert_eq!(second, Some(HandleSignal::Connected));

    let name = handle
        .request("system_chain", json!([]))
        .await
        .expect("after reconnect");
    assert_eq!(name, json!("Testnet"));
    assert_eq!(node.connections(), 2);

    handle.disconnect().await.expect("close");
}

#[tokio::test]
async fn disconnect_is_idempotent_and_final() {
    let node = spawn_ws_node(genesis(3)).await;
    let handle = transport()
        .open(&endpoint("westend", &node.url))
        .await
        .expect("open");

    handle.disconnect().await.expect("close");
    handle.disconnect().await.expect("close twice");

    let err = handle
        .request("system_chain", json!([]))
        .await
        .expect_err("closed");
    assert!(matches!(err, PortError::Transport(_)));
}

#[tokio::test]
async fn open_fails_when_nothing_listens() {
    let result = transport()
        .open(&endpoint("westend", "ws://127.0.0.1:9"))
        .await;
    assert!(matches!(result, Err(PortError::Transport(_))));

    let result = transport()
        .open(&endpoint("westend", "https://rpc.example.org"))
        .await;
    assert!(matches!(result, Err(PortError::Validation(_))));
}

#[tokio::test]
async fn probe_rejects_a_node_of_another_chain() {
    let node = spawn_ws_node(genesis(3)).await;
    let transport = transport();

    let result = probe(
        &transport,
        &endpoint("westend", &node.url),
        Some(ChainIdentity::Genesis(genesis(4))),
        Duration::from_secs(5),
    )
    .await;

    assert!(!result.connected);
    assert_eq!(result.identity, Some(ChainIdentity::Genesis(genesis(3))));
}

#[tokio::test]
async fn connection_gives_up_when_the_node_stays_down() {
    let node = spawn_single_use_ws_node(genesis(3)).await;
    let transport = SubstrateWsTransport::new(Duration::from_millis(10), Duration::from_secs(5));
    let conn = ChainConnection::new(
        endpoint("westend", &node.url),
        ChainFamily::Substrate,
        Arc::new(transport),
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            max_consecutive_retries: 3,
        },
    );
    conn.connect();
    conn.ready(Duration::from_secs(5)).await.expect("ready");

    conn.request("test_dropConnection", json!([]))
        .await
        .expect_err("peer hung up");

    timeout(Duration::from_secs(5), async {
        while conn.status() != ConnectionStatus::Error {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection gave up");
    assert_eq!(node.connections(), 1);
    assert!(conn.identity().is_none());
}
