#![allow(dead_code)]

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use alloy::primitives::B256;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tiny_http::{Response, Server, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use wallet_bg_core::{ChainSlug, Endpoint};

pub fn endpoint(chain: &str, url: &str) -> Endpoint {
    Endpoint::new(
        ChainSlug::new(chain).expect("valid slug"),
        "fixture",
        url,
    )
}

pub fn genesis(seed: u8) -> B256 {
    B256::repeat_byte(seed)
}

/// JSON-RPC fixture over plain HTTP. Records every method it is asked for.
///
/// `eth_chainId` answers `chain_id`, `eth_blockNumber` answers `0x10`,
/// `http_fail` answers status 500 and anything else gets a JSON-RPC error.
pub fn spawn_evm_node(chain_id: u64, calls: Arc<Mutex<Vec<String>>>) -> String {
    let server = Server::http("127.0.0.1:0").expect("start server");
    let addr = format!("http://{}", server.server_addr());

    thread::spawn(move || {
        for _ in 0..64 {
            let mut req = match server.recv() {
                Ok(r) => r,
                Err(_) => break,
            };
            let mut body = String::new();
            if req.as_reader().read_to_string(&mut body).is_err() {
                continue;
            }
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            let method = request
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if let Ok(mut g) = calls.lock() {
                g.push(method.clone());
            }

            let (code, payload) = match method.as_str() {
                "eth_chainId" => (
                    200,
                    json!({"jsonrpc": "2.0", "id": id, "result": format!("{chain_id:#x}")}),
                ),
                "eth_blockNumber" => (
                    200,
                    json!({"jsonrpc": "2.0", "id": id, "result": "0x10"}),
                ),
                "http_fail" => (500, json!({"error": "boom"})),
                _ => (
                    200,
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "method not found"}
                    }),
                ),
            };
            let response =
                Response::from_string(payload.to_string()).with_status_code(StatusCode(code));
            let _ = req.respond(response);
        }
    });

    addr
}

/// Substrate-like WebSocket node. `test_dropConnection` makes it hang up on
/// the caller without answering; it keeps accepting new connections.
pub struct WsNode {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
}

impl WsNode {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn spawn_ws_node(genesis: B256) -> WsNode {
    spawn_ws_node_accepting(genesis, usize::MAX).await
}

/// A node that stops listening after its first connection, so redials are
/// refused.
pub async fn spawn_single_use_ws_node(genesis: B256) -> WsNode {
    spawn_ws_node_accepting(genesis, 1).await
}

async fn spawn_ws_node_accepting(genesis: B256, accept: usize) -> WsNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("local addr"));
    let connections = Arc::new(AtomicUsize::new(0));

    let genesis_hex = alloy::hex::encode_prefixed(genesis);
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        for _ in 0..accept {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_ws(tcp, genesis_hex.clone()));
        }
    });

    WsNode { url, connections }
}

async fn serve_ws(tcp: TcpStream, genesis_hex: String) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
        return;
    };
    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else { continue };
        let request: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let reply = match request.get("method").and_then(Value::as_str) {
            Some("chain_getBlockHash") => {
                json!({"jsonrpc": "2.0", "id": id, "result": genesis_hex})
            }
            Some("system_chain") => {
                json!({"jsonrpc": "2.0", "id": id, "result": "Testnet"})
            }
            Some("test_dropConnection") => return,
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "method not found"}
            }),
        };
        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
            return;
        }
    }
}
