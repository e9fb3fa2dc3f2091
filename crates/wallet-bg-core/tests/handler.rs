mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{
    endpoint, eventually, evm_chain, genesis, slug, substrate_chain, Behavior, FakeTransport,
    StaticRegistry,
};
use wallet_bg_core::{
    ChainFamily, ChainHandler, ChainIdentity, ChainSlug, ConnectionConfig, ConnectionStatus,
    HandlerConfig, InitOptions,
};

fn config() -> HandlerConfig {
    HandlerConfig {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            max_consecutive_retries: 9,
        },
        recover_delay: Duration::from_millis(100),
        max_recover_rounds: 2,
    }
}

fn substrate_handler(transport: &FakeTransport, chains: usize) -> ChainHandler {
    let infos = (0..chains)
        .map(|i| substrate_chain(&format!("chain-{i}"), &format!("wss://{i}.example.org"), 1))
        .collect();
    ChainHandler::new(
        ChainFamily::Substrate,
        Arc::new(transport.clone()),
        StaticRegistry::new(infos),
        config(),
    )
}

fn init_all(handler: &ChainHandler, chains: usize) {
    for i in 0..chains {
        let name = format!("chain-{i}");
        handler
            .init_api(
                &slug(&name),
                endpoint(&name, &format!("wss://{i}.example.org")),
                InitOptions::default(),
            )
            .expect("init");
    }
}

fn all_have_status(handler: &ChainHandler, status: ConnectionStatus) -> bool {
    let map = handler.api_map();
    !map.is_empty() && map.values().all(|c| c.status() == status)
}

#[tokio::test]
async fn sleep_then_wake_up_restores_every_active_chain() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    let handler = substrate_handler(&transport, 3);
    init_all(&handler, 3);
    eventually("all connected", || {
        all_have_status(&handler, ConnectionStatus::Connected)
    })
    .await;

    handler.sleep().await;
    assert!(handler.is_sleeping());
    assert!(all_have_status(&handler, ConnectionStatus::Disconnected));
    assert_eq!(transport.live(), 0);

    handler.wake_up();
    eventually("all reconnected", || {
        all_have_status(&handler, ConnectionStatus::Connected)
    })
    .await;
    assert_eq!(transport.opened(), 6);
    assert_eq!(transport.live(), 3);
}

#[tokio::test]
async fn one_failing_disconnect_does_not_stop_the_others() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    transport.fail_close("wss://1.example.org");
    let handler = substrate_handler(&transport, 3);
    init_all(&handler, 3);
    eventually("all connected", || {
        all_have_status(&handler, ConnectionStatus::Connected)
    })
    .await;

    handler.sleep().await;

    assert!(all_have_status(&handler, ConnectionStatus::Disconnected));
    assert_eq!(transport.closed(), 3);
}

#[tokio::test(start_paused = true)]
async fn never_ready_chain_is_recovered_a_bounded_number_of_times() {
    let transport = FakeTransport::new(
        ChainFamily::Substrate,
        Behavior::FailOpen("refused".to_owned()),
    );
    let handler = substrate_handler(&transport, 1);
    init_all(&handler, 1);

    eventually("two recovery rounds", || transport.attempts() == 3).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.attempts(), 3);
    assert_eq!(
        handler.connection_status(&slug("chain-0")),
        Some(ConnectionStatus::Error)
    );
}

#[tokio::test(start_paused = true)]
async fn recovery_backoff_saturates_past_thirty_two_rounds() {
    let transport = FakeTransport::new(
        ChainFamily::Substrate,
        Behavior::FailOpen("refused".to_owned()),
    );
    let handler = ChainHandler::new(
        ChainFamily::Substrate,
        Arc::new(transport.clone()),
        StaticRegistry::new(vec![substrate_chain("chain-0", "wss://0.example.org", 1)]),
        HandlerConfig {
            recover_delay: Duration::from_millis(1),
            max_recover_rounds: 34,
            ..config()
        },
    );
    init_all(&handler, 1);

    for _ in 0..400 {
        if transport.attempts() == 35 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(86_400)).await;
    }

    assert_eq!(transport.attempts(), 35);
    assert_eq!(
        handler.connection_status(&slug("chain-0")),
        Some(ConnectionStatus::Error)
    );
}

#[tokio::test(start_paused = true)]
async fn recovery_connects_once_the_provider_answers() {
    let transport = FakeTransport::new(
        ChainFamily::Substrate,
        Behavior::FailOpen("refused".to_owned()),
    );
    let handler = substrate_handler(&transport, 1);
    init_all(&handler, 1);
    eventually("first failure", || transport.attempts() == 1).await;

    transport.set_behavior(
        "wss://0.example.org",
        Behavior::Answer(ChainIdentity::Genesis(genesis(1))),
    );

    eventually("recovered", || {
        handler.connection_status(&slug("chain-0")) == Some(ConnectionStatus::Connected)
    })
    .await;
    let conn = handler.get_api(&slug("chain-0")).expect("api");
    assert!(conn.is_api_ready_once());
    assert!(!conn.has_pending_recovery());
}

#[tokio::test(start_paused = true)]
async fn no_recovery_is_scheduled_while_sleeping() {
    let transport = FakeTransport::new(
        ChainFamily::Substrate,
        Behavior::FailOpen("refused".to_owned()),
    );
    let handler = substrate_handler(&transport, 1);
    handler.sleep().await;
    init_all(&handler, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn init_api_with_new_url_switches_provider() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    let handler = substrate_handler(&transport, 1);
    init_all(&handler, 1);
    let conn = handler.get_api(&slug("chain-0")).expect("api");
    conn.ready(Duration::from_secs(1)).await.expect("ready");

    let same = handler
        .init_api(
            &slug("chain-0"),
            endpoint("chain-0", "wss://backup.example.org"),
            InitOptions::default(),
        )
        .expect("init again");

    eventually("switched", || {
        same.endpoint().url == "wss://backup.example.org" && same.is_connected()
    })
    .await;
    assert_eq!(handler.api_map().len(), 1);
    assert_eq!(transport.live(), 1);
}

#[tokio::test]
async fn init_api_rejects_endpoint_of_another_chain() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    let handler = substrate_handler(&transport, 1);

    let err = handler
        .init_api(
            &slug("chain-0"),
            endpoint("kusama", "wss://0.example.org"),
            InitOptions::default(),
        )
        .expect_err("mismatched endpoint");
    assert!(err.to_string().contains("kusama"));
    assert!(handler.get_api(&slug("chain-0")).is_none());
}

#[tokio::test]
async fn status_callback_sees_every_transition() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    let handler = substrate_handler(&transport, 1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let conn = handler
        .init_api(
            &slug("chain-0"),
            endpoint("chain-0", "wss://0.example.org"),
            InitOptions {
                on_status: Some(Arc::new(move |_: &ChainSlug, status: ConnectionStatus| {
                    sink.lock().expect("sink").push(status)
                })),
            },
        )
        .expect("init");
    conn.ready(Duration::from_secs(1)).await.expect("ready");

    eventually("connected reported", || {
        seen.lock().expect("seen").last() == Some(&ConnectionStatus::Connected)
    })
    .await;
    assert_eq!(
        *seen.lock().expect("seen"),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test]
async fn destroy_api_disconnects_and_forgets() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    let handler = substrate_handler(&transport, 1);
    init_all(&handler, 1);
    let conn = handler.get_api(&slug("chain-0")).expect("api");
    conn.ready(Duration::from_secs(1)).await.expect("ready");

    handler.destroy_api(&slug("chain-0")).await.expect("destroy");

    assert!(handler.get_api(&slug("chain-0")).is_none());
    assert_eq!(transport.live(), 0);
}

#[tokio::test]
async fn substrate_chain_spec_reads_live_properties() {
    let transport = FakeTransport::substrate(ChainIdentity::Genesis(genesis(1)));
    transport.set_response("chain_getBlockHash", json!(format!("{:#x}", genesis(1))));
    transport.set_response("system_chain", json!("Polkadot"));
    transport.set_response(
        "system_properties",
        json!({"ss58Format": 0, "tokenDecimals": [10], "tokenSymbol": ["DOT"]}),
    );
    let handler = substrate_handler(&transport, 1);
    init_all(&handler, 1);
    let conn = handler.get_api(&slug("chain-0")).expect("api");
    conn.ready(Duration::from_secs(1)).await.expect("ready");

    let spec = handler
        .get_chain_spec(&slug("chain-0"))
        .await
        .expect("chain spec");

    assert_eq!(spec.name, "Polkadot");
    assert_eq!(spec.genesis_hash, Some(genesis(1)));
    assert_eq!(spec.symbol, "DOT");
    assert_eq!(spec.decimals, 10);
    assert_eq!(spec.address_prefix, Some(0));
}

#[tokio::test]
async fn evm_chain_spec_failure_leaves_connection_alone() {
    let transport = FakeTransport::new(
        ChainFamily::Evm,
        Behavior::Answer(ChainIdentity::EvmChainId(1)),
    );
    let handler = ChainHandler::new(
        ChainFamily::Evm,
        Arc::new(transport.clone()),
        StaticRegistry::new(vec![evm_chain("ethereum", "https://eth.example.org", 1)]),
        config(),
    );
    let conn = handler
        .init_api(
            &slug("ethereum"),
            endpoint("ethereum", "https://eth.example.org"),
            InitOptions::default(),
        )
        .expect("init");
    conn.ready(Duration::from_secs(1)).await.expect("ready");

    handler
        .get_chain_spec(&slug("ethereum"))
        .await
        .expect_err("no scripted eth_chainId");
    assert!(conn.is_connected());

    transport.set_response("eth_chainId", json!("0x1"));
    let spec = handler
        .get_chain_spec(&slug("ethereum"))
        .await
        .expect("chain spec");
    assert_eq!(spec.evm_chain_id, Some(1));
    assert_eq!(spec.symbol, "ETH");
    assert_eq!(spec.decimals, 18);
}
