mod common;

use std::collections::BTreeMap;

use serde_json::json;

use common::genesis;
use wallet_bg_adapters::{JsonFileStore, MemoryStore};
use wallet_bg_core::{
    AccountAuthType, AuthStorePort, AuthUrlEntry, AuthUrls, MetadataDef, MetadataStorePort,
    PortError, TimestampMs,
};

fn auth_urls() -> AuthUrls {
    let origin = "app.example.org".to_owned();
    let entry = AuthUrlEntry {
        id: origin.clone(),
        origin: "Example".to_owned(),
        url: "https://app.example.org/connect".to_owned(),
        is_allowed: true,
        is_allowed_map: BTreeMap::from([(
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".to_owned(),
            true,
        )]),
        account_auth_type: AccountAuthType::Evm,
        last_auth_ms: TimestampMs(1_739_750_400_000),
        count: 1,
        current_evm_network: None,
    };
    BTreeMap::from([(origin, entry)])
}

fn metadata(seed: u8, spec_version: u32) -> MetadataDef {
    MetadataDef {
        chain: format!("chain-{seed}"),
        genesis_hash: genesis(seed),
        spec_version,
        ss58_format: 42,
        token_decimals: 12,
        token_symbol: "UNIT".to_owned(),
        types: json!({}),
    }
}

#[tokio::test]
async fn file_store_round_trips_auth_urls() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = JsonFileStore::new(dir.path().join("state"));

    assert!(AuthStorePort::load(&store).await.expect("empty load").is_empty());
    store.save(&auth_urls()).await.expect("save");

    let reopened = JsonFileStore::new(dir.path().join("state"));
    assert_eq!(reopened.load().await.expect("load"), auth_urls());
}

#[tokio::test]
async fn file_store_keeps_one_definition_per_genesis() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = JsonFileStore::new(dir.path());

    store.put(&metadata(1, 10)).await.expect("put");
    store.put(&metadata(2, 5)).await.expect("put other");
    store.put(&metadata(1, 11)).await.expect("replace");

    let def = store.get(&genesis(1)).await.expect("get").expect("present");
    assert_eq!(def.spec_version, 11);
    assert!(store.get(&genesis(9)).await.expect("get").is_none());
    assert_eq!(store.all().await.expect("all").len(), 2);
}

#[tokio::test]
async fn corrupt_file_is_a_validation_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("auth_urls.json"), b"{not json").expect("write");
    let store = JsonFileStore::new(dir.path());

    let err = AuthStorePort::load(&store).await.expect_err("corrupt");
    assert!(matches!(err, PortError::Validation(_)));
}

#[tokio::test]
async fn memory_store_behaves_like_the_file_store() {
    let store = MemoryStore::default();

    store.save(&auth_urls()).await.expect("save");
    assert_eq!(store.load().await.expect("load"), auth_urls());

    store.put(&metadata(1, 10)).await.expect("put");
    store.put(&metadata(1, 12)).await.expect("replace");
    let all = store.all().await.expect("all");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].spec_version, 12);
}
