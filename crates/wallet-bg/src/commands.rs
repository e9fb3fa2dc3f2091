use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use tokio::io::{AsyncBufReadExt, BufReader};

use wallet_bg_adapters::{
    EvmHttpTransport, JsonFileStore, PasswordGate, RuntimeConfig, StaticChainRegistry,
    SubstrateWsTransport, SystemClockAdapter, TracingBadge,
};
use wallet_bg_core::{
    probe, ChainFamily, ChainService, ChainSlug, ConnectionStatus, Endpoint, InitOptions,
    RequestService, RpcTransport, StatusCallback,
};

const STATUS_REPORT_EVERY: Duration = Duration::from_secs(60);

fn transports(
    config: &RuntimeConfig,
) -> eyre::Result<(Arc<dyn RpcTransport>, Arc<dyn RpcTransport>)> {
    let substrate =
        SubstrateWsTransport::new(config.auto_connect_delay(), config.request_timeout());
    let evm = EvmHttpTransport::new(config.request_timeout())?;
    Ok((Arc::new(substrate), Arc::new(evm)))
}

async fn chain_service(config: &RuntimeConfig) -> eyre::Result<ChainService> {
    let registry = match &config.chain_list_path {
        Some(path) => StaticChainRegistry::from_path(path)
            .await
            .wrap_err("loading chain list")?,
        None => {
            tracing::warn!("no chain list configured, starting with an empty registry");
            StaticChainRegistry::default()
        }
    };
    let (substrate, evm) = transports(config)?;
    Ok(ChainService::new(
        Arc::new(registry),
        substrate,
        evm,
        config.handler_config(ChainFamily::Substrate),
        config.handler_config(ChainFamily::Evm),
    ))
}

pub async fn run(config: RuntimeConfig) -> eyre::Result<()> {
    let chains = chain_service(&config).await?;
    let on_status: StatusCallback = Arc::new(|chain: &ChainSlug, status: ConnectionStatus| {
        tracing::info!(chain = %chain, status = %status, "chain status changed");
    });
    let connections = chains.init_active_chains(InitOptions {
        on_status: Some(on_status),
    });

    let store = JsonFileStore::new(&config.store_dir);
    let requests = RequestService::new(
        store.clone(),
        store,
        TracingBadge::default(),
        Arc::new(SystemClockAdapter),
        config.notification_mode,
    );
    let known = requests.metadata.known_metadata().await?;
    tracing::info!(
        chains = connections.len(),
        metadata = known.len(),
        store = %config.store_dir.display(),
        "wallet background running"
    );

    let mut report = tokio::time::interval(STATUS_REPORT_EVERY);
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                for connection in &connections {
                    tracing::info!(
                        chain = %connection.slug(),
                        url = %connection.endpoint().url,
                        status = %connection.status(),
                        pending_requests = requests.num_all_requests(),
                        "status report"
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.wrap_err("waiting for shutdown signal")?;
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    let dropped = requests.reset_wallet().await?;
    if dropped > 0 {
        tracing::info!(dropped, "pending requests rejected on shutdown");
    }
    chains.stop_all_chain_apis().await;
    Ok(())
}

pub async fn probe_url(
    config: &RuntimeConfig,
    url: &str,
    timeout_ms: Option<u64>,
) -> eyre::Result<()> {
    let family =
        ChainFamily::from_url(url).ok_or_else(|| eyre!("unsupported provider url {url}"))?;
    let (substrate, evm) = transports(config)?;
    let transport = match family {
        ChainFamily::Substrate => substrate,
        ChainFamily::Evm => evm,
    };
    let budget = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.probe_timeout(family));
    let endpoint = Endpoint::new(ChainSlug::new("probe")?, "cli", url);

    let result = probe(transport.as_ref(), &endpoint, None, budget).await;
    if let Some(handle) = &result.handle {
        handle.disconnect().await?;
    }
    match (result.connected, result.identity) {
        (true, Some(identity)) => {
            println!("{family} provider {url} is up, {identity}");
            Ok(())
        }
        _ => Err(eyre!(
            "{family} provider {url} failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_owned())
        )),
    }
}

pub async fn validate(config: &RuntimeConfig, url: &str, chain: Option<&str>) -> eyre::Result<()> {
    let chains = chain_service(config).await?;
    let existing = chain.map(ChainSlug::new).transpose()?;
    let response = chains.validate_custom_chain(url, existing.as_ref()).await?;
    if response.success {
        let identity = response
            .identity
            .map(|identity| identity.to_string())
            .unwrap_or_default();
        println!("{url} is usable, {identity}");
        return Ok(());
    }
    Err(eyre!(
        "{url} rejected: {:?}{}",
        response.error,
        response
            .conflict_chain
            .map(|slug| format!(" (conflicts with {slug})"))
            .unwrap_or_default()
    ))
}

pub async fn set_password(config: &RuntimeConfig) -> eyre::Result<()> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .wrap_err("reading password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    let gate = PasswordGate::create(password, config.kdf_params())?;
    let path = config.password_path();
    gate.save(&path).await?;
    tracing::info!(
        path = %path.display(),
        kdf = ?gate.record().kdf_algorithm,
        "password verifier stored"
    );
    Ok(())
}
