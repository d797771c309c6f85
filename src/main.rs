use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mitm_proxy::cache::ResponseCache;
use mitm_proxy::certs::CertificateMint;
use mitm_proxy::config::ProxyConfig;
use mitm_proxy::listener::{self, ProxyListener};
use mitm_proxy::logging;
use mitm_proxy::rules::InMemoryRuleStore;
use mitm_proxy::shutdown::{spawn_ctrl_c_trigger, Shutdown};
use mitm_proxy::state::ProxyState;
use mitm_proxy::traffic::InMemoryTrafficLog;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ProxyConfig::parse();
    logging::init(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let certs = Arc::new(
        CertificateMint::load(&config.ca_cert, &config.ca_key, config.certs_dir.clone())
            .await
            .context("loading CA material")?,
    );

    let rule_store = InMemoryRuleStore::shared();
    let traffic_log = InMemoryTrafficLog::shared();
    let cache = Arc::new(ResponseCache::new(
        config.cache_dir.clone(),
        config.cache_ttl_seconds,
    ));

    let state = Arc::new(ProxyState::new(
        rule_store.clone(),
        certs.clone(),
        cache.clone(),
        traffic_log.clone(),
        format!("{}:{}", config.host, config.port),
    ));
    let listener = ProxyListener::bind(&config.host, config.port, state).await?;

    let (shutdown, _rx) = Shutdown::new();
    spawn_ctrl_c_trigger(shutdown.clone());

    info!(
        host = %config.host,
        port = config.port,
        "mitm-proxy starting"
    );

    listener::serve(
        listener,
        shutdown,
        Duration::from_secs(config.shutdown_grace_seconds),
    )
    .await;

    info!("mitm-proxy shut down");
    Ok(())
}
